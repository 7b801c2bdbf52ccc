use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{stream, StreamExt};
use octograph_client::{
    db::LatestPointQuery,
    time::{iso8601, local_date, local_midnight, next_day},
    Agreement, CollectionWindow, RateInterval,
};

use super::{ConsumptionSource, MeterRef, PipelineError, PointSink, PricingSource, Utility};
use crate::{
    config::{DateRange, Settings},
    sources::Account,
    transform::{
        compute_costs, AgreementWindowResolver, CostSettings, CoverageGap, DayNightBandNormaliser,
        SeriesMaterialiser,
    },
};

const STANDARD_UNIT_RATES: &str = "standard_unit_rates";
const DAY_UNIT_RATES: &str = "day_unit_rates";
const NIGHT_UNIT_RATES: &str = "night_unit_rates";
const STANDING_CHARGES: &str = "standing_charges";

/// One meter to collect, with the tariff history of its meter point.
#[derive(Debug, Clone)]
pub struct MeterJob {
    pub meter: MeterRef,
    pub agreements: Vec<Agreement>,
}

/// Every meter on the account, minus those missing from `included` when set.
pub fn jobs_for_account(account: &Account, included: Option<&[String]>) -> Vec<MeterJob> {
    let wanted = |serial: &str| included.map_or(true, |list| list.iter().any(|s| s == serial));
    let mut jobs = Vec::new();

    for property in &account.properties {
        tracing::info!(
            address = property.address_line_1.as_deref().unwrap_or(""),
            postcode = property.postcode.as_deref().unwrap_or(""),
            electricity_meter_points = property.electricity_meter_points.len(),
            gas_meter_points = property.gas_meter_points.len(),
            "processing property"
        );

        for point in &property.electricity_meter_points {
            for meter in &point.meters {
                if !wanted(&meter.serial_number) {
                    tracing::info!(mpan = %point.mpan, serial_number = %meter.serial_number, "skipping electricity meter not in included_meters");
                    continue;
                }
                jobs.push(MeterJob {
                    meter: MeterRef {
                        utility: Utility::Electricity,
                        meter_point: point.mpan.clone(),
                        serial_number: meter.serial_number.clone(),
                    },
                    agreements: point.agreements.clone(),
                });
            }
        }

        for point in &property.gas_meter_points {
            for meter in &point.meters {
                if !wanted(&meter.serial_number) {
                    tracing::info!(mprn = %point.mprn, serial_number = %meter.serial_number, "skipping gas meter not in included_meters");
                    continue;
                }
                jobs.push(MeterJob {
                    meter: MeterRef {
                        utility: Utility::Gas,
                        meter_point: point.mprn.clone(),
                        serial_number: meter.serial_number.clone(),
                    },
                    agreements: point.agreements.clone(),
                });
            }
        }
    }
    jobs
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReport {
    pub meter: MeterRef,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub written_points: usize,
    /// Points dropped because the store already holds their timestamp.
    pub already_stored: usize,
    pub gaps: Vec<CoverageGap>,
    pub unpriced_slots: usize,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub meters: Vec<MeterReport>,
    pub failures: Vec<(MeterRef, PipelineError)>,
}

impl BatchReport {
    pub fn written_points(&self) -> usize {
        self.meters.iter().map(|m| m.written_points).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Runs every meter job for one date range: resume, resolve tariffs, fetch,
/// materialise, cost and write.
pub struct BatchPipeline<A, S, Q> {
    api: A,
    sink: S,
    latest: Q,
    settings: Settings,
    range: DateRange,
    bucket: String,
}

impl<A, S, Q> BatchPipeline<A, S, Q>
where
    A: PricingSource + ConsumptionSource,
    S: PointSink,
    Q: LatestPointQuery,
{
    pub fn new(api: A, sink: S, latest: Q, settings: Settings, range: DateRange, bucket: impl Into<String>) -> Self {
        Self {
            api,
            sink,
            latest,
            settings,
            range,
            bucket: bucket.into(),
        }
    }

    /// Jobs run `concurrency` at a time. A failing job is recorded and does
    /// not stop the others.
    pub async fn run(&self, jobs: Vec<MeterJob>) -> BatchReport {
        let outcomes: Vec<(MeterRef, Result<MeterReport, PipelineError>)> = stream::iter(jobs)
            .map(|job| async move {
                let outcome = self.process(&job).await;
                (job.meter, outcome)
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (meter, outcome) in outcomes {
            match outcome {
                Ok(done) => report.meters.push(done),
                Err(e) => {
                    tracing::error!(
                        meter_point = %meter.meter_point,
                        serial_number = %meter.serial_number,
                        error = %e,
                        "meter job failed"
                    );
                    metrics::counter!("octograph_job_failures_total").increment(1);
                    report.failures.push((meter, e));
                }
            }
        }
        report.meters.sort_by(|a, b| a.meter.meter_point.cmp(&b.meter.meter_point));
        report
    }

    async fn latest_stored(&self, meter: &MeterRef) -> Result<Option<DateTime<Utc>>, PipelineError> {
        self.latest
            .find_latest(meter.utility.measurement(), "consumption", &meter.tags())
            .await
            .map_err(|e| PipelineError::Store(format!("{e:#}")))
    }

    /// First local date to collect: the configured start, or the day of the
    /// latest stored point when that falls inside the range.
    fn resume_date(&self, meter: &MeterRef, latest: Option<DateTime<Utc>>) -> NaiveDate {
        let resumed = latest
            .map(|ts| local_date(ts, self.settings.tz))
            .filter(|day| *day > self.range.from && *day <= self.range.to);
        if let Some(day) = resumed {
            tracing::info!(meter_point = %meter.meter_point, resume_from = %day, "resuming from latest stored point");
        }
        resumed.unwrap_or(self.range.from)
    }

    pub async fn process(&self, job: &MeterJob) -> Result<MeterReport, PipelineError> {
        let meter = &job.meter;
        let tz = self.settings.tz;

        let latest = self.latest_stored(meter).await?;
        let from = self.resume_date(meter, latest);
        let to = self.range.to;
        let window = CollectionWindow::new(local_midnight(from, tz), local_midnight(next_day(to), tz))?;
        tracing::info!(
            utility = meter.utility.measurement(),
            meter_point = %meter.meter_point,
            serial_number = %meter.serial_number,
            from = %iso8601(window.from()),
            to = %iso8601(window.to()),
            "processing meter"
        );

        let resolver = AgreementWindowResolver::new(self.settings.payment_method.clone());
        let plan = resolver.plan(&job.agreements, &window);
        for gap in &plan.gaps {
            tracing::warn!(meter_point = %meter.meter_point, gap = %gap, "no agreement covers part of the window");
            metrics::counter!("octograph_coverage_gaps_total").increment(1);
        }
        let mut components = resolver.resolve(&self.api, &plan).await?;

        let unit_rates = self.unit_rates(&mut components, from, to);
        let standing_charges = components.remove(STANDING_CHARGES).unwrap_or_default();
        let consumption = self.consumption(meter, window.from(), window.to()).await?;

        let materialiser = SeriesMaterialiser::new(self.settings.resolution);
        let cost_settings = CostSettings {
            resolution: self.settings.resolution,
            conversion_factor: match meter.utility {
                Utility::Gas => self.settings.gas_conversion_factor,
                Utility::Electricity => None,
            },
            tz,
        };
        let mut tags: BTreeMap<String, String> = self.settings.tags.clone();
        tags.extend(meter.tags());

        let costed = compute_costs(
            meter.utility.measurement(),
            &materialiser.materialise_readings(&consumption),
            &materialiser.materialise(&unit_rates),
            &materialiser.materialise(&standing_charges),
            &cost_settings,
            &tags,
        );
        if costed.unpriced_slots > 0 {
            tracing::warn!(
                meter_point = %meter.meter_point,
                unpriced_slots = costed.unpriced_slots,
                "consumption slots without a unit rate were skipped"
            );
            metrics::counter!("octograph_unpriced_slots_total").increment(costed.unpriced_slots as u64);
        }

        // ILP appends, so anything at or before the latest stored point
        // would be a second copy.
        let mut points = costed.points;
        let costed_points = points.len();
        if let Some(stored) = latest {
            points.retain(|p| p.time > stored);
        }
        let already_stored = costed_points - points.len();
        if already_stored > 0 {
            tracing::debug!(meter_point = %meter.meter_point, already_stored, "skipping points already in the store");
        }

        let written_points = points.len();
        self.sink.write(&self.bucket, points).await?;
        metrics::counter!("octograph_points_written_total").increment(written_points as u64);
        tracing::info!(meter_point = %meter.meter_point, points = written_points, "meter written");

        Ok(MeterReport {
            meter: meter.clone(),
            from,
            to,
            written_points,
            already_stored,
            gaps: plan.gaps,
            unpriced_slots: costed.unpriced_slots,
        })
    }

    /// Standard rates as published, plus day/night rates split into bands
    /// over the local days `from..=to`.
    fn unit_rates(&self, components: &mut BTreeMap<String, Vec<RateInterval>>, from: NaiveDate, to: NaiveDate) -> Vec<RateInterval> {
        let mut rates = components.remove(STANDARD_UNIT_RATES).unwrap_or_default();
        let day = components.remove(DAY_UNIT_RATES).unwrap_or_default();
        let night = components.remove(NIGHT_UNIT_RATES).unwrap_or_default();
        if !day.is_empty() || !night.is_empty() {
            let normaliser = DayNightBandNormaliser::new(from, to, self.settings.tz, self.settings.band);
            rates.extend(normaliser.normalise(&day, &night));
        }
        rates.sort_by_key(|r| r.valid_from());
        rates
    }

    async fn consumption(&self, meter: &MeterRef, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<RateInterval>, PipelineError> {
        let readings = self.api.fetch_consumption(meter, from, to).await?;
        let total = readings.len();
        let mut rows: Vec<RateInterval> = readings
            .into_iter()
            .filter_map(|reading| match reading.into_interval() {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(meter_point = %meter.meter_point, error = %e, "dropping malformed reading");
                    None
                }
            })
            .collect();
        rows.sort_by_key(|r| r.valid_from());
        tracing::debug!(meter_point = %meter.meter_point, readings = total, kept = rows.len(), "fetched consumption");
        Ok(rows)
    }
}
