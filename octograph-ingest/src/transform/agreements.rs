//! Agreement-window resolution.
//!
//! A meter point's tariff history is a list of agreements, each valid over its
//! own window. For one collection window we walk a cursor through the
//! agreements in start order, fetch pricing only for the stretch each
//! agreement actually covers, and clip every fetched row to that stretch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use octograph_client::{time::iso8601, Agreement, CollectionWindow, RateInterval};

use crate::{
    pipeline::{PriceRow, PricingSource},
    sources::FetchError,
};

/// The part of the collection window one agreement is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementSpan {
    pub tariff_code: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// A stretch of the collection window no agreement covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageGap {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl std::fmt::Display for CoverageGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", iso8601(self.from), iso8601(self.to))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreementPlan {
    pub spans: Vec<AgreementSpan>,
    pub gaps: Vec<CoverageGap>,
}

#[derive(Debug, Clone, Default)]
pub struct AgreementWindowResolver {
    payment_method: Option<String>,
}

impl AgreementWindowResolver {
    /// Rows whose payment method differs from `payment_method` are dropped;
    /// rows without one always pass. `None` accepts every row.
    pub fn new(payment_method: Option<String>) -> Self {
        Self { payment_method }
    }

    /// Walk the window in ascending `valid_from` order.
    ///
    /// The agreement active at the cursor owns the window up to its end; the
    /// cursor then moves there. When agreements overlap, the first one in
    /// start order wins and the overlapped part of the next is never used.
    /// Stretches with no active agreement become gaps and get no span.
    pub fn plan(&self, agreements: &[Agreement], window: &CollectionWindow) -> AgreementPlan {
        let mut sorted: Vec<&Agreement> = agreements.iter().collect();
        sorted.sort_by_key(|a| a.valid_from);

        let mut plan = AgreementPlan::default();
        let mut cursor = window.from();

        for agreement in sorted {
            if cursor >= window.to() {
                break;
            }
            let agreement_end = agreement.end_or(window.to());
            if agreement_end <= cursor {
                continue;
            }
            if agreement.valid_from > cursor {
                let resume_at = agreement.valid_from.min(window.to());
                plan.gaps.push(CoverageGap {
                    from: cursor,
                    to: resume_at,
                });
                cursor = resume_at;
                if cursor >= window.to() {
                    break;
                }
            }

            let to = agreement_end.min(window.to());
            plan.spans.push(AgreementSpan {
                tariff_code: agreement.tariff_code.clone(),
                from: cursor,
                to,
            });
            cursor = to;
        }

        if cursor < window.to() {
            plan.gaps.push(CoverageGap {
                from: cursor,
                to: window.to(),
            });
        }
        plan
    }

    /// Clip provider rows to `span` and stamp them with its tariff code.
    ///
    /// A row without `valid_to` runs to the end of the span; one without
    /// `valid_from` starts at the span's start.
    pub fn clip_rows(&self, span: &AgreementSpan, rows: &[PriceRow]) -> Vec<RateInterval> {
        rows.iter()
            .filter(|row| self.accepts(row))
            .filter_map(|row| {
                let from = row.valid_from.map_or(span.from, |f| f.max(span.from));
                let to = row.valid_to.map_or(span.to, |t| t.min(span.to));
                let mut payload = row.payload();
                payload.tariff_code = Some(span.tariff_code.clone());
                RateInterval::new(from, to, payload).ok()
            })
            .collect()
    }

    fn accepts(&self, row: &PriceRow) -> bool {
        match (&self.payment_method, &row.payment_method) {
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            _ => true,
        }
    }

    /// Fetch and clip every component for every span of `plan`.
    ///
    /// Components come back sorted by `valid_from`.
    pub async fn resolve<P>(
        &self,
        source: &P,
        plan: &AgreementPlan,
    ) -> Result<BTreeMap<String, Vec<RateInterval>>, FetchError>
    where
        P: PricingSource + ?Sized,
    {
        let mut components: BTreeMap<String, Vec<RateInterval>> = BTreeMap::new();
        for span in &plan.spans {
            tracing::debug!(
                tariff_code = %span.tariff_code,
                from = %iso8601(span.from),
                to = %iso8601(span.to),
                "fetching pricing for agreement span"
            );
            let pricing = source.fetch_pricing(&span.tariff_code, span.from, span.to).await?;
            for (component, rows) in pricing {
                components
                    .entry(component)
                    .or_default()
                    .extend(self.clip_rows(span, &rows));
            }
        }
        for (component, rows) in components.iter_mut() {
            rows.sort_by_key(|r| r.valid_from());
            if self.payment_method.is_none() {
                if let Some(at) = first_payment_method_clash(rows) {
                    tracing::warn!(
                        component = %component,
                        at = %iso8601(at),
                        "rows for different payment methods overlap; set payment_method to pick one"
                    );
                }
            }
        }
        Ok(components)
    }
}

/// Start of the first overlap between rows carrying different payment
/// methods. `rows` must be sorted by `valid_from`.
///
/// Without a configured method both variants survive clipping, and which
/// one a slot keeps then depends on provider order.
fn first_payment_method_clash(rows: &[RateInterval]) -> Option<DateTime<Utc>> {
    for (i, row) in rows.iter().enumerate() {
        let Some(method) = row.payload.payment_method.as_deref() else {
            continue;
        };
        let clash = rows[i + 1..]
            .iter()
            .take_while(|later| later.valid_from() < row.valid_to())
            .find(|later| {
                later
                    .payload
                    .payment_method
                    .as_deref()
                    .is_some_and(|other| !other.eq_ignore_ascii_case(method))
            });
        if let Some(later) = clash {
            return Some(later.valid_from());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pricing;
    use octograph_client::time::parse_instant;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_instant(&format!("{s}T00:00:00Z")).unwrap()
    }

    fn agreement(code: &str, from: &str, to: Option<&str>) -> Agreement {
        Agreement {
            tariff_code: code.into(),
            valid_from: ts(from),
            valid_to: to.map(ts),
        }
    }

    fn window(from: &str, to: &str) -> CollectionWindow {
        CollectionWindow::new(ts(from), ts(to)).unwrap()
    }

    fn span(code: &str, from: &str, to: &str) -> AgreementSpan {
        AgreementSpan {
            tariff_code: code.into(),
            from: ts(from),
            to: ts(to),
        }
    }

    fn row(from: Option<&str>, to: Option<&str>, pm: Option<&str>, value: f64) -> PriceRow {
        PriceRow {
            valid_from: from.map(ts),
            valid_to: to.map(ts),
            payment_method: pm.map(str::to_string),
            value_exc_vat: Some(value / 1.05),
            value_inc_vat: Some(value),
            ..Default::default()
        }
    }

    /// Records each request and answers with one open-ended unit rate and
    /// one standing charge that began long before.
    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait::async_trait]
    impl PricingSource for RecordingSource {
        async fn fetch_pricing(&self, tariff_code: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Pricing, FetchError> {
            self.calls.lock().unwrap().push((tariff_code.to_string(), from, to));
            let value = if tariff_code == "A" { 30.0 } else { 25.0 };
            Ok(Pricing::from([
                ("standard_unit_rates".to_string(), vec![row(Some("2022-06-01"), None, None, value)]),
                ("standing_charges".to_string(), vec![row(Some("2022-01-01"), None, Some("DIRECT_DEBIT"), 45.0)]),
            ]))
        }
    }

    #[test]
    fn sequential_agreements_split_the_window() {
        let agreements = [agreement("B", "2023-02-01", None), agreement("A", "2023-01-01", Some("2023-02-01"))];
        let plan = AgreementWindowResolver::default().plan(&agreements, &window("2023-01-15", "2023-02-15"));

        assert_eq!(
            plan.spans,
            vec![span("A", "2023-01-15", "2023-02-01"), span("B", "2023-02-01", "2023-02-15")]
        );
        assert!(plan.gaps.is_empty());
    }

    #[test]
    fn expired_and_future_agreements_are_ignored() {
        let agreements = [
            agreement("OLD", "2022-01-01", Some("2023-01-01")),
            agreement("NOW", "2023-01-01", None),
            agreement("LATER", "2024-01-01", None),
        ];
        let plan = AgreementWindowResolver::default().plan(&agreements, &window("2023-03-01", "2023-03-02"));
        assert_eq!(plan.spans, vec![span("NOW", "2023-03-01", "2023-03-02")]);
    }

    #[test]
    fn uncovered_stretches_are_reported_as_gaps() {
        let agreements = [
            agreement("A", "2023-01-10", Some("2023-01-20")),
            agreement("B", "2023-01-25", Some("2023-01-28")),
        ];
        let plan = AgreementWindowResolver::default().plan(&agreements, &window("2023-01-01", "2023-02-01"));

        assert_eq!(
            plan.spans,
            vec![span("A", "2023-01-10", "2023-01-20"), span("B", "2023-01-25", "2023-01-28")]
        );
        assert_eq!(
            plan.gaps,
            vec![
                CoverageGap { from: ts("2023-01-01"), to: ts("2023-01-10") },
                CoverageGap { from: ts("2023-01-20"), to: ts("2023-01-25") },
                CoverageGap { from: ts("2023-01-28"), to: ts("2023-02-01") },
            ]
        );
    }

    #[test]
    fn no_agreements_means_one_gap_over_the_whole_window() {
        let plan = AgreementWindowResolver::default().plan(&[], &window("2023-01-01", "2023-02-01"));
        assert!(plan.spans.is_empty());
        assert_eq!(plan.gaps, vec![CoverageGap { from: ts("2023-01-01"), to: ts("2023-02-01") }]);
    }

    #[test]
    fn overlapping_agreements_first_match_wins() {
        let agreements = [
            agreement("A", "2023-01-01", Some("2023-01-20")),
            agreement("B", "2023-01-10", None),
        ];
        let plan = AgreementWindowResolver::default().plan(&agreements, &window("2023-01-05", "2023-01-31"));
        assert_eq!(
            plan.spans,
            vec![span("A", "2023-01-05", "2023-01-20"), span("B", "2023-01-20", "2023-01-31")]
        );
    }

    #[test]
    fn rows_are_clipped_filtered_and_stamped() {
        let resolver = AgreementWindowResolver::new(Some("DIRECT_DEBIT".into()));
        let rows = [
            row(Some("2023-01-01"), Some("2023-01-20"), Some("DIRECT_DEBIT"), 30.0),
            row(Some("2023-01-20"), None, Some("direct_debit"), 31.0),
            row(Some("2023-01-01"), None, Some("NON_DIRECT_DEBIT"), 33.0),
            row(None, None, None, 29.0),
            row(Some("2022-01-01"), Some("2023-01-02"), None, 28.0),
        ];
        let clipped = resolver.clip_rows(&span("E-1R-AGILE-FLEX-22-11-25-C", "2023-01-15", "2023-02-01"), &rows);

        let bounds: Vec<_> = clipped
            .iter()
            .map(|r| (r.valid_from(), r.valid_to(), r.payload.value_inc_vat))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (ts("2023-01-15"), ts("2023-01-20"), Some(30.0)),
                (ts("2023-01-20"), ts("2023-02-01"), Some(31.0)),
                (ts("2023-01-15"), ts("2023-02-01"), Some(29.0)),
            ]
        );
        assert!(clipped
            .iter()
            .all(|r| r.payload.tariff_code.as_deref() == Some("E-1R-AGILE-FLEX-22-11-25-C")));
    }

    #[test]
    fn overlapping_payment_methods_are_detected() {
        let span = span("E-1R-VAR-22-11-01-C", "2023-01-01", "2023-02-01");
        let all = AgreementWindowResolver::default();
        let rows = [
            row(Some("2023-01-01"), None, Some("DIRECT_DEBIT"), 30.0),
            row(Some("2023-01-10"), None, Some("NON_DIRECT_DEBIT"), 33.0),
        ];
        let mut clipped = all.clip_rows(&span, &rows);
        clipped.sort_by_key(|r| r.valid_from());
        assert_eq!(first_payment_method_clash(&clipped), Some(ts("2023-01-10")));

        let sequential = [
            row(Some("2023-01-01"), Some("2023-01-10"), Some("DIRECT_DEBIT"), 30.0),
            row(Some("2023-01-10"), None, Some("NON_DIRECT_DEBIT"), 33.0),
            row(Some("2023-01-01"), None, None, 29.0),
        ];
        let mut clipped = all.clip_rows(&span, &sequential);
        clipped.sort_by_key(|r| r.valid_from());
        assert_eq!(first_payment_method_clash(&clipped), None);

        let filtered = AgreementWindowResolver::new(Some("DIRECT_DEBIT".into())).clip_rows(&span, &rows);
        assert_eq!(first_payment_method_clash(&filtered), None);
    }

    #[tokio::test]
    async fn resolve_fetches_each_agreement_only_for_its_own_stretch() {
        let source = RecordingSource::default();
        let resolver = AgreementWindowResolver::new(Some("DIRECT_DEBIT".into()));
        let agreements = [agreement("A", "2023-01-01", Some("2023-02-01")), agreement("B", "2023-02-01", None)];
        let plan = resolver.plan(&agreements, &window("2023-01-15", "2023-02-15"));

        let components = resolver.resolve(&source, &plan).await.unwrap();

        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![
                ("A".to_string(), ts("2023-01-15"), ts("2023-02-01")),
                ("B".to_string(), ts("2023-02-01"), ts("2023-02-15")),
            ]
        );

        // Each component tiles the window exactly.
        for rows in components.values() {
            assert_eq!(rows.first().unwrap().valid_from(), ts("2023-01-15"));
            assert_eq!(rows.last().unwrap().valid_to(), ts("2023-02-15"));
            for pair in rows.windows(2) {
                assert_eq!(pair[0].valid_to(), pair[1].valid_from());
            }
        }
        let unit_rates = &components["standard_unit_rates"];
        assert_eq!(unit_rates[0].payload.tariff_code.as_deref(), Some("A"));
        assert_eq!(unit_rates[1].payload.value_inc_vat, Some(25.0));
    }
}
