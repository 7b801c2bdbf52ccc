//! Joins consumption against unit rates and standing charges.

use std::collections::BTreeMap;

use chrono_tz::Tz;
use octograph_client::Point;

use super::series::{Resolution, Series};

#[derive(Debug, Clone, Copy)]
pub struct CostSettings {
    pub resolution: Resolution,
    /// Volume to kWh factor for meters that report m³.
    pub conversion_factor: Option<f64>,
    pub tz: Tz,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostedSeries {
    pub points: Vec<Point>,
    /// Consumption slots dropped for lack of a unit rate.
    pub unpriced_slots: usize,
}

/// One point per consumption slot that has a unit rate.
///
/// Prices are looked up by covering slot so a consumption series keyed on
/// local midnights still finds rates keyed on UTC boundaries. A missing
/// standing charge counts as zero.
pub fn compute_costs(
    measurement: &str,
    consumption: &Series,
    unit_rates: &Series,
    standing_charges: &Series,
    settings: &CostSettings,
    extra_tags: &BTreeMap<String, String>,
) -> CostedSeries {
    let mut out = CostedSeries::default();
    let day_fraction = settings.resolution.day_fraction();

    for (key, entry) in consumption.iter() {
        let Some(used) = entry.consumption else {
            continue;
        };
        let at = key.instant();
        let Some((_, rate)) = unit_rates.covering(at) else {
            out.unpriced_slots += 1;
            continue;
        };
        let Some(unit_rate) = rate.value_inc_vat else {
            out.unpriced_slots += 1;
            continue;
        };

        let used = settings.conversion_factor.map_or(used, |factor| used * factor);
        let cost = used * unit_rate;
        let standing_charge = standing_charges
            .covering(at)
            .and_then(|(_, s)| s.value_inc_vat)
            .map_or(0.0, |daily| daily * day_fraction);

        let mut point = Point::new(measurement, at)
            .field("consumption", used)
            .field("unit_rate", unit_rate)
            .field("cost", cost)
            .field("standing_charge", standing_charge)
            .field("total_cost", cost + standing_charge)
            .tag("time_of_day", at.with_timezone(&settings.tz).format("%H:%M").to_string());
        if let Some(code) = &rate.tariff_code {
            point = point.tag("tariff_code", code.clone());
        }
        if let Some(band) = rate.rate_band {
            point = point.tag("active_rate", band.as_str());
        }
        for (k, v) in extra_tags {
            point = point.tag(k.clone(), v.clone());
        }
        out.points.push(point);
    }
    out
}
