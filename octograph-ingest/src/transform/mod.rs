//! Pure transformations from provider rows to per-slot points.

mod agreements;
mod bands;
mod cost;
mod series;

pub use agreements::{AgreementPlan, AgreementSpan, AgreementWindowResolver, CoverageGap};
pub use bands::{BandHours, DayNightBandNormaliser};
pub use cost::{compute_costs, CostSettings, CostedSeries};
pub use series::{Resolution, Series, SeriesMaterialiser, SlotEntry, SlotKey};
