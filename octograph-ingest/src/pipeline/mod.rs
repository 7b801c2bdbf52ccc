use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use octograph_client::{
    time::iso8601_format,
    DomainError, Point, RateInterval, RatePayload,
};
use serde::Deserialize;

use crate::{config::ConfigError, sources::FetchError};

mod batch;

pub use batch::{jobs_for_account, BatchPipeline, BatchReport, MeterJob, MeterReport};

/// Failure of one meter point's run. Other meter points carry on.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid data: {0}")]
    Domain(#[from] DomainError),
    #[error("store error: {0}")]
    Store(String),
    #[error("sink error: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Utility {
    Electricity,
    Gas,
}

impl Utility {
    /// Measurement name of the cost series.
    pub fn measurement(self) -> &'static str {
        match self {
            Utility::Electricity => "electricity",
            Utility::Gas => "gas",
        }
    }
}

/// A physical meter on a meter point (MPAN for electricity, MPRN for gas).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterRef {
    pub utility: Utility,
    pub meter_point: String,
    pub serial_number: String,
}

impl MeterRef {
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("meter_point".to_string(), self.meter_point.clone()),
            ("serial_number".to_string(), self.serial_number.clone()),
        ])
    }
}

/// One rate row as the provider publishes it. Fields without a typed home
/// are kept in `extra` and travel with the row's payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PriceRow {
    #[serde(default, with = "iso8601_format::option")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, with = "iso8601_format::option")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub value_exc_vat: Option<f64>,
    #[serde(default)]
    pub value_inc_vat: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PriceRow {
    pub fn payload(&self) -> RatePayload {
        RatePayload {
            value_exc_vat: self.value_exc_vat,
            value_inc_vat: self.value_inc_vat,
            payment_method: self.payment_method.clone(),
            extra: self.extra.clone(),
            ..Default::default()
        }
    }
}

/// Rate rows per pricing component (`standing_charges`, `standard_unit_rates`, ...).
pub type Pricing = BTreeMap<String, Vec<PriceRow>>;

/// One metered reading.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumptionReading {
    pub consumption: f64,
    #[serde(with = "iso8601_format")]
    pub interval_start: DateTime<Utc>,
    #[serde(with = "iso8601_format")]
    pub interval_end: DateTime<Utc>,
}

impl ConsumptionReading {
    pub fn into_interval(self) -> Result<RateInterval, DomainError> {
        let payload = RatePayload {
            consumption: Some(self.consumption),
            ..Default::default()
        };
        RateInterval::new(self.interval_start, self.interval_end, payload)
    }
}

#[async_trait::async_trait]
pub trait PricingSource: Send + Sync {
    async fn fetch_pricing(
        &self,
        tariff_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Pricing, FetchError>;
}

#[async_trait::async_trait]
pub trait ConsumptionSource: Send + Sync {
    async fn fetch_consumption(
        &self,
        meter: &MeterRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ConsumptionReading>, FetchError>;
}

#[async_trait::async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, bucket: &str, points: Vec<Point>) -> Result<(), PipelineError>;
}
