use std::{collections::BTreeMap, fs, path::PathBuf};

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use octograph_client::time::{local_date, parse_tz};
use serde::Deserialize;

use crate::transform::{BandHours, Resolution};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no Octopus API key provided")]
    MissingApiKey,
    #[error("no Octopus account number set")]
    MissingAccountNumber,
    #[error("invalid resolution: {0} minutes (supported: 30, 60, 1440, 10080)")]
    UnsupportedResolution(u32),
    #[error("low rate hour {0} is outside 0..=23")]
    BandHourOutOfRange(u32),
    #[error("low rate band starts and ends at hour {0}")]
    DegenerateBand(u32),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("date range is inverted: {from} is after {to}")]
    InvertedDateRange { from: NaiveDate, to: NaiveDate },
}

#[derive(Debug, Clone, Deserialize)]
pub struct OctopusConfig {
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub account_number: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_resolution_minutes")]
    pub resolution_minutes: u32,
    pub payment_method: Option<String>,
    pub included_meters: Option<Vec<String>>,
    #[serde(default)]
    pub low_rate_start_hour: u32,
    #[serde(default = "default_low_rate_end_hour")]
    pub low_rate_end_hour: u32,
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_api_prefix() -> String {
    "https://api.octopus.energy/v1".into()
}

fn default_timezone() -> String {
    "Europe/London".into()
}

fn default_resolution_minutes() -> u32 {
    30
}

fn default_low_rate_end_hour() -> u32 {
    7
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_min_request_interval_ms() -> u64 {
    200
}

fn default_concurrency() -> usize {
    2
}

/// Gas meter settings. SMETS2 meters (`meter_type > 1`) report volume and
/// need converting to kWh.
#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    #[serde(default = "default_meter_type")]
    pub meter_type: u32,
    #[serde(default = "default_volume_correction_factor")]
    pub volume_correction_factor: f64,
    #[serde(default = "default_calorific_value")]
    pub calorific_value: f64,
}

fn default_meter_type() -> u32 {
    1
}

fn default_volume_correction_factor() -> f64 {
    1.02264
}

fn default_calorific_value() -> f64 {
    40.0
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            meter_type: default_meter_type(),
            volume_correction_factor: default_volume_correction_factor(),
            calorific_value: default_calorific_value(),
        }
    }
}

impl GasConfig {
    /// m³ to kWh factor, or `None` when the meter already reports kWh.
    pub fn conversion_factor(&self) -> Option<f64> {
        (self.meter_type > 1).then(|| self.volume_correction_factor * self.calorific_value / 3.6)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    pub max_connections: u32,
    pub ilp_tcp_addr: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_bucket() -> String {
    "energy".into()
}

fn default_batch_size() -> usize {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub octopus: OctopusConfig,
    #[serde(default)]
    pub gas: GasConfig,
    pub questdb: QuestDbConfig,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub metrics: Option<MetricsConfig>,
}

/// Validated, typed view of the parts of [`AppConfig`] the pipeline needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tz: Tz,
    pub resolution: Resolution,
    pub band: BandHours,
    pub payment_method: Option<String>,
    pub included_meters: Option<Vec<String>>,
    pub gas_conversion_factor: Option<f64>,
    pub tags: BTreeMap<String, String>,
    pub concurrency: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        use std::env;

        let path = env::var("OCTOGRAPH_CONFIG").unwrap_or_else(|_| "octograph-config.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Checks everything that would otherwise fail half-way through a run.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let o = &self.octopus;
        if o.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if o.account_number.trim().is_empty() {
            return Err(ConfigError::MissingAccountNumber);
        }
        if o.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        let tz = parse_tz(&o.timezone).map_err(|_| ConfigError::UnknownTimezone(o.timezone.clone()))?;
        let resolution = Resolution::try_from(o.resolution_minutes)?;
        let band = BandHours::new(o.low_rate_start_hour, o.low_rate_end_hour)?;

        Ok(Settings {
            tz,
            resolution,
            band,
            payment_method: o.payment_method.clone(),
            included_meters: o.included_meters.clone(),
            gas_conversion_factor: self.gas.conversion_factor(),
            tags: self.tags.clone(),
            concurrency: o.concurrency,
        })
    }
}

/// Inclusive range of local calendar dates to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// `[FROM_DATE [TO_DATE]]`; both default to yesterday in `tz`, and a lone
    /// `FROM_DATE` runs up to yesterday.
    pub fn from_args<I, S>(args: I, tz: Tz) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let today = local_date(Utc::now(), tz);
        let yesterday = today.pred_opt().unwrap_or(today);

        let mut args = args.into_iter();
        let from = args.next().map(|s| parse_date(s.as_ref())).transpose()?;
        let to = args.next().map(|s| parse_date(s.as_ref())).transpose()?;

        let to = to.unwrap_or(yesterday);
        let from = from.unwrap_or(to);
        if from > to {
            return Err(ConfigError::InvertedDateRange { from, to });
        }
        Ok(Self { from, to })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| ConfigError::InvalidDate(s.to_string()))
}
