mod agreement;
mod interval;
mod point;

pub use agreement::{Agreement, CollectionWindow};
pub use interval::{RateBand, RateInterval, RatePayload};
pub use point::{table_name, Point};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("empty interval: valid_from {from} is not before valid_to {to}")]
    EmptyInterval { from: String, to: String },
    #[error("empty collection window: {from} is not before {to}")]
    EmptyWindow { from: String, to: String },
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(String),
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}
