pub mod db;
pub mod domain;
pub mod time;

pub use domain::{table_name, Agreement, CollectionWindow, DomainError, Point, RateBand, RateInterval, RatePayload};
