use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DomainError;
use crate::time::{iso8601, iso8601_format};

/// A tariff assignment for a meter point over its own validity window.
///
/// `valid_to == None` means the agreement is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub tariff_code: String,
    #[serde(with = "iso8601_format")]
    pub valid_from: DateTime<Utc>,
    #[serde(default, with = "iso8601_format::option")]
    pub valid_to: Option<DateTime<Utc>>,
}

impl Agreement {
    /// End of the agreement, with an open end standing in for `horizon`.
    pub fn end_or(&self, horizon: DateTime<Utc>) -> DateTime<Utc> {
        self.valid_to.unwrap_or(horizon)
    }
}

/// Caller-supplied `[from, to)` bounds for one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionWindow {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl CollectionWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, DomainError> {
        if from >= to {
            return Err(DomainError::EmptyWindow {
                from: iso8601(from),
                to: iso8601(to),
            });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> DateTime<Utc> {
        self.from
    }

    pub fn to(&self) -> DateTime<Utc> {
        self.to
    }
}
