use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DomainError;
use crate::time::{iso8601, iso8601_format};

/// Which side of the day/night split a rate row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateBand {
    Low,
    High,
}

impl RateBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateBand::Low => "low",
            RateBand::High => "high",
        }
    }
}

/// Payload carried by a rate or consumption interval.
///
/// Known fields are typed; anything else the provider sends is kept verbatim
/// in `extra` and passed through every stage untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tariff_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_exc_vat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_inc_vat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumption: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_band: Option<RateBand>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Half-open `[valid_from, valid_to)` range with a payload.
///
/// The bounds are private so that `valid_from < valid_to` holds for every
/// value, including deserialised ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RateIntervalRepr", into = "RateIntervalRepr")]
pub struct RateInterval {
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    pub payload: RatePayload,
}

#[derive(Clone, Serialize, Deserialize)]
struct RateIntervalRepr {
    #[serde(with = "iso8601_format")]
    valid_from: DateTime<Utc>,
    #[serde(with = "iso8601_format")]
    valid_to: DateTime<Utc>,
    #[serde(flatten)]
    payload: RatePayload,
}

impl TryFrom<RateIntervalRepr> for RateInterval {
    type Error = DomainError;

    fn try_from(r: RateIntervalRepr) -> Result<Self, Self::Error> {
        RateInterval::new(r.valid_from, r.valid_to, r.payload)
    }
}

impl From<RateInterval> for RateIntervalRepr {
    fn from(i: RateInterval) -> Self {
        RateIntervalRepr {
            valid_from: i.valid_from,
            valid_to: i.valid_to,
            payload: i.payload,
        }
    }
}

impl RateInterval {
    pub fn new(
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        payload: RatePayload,
    ) -> Result<Self, DomainError> {
        if valid_from >= valid_to {
            return Err(DomainError::EmptyInterval {
                from: iso8601(valid_from),
                to: iso8601(valid_to),
            });
        }
        Ok(Self {
            valid_from,
            valid_to,
            payload,
        })
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_to(&self) -> DateTime<Utc> {
        self.valid_to
    }

    /// Copy of this interval truncated to `[from, to)`, or `None` when the two
    /// ranges do not overlap.
    pub fn clip(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<Self> {
        let valid_from = self.valid_from.max(from);
        let valid_to = self.valid_to.min(to);
        (valid_from < valid_to).then(|| Self {
            valid_from,
            valid_to,
            payload: self.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_instant;
    use pretty_assertions::assert_eq;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    #[test]
    fn new_rejects_empty_and_inverted_ranges() {
        let at = ts("2023-02-01T00:00:00Z");
        assert!(RateInterval::new(at, at, RatePayload::default()).is_err());
        assert!(RateInterval::new(at, ts("2023-01-31T00:00:00Z"), RatePayload::default()).is_err());
    }

    #[test]
    fn clip_keeps_payload_and_drops_disjoint_ranges() {
        let payload = RatePayload {
            value_inc_vat: Some(21.0),
            ..Default::default()
        };
        let row = RateInterval::new(ts("2023-01-01T00:00:00Z"), ts("2023-03-01T00:00:00Z"), payload).unwrap();

        let clipped = row.clip(ts("2023-02-01T00:00:00Z"), ts("2023-04-01T00:00:00Z")).unwrap();
        assert_eq!(clipped.valid_from(), ts("2023-02-01T00:00:00Z"));
        assert_eq!(clipped.valid_to(), ts("2023-03-01T00:00:00Z"));
        assert_eq!(clipped.payload.value_inc_vat, Some(21.0));

        assert!(row.clip(ts("2023-03-01T00:00:00Z"), ts("2023-04-01T00:00:00Z")).is_none());
    }

    #[test]
    fn deserialising_keeps_unknown_fields_and_enforces_order() {
        let row: RateInterval = serde_json::from_str(
            r#"{"valid_from":"2023-02-01T00:00:00Z","valid_to":"2023-02-02T00:00:00Z","value_inc_vat":30.5,"rate":10}"#,
        )
        .unwrap();
        assert_eq!(row.payload.extra.get("rate"), Some(&serde_json::json!(10)));

        let inverted = serde_json::from_str::<RateInterval>(
            r#"{"valid_from":"2023-02-02T00:00:00Z","valid_to":"2023-02-01T00:00:00Z"}"#,
        );
        assert!(inverted.is_err());
    }
}
