//! UTC exchange format and local wall-clock helpers.
//!
//! Instants are stored and exchanged in UTC. Calendar-day and clock-hour
//! arithmetic happens in the account's local zone, so that a "day" is 23 or 25
//! real hours long across daylight-saving transitions.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::DomainError;

/// Fixed UTC wire format, second precision with a literal `Z`.
pub const ISO8601_UTC: &str = "%Y-%m-%dT%H:%M:%SZ";

// Longest DST gap we are willing to step across, in 15 minute steps.
const MAX_GAP_STEPS: u32 = 96;

pub fn iso8601(ts: DateTime<Utc>) -> String {
    ts.format(ISO8601_UTC).to_string()
}

/// Parse an RFC 3339 timestamp with any offset and normalise it to UTC.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::InvalidTimestamp(format!("'{s}': {e}")))
}

pub fn parse_tz(name: &str) -> Result<Tz, DomainError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| DomainError::UnknownTimezone(name.to_string()))
}

/// Calendar date of `ts` as seen in `tz`.
pub fn local_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    local_at(date, 0, tz)
}

/// Resolve `hour:00` local time on `date` to an instant.
///
/// Ambiguous wall-clock times (the repeated hour in autumn) resolve to the
/// earlier instant. Wall-clock times that do not exist (the skipped hour in
/// spring) resolve forward to the first instant after the gap.
pub fn local_at(date: NaiveDate, hour: u32, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(chrono::NaiveTime::MIN) + Duration::hours(i64::from(hour));
    resolve_local(naive, tz)
}

fn resolve_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..MAX_GAP_STEPS {
        if let Some(ts) = tz.from_local_datetime(&candidate).earliest() {
            return ts.with_timezone(&Utc);
        }
        candidate += Duration::minutes(15);
    }
    // No real zone has a day-long gap; fall back to reading the wall clock as UTC.
    Utc.from_utc_datetime(&naive)
}

pub fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(NaiveDate::MAX)
}

/// Minutes between two instants as a float, negative when `b < a`.
pub fn minutes_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_seconds() as f64 / 60.0
}

/// Serde adapter writing instants in [`ISO8601_UTC`] and reading any RFC 3339 offset.
pub mod iso8601_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::iso8601(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_instant(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_str(&crate::time::iso8601(*ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|r| crate::time::parse_instant(&r).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::London;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn iso8601_is_utc_with_literal_z() {
        let ts = parse_instant("2023-08-01T01:00:00+01:00").unwrap();
        assert_eq!(iso8601(ts), "2023-08-01T00:00:00Z");
    }

    #[test]
    fn parse_instant_rejects_garbage() {
        assert!(matches!(parse_instant("yesterday"), Err(DomainError::InvalidTimestamp(_))));
    }

    #[test]
    fn local_midnight_follows_summer_time() {
        assert_eq!(iso8601(local_midnight(date(2023, 2, 1), London)), "2023-02-01T00:00:00Z");
        assert_eq!(iso8601(local_midnight(date(2023, 8, 1), London)), "2023-07-31T23:00:00Z");
    }

    #[test]
    fn day_lengths_change_across_transitions() {
        let spring = local_midnight(date(2023, 3, 27), London) - local_midnight(date(2023, 3, 26), London);
        let autumn = local_midnight(date(2023, 10, 30), London) - local_midnight(date(2023, 10, 29), London);
        assert_eq!(spring.num_hours(), 23);
        assert_eq!(autumn.num_hours(), 25);
    }

    #[test]
    fn skipped_hour_resolves_forward_to_the_transition() {
        // 01:00 does not exist in London on 2023-03-26; clocks jump at 01:00 UTC.
        assert_eq!(iso8601(local_at(date(2023, 3, 26), 1, London)), "2023-03-26T01:00:00Z");
        assert_eq!(iso8601(local_at(date(2023, 3, 26), 2, London)), "2023-03-26T01:00:00Z");
    }

    #[test]
    fn repeated_hour_resolves_to_the_earlier_instant() {
        assert_eq!(iso8601(local_at(date(2023, 10, 29), 1, London)), "2023-10-29T00:00:00Z");
    }

    #[test]
    fn iso8601_format_round_trips_through_serde() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Row {
            #[serde(with = "iso8601_format")]
            at: DateTime<Utc>,
            #[serde(default, with = "iso8601_format::option")]
            until: Option<DateTime<Utc>>,
        }

        let row: Row = serde_json::from_str(r#"{"at":"2023-02-01T02:00:00+00:00","until":null}"#).unwrap();
        assert!(row.until.is_none());
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"at":"2023-02-01T02:00:00Z","until":null}"#);
    }
}
