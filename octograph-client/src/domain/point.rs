use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// One row destined for the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            time,
            fields: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Table a measurement lands in; the bucket acts as a table-name prefix.
pub fn table_name(bucket: &str, measurement: &str) -> String {
    if bucket.is_empty() {
        measurement.to_string()
    } else {
        format!("{bucket}_{measurement}")
    }
}
