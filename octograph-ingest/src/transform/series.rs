//! Fixed-resolution series materialisation.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, Utc};
use octograph_client::{
    time::{iso8601, minutes_between},
    RateBand, RateInterval, RatePayload,
};
use serde::{Serialize, Serializer};

use crate::config::ConfigError;

/// Supported reporting slot lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    HalfHour,
    Hour,
    Day,
    Week,
}

impl Resolution {
    pub fn minutes(self) -> u32 {
        match self {
            Resolution::HalfHour => 30,
            Resolution::Hour => 60,
            Resolution::Day => 60 * 24,
            Resolution::Week => 60 * 24 * 7,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::minutes(i64::from(self.minutes()))
    }

    /// Provider `group_by` value for consumption at this resolution.
    pub fn group_by(self) -> Option<&'static str> {
        match self {
            Resolution::HalfHour => None,
            Resolution::Hour => Some("hour"),
            Resolution::Day => Some("day"),
            Resolution::Week => Some("week"),
        }
    }

    /// Day and week slots follow local calendar boundaries, so their length
    /// in UTC varies across DST changes.
    pub fn is_calendar(self) -> bool {
        matches!(self, Resolution::Day | Resolution::Week)
    }

    /// Share of a day one slot represents, used to spread daily charges.
    pub fn day_fraction(self) -> f64 {
        f64::from(self.minutes()) / 1440.0
    }
}

impl TryFrom<u32> for Resolution {
    type Error = ConfigError;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        match minutes {
            30 => Ok(Resolution::HalfHour),
            60 => Ok(Resolution::Hour),
            1440 => Ok(Resolution::Day),
            10080 => Ok(Resolution::Week),
            other => Err(ConfigError::UnsupportedResolution(other)),
        }
    }
}

/// Slot start instant; displays and serialises in the UTC wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey(DateTime<Utc>);

impl SlotKey {
    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&iso8601(self.0))
    }
}

impl Serialize for SlotKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// The fields a slot keeps from its source row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tariff_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_exc_vat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_inc_vat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumption: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_band: Option<RateBand>,
}

impl From<&RatePayload> for SlotEntry {
    fn from(p: &RatePayload) -> Self {
        SlotEntry {
            tariff_code: p.tariff_code.clone(),
            value_exc_vat: p.value_exc_vat,
            value_inc_vat: p.value_inc_vat,
            consumption: p.consumption,
            rate_band: p.rate_band,
        }
    }
}

/// One entry per slot, in ascending time order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Series {
    slots: BTreeMap<SlotKey, SlotEntry>,
    #[serde(skip)]
    resolution: Resolution,
}

impl Series {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            slots: BTreeMap::new(),
            resolution,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, at: DateTime<Utc>) -> Option<&SlotEntry> {
        self.slots.get(&SlotKey(at))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotKey, &SlotEntry)> {
        self.slots.iter()
    }

    /// The slot whose span contains `at`: the latest key at or before `at`
    /// that is less than one resolution earlier.
    pub fn covering(&self, at: DateTime<Utc>) -> Option<(&SlotKey, &SlotEntry)> {
        let step = self.resolution.duration();
        self.slots
            .range(..=SlotKey(at))
            .next_back()
            .filter(|(key, _)| at - key.0 < step)
    }
}

/// Expands validity intervals into one entry per fixed-length slot.
#[derive(Debug, Clone, Copy)]
pub struct SeriesMaterialiser {
    resolution: Resolution,
}

impl SeriesMaterialiser {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    /// Slots start at each row's `valid_from` and step by the resolution while
    /// inside the row. A later row writing an existing key replaces it.
    ///
    /// Consumption is a quantity, so a row whose span differs from one slot
    /// has it scaled to the full-slot-equivalent rate
    /// `consumption / (span / resolution)`. Prices are rates and never scaled.
    pub fn materialise(&self, rows: &[RateInterval]) -> Series {
        let step = self.resolution.duration();
        let slot_minutes = f64::from(self.resolution.minutes());
        let mut series = Series::new(self.resolution);

        for row in rows {
            let span_slots = minutes_between(row.valid_from(), row.valid_to()) / slot_minutes;
            let mut at = row.valid_from();
            while at < row.valid_to() {
                let mut entry = SlotEntry::from(&row.payload);
                if let Some(consumption) = entry.consumption {
                    entry.consumption = Some(consumption / span_slots);
                }
                series.slots.insert(SlotKey(at), entry);
                at += step;
            }
        }
        series
    }

    /// Materialise metered readings.
    ///
    /// At day and week resolution the provider already groups readings by
    /// local calendar day or week, and a 23 or 25 hour day is still one slot.
    /// Each reading keeps a single slot at its start with the quantity as
    /// measured. Finer resolutions go through [`Self::materialise`].
    pub fn materialise_readings(&self, rows: &[RateInterval]) -> Series {
        if !self.resolution.is_calendar() {
            return self.materialise(rows);
        }
        let mut series = Series::new(self.resolution);
        for row in rows {
            series.slots.insert(SlotKey(row.valid_from()), SlotEntry::from(&row.payload));
        }
        series
    }
}
