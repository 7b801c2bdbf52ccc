//! Day/night band splitting.
//!
//! Dual-register tariffs publish "day" and "night" rates as long multi-day
//! validity ranges, while the cheap band itself is a clock-hour range that
//! repeats every local day. [`DayNightBandNormaliser`] turns both into
//! calendar-day-aligned sub-intervals tagged with the band they belong to.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use octograph_client::{
    time::{local_at, local_date, local_midnight, next_day},
    RateBand, RateInterval,
};

use crate::config::ConfigError;

/// Clock hours delimiting the low-rate band, `[low_start, low_end)` local time.
///
/// A band that ends before it starts wraps past midnight. Equal hours would
/// make the band either empty or the whole day, so they are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandHours {
    low_start: u32,
    low_end: u32,
}

impl BandHours {
    pub fn new(low_start: u32, low_end: u32) -> Result<Self, ConfigError> {
        for hour in [low_start, low_end] {
            if hour > 23 {
                return Err(ConfigError::BandHourOutOfRange(hour));
            }
        }
        if low_start == low_end {
            return Err(ConfigError::DegenerateBand(low_start));
        }
        Ok(Self { low_start, low_end })
    }

    pub fn low_start(&self) -> u32 {
        self.low_start
    }

    pub fn low_end(&self) -> u32 {
        self.low_end
    }
}

pub struct DayNightBandNormaliser {
    start_limit: DateTime<Utc>,
    end_limit: DateTime<Utc>,
    tz: Tz,
    hours: BandHours,
}

impl DayNightBandNormaliser {
    /// Normaliser clipping to the local calendar days `window_start..=window_end`.
    pub fn new(window_start: NaiveDate, window_end: NaiveDate, tz: Tz, hours: BandHours) -> Self {
        Self {
            start_limit: local_midnight(window_start, tz),
            end_limit: local_midnight(next_day(window_end), tz),
            tz,
            hours,
        }
    }

    /// Day rows become high-rate pieces outside the low band, night rows
    /// low-rate pieces inside it. Output order is unspecified.
    pub fn normalise(&self, day_rates: &[RateInterval], night_rates: &[RateInterval]) -> Vec<RateInterval> {
        let mut out = Vec::new();
        for row in day_rates {
            out.extend(self.split(row, self.hours.low_end, self.hours.low_start, RateBand::High));
        }
        for row in night_rates {
            out.extend(self.split(row, self.hours.low_start, self.hours.low_end, RateBand::Low));
        }
        out
    }

    /// Cut `row` into the daily pieces of `[start_hour, end_hour)`.
    fn split(&self, row: &RateInterval, start_hour: u32, end_hour: u32, band: RateBand) -> Vec<RateInterval> {
        let Some(row) = row.clip(self.start_limit, self.end_limit) else {
            return Vec::new();
        };
        let tz = self.tz;
        let row_end = row.valid_to();

        let mut day = local_date(row.valid_from(), tz);
        let mut midnight = local_midnight(day, tz);
        let mut out = Vec::new();

        if start_hour < end_hour {
            while midnight < row_end {
                emit(&mut out, &row, band, local_at(day, start_hour, tz), local_at(day, end_hour, tz));
                day = next_day(day);
                midnight = local_midnight(day, tz);
            }
        } else {
            // Tail of the band that began the previous evening.
            if end_hour != 0 {
                emit(&mut out, &row, band, midnight, local_at(day, end_hour, tz));
            }
            while midnight < row_end {
                let from = local_at(day, start_hour, tz);
                day = next_day(day);
                midnight = local_midnight(day, tz);
                emit(&mut out, &row, band, from, local_at(day, end_hour, tz));
            }
        }
        out
    }
}

fn emit(out: &mut Vec<RateInterval>, row: &RateInterval, band: RateBand, from: DateTime<Utc>, to: DateTime<Utc>) {
    if let Some(mut piece) = row.clip(from, to) {
        piece.payload.rate_band = Some(band);
        out.push(piece);
    }
}
