//! Bucket granularities and query periods
//!
//! Buckets are aligned to the Unix epoch, so a 30-minute bucket always
//! starts on :00 or :30 and a daily bucket at 00:00 UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Supported bucket widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    /// 30 minutes
    #[serde(rename = "30m")]
    M30,
    /// 1 hour
    #[serde(rename = "1h")]
    H1,
    /// 1 day
    #[serde(rename = "1d")]
    D1,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::M30 => 30 * 60,
            Granularity::H1 => 3600,
            Granularity::D1 => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Granularity::M30 => "30m",
            Granularity::H1 => "1h",
            Granularity::D1 => "1d",
        }
    }

    pub fn all() -> &'static [Granularity] {
        &[Granularity::M30, Granularity::H1, Granularity::D1]
    }

    /// Floor `time` to the start of its bucket.
    pub fn align_to_boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.seconds();
        let aligned = time.timestamp().div_euclid(width) * width;
        DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(time)
    }

    /// How far back materialization keeps buckets: the longest period
    /// served at this granularity.
    pub fn horizon(&self) -> Duration {
        Period::all()
            .iter()
            .filter(|p| p.granularity() == *self)
            .map(|p| p.length())
            .max()
            .unwrap_or_else(|| self.duration())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Query window lengths exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "7d")]
    D7,
    #[serde(rename = "30d")]
    D30,
    #[serde(rename = "90d")]
    D90,
    #[serde(rename = "1y")]
    Y1,
}

impl Period {
    pub fn all() -> &'static [Period] {
        &[Period::D7, Period::D30, Period::D90, Period::Y1]
    }

    /// 7d buckets at 30 minutes, 30d/90d at one hour, 1y at one day.
    pub fn granularity(&self) -> Granularity {
        match self {
            Period::D7 => Granularity::M30,
            Period::D30 | Period::D90 => Granularity::H1,
            Period::Y1 => Granularity::D1,
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            Period::D7 => Duration::days(7),
            Period::D30 => Duration::days(30),
            Period::D90 => Duration::days(90),
            Period::Y1 => Duration::days(365),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::D7 => "7d",
            Period::D30 => "30d",
            Period::D90 => "90d",
            Period::Y1 => "1y",
        }
    }

    /// First bucket of the window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.granularity().align_to_boundary(now - self.length())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7d" => Ok(Period::D7),
            "30d" => Ok(Period::D30),
            "90d" => Ok(Period::D90),
            "1y" => Ok(Period::Y1),
            other => Err(format!("Unknown period: {}", other)),
        }
    }
}
