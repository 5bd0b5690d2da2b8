use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PerpsError;

/// Lookback duration over which trader and liquidation metrics are computed.
///
/// Ordering follows duration, so a `BTreeMap<TimeWindow, _>` serializes
/// shortest window first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "24h")]
    Day,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 4] = [
        TimeWindow::OneHour,
        TimeWindow::FourHours,
        TimeWindow::EightHours,
        TimeWindow::Day,
    ];

    pub fn hours(&self) -> u32 {
        match self {
            TimeWindow::OneHour => 1,
            TimeWindow::FourHours => 4,
            TimeWindow::EightHours => 8,
            TimeWindow::Day => 24,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::OneHour => "1h",
            TimeWindow::FourHours => "4h",
            TimeWindow::EightHours => "8h",
            TimeWindow::Day => "24h",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours()))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = PerpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1h" => Ok(TimeWindow::OneHour),
            "4h" => Ok(TimeWindow::FourHours),
            "8h" => Ok(TimeWindow::EightHours),
            "24h" | "1d" => Ok(TimeWindow::Day),
            _ => Err(PerpsError::InvalidWindow(s.to_string())),
        }
    }
}
