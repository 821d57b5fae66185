// =============================================================================
// Shared types used across the market-pulse service
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single request-state cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl Default for FetchStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of a request-state cell as seen by the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchState<T> {
    pub status: FetchStatus,
    pub data: Option<T>,
    pub error: Option<String>,
    /// When the last fetch settled (success or error).
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> FetchState<T> {
    pub fn idle() -> Self {
        Self {
            status: FetchStatus::Idle,
            data: None,
            error: None,
            updated_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == FetchStatus::Loading
    }
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Aggregate bar width accepted by the time-series endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Default for Timespan {
    fn default() -> Self {
        Self::Day
    }
}

impl Timespan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl std::fmt::Display for Timespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timespan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown timespan '{other}'")),
        }
    }
}

/// Chart range presets offered by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1D")]
    OneDay,
    #[serde(rename = "1W")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "1Y")]
    OneYear,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::OneMonth
    }
}

impl TimeRange {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OneDay => "1D",
            Self::OneWeek => "1W",
            Self::OneMonth => "1M",
            Self::ThreeMonths => "3M",
            Self::OneYear => "1Y",
        }
    }

    /// First day covered by the range when it ends on `today`.
    ///
    /// Month arithmetic is calendar based and clamps to the end of shorter
    /// months (31 March minus one month is 28/29 February).
    pub fn from_date(&self, today: NaiveDate) -> NaiveDate {
        let shifted = match self {
            Self::OneDay => today.checked_sub_days(Days::new(1)),
            Self::OneWeek => today.checked_sub_days(Days::new(7)),
            Self::OneMonth => today.checked_sub_months(Months::new(1)),
            Self::ThreeMonths => today.checked_sub_months(Months::new(3)),
            Self::OneYear => today.checked_sub_months(Months::new(12)),
        };
        shifted.unwrap_or(today)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1D" => Ok(Self::OneDay),
            "1W" => Ok(Self::OneWeek),
            "1M" => Ok(Self::OneMonth),
            "3M" => Ok(Self::ThreeMonths),
            "1Y" => Ok(Self::OneYear),
            other => Err(format!("unknown time range '{other}'. Use 1D, 1W, 1M, 3M or 1Y")),
        }
    }
}

/// Normalise user-entered ticker input (`" aapl "` -> `"AAPL"`).
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn time_range_from_dates() {
        let today = date(2024, 3, 31);
        assert_eq!(TimeRange::OneDay.from_date(today), date(2024, 3, 30));
        assert_eq!(TimeRange::OneWeek.from_date(today), date(2024, 3, 24));
        assert_eq!(TimeRange::OneMonth.from_date(today), date(2024, 2, 29));
        assert_eq!(TimeRange::ThreeMonths.from_date(today), date(2023, 12, 31));
        assert_eq!(TimeRange::OneYear.from_date(today), date(2023, 3, 31));
    }

    #[test]
    fn time_range_parses_labels() {
        assert_eq!("3m".parse::<TimeRange>().unwrap(), TimeRange::ThreeMonths);
        assert!("2Y".parse::<TimeRange>().is_err());
        let json = serde_json::to_string(&TimeRange::OneYear).unwrap();
        assert_eq!(json, "\"1Y\"");
    }

    #[test]
    fn timespan_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Timespan::Quarter).unwrap(), "\"quarter\"");
        assert_eq!("HOUR".parse::<Timespan>().unwrap(), Timespan::Hour);
    }

    #[test]
    fn symbols_are_trimmed_and_uppercased() {
        assert_eq!(normalize_symbol("  msft "), "MSFT");
        assert_eq!(normalize_symbol("binance:btcusdt"), "BINANCE:BTCUSDT");
        assert_eq!(normalize_symbol("   "), "");
    }
}
