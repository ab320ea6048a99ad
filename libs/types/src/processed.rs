//! Analysis-ready bars
//!
//! Indicator columns are `Option<f64>`: `None` means "not enough history",
//! which is distinct from a computed zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Derived columns of one processed bar
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Indicators {
    /// Percent change of close versus the previous bar
    pub daily_return: Option<f64>,
    /// Short moving average of close
    pub ma_short: Option<f64>,
    /// Long moving average of close
    pub ma_long: Option<f64>,
    /// Rolling sample standard deviation of `daily_return`
    pub volatility: Option<f64>,
    /// Moving average of volume
    pub volume_ma: Option<f64>,
    /// Close minus the close `momentum` bars earlier
    pub momentum: Option<f64>,
    /// Running mean of close since the first bar
    pub cumulative_average: Option<f64>,
    /// Moving average of each trading day's last close, shared by every
    /// bar of that day
    #[serde(default)]
    pub eod_ma: Option<f64>,
}

/// One row of a processed series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    /// Synthesized by gap fill rather than observed
    pub filled: bool,
    #[serde(flatten)]
    pub indicators: Indicators,
}
