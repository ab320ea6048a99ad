//! Series summary statistics

use crate::indicators::sample_std;
use rust_decimal::Decimal;
use serde::Serialize;
use types::processed::ProcessedBar;

/// Whole-series statistics; every field is `None` on an empty series
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    pub bars: usize,
    pub mean_return: Option<f64>,
    pub std_return: Option<f64>,
    pub mean_volume: Option<f64>,
    pub max_high: Option<Decimal>,
    pub min_low: Option<Decimal>,
    /// `max_high - min_low`
    pub price_range: Option<Decimal>,
}

pub fn get_summary_stats(bars: &[ProcessedBar]) -> SummaryStats {
    if bars.is_empty() {
        return SummaryStats::default();
    }

    let returns: Vec<f64> = bars.iter().filter_map(|b| b.indicators.daily_return).collect();
    let mean_return =
        (!returns.is_empty()).then(|| returns.iter().sum::<f64>() / returns.len() as f64);
    let mean_volume = bars.iter().map(|b| b.volume as f64).sum::<f64>() / bars.len() as f64;
    let max_high = bars.iter().map(|b| b.high).max();
    let min_low = bars.iter().map(|b| b.low).min();

    SummaryStats {
        bars: bars.len(),
        mean_return,
        std_return: sample_std(&returns),
        mean_volume: Some(mean_volume),
        max_high,
        min_low,
        price_range: max_high.zip(min_low).map(|(high, low)| high - low),
    }
}
