//! Preprocessing pipeline for one symbol's series
//!
//! Steps run in a fixed order and each can be switched off:
//!
//! 1. hygiene: sort, drop repeated timestamps (first kept), invalid quotes
//!    and quotes of another symbol
//! 2. session filter
//! 3. resampling to a coarser period
//! 4. gap fill on the output period's grid
//! 5. indicators
//!
//! Canonical data is never modified; results go to the processed table.

use crate::gap_fill::{fill_gaps, FilledBar, GapFillOptions};
use crate::indicators;
use crate::resample::resample;
use crate::session::TradingSession;
use crate::summary::{get_summary_stats, SummaryStats};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use persistence::canonical::{CanonicalStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use types::config::{IndicatorWindows, PipelineConfig};
use types::errors::ConfigurationError;
use types::ids::Symbol;
use types::period::BarPeriod;
use types::processed::{Indicators, ProcessedBar};
use types::quote::Quote;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessOptions {
    /// `None` disables the session filter and the session-aware grid
    pub session: Option<TradingSession>,
    /// Calendar for resampling buckets
    pub timezone: Tz,
    /// Period of the stored bars
    pub source_period: BarPeriod,
    pub resample: Option<BarPeriod>,
    pub gap_fill: Option<GapFillOptions>,
    pub indicators: Option<IndicatorWindows>,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            session: Some(TradingSession::default()),
            timezone: chrono_tz::America::New_York,
            source_period: BarPeriod::M5,
            resample: None,
            gap_fill: Some(GapFillOptions::default()),
            indicators: Some(IndicatorWindows::default()),
        }
    }
}

impl PreprocessOptions {
    pub fn from_config(
        config: &PipelineConfig,
        symbol: &Symbol,
    ) -> Result<Self, ConfigurationError> {
        let source_period = config.symbol(symbol)?.interval;
        let pre = &config.preprocessing;

        if let Some(target) = pre.resample {
            if target < source_period {
                return Err(ConfigurationError::invalid(
                    "preprocessing.resample",
                    format!("{target} is finer than the {source_period} interval of {symbol}"),
                ));
            }
        }

        Ok(Self {
            session: pre.session_filter.then(|| TradingSession::from_config(&config.session)),
            timezone: config.session.timezone,
            source_period,
            resample: pre.resample,
            gap_fill: pre.gap_fill.then_some(GapFillOptions {
                cap: pre.gap_fill_cap,
                volume: pre.volume_fill,
            }),
            indicators: pre.indicators.then_some(pre.windows),
        })
    }

    /// Period of the bars `process` emits.
    pub fn output_period(&self) -> BarPeriod {
        self.resample.unwrap_or(self.source_period)
    }
}

/// Rows removed before the series was processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub duplicate_timestamps: usize,
    pub invalid: usize,
    pub foreign_symbol: usize,
    pub outside_session: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.duplicate_timestamps + self.invalid + self.foreign_symbol + self.outside_session
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSeries {
    pub symbol: Symbol,
    pub period: BarPeriod,
    pub bars: Vec<ProcessedBar>,
    /// Grid slots gap fill could not cover
    pub missing: Vec<DateTime<Utc>>,
    pub drops: DropCounts,
}

impl ProcessedSeries {
    pub fn filled_count(&self) -> usize {
        self.bars.iter().filter(|bar| bar.filled).count()
    }

    pub fn summary(&self) -> SummaryStats {
        get_summary_stats(&self.bars)
    }
}

/// Run every enabled step over `series`.
pub fn process(symbol: &Symbol, series: &[Quote], options: &PreprocessOptions) -> ProcessedSeries {
    let (mut quotes, mut drops) = hygiene(symbol, series);

    if let Some(session) = &options.session {
        let before = quotes.len();
        quotes.retain(|q| session.contains(q.timestamp));
        drops.outside_session = before - quotes.len();
        debug!(
            symbol = %symbol,
            kept = quotes.len(),
            dropped = drops.outside_session,
            "Session filter applied"
        );
    }

    let period = options.output_period();
    if let Some(target) = options.resample {
        let before = quotes.len();
        quotes = resample(&quotes, target, options.timezone);
        debug!(symbol = %symbol, period = %target, from = before, to = quotes.len(), "Resampled");
    }

    let (timeline, missing) = match options.gap_fill {
        Some(fill) => {
            let result = fill_gaps(&quotes, period, options.session.as_ref(), fill);
            (result.bars, result.missing)
        }
        None => (quotes.into_iter().map(FilledBar::observed).collect(), Vec::new()),
    };

    let columns = match &options.indicators {
        Some(windows) => indicators::compute(&timeline, windows, options.timezone),
        None => vec![Indicators::default(); timeline.len()],
    };

    let bars: Vec<ProcessedBar> = timeline
        .into_iter()
        .zip(columns)
        .map(|(bar, indicators)| ProcessedBar {
            timestamp: bar.quote.timestamp,
            open: bar.quote.open,
            high: bar.quote.high,
            low: bar.quote.low,
            close: bar.quote.close,
            volume: bar.quote.volume,
            filled: bar.filled,
            indicators,
        })
        .collect();

    let processed = ProcessedSeries {
        symbol: symbol.clone(),
        period,
        bars,
        missing,
        drops,
    };
    info!(
        symbol = %symbol,
        period = %period,
        input = series.len(),
        output = processed.bars.len(),
        filled = processed.filled_count(),
        missing = processed.missing.len(),
        dropped = drops.total(),
        "Series preprocessed"
    );
    processed
}

/// Load a symbol's canonical series, process it and store the result.
pub fn preprocess_symbol(
    store: &CanonicalStore,
    symbol: &Symbol,
    options: &PreprocessOptions,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    processed_at: DateTime<Utc>,
) -> Result<ProcessedSeries, PreprocessError> {
    let series: Vec<Quote> = store
        .load_series(symbol, from, to)?
        .into_iter()
        .map(|record| record.quote)
        .collect();
    let processed = process(symbol, &series, options);
    let written = store.write_processed(
        symbol,
        processed.period,
        &processed.bars,
        from,
        to,
        processed_at,
    )?;
    debug!(symbol = %symbol, written, "Processed bars stored");
    Ok(processed)
}

fn hygiene(symbol: &Symbol, series: &[Quote]) -> (Vec<Quote>, DropCounts) {
    let mut drops = DropCounts::default();
    let mut quotes: Vec<Quote> = Vec::with_capacity(series.len());

    for quote in series {
        if &quote.symbol != symbol {
            drops.foreign_symbol += 1;
            continue;
        }
        // Stored history is never ahead of itself; only the price checks matter.
        if quote.validate(quote.timestamp, Duration::zero()).is_err() {
            drops.invalid += 1;
            continue;
        }
        quotes.push(quote.clone());
    }

    quotes.sort_by_key(|q| q.timestamp);
    let before = quotes.len();
    quotes.dedup_by_key(|q| q.timestamp);
    drops.duplicate_timestamps = before - quotes.len();

    (quotes, drops)
}
