//! Bounded retry around the upstream call, plus per-bar validation
//!
//! A logical fetch makes at most `max_attempts` upstream calls. Retryable
//! failures sleep `min(base * multiplier^(k-1) * jitter, max_delay)` on the
//! injected clock before attempt `k + 1`; terminal failures stop at once.
//! Validation failures are never retried: the offending bar is dropped
//! with a named reason and the rest of the batch goes through.

use crate::key_pool::CredentialHandle;
use crate::upstream::{QuoteSource, UpstreamError};
use chrono_tz::Tz;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use types::clock::Clock;
use types::config::{PipelineConfig, RetryConfig};
use types::errors::{FetchFailure, ValidationError};
use types::ids::Symbol;
use types::period::BarPeriod;
use types::quote::{Quote, QuoteDraft};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Failure(#[from] FetchFailure),

    #[error("no valid bar for {symbol}: {error}")]
    Invalid { symbol: Symbol, error: ValidationError },

    #[error("upstream returned no bars for {symbol}")]
    Empty { symbol: Symbol },
}

// ── Retry policy ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Sleep before attempt `attempt + 1`, with `attempt` counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if self.jitter_factor > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
            millis *= 1.0 + spread;
        }
        let cap = self.max_delay.as_millis() as f64;
        let capped = if millis.is_finite() { millis.clamp(0.0, cap) } else { cap };
        Duration::from_millis(capped.round() as u64)
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Outcome of one logical fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub symbol: Symbol,
    /// Valid bars, oldest first
    pub quotes: Vec<Quote>,
    pub rejected: Vec<(QuoteDraft, ValidationError)>,
    pub attempts: u32,
}

impl FetchedBatch {
    pub fn latest(&self) -> Option<&Quote> {
        self.quotes.last()
    }
}

pub struct ResilientFetcher {
    source: Arc<dyn QuoteSource>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    skew: chrono::Duration,
    default_tz: Tz,
    intervals: BTreeMap<Symbol, BarPeriod>,
}

impl ResilientFetcher {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        skew: chrono::Duration,
        default_tz: Tz,
    ) -> Self {
        Self {
            source,
            clock,
            policy,
            skew,
            default_tz,
            intervals: BTreeMap::new(),
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        source: Arc<dyn QuoteSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut fetcher = Self::new(
            source,
            clock,
            RetryPolicy::from_config(&config.retry),
            config.validation.clock_skew(),
            config.session.timezone,
        );
        fetcher.intervals = config
            .symbols
            .iter()
            .map(|(symbol, cfg)| (symbol.clone(), cfg.interval))
            .collect();
        fetcher
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn interval(&self, symbol: &Symbol) -> BarPeriod {
        self.intervals.get(symbol).copied().unwrap_or_default()
    }

    /// Fetch the symbol's intraday series and validate every bar.
    pub async fn fetch_batch(
        &self,
        symbol: &Symbol,
        credential: &CredentialHandle,
    ) -> Result<FetchedBatch, FetchFailure> {
        let period = self.interval(symbol);
        let mut attempt = 0u32;

        let series = loop {
            attempt += 1;
            let error = match self.source.intraday(symbol, period, credential).await {
                Ok(series) => break series,
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.policy.max_attempts {
                warn!(
                    symbol = %symbol,
                    attempts = attempt,
                    error = %error,
                    "Fetch failed"
                );
                return Err(failure(symbol, attempt, &error));
            }

            let delay = self.policy.delay(attempt);
            warn!(
                symbol = %symbol,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Fetch attempt failed, backing off"
            );
            self.clock.sleep(delay).await;
        };

        let now = self.clock.now();
        let tz = series.time_zone.unwrap_or(self.default_tz);
        let mut quotes = Vec::with_capacity(series.bars.len());
        let mut rejected = Vec::new();

        for draft in series.bars {
            match draft.into_quote(symbol, tz, now, self.skew) {
                Ok(quote) => quotes.push(quote),
                Err(error) => {
                    warn!(
                        symbol = %symbol,
                        timestamp = %draft.timestamp,
                        reason = error.reason(),
                        "Dropping invalid bar"
                    );
                    rejected.push((draft, error));
                }
            }
        }
        quotes.sort_by_key(|q| q.timestamp);
        quotes.dedup_by_key(|q| q.timestamp);

        debug!(
            symbol = %symbol,
            attempts = attempt,
            valid = quotes.len(),
            rejected = rejected.len(),
            "Fetched batch"
        );
        Ok(FetchedBatch {
            symbol: symbol.clone(),
            quotes,
            rejected,
            attempts: attempt,
        })
    }

    /// Most recent valid bar of one logical fetch.
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        credential: &CredentialHandle,
    ) -> Result<Quote, FetchError> {
        let mut batch = self.fetch_batch(symbol, credential).await?;
        if let Some(quote) = batch.quotes.pop() {
            return Ok(quote);
        }
        match batch.rejected.pop() {
            Some((_, error)) => Err(FetchError::Invalid {
                symbol: symbol.clone(),
                error,
            }),
            None => Err(FetchError::Empty {
                symbol: symbol.clone(),
            }),
        }
    }
}

fn failure(symbol: &Symbol, attempts: u32, error: &UpstreamError) -> FetchFailure {
    FetchFailure {
        symbol: symbol.clone(),
        attempts,
        last_error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{draft, ScriptedSource};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use types::clock::ManualClock;
    use types::ids::{ApiKey, CredentialId};

    fn now() -> DateTime<Utc> {
        // 2024-03-01 16:10 New York
        Utc.with_ymd_and_hms(2024, 3, 1, 21, 10, 0).unwrap()
    }

    fn credential() -> CredentialHandle {
        CredentialHandle {
            id: CredentialId::new("primary"),
            api_key: ApiKey::new("KEYPRIMARY"),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn fetcher(source: Arc<ScriptedSource>, clock: Arc<ManualClock>) -> ResilientFetcher {
        ResilientFetcher::new(
            source,
            clock,
            policy(),
            chrono::Duration::seconds(60),
            chrono_tz::America::New_York,
        )
    }

    fn good_bars() -> Vec<QuoteDraft> {
        vec![
            draft("2024-03-01 16:00:00", "179.55", "179.70", "179.40", "179.66", "1234567"),
            draft("2024-03-01 15:55:00", "179.30", "179.60", "179.25", "179.55", "845210"),
        ]
    }

    #[tokio::test]
    async fn test_retry_bound_and_backoff() {
        let source = Arc::new(ScriptedSource::new(Err(UpstreamError::Transport("reset".into()))));
        let clock = Arc::new(ManualClock::new(now()));
        let fetcher = fetcher(source.clone(), clock.clone());

        let err = fetcher
            .fetch_batch(&Symbol::new("AAPL"), &credential())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(source.calls(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(clock.total_slept() <= policy().max_delay * 2);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let source = Arc::new(ScriptedSource::new(Ok(good_bars())));
        source
            .push(Err(UpstreamError::Throttled("5 calls per minute".into())))
            .push(Err(UpstreamError::Status(503)));
        let clock = Arc::new(ManualClock::new(now()));

        let batch = fetcher(source.clone(), clock)
            .fetch_batch(&Symbol::new("AAPL"), &credential())
            .await
            .unwrap();
        assert_eq!(batch.attempts, 3);
        assert_eq!(batch.quotes.len(), 2);
        assert!(batch.quotes[0].timestamp < batch.quotes[1].timestamp);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let source = Arc::new(ScriptedSource::new(Err(UpstreamError::Rejected(
            "Invalid API call".into(),
        ))));
        let clock = Arc::new(ManualClock::new(now()));

        let err = fetcher(source.clone(), clock.clone())
            .fetch_batch(&Symbol::new("NOPE"), &credential())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(source.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_bars_dropped_with_reason() {
        let mut bars = good_bars();
        bars.push(draft("2024-03-01 15:50:00", "179.30", "179.00", "179.25", "179.55", "10"));
        bars.push(draft("not a time", "1", "1", "1", "1", "1"));
        bars.push(draft("2024-03-01 15:45:00", "179.30", "179.60", "179.25", "179.55", "-5"));
        let source = Arc::new(ScriptedSource::new(Ok(bars)));
        let clock = Arc::new(ManualClock::new(now()));

        let batch = fetcher(source.clone(), clock)
            .fetch_batch(&Symbol::new("AAPL"), &credential())
            .await
            .unwrap();
        assert_eq!(batch.quotes.len(), 2);
        let reasons: Vec<_> = batch.rejected.iter().map(|(_, e)| e.reason()).collect();
        assert_eq!(reasons.len(), 3);
        assert!(batch
            .rejected
            .iter()
            .any(|(_, e)| matches!(e, ValidationError::NegativeVolume(-5))));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_future_bar_rejected() {
        let bars = vec![draft("2024-03-01 16:15:00", "1", "2", "1", "2", "1")];
        let source = Arc::new(ScriptedSource::new(Ok(bars)));
        let clock = Arc::new(ManualClock::new(now()));

        let err = fetcher(source, clock)
            .fetch(&Symbol::new("AAPL"), &credential())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Invalid {
                error: ValidationError::FutureTimestamp { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_returns_latest() {
        let source = Arc::new(ScriptedSource::new(Ok(good_bars())));
        let clock = Arc::new(ManualClock::new(now()));

        let quote = fetcher(source, clock)
            .fetch(&Symbol::new("AAPL"), &credential())
            .await
            .unwrap();
        assert_eq!(quote.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 21, 0, 0).unwrap());
        assert_eq!(quote.close, dec!(179.66));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..policy()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn prop_total_backoff_bounded(
            attempts in 1u32..12,
            base_ms in 0u64..5_000,
            cap_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..1.0,
        ) {
            let policy = RetryPolicy {
                max_attempts: attempts,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(cap_ms),
                multiplier,
                jitter_factor: jitter,
            };
            let total: Duration = (1..attempts).map(|k| policy.delay(k)).sum();
            prop_assert!(total <= policy.max_delay * (attempts - 1));
        }
    }
}
