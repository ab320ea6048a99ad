//! Periodic fetch-and-publish loop
//!
//! Each symbol cycles `Idle → Fetching → Publishing → Idle` once per tick.
//! A tick publishes the bars newer than the symbol's watermark onto the
//! channel and, concurrently, archives the same envelopes under
//! `{symbol}/{tick}`. Either side effect may fail without stopping the
//! other; failures are reported in the `TickReport` and the tick counts as
//! degraded.
//!
//! A watermark only moves past a bar once it and every older bar of the
//! tick were published. With a `WatermarkStore` attached, watermarks are
//! saved on every advance and restored at startup.

use crate::fetcher::ResilientFetcher;
use crate::key_pool::RateLimitedKeyPool;
use crate::metrics::PublisherMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use persistence::archive::{ArchiveKey, ArchiveStore};
use persistence::channel::EnvelopeSink;
use persistence::watermark::{WatermarkError, WatermarkStore};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::clock::Clock;
use types::config::PipelineConfig;
use types::envelope::RawEnvelope;
use types::errors::{FetchFailure, PersistenceError};
use types::ids::{PublisherId, Symbol};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolState {
    #[default]
    Idle,
    Fetching,
    Publishing,
}

/// What one tick did for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub symbol: Symbol,
    /// Furthest stage the tick reached
    pub state: SymbolState,
    /// Valid bars returned by the fetch
    pub fetched: usize,
    /// Bars dropped by validation
    pub rejected: usize,
    pub published: usize,
    pub publish_failures: usize,
    /// `None` when there was nothing new to archive
    pub archive: Option<Result<PathBuf, PersistenceError>>,
    pub fetch_failure: Option<FetchFailure>,
}

impl TickReport {
    fn new(symbol: &Symbol) -> Self {
        Self {
            symbol: symbol.clone(),
            state: SymbolState::Idle,
            fetched: 0,
            rejected: 0,
            published: 0,
            publish_failures: 0,
            archive: None,
            fetch_failure: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.fetch_failure.is_some()
            || self.publish_failures > 0
            || matches!(self.archive, Some(Err(_)))
    }
}

pub struct PublishLoop {
    pool: Arc<RateLimitedKeyPool>,
    fetcher: Arc<ResilientFetcher>,
    sink: Arc<dyn EnvelopeSink>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    publisher_id: PublisherId,
    next_seq: AtomicU64,
    schedule: BTreeMap<Symbol, Duration>,
    states: Mutex<BTreeMap<Symbol, SymbolState>>,
    watermarks: Mutex<BTreeMap<Symbol, DateTime<Utc>>>,
    watermark_store: Option<WatermarkStore>,
    metrics: Arc<PublisherMetrics>,
}

impl PublishLoop {
    pub fn new(
        pool: Arc<RateLimitedKeyPool>,
        fetcher: Arc<ResilientFetcher>,
        sink: Arc<dyn EnvelopeSink>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let publisher_id = PublisherId::new();
        info!(publisher_id = %publisher_id, "Publish loop created");
        Self {
            pool,
            fetcher,
            sink,
            archive,
            clock,
            publisher_id,
            next_seq: AtomicU64::new(1),
            schedule: BTreeMap::new(),
            states: Mutex::new(BTreeMap::new()),
            watermarks: Mutex::new(BTreeMap::new()),
            watermark_store: None,
            metrics: Arc::new(PublisherMetrics::new()),
        }
    }

    /// Schedule every configured symbol at its poll interval.
    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        for (symbol, cfg) in &config.symbols {
            self.schedule.insert(symbol.clone(), cfg.poll_interval());
        }
        self
    }

    /// Restore saved watermarks from `store` and save every advance to it.
    pub fn with_watermark_store(mut self, store: WatermarkStore) -> Result<Self, WatermarkError> {
        for (symbol, timestamp) in store.load()? {
            info!(symbol = %symbol, watermark = %timestamp, "Watermark restored");
            self.seed_watermark(&symbol, timestamp);
        }
        self.watermark_store = Some(store);
        Ok(self)
    }

    pub fn with_schedule(mut self, symbol: Symbol, interval: Duration) -> Self {
        self.schedule.insert(symbol, interval);
        self
    }

    pub fn publisher_id(&self) -> PublisherId {
        self.publisher_id
    }

    pub fn metrics(&self) -> Arc<PublisherMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self, symbol: &Symbol) -> SymbolState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    pub fn watermark(&self, symbol: &Symbol) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }

    /// Start publishing after `timestamp`.
    pub fn seed_watermark(&self, symbol: &Symbol, timestamp: DateTime<Utc>) {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(symbol.clone())
            .and_modify(|w| *w = (*w).max(timestamp))
            .or_insert(timestamp);
    }

    fn set_state(&self, symbol: &Symbol, state: SymbolState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.clone(), state);
    }

    /// Run one fetch-and-publish cycle for `symbol`.
    pub async fn tick(&self, symbol: &Symbol) -> TickReport {
        let started = Instant::now();
        let report = self.run_tick(symbol).await;
        self.set_state(symbol, SymbolState::Idle);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_tick(&report, elapsed_ms);
        if report.is_degraded() {
            warn!(
                symbol = %symbol,
                published = report.published,
                publish_failures = report.publish_failures,
                archive_ok = !matches!(report.archive, Some(Err(_))),
                fetch_failed = report.fetch_failure.is_some(),
                "Tick degraded"
            );
        } else {
            info!(
                symbol = %symbol,
                fetched = report.fetched,
                rejected = report.rejected,
                published = report.published,
                elapsed_ms,
                "Tick complete"
            );
        }
        report
    }

    async fn run_tick(&self, symbol: &Symbol) -> TickReport {
        let mut report = TickReport::new(symbol);
        self.set_state(symbol, SymbolState::Fetching);
        report.state = SymbolState::Fetching;

        let credential = match self.pool.acquire(symbol).await {
            Ok(credential) => credential,
            Err(e) => {
                report.fetch_failure = Some(FetchFailure {
                    symbol: symbol.clone(),
                    attempts: 0,
                    last_error: e.to_string(),
                });
                return report;
            }
        };

        let batch = match self.fetcher.fetch_batch(symbol, &credential).await {
            Ok(batch) => batch,
            Err(failure) => {
                report.fetch_failure = Some(failure);
                return report;
            }
        };
        report.fetched = batch.quotes.len();
        report.rejected = batch.rejected.len();

        let watermark = self.watermark(symbol);
        let ingested_at = self.clock.now();
        let envelopes: Vec<RawEnvelope> = batch
            .quotes
            .into_iter()
            .filter(|q| watermark.map_or(true, |w| q.timestamp > w))
            .map(|quote| {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                RawEnvelope::new(quote, ingested_at, seq, self.publisher_id)
            })
            .collect();

        if envelopes.is_empty() {
            debug!(symbol = %symbol, "No bars newer than watermark");
            return report;
        }

        self.set_state(symbol, SymbolState::Publishing);
        report.state = SymbolState::Publishing;

        let key = ArchiveKey::new(symbol.clone(), tick_stamp(ingested_at));
        let (published, archived) = tokio::join!(
            self.publish_all(&envelopes),
            self.archive.put(&key, &envelopes)
        );

        report.archive = Some(match archived {
            Ok(blob) => Ok(blob.json),
            Err(e) => {
                let failure = PersistenceError::Archive {
                    key: key.object_name(),
                    message: e.to_string(),
                };
                error!(symbol = %symbol, error = %failure, "Archive write failed");
                Err(failure)
            }
        });

        let mut advanced_to = None;
        let mut clean_prefix = true;
        for (envelope, outcome) in envelopes.iter().zip(published) {
            match outcome {
                Ok(_) => {
                    report.published += 1;
                    if clean_prefix {
                        advanced_to = Some(envelope.quote.timestamp);
                    }
                }
                Err(e) => {
                    error!(
                        symbol = %symbol,
                        timestamp = %envelope.quote.timestamp,
                        error = %e,
                        "Publish failed"
                    );
                    report.publish_failures += 1;
                    clean_prefix = false;
                }
            }
        }
        if let Some(timestamp) = advanced_to {
            self.seed_watermark(symbol, timestamp);
            self.save_watermarks();
        }
        report
    }

    fn save_watermarks(&self) {
        let Some(store) = &self.watermark_store else {
            return;
        };
        // Held across the save so concurrent ticks write in order.
        let watermarks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = store.save(&watermarks) {
            error!(path = %store.path().display(), error = %e, "Watermark save failed");
        }
    }

    async fn publish_all(&self, envelopes: &[RawEnvelope]) -> Vec<Result<u64, PersistenceError>> {
        let mut outcomes = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let outcome = self.sink.publish(envelope).await;
            outcomes.push(outcome.map_err(|e| PersistenceError::Channel {
                message: e.to_string(),
            }));
        }
        outcomes
    }

    /// Tick every scheduled symbol on its own interval until `shutdown`.
    ///
    /// A tick in progress finishes before its task notices cancellation.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tasks: Vec<_> = self
            .schedule
            .iter()
            .map(|(symbol, interval)| {
                let this = self.clone();
                let symbol = symbol.clone();
                let period = if interval.is_zero() {
                    DEFAULT_TICK_INTERVAL
                } else {
                    *interval
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(symbol = %symbol, interval_secs = period.as_secs(), "Symbol scheduled");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticker.tick() => {
                                this.tick(&symbol).await;
                            }
                        }
                    }
                    debug!(symbol = %symbol, "Symbol task stopped");
                })
            })
            .collect();

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Symbol task panicked");
            }
        }
        info!("Publish loop stopped");
    }
}

fn tick_stamp(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}
