//! Streaming consumer: poll, process, commit, repeat
//!
//! The channel cursor is committed only after a whole batch went through
//! the engine, so a crash mid-batch redelivers it and the identity check
//! turns the replays into duplicates. A store failure rewinds to the last
//! commit and retries after a pause; too many in a row stop the worker.
//! What a failed batch did before the failure stays in the report, and its
//! replayed deliveries are counted as `replayed` rather than twice.

use crate::engine::DedupEngine;
use crate::stats::DedupReport;
use crate::window::{SequenceObservation, SequenceTracker};
use persistence::canonical::StoreError;
use persistence::channel::{ChannelError, Delivery, EnvelopeSource};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::config::DedupConfig;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Canonical store failed {failures} batches in a row: {last}")]
    Store { failures: u32, last: StoreError },

    #[error("Batch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub max_consecutive_failures: u32,
    pub failure_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_consecutive_failures: 5,
            failure_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            ..Self::default()
        }
    }
}

pub struct DedupWorker<S: EnvelopeSource> {
    engine: Arc<DedupEngine>,
    source: S,
    config: WorkerConfig,
    sequences: SequenceTracker,
    report: DedupReport,
    /// Last offset a failed batch got through before it was rewound
    replay_through: Option<u64>,
}

impl<S: EnvelopeSource> DedupWorker<S> {
    pub fn new(engine: Arc<DedupEngine>, source: S, config: WorkerConfig) -> Self {
        Self {
            engine,
            source,
            config,
            sequences: SequenceTracker::new(),
            report: DedupReport::default(),
            replay_through: None,
        }
    }

    /// Drain the channel until `shutdown` fires or the channel closes.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DedupReport, WorkerError> {
        let mut consecutive_failures = 0u32;
        info!(batch_size = self.config.batch_size, "Dedup worker started");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.source.next_batch(self.config.batch_size) => next,
            };
            let batch = match next {
                Ok(batch) => batch,
                Err(ChannelError::Closed) => {
                    info!("Channel closed");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            match self.handle_batch(batch).await? {
                None => consecutive_failures = 0,
                Some(e) => {
                    consecutive_failures += 1;
                    error!(
                        error = %e,
                        attempt = consecutive_failures,
                        "Batch failed, rewound to last commit"
                    );
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        return Err(WorkerError::Store {
                            failures: consecutive_failures,
                            last: e,
                        });
                    }
                    tokio::time::sleep(self.config.failure_backoff).await;
                }
            }
        }

        info!(report = %self.report, "Dedup worker stopped");
        Ok(self.report)
    }

    /// Process one batch, then commit it or rewind to the last commit.
    /// Returns the store failure that caused a rewind.
    async fn handle_batch(
        &mut self,
        batch: Vec<Delivery>,
    ) -> Result<Option<StoreError>, WorkerError> {
        let Some(through) = batch.last().map(|d| d.offset) else {
            return Ok(None);
        };

        for delivery in &batch {
            let envelope = &delivery.envelope;
            if let SequenceObservation::Gap { .. } =
                self.sequences.observe(envelope.publisher_id, envelope.source_seq)
            {
                self.report.sequence_gaps += 1;
            }
        }

        let outcome = process_batch(self.engine.clone(), batch, self.replay_through).await?;
        self.report.merge(&outcome.report);
        match outcome.failure {
            None => {
                self.source.ack(through).await?;
                self.report.batches += 1;
                if self.replay_through.is_some_and(|r| r <= through) {
                    self.replay_through = None;
                }
                debug!(
                    through,
                    inserted = outcome.report.inserted,
                    duplicates = outcome.report.duplicates,
                    replayed = outcome.report.replayed,
                    "Batch committed"
                );
                Ok(None)
            }
            Some(e) => {
                self.report.rewinds += 1;
                self.replay_through = self.replay_through.max(outcome.last_ok);
                self.source.rewind().await?;
                Ok(Some(e))
            }
        }
    }
}

struct BatchOutcome {
    report: DedupReport,
    /// Offset of the last delivery the engine finished
    last_ok: Option<u64>,
    failure: Option<StoreError>,
}

/// Run one batch on the blocking pool; stops at the first store failure.
/// Deliveries at or below `replay_through` are processed but not counted again.
async fn process_batch(
    engine: Arc<DedupEngine>,
    batch: Vec<Delivery>,
    replay_through: Option<u64>,
) -> Result<BatchOutcome, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let mut report = DedupReport::default();
        let mut last_ok = None;
        for delivery in &batch {
            match engine.process(&delivery.envelope) {
                Ok(_) if replay_through.is_some_and(|r| delivery.offset <= r) => {
                    report.replayed += 1
                }
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    warn!(offset = delivery.offset, error = %e, "Store write failed");
                    return BatchOutcome {
                        report,
                        last_ok,
                        failure: Some(e),
                    };
                }
            }
            last_ok = Some(delivery.offset);
        }
        BatchOutcome {
            report,
            last_ok,
            failure: None,
        }
    })
    .await
}
