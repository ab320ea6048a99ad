//! Durable topic on top of the journal
//!
//! `TopicPublisher` appends JSON-encoded envelopes; `TopicSubscriber`
//! tails the journal from its committed cursor. A consumer that crashes
//! between processing and committing sees the uncommitted tail again on
//! restart (at-least-once).

use crate::channel::{ChannelError, Delivery, EnvelopeSink, EnvelopeSource};
use crate::cursor::CursorStore;
use crate::journal::{JournalConfig, JournalWriter};
use crate::reader::{JournalReader, ReaderError};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use types::envelope::RawEnvelope;

/// Record kind of a published envelope
pub const ENVELOPE_KIND: &str = "raw_envelope";

pub struct TopicPublisher {
    writer: Mutex<JournalWriter>,
}

impl TopicPublisher {
    pub fn open(dir: &Path) -> Result<Self, ChannelError> {
        Self::with_config(JournalConfig::new(dir))
    }

    pub fn with_config(config: JournalConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            writer: Mutex::new(JournalWriter::open(config)?),
        })
    }

    /// Append one envelope; durable once this returns (default fsync policy).
    pub fn publish_envelope(&self, envelope: &RawEnvelope) -> Result<u64, ChannelError> {
        let payload = serde_json::to_vec(envelope)?;
        let published_at = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut writer = self.writer.lock().map_err(|_| ChannelError::Poisoned)?;
        let record = writer.append(ENVELOPE_KIND, published_at, payload)?;
        Ok(record.offset)
    }
}

#[async_trait]
impl EnvelopeSink for TopicPublisher {
    async fn publish(&self, envelope: &RawEnvelope) -> Result<u64, ChannelError> {
        self.publish_envelope(envelope)
    }
}

pub struct TopicSubscriber {
    dir: PathBuf,
    reader: JournalReader,
    cursor: CursorStore,
    committed: u64,
    /// Highest offset already handed out (or skipped) by `poll`
    delivered_through: u64,
    /// Highest envelope offset handed out and not yet committed
    outstanding: Option<u64>,
    poll_interval: Duration,
}

impl TopicSubscriber {
    /// Open a subscriber that resumes after the consumer's committed cursor.
    pub fn open(dir: &Path, consumer: &str, poll_interval: Duration) -> Result<Self, ChannelError> {
        let cursor = CursorStore::new(dir, consumer)?;
        let committed = cursor.load()?;
        let mut reader = JournalReader::open(dir)?;
        let skipped = reader.skip_through(committed)?;
        info!(
            consumer,
            committed,
            skipped,
            "Topic subscriber resumed"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            reader,
            cursor,
            committed,
            delivered_through: committed,
            outstanding: None,
            poll_interval,
        })
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Read up to `max` deliveries that are available right now.
    ///
    /// Records with bad checksums or undecodable payloads are logged and
    /// skipped.
    pub fn poll(&mut self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        let mut batch = Vec::new();
        while batch.len() < max.max(1) {
            let record = match self.reader.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch { offset, byte_offset, .. }) => {
                    warn!(offset, byte_offset, "Skipping corrupt topic record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if record.offset <= self.delivered_through {
                continue;
            }
            self.delivered_through = record.offset;

            if record.kind != ENVELOPE_KIND {
                debug!(offset = record.offset, kind = %record.kind, "Ignoring non-envelope record");
                continue;
            }
            match serde_json::from_slice::<RawEnvelope>(&record.payload) {
                Ok(envelope) => {
                    self.outstanding = Some(record.offset);
                    batch.push(Delivery {
                        offset: record.offset,
                        envelope,
                    });
                }
                Err(e) => warn!(
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable envelope"
                ),
            }
        }
        Ok(batch)
    }

    /// Persist the cursor. Offsets at or below the current cursor are ignored.
    ///
    /// Once every handed-out envelope is covered, the cursor also moves past
    /// the records `poll` skipped after them.
    pub fn commit(&mut self, through: u64) -> Result<(), ChannelError> {
        let through = match self.outstanding {
            Some(last) if through >= last => through.max(self.delivered_through),
            _ => through,
        };
        if through <= self.committed {
            return Ok(());
        }
        self.cursor.store(through)?;
        self.committed = through;
        if self.outstanding.is_some_and(|last| through >= last) {
            self.outstanding = None;
        }
        Ok(())
    }

    /// Commit records that were skipped while no envelope is awaiting its ack.
    pub fn commit_skipped(&mut self) -> Result<(), ChannelError> {
        if self.outstanding.is_none() && self.delivered_through > self.committed {
            debug!(through = self.delivered_through, "Committing skipped records");
            self.commit(self.delivered_through)?;
        }
        Ok(())
    }

    /// Reposition right after the committed cursor.
    pub fn reset_to_committed(&mut self) -> Result<(), ChannelError> {
        let mut reader = JournalReader::open(&self.dir)?;
        reader.skip_through(self.committed)?;
        self.reader = reader;
        self.delivered_through = self.committed;
        self.outstanding = None;
        Ok(())
    }
}

#[async_trait]
impl EnvelopeSource for TopicSubscriber {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        loop {
            let batch = self.poll(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            self.commit_skipped()?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&mut self, through: u64) -> Result<(), ChannelError> {
        self.commit(through)
    }

    async fn rewind(&mut self) -> Result<(), ChannelError> {
        self.reset_to_committed()
    }
}
