//! Channel seams between the publisher and its consumers
//!
//! `EnvelopeSink` and `EnvelopeSource` are implemented by the durable topic
//! ([`crate::topic`]) and by the in-memory channel below, which serves
//! tests and single-process runs.

use crate::cursor::CursorError;
use crate::journal::JournalError;
use crate::reader::ReaderError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use types::envelope::RawEnvelope;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel closed")]
    Closed,

    #[error("Lock poisoned")]
    Poisoned,
}

/// One envelope handed to a consumer, with the offset to acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: u64,
    pub envelope: RawEnvelope,
}

#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Publish one envelope and return its channel offset.
    async fn publish(&self, envelope: &RawEnvelope) -> Result<u64, ChannelError>;
}

/// At-least-once consumer side of a channel.
#[async_trait]
pub trait EnvelopeSource: Send {
    /// Wait for up to `max` deliveries; returns a non-empty batch.
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Delivery>, ChannelError>;

    /// Mark everything up to and including `through` as processed.
    async fn ack(&mut self, through: u64) -> Result<(), ChannelError>;

    /// Redeliver everything after the last acknowledged offset.
    async fn rewind(&mut self) -> Result<(), ChannelError>;
}

// ── In-memory channel ───────────────────────────────────────────────

pub fn memory_channel(capacity: usize) -> (MemorySink, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        MemorySink {
            tx,
            next_offset: AtomicU64::new(1),
        },
        MemorySource {
            rx,
            unacked: VecDeque::new(),
            replay: VecDeque::new(),
        },
    )
}

pub struct MemorySink {
    tx: mpsc::Sender<Delivery>,
    next_offset: AtomicU64,
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn publish(&self, envelope: &RawEnvelope) -> Result<u64, ChannelError> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Delivery {
                offset,
                envelope: envelope.clone(),
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        Ok(offset)
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<Delivery>,
    unacked: VecDeque<Delivery>,
    replay: VecDeque<Delivery>,
}

#[async_trait]
impl EnvelopeSource for MemorySource {
    async fn next_batch(&mut self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        let max = max.max(1);
        let mut batch = Vec::new();

        while batch.len() < max {
            match self.replay.pop_front() {
                Some(delivery) => batch.push(delivery),
                None => break,
            }
        }

        if batch.is_empty() {
            match self.rx.recv().await {
                Some(delivery) => batch.push(delivery),
                None => return Err(ChannelError::Closed),
            }
        }
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(delivery) => batch.push(delivery),
                Err(_) => break,
            }
        }

        self.unacked.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn ack(&mut self, through: u64) -> Result<(), ChannelError> {
        self.unacked.retain(|d| d.offset > through);
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), ChannelError> {
        let mut pending: VecDeque<Delivery> = self.unacked.drain(..).collect();
        pending.extend(self.replay.drain(..));
        self.replay = pending;
        Ok(())
    }
}
