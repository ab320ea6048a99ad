//! Bounded replays through the same identity check as the stream
//!
//! `backfill_journal` reads every intact envelope in a topic directory,
//! skipping corrupt frames; `backfill_archive` replays the raw archive
//! blobs of the given symbols. Neither touches any consumer cursor.

use crate::engine::DedupEngine;
use crate::stats::DedupReport;
use persistence::archive::{ArchiveError, ArchiveStore};
use persistence::canonical::StoreError;
use persistence::reader::{JournalReader, ReaderError};
use persistence::topic::ENVELOPE_KIND;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use types::envelope::RawEnvelope;
use types::ids::Symbol;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("Journal error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Replay every envelope in the topic at `topic_dir`.
pub fn backfill_journal(
    engine: &DedupEngine,
    topic_dir: &Path,
) -> Result<DedupReport, BackfillError> {
    let mut reader = JournalReader::open(topic_dir)?;
    let (records, corruptions) = reader.recover_records()?;

    let mut report = DedupReport::default();
    report.corrupt_records = corruptions.len() as u64;
    for corruption in &corruptions {
        warn!(
            segment = %corruption.segment.display(),
            byte_offset = corruption.byte_offset,
            kind = ?corruption.kind,
            detail = %corruption.detail,
            "Skipping corrupt journal data"
        );
    }

    for record in records {
        if record.kind != ENVELOPE_KIND {
            continue;
        }
        match serde_json::from_slice::<RawEnvelope>(&record.payload) {
            Ok(envelope) => {
                let outcome = engine.process(&envelope)?;
                report.record(&outcome);
            }
            Err(e) => {
                warn!(offset = record.offset, error = %e, "Undecodable envelope");
                report.reject("undecodable");
            }
        }
    }
    report.batches = 1;

    info!(topic = %topic_dir.display(), report = %report, "Journal backfill complete");
    Ok(report)
}

/// Replay the archived batches of `symbols`, oldest blob first.
pub async fn backfill_archive(
    engine: &DedupEngine,
    archive: &dyn ArchiveStore,
    symbols: &[Symbol],
) -> Result<DedupReport, BackfillError> {
    let mut report = DedupReport::default();
    for symbol in symbols {
        let keys = archive.list(symbol).await?;
        for key in &keys {
            let envelopes = archive.get(key).await?;
            for envelope in &envelopes {
                let outcome = engine.process(envelope)?;
                report.record(&outcome);
            }
            report.batches += 1;
        }
        info!(symbol = %symbol, blobs = keys.len(), "Archive backfill for symbol done");
    }
    info!(report = %report, "Archive backfill complete");
    Ok(report)
}
