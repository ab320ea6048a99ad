//! Dedup counters

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::engine::DedupOutcome;

/// Counts of what a streaming run or backfill did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupReport {
    pub processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub rejected: u64,
    /// Rejections by reason label
    pub rejected_by_reason: BTreeMap<String, u64>,
    /// Journal frames skipped as corrupt (backfill only)
    pub corrupt_records: u64,
    pub sequence_gaps: u64,
    pub batches: u64,
    /// Failed batches rolled back to the last commit
    pub rewinds: u64,
    /// Deliveries seen again after a rewind; their outcome was already counted
    pub replayed: u64,
}

impl DedupReport {
    pub fn record(&mut self, outcome: &DedupOutcome) {
        self.processed += 1;
        match outcome {
            DedupOutcome::Inserted => self.inserted += 1,
            DedupOutcome::Duplicate => self.duplicates += 1,
            DedupOutcome::Conflict { .. } => self.conflicts += 1,
            DedupOutcome::Rejected(reason) => self.reject(reason.label()),
        }
    }

    /// Count a delivery dropped before it reached the engine.
    pub fn reject(&mut self, label: &str) {
        self.rejected += 1;
        *self.rejected_by_reason.entry(label.to_string()).or_default() += 1;
    }

    pub fn merge(&mut self, other: &DedupReport) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        for (reason, count) in &other.rejected_by_reason {
            *self.rejected_by_reason.entry(reason.clone()).or_default() += count;
        }
        self.corrupt_records += other.corrupt_records;
        self.sequence_gaps += other.sequence_gaps;
        self.batches += other.batches;
        self.rewinds += other.rewinds;
        self.replayed += other.replayed;
    }
}

impl fmt::Display for DedupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} inserted={} duplicates={} conflicts={} rejected={} rewinds={}",
            self.processed,
            self.inserted,
            self.duplicates,
            self.conflicts,
            self.rejected,
            self.rewinds
        )
    }
}
