//! Journal Reader - tailing reader with corruption detection
//!
//! Reads segments in order and keeps its position, so a long-lived reader
//! picks up frames appended after it reached the end. A frame cut short at
//! the end of the newest segment is treated as "not written yet" rather
//! than corruption; the same situation in an older segment is logged as a
//! truncated segment and skipped.

use crate::journal::{list_segments, FrameError, JournalRecord};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Checksum mismatch in {segment} at byte {byte_offset} (record offset {offset})")]
    ChecksumMismatch {
        segment: PathBuf,
        byte_offset: u64,
        offset: u64,
    },
}

// ── Corruption Log ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    MalformedFrame,
    TruncatedSegment,
}

/// Structured corruption record for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    pub segment: PathBuf,
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

// ── Journal Reader ──────────────────────────────────────────────────

pub struct JournalReader {
    dir: PathBuf,
    segments: Vec<PathBuf>,
    segment_idx: usize,
    /// Bytes of the current segment that precede `buf`
    consumed: u64,
    buf: Vec<u8>,
    pos: usize,
    last_offset: Option<u64>,
    corruption_log: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// Open a reader positioned at the start of the topic.
    ///
    /// A missing directory reads as an empty topic.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let segments = list_segments(dir)?.into_iter().map(|(_, p)| p).collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            segment_idx: 0,
            consumed: 0,
            buf: Vec::new(),
            pos: 0,
            last_offset: None,
            corruption_log: Vec::new(),
        })
    }

    /// Read the next record, validating its checksum.
    ///
    /// Returns `None` when no complete record is available yet. A checksum
    /// failure is returned as an error after the reader has moved past the
    /// bad frame, so the caller may log it and continue.
    pub fn next_record(&mut self) -> Result<Option<JournalRecord>, ReaderError> {
        loop {
            if self.pos >= self.buf.len() && !self.refill()? {
                return Ok(None);
            }

            let byte_offset = self.consumed + self.pos as u64;
            match JournalRecord::decode(&self.buf[self.pos..]) {
                Ok((record, used)) => {
                    self.pos += used;
                    if !record.is_intact() {
                        let segment = self.current_segment();
                        self.log_corruption(
                            byte_offset,
                            CorruptionKind::ChecksumMismatch,
                            format!(
                                "CRC32C mismatch for offset {}, stored {:#010x}",
                                record.offset, record.checksum
                            ),
                        );
                        return Err(ReaderError::ChecksumMismatch {
                            segment,
                            byte_offset,
                            offset: record.offset,
                        });
                    }
                    self.last_offset = Some(record.offset);
                    return Ok(Some(record));
                }
                Err(FrameError::Incomplete { needed, available }) => {
                    if self.has_later_segment()? {
                        self.log_corruption(
                            byte_offset,
                            CorruptionKind::TruncatedSegment,
                            format!(
                                "segment ends mid-frame: need {needed} bytes, have {available}"
                            ),
                        );
                        self.skip_segment();
                        continue;
                    }
                    // The writer may still be appending this frame
                    if !self.refill()? {
                        return Ok(None);
                    }
                }
                Err(FrameError::Malformed(detail)) => {
                    self.log_corruption(byte_offset, CorruptionKind::MalformedFrame, detail);
                    self.pos = self.buf.len();
                }
            }
        }
    }

    /// Read every record currently available, stopping at the first error.
    pub fn read_all(&mut self) -> Result<Vec<JournalRecord>, ReaderError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Read every intact record, skipping frames with bad checksums.
    pub fn recover_records(
        &mut self,
    ) -> Result<(Vec<JournalRecord>, Vec<CorruptionRecord>), ReaderError> {
        let mut records = Vec::new();
        loop {
            match self.next_record() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((records, self.corruption_log.clone()))
    }

    /// Skip records with `offset <= after`. Returns the number skipped.
    pub fn skip_through(&mut self, after: u64) -> Result<u64, ReaderError> {
        let mut skipped = 0u64;
        while self.last_offset.map_or(true, |last| last < after) {
            let before = (self.segment_idx, self.consumed + self.pos as u64);
            match self.next_record() {
                Ok(Some(record)) if record.offset <= after => skipped += 1,
                Ok(Some(record)) => {
                    // Overshot: rewind to the start of this frame
                    let (idx, at) = before;
                    self.segment_idx = idx;
                    self.consumed = at;
                    self.buf.clear();
                    self.pos = 0;
                    self.last_offset = record.offset.checked_sub(1);
                    break;
                }
                Ok(None) => break,
                Err(ReaderError::ChecksumMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn current_segment(&self) -> PathBuf {
        self.segments
            .get(self.segment_idx)
            .cloned()
            .unwrap_or_else(|| self.dir.clone())
    }

    fn log_corruption(&mut self, byte_offset: u64, kind: CorruptionKind, detail: String) {
        let segment = self.current_segment();
        warn!(
            segment = %segment.display(),
            byte_offset,
            kind = ?kind,
            detail = %detail,
            "Journal corruption detected"
        );
        self.corruption_log.push(CorruptionRecord {
            segment,
            byte_offset,
            kind,
            detail,
        });
    }

    fn has_later_segment(&mut self) -> Result<bool, ReaderError> {
        if self.segment_idx + 1 >= self.segments.len() {
            self.rediscover()?;
        }
        Ok(self.segment_idx + 1 < self.segments.len())
    }

    fn rediscover(&mut self) -> Result<(), ReaderError> {
        self.segments = list_segments(&self.dir)?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        Ok(())
    }

    fn skip_segment(&mut self) {
        self.segment_idx += 1;
        self.consumed = 0;
        self.buf.clear();
        self.pos = 0;
    }

    /// Drop consumed bytes and read whatever the segment gained since.
    ///
    /// Moves on to the next segment once the current one is exhausted.
    /// Returns false when no new bytes are available anywhere.
    fn refill(&mut self) -> Result<bool, ReaderError> {
        loop {
            self.consumed += self.pos as u64;
            self.buf.drain(..self.pos);
            self.pos = 0;

            if self.read_more()? > 0 {
                return Ok(true);
            }
            if !self.buf.is_empty() || !self.has_later_segment()? {
                return Ok(false);
            }
            self.skip_segment();
        }
    }

    fn read_more(&mut self) -> Result<usize, ReaderError> {
        let Some(path) = self.segments.get(self.segment_idx) else {
            return Ok(0);
        };
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(self.consumed + self.buf.len() as u64))?;
        Ok(file.read_to_end(&mut self.buf)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
