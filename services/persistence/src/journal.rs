//! Topic journal - append-only segment files with checksummed frames
//!
//! The durable channel between the publisher and the dedup consumers. Each
//! published envelope becomes one frame; frames get a topic-wide offset
//! starting at 1 that survives restarts.
//!
//! # Frame layout
//! ```text
//! [body_len:     u32]
//! [offset:       u64]
//! [published_at: i64]   // unix nanos, publisher wall clock
//! [kind_len:     u16][kind: bytes]
//! [payload_len:  u32][payload: bytes]
//! [checksum:     u32]   // CRC32C over offset+published_at+kind+payload
//! ```
//!
//! One writer process per topic directory.

use crc32c::crc32c;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on a frame body; anything larger is treated as corruption.
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

// offset + published_at + kind_len + payload_len + checksum
const MIN_BODY: usize = 8 + 8 + 2 + 4 + 4;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Record kind too long: {0} bytes")]
    KindTooLong(usize),

    #[error("Frame too large: {0} bytes (limit {MAX_FRAME_BODY})")]
    FrameTooLarge(usize),
}

/// Why a byte slice does not start with a whole frame
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// The frame continues past the end of the available bytes
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

// ── Journal Record ──────────────────────────────────────────────────

/// One frame of the topic journal
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub offset: u64,
    pub published_at: i64,
    pub kind: String,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalRecord {
    pub fn new(offset: u64, published_at: i64, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        let kind = kind.into();
        let checksum = Self::checksum_of(offset, published_at, &kind, &payload);
        Self {
            offset,
            published_at,
            kind,
            payload,
            checksum,
        }
    }

    fn checksum_of(offset: u64, published_at: i64, kind: &str, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(16 + kind.len() + payload.len());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&published_at.to_le_bytes());
        buf.extend_from_slice(kind.as_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    /// True when the stored checksum matches the content.
    pub fn is_intact(&self) -> bool {
        self.checksum
            == Self::checksum_of(self.offset, self.published_at, &self.kind, &self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind.as_bytes();
        let body_len = MIN_BODY + kind.len() + self.payload.len();

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.published_at.to_le_bytes());
        buf.extend_from_slice(&(kind.len() as u16).to_le_bytes());
        buf.extend_from_slice(kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode the frame at the start of `data`.
    ///
    /// Returns the record and the number of bytes it occupies. The checksum
    /// is not verified here; see [`JournalRecord::is_intact`].
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete {
                needed: 4,
                available: data.len(),
            });
        }

        let body_len = read_u32(data, 0) as usize;
        if !(MIN_BODY..=MAX_FRAME_BODY).contains(&body_len) {
            return Err(FrameError::Malformed(format!(
                "implausible body length {body_len}"
            )));
        }

        let total = 4 + body_len;
        if data.len() < total {
            return Err(FrameError::Incomplete {
                needed: total,
                available: data.len(),
            });
        }

        let body = &data[4..total];
        let offset = read_u64(body, 0);
        let published_at = read_u64(body, 8) as i64;
        let kind_len = read_u16(body, 16) as usize;

        let kind_end = 18 + kind_len;
        if kind_end + 8 > body.len() {
            return Err(FrameError::Malformed(format!(
                "kind length {kind_len} overruns body of {} bytes",
                body.len()
            )));
        }
        let kind = std::str::from_utf8(&body[18..kind_end])
            .map_err(|e| FrameError::Malformed(format!("kind is not UTF-8: {e}")))?
            .to_string();

        let payload_len = read_u32(body, kind_end) as usize;
        let payload_start = kind_end + 4;
        if payload_start + payload_len + 4 != body.len() {
            return Err(FrameError::Malformed(format!(
                "payload length {payload_len} disagrees with body length {}",
                body.len()
            )));
        }
        let payload = body[payload_start..payload_start + payload_len].to_vec();
        let checksum = read_u32(body, payload_start + payload_len);

        Ok((
            Self {
                offset,
                published_at,
                kind,
                payload,
                checksum,
            },
            total,
        ))
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

// ── Flush / Fsync Policies ──────────────────────────────────────────

/// Controls when buffered data is flushed to the OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    EveryWrite,
    EveryN(usize),
}

/// Controls when `fsync` is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(usize),
    OnRotation,
}

// ── Writer Configuration ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Topic directory holding the segment files.
    pub dir: PathBuf,
    /// Segment size in bytes before rotation (default 64 MiB).
    pub max_segment_bytes: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: 64 * 1024 * 1024,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

// ── Journal Writer ──────────────────────────────────────────────────

/// Append-only writer that assigns offsets.
pub struct JournalWriter {
    config: JournalConfig,
    writer: BufWriter<File>,
    segment_path: PathBuf,
    segment_index: u64,
    segment_bytes: u64,
    next_offset: u64,
    writes_since_flush: usize,
    writes_since_fsync: usize,
}

impl JournalWriter {
    /// Open the topic for appending.
    ///
    /// Scans existing segments to continue the offset sequence, and cuts a
    /// torn frame left at the end of the newest segment by a crash.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;

        let segments = list_segments(&config.dir)?;
        let mut last_offset = 0u64;
        for (_, path) in &segments {
            let scan = scan_segment(path)?;
            last_offset = last_offset.max(scan.last_offset.unwrap_or(0));
        }

        let segment_index = segments.last().map(|(idx, _)| *idx).unwrap_or(1);
        let segment_path = segment_path(&config.dir, segment_index);

        if segment_path.exists() {
            let scan = scan_segment(&segment_path)?;
            if scan.valid_len < scan.total_len {
                warn!(
                    segment = %segment_path.display(),
                    dropped_bytes = scan.total_len - scan.valid_len,
                    "Truncating torn frame at end of segment"
                );
                let file = OpenOptions::new().write(true).open(&segment_path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)?;
        let segment_bytes = file.metadata()?.len();

        info!(
            dir = %config.dir.display(),
            segment = segment_index,
            next_offset = last_offset + 1,
            "Journal opened"
        );

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            segment_path,
            segment_index,
            segment_bytes,
            next_offset: last_offset + 1,
            writes_since_flush: 0,
            writes_since_fsync: 0,
        })
    }

    /// Offset the next appended record will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn segment_path(&self) -> &Path {
        &self.segment_path
    }

    /// Append one record and return it with its assigned offset.
    pub fn append(
        &mut self,
        kind: &str,
        published_at: i64,
        payload: Vec<u8>,
    ) -> Result<JournalRecord, JournalError> {
        if kind.len() > u16::MAX as usize {
            return Err(JournalError::KindTooLong(kind.len()));
        }
        let body = MIN_BODY + kind.len() + payload.len();
        if body > MAX_FRAME_BODY {
            return Err(JournalError::FrameTooLarge(body));
        }

        if self.segment_bytes >= self.config.max_segment_bytes {
            self.rotate()?;
        }

        let record = JournalRecord::new(self.next_offset, published_at, kind, payload);
        let bytes = record.encode();
        self.writer.write_all(&bytes)?;

        self.segment_bytes += bytes.len() as u64;
        self.next_offset += 1;
        self.writes_since_flush += 1;
        self.writes_since_fsync += 1;

        self.apply_flush_policy()?;
        self.apply_fsync_policy()?;

        Ok(record)
    }

    /// Force flush + fsync.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_flush = 0;
        self.writes_since_fsync = 0;
        Ok(())
    }

    fn apply_flush_policy(&mut self) -> Result<(), JournalError> {
        let should_flush = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => self.writes_since_flush >= n,
        };
        if should_flush {
            self.writer.flush()?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    fn apply_fsync_policy(&mut self) -> Result<(), JournalError> {
        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            self.writes_since_fsync = 0;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync()?;

        self.segment_index += 1;
        self.segment_path = segment_path(&self.config.dir, self.segment_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.segment_path)?;

        self.writer = BufWriter::new(file);
        self.segment_bytes = 0;
        info!(segment = self.segment_index, "Journal segment rotated");
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

// ── Segment Files ───────────────────────────────────────────────────

pub(crate) fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index:06}{SEGMENT_SUFFIX}"))
}

/// Segment files in `dir` ordered by index; empty if `dir` does not exist.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let index = name
                .strip_prefix(SEGMENT_PREFIX)?
                .strip_suffix(SEGMENT_SUFFIX)?
                .parse::<u64>()
                .ok()?;
            Some((index, entry.path()))
        })
        .collect();

    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

struct SegmentScan {
    last_offset: Option<u64>,
    /// Length of the prefix made of whole frames
    valid_len: u64,
    total_len: u64,
}

fn scan_segment(path: &Path) -> io::Result<SegmentScan> {
    let data = fs::read(path)?;
    let mut pos = 0usize;
    let mut last_offset = None;

    while pos < data.len() {
        match JournalRecord::decode(&data[pos..]) {
            Ok((record, used)) => {
                if record.is_intact() {
                    last_offset = Some(record.offset);
                }
                pos += used;
            }
            Err(_) => break,
        }
    }

    Ok(SegmentScan {
        last_offset,
        valid_len: pos as u64,
        total_len: data.len() as u64,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
