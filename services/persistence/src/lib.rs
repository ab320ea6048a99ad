//! Persistence for the quote pipeline
//!
//! - [`journal`] / [`reader`]: append-only, checksummed segment files
//! - [`topic`] / [`cursor`]: a durable envelope topic with per-consumer cursors
//! - [`channel`]: the publish/consume seams plus an in-memory channel
//! - [`archive`]: raw batch blobs (JSON + CSV) per fetch tick
//! - [`canonical`]: the deduplicated SQLite store
//! - [`watermark`]: per-symbol publish progress that survives restarts

pub mod archive;
pub mod canonical;
pub mod channel;
pub mod cursor;
pub mod journal;
pub mod reader;
pub mod topic;
pub mod watermark;
