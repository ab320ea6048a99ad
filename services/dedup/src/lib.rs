//! Deduplicating consumer
//!
//! Drains the envelope topic (or replays the journal / raw archive) into
//! the canonical store, writing each identity key at most once no matter
//! how often or in which order it is delivered.

pub mod backfill;
pub mod engine;
pub mod stats;
pub mod window;
pub mod worker;

pub const SERVICE_VERSION: &str = "0.1.0";
