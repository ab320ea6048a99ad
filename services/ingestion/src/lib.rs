//! Quote publisher
//!
//! Fetches intraday bars per symbol from a rate-limited upstream API,
//! validates them and publishes each new bar onto the durable topic while
//! archiving a raw copy of every tick.
//!
//! ```text
//!  RateLimitedKeyPool ──► ResilientFetcher ──► PublishLoop
//!   (one key per symbol,   (bounded retry,       │
//!    min call spacing)      per-bar validation)  ├──► topic (EnvelopeSink)
//!                                                └──► raw archive
//! ```

pub mod fetcher;
pub mod key_pool;
pub mod metrics;
pub mod publish;
pub mod scripted;
pub mod upstream;

pub const SERVICE_VERSION: &str = "0.1.0";
