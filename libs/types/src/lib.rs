//! Types library for the quote ingestion pipeline
//!
//! This library provides the data model shared by the ingestion, dedup and
//! preprocessing workers, so that every stage agrees on what a quote is,
//! how its identity is derived and how the pipeline is configured.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, CredentialId, ApiKey, PublisherId, IdentityKey)
//! - `quote`: Normalized OHLCV quote and its validation
//! - `envelope`: Channel envelopes and canonical records
//! - `processed`: Analysis-ready bars with derived indicator columns
//! - `period`: Fixed-width bar periods and calendar alignment
//! - `numeric`: Decimal helpers
//! - `clock`: Injectable clock (system and manual)
//! - `config`: Validated YAML configuration
//! - `errors`: Error taxonomy

pub mod clock;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod numeric;
pub mod period;
pub mod processed;
pub mod quote;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::*;
    pub use crate::envelope::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::period::*;
    pub use crate::processed::*;
    pub use crate::quote::*;
}
