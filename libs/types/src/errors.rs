//! Error types for the quote pipeline
//!
//! Shared taxonomy using thiserror. Component crates keep their own
//! module-level errors and convert into these at the boundaries.

use crate::ids::Symbol;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level pipeline error
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Fetch failure: {0}")]
    Fetch(#[from] FetchFailure),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Invalid or unreadable configuration; fatal at startup
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml_bw::Error),

    #[error("Environment variable {0} is not set and has no default")]
    MissingEnvVar(String),

    #[error("No credentials configured")]
    NoCredentials,

    #[error("No symbols configured")]
    NoSymbols,

    #[error("Symbol {0} has no assigned credential")]
    UnassignedSymbol(Symbol),

    #[error("Symbol {symbol} references unknown credential {credential}")]
    UnknownCredential { symbol: Symbol, credential: String },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Logical fetch that exhausted its retries or hit a terminal upstream error
#[derive(Error, Debug, Clone, PartialEq)]
#[error("fetch for {symbol} failed after {attempts} attempt(s): {last_error}")]
pub struct FetchFailure {
    pub symbol: Symbol,
    pub attempts: u32,
    pub last_error: String,
}

/// Record rejected before entering the pipeline; never retried
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unparseable timestamp: {raw:?}")]
    UnparseableTimestamp { raw: String },

    #[error("Timestamp {timestamp} is beyond the clock-skew tolerance (now {now})")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Invalid number in field {field}: {raw:?}")]
    InvalidNumber { field: &'static str, raw: String },

    #[error("Non-positive {field}: {value}")]
    NonPositivePrice { field: &'static str, value: Decimal },

    #[error("Negative volume: {0}")]
    NegativeVolume(i64),

    #[error("High {high} is below max(open, close, low) = {floor}")]
    HighBelowRange { high: Decimal, floor: Decimal },

    #[error("Low {low} is above min(open, close, high) = {ceiling}")]
    LowAboveRange { low: Decimal, ceiling: Decimal },

    #[error("Symbol mismatch: expected {expected}, got {actual}")]
    SymbolMismatch { expected: Symbol, actual: Symbol },
}

impl ValidationError {
    /// Stable label used in drop counters and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::UnparseableTimestamp { .. } => "unparseable_timestamp",
            ValidationError::FutureTimestamp { .. } => "future_timestamp",
            ValidationError::InvalidNumber { .. } => "invalid_number",
            ValidationError::NonPositivePrice { .. } => "non_positive_price",
            ValidationError::NegativeVolume(_) => "negative_volume",
            ValidationError::HighBelowRange { .. } => "high_below_range",
            ValidationError::LowAboveRange { .. } => "low_above_range",
            ValidationError::SymbolMismatch { .. } => "symbol_mismatch",
        }
    }
}

/// A side effect against one of the stores failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Archive write failed for {key}: {message}")]
    Archive { key: String, message: String },

    #[error("Channel publish failed: {message}")]
    Channel { message: String },

    #[error("Canonical store write failed: {message}")]
    Canonical { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FetchFailure {
            symbol: Symbol::new("AAPL"),
            attempts: 3,
            last_error: "HTTP 503".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "fetch for AAPL failed after 3 attempt(s): HTTP 503"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err = ValidationError::NegativeVolume(-5);
        let pipeline: PipelineError = err.into();
        assert!(matches!(pipeline, PipelineError::Validation(_)));
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(ValidationError::NegativeVolume(-1).reason(), "negative_volume");
        let err = ValidationError::UnparseableTimestamp { raw: "x".into() };
        assert_eq!(err.reason(), "unparseable_timestamp");
    }
}
