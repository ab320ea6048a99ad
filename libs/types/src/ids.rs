//! Identifier types for pipeline entities
//!
//! Symbols are validated tickers, credentials are referred to by their
//! configured name, and publisher instances get a UUID v7 so that
//! `(publisher_id, source_seq)` is unique across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum ticker length accepted by [`Symbol`]
pub const MAX_SYMBOL_LEN: usize = 12;

/// Validated ticker symbol (e.g. "AAPL", "BRK.B")
///
/// Input is upper-cased; only ASCII letters, digits, `.` and `-` are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol from a literal
    ///
    /// # Panics
    /// Panics if the ticker is empty, too long or contains invalid characters.
    pub fn new(ticker: impl Into<String>) -> Self {
        let ticker = ticker.into();
        match Self::try_new(&ticker) {
            Some(symbol) => symbol,
            None => panic!("invalid ticker symbol: {ticker:?}"),
        }
    }

    /// Try to create a symbol, returning None if invalid
    pub fn try_new(ticker: &str) -> Option<Self> {
        let normalized = ticker.trim().to_ascii_uppercase();
        let valid_len = !normalized.is_empty() && normalized.len() <= MAX_SYMBOL_LEN;
        let valid_chars = normalized
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');
        (valid_len && valid_chars).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(&value).ok_or_else(|| format!("invalid ticker symbol: {value:?}"))
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a configured API credential (e.g. "primary")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream API key
///
/// `Debug` and `Display` only ever show a masked form; call
/// [`ApiKey::expose`] at the single place the key goes on the wire.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First four characters followed by an ellipsis
    pub fn masked(&self) -> String {
        if self.0.len() <= 4 {
            return "****".to_string();
        }
        let prefix: String = self.0.chars().take(4).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Serialize for ApiKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.masked())
    }
}

/// Identifier of one publisher process instance
///
/// Uses UUID v7 so envelopes from successive runs sort by start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherId(Uuid);

impl PublisherId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How record identity is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKeyMode {
    /// One record per (symbol, timestamp); later payloads conflict
    #[default]
    SymbolTimestamp,
    /// Payload digest is part of the key, so revised bars are kept as well
    SymbolTimestampPayload,
}

/// Uniqueness key of a canonical record
///
/// `payload_digest` is empty under [`IdentityKeyMode::SymbolTimestamp`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub payload_digest: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"))?;
        if !self.payload_digest.is_empty() {
            let short: String = self.payload_digest.chars().take(12).collect();
            write!(f, "#{short}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalizes_case() {
        let symbol = Symbol::new("aapl");
        assert_eq!(symbol.as_str(), "AAPL");
        assert_eq!(symbol.to_string(), "AAPL");
    }

    #[test]
    fn test_symbol_validation() {
        assert!(Symbol::try_new("BRK.B").is_some());
        assert!(Symbol::try_new("RDS-A").is_some());
        assert!(Symbol::try_new("").is_none());
        assert!(Symbol::try_new("AAPL MSFT").is_none());
        assert!(Symbol::try_new("ABCDEFGHIJKLM").is_none());
        assert!(Symbol::try_new("A$").is_none());
    }

    #[test]
    fn test_symbol_serde_rejects_invalid() {
        let symbol: Symbol = serde_json::from_str("\"msft\"").unwrap();
        assert_eq!(symbol.as_str(), "MSFT");
        assert!(serde_json::from_str::<Symbol>("\"not a ticker\"").is_err());
    }

    #[test]
    fn test_api_key_is_masked() {
        let key = ApiKey::new("J30SECRETKEY");
        assert_eq!(key.masked(), "J30S...");
        assert!(!format!("{key:?}").contains("SECRETKEY"));
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"J30S...\"");
        assert_eq!(ApiKey::new("abc").masked(), "****");
    }

    #[test]
    fn test_publisher_ids_unique() {
        assert_ne!(PublisherId::new(), PublisherId::new());
    }

    #[test]
    fn test_identity_key_mode_serde() {
        let mode: IdentityKeyMode = serde_json::from_str("\"symbol_timestamp_payload\"").unwrap();
        assert_eq!(mode, IdentityKeyMode::SymbolTimestampPayload);
        assert_eq!(IdentityKeyMode::default(), IdentityKeyMode::SymbolTimestamp);
    }
}
