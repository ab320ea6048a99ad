//! Channel envelopes and canonical records

use crate::ids::{IdentityKey, IdentityKeyMode, PublisherId};
use crate::quote::Quote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A quote in transit on the asynchronous channel
///
/// `(publisher_id, source_seq)` identifies one publish; the same quote may
/// travel in several envelopes when it is redelivered or re-fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub quote: Quote,
    pub ingested_at: DateTime<Utc>,
    pub source_seq: u64,
    pub publisher_id: PublisherId,
}

impl RawEnvelope {
    pub fn new(
        quote: Quote,
        ingested_at: DateTime<Utc>,
        source_seq: u64,
        publisher_id: PublisherId,
    ) -> Self {
        Self {
            quote,
            ingested_at,
            source_seq,
            publisher_id,
        }
    }

    pub fn identity_key(&self, mode: IdentityKeyMode) -> IdentityKey {
        self.quote.identity_key(mode)
    }
}

/// A quote as stored in the canonical store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub quote: Quote,
    /// When the identity key was first written
    pub first_seen: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn new(quote: Quote, first_seen: DateTime<Utc>) -> Self {
        Self { quote, first_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Symbol;
    use rust_decimal_macros::dec;

    #[test]
    fn test_envelope_json_shape() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let quote = Quote::new(
            Symbol::new("AAPL"),
            ts,
            dec!(187.15),
            dec!(187.44),
            dec!(187.0),
            dec!(187.3),
            5_000,
        );
        let envelope = RawEnvelope::new(quote, ts, 7, PublisherId::new());

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["quote"]["symbol"], "AAPL");
        // Decimals travel as strings to keep them exact
        assert_eq!(json["quote"]["high"], "187.44");
        assert_eq!(json["source_seq"], 7);

        let decoded: RawEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, envelope);
    }
}
