//! Normalized OHLCV quote
//!
//! A `Quote` is the unit every stage exchanges. Upstream bars arrive as
//! [`QuoteDraft`]s (raw strings plus a source timezone) and become quotes
//! only through [`QuoteDraft::into_quote`], which applies the same checks
//! as [`Quote::validate`].

use crate::errors::ValidationError;
use crate::ids::{IdentityKey, IdentityKeyMode, Symbol};
use crate::numeric::{canonical_text, parse_decimal};
use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One bar for one symbol
///
/// Timestamps are UTC with whole-second precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl Quote {
    /// Create a quote, truncating the timestamp to whole seconds
    pub fn new(
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: u64,
    ) -> Self {
        Self {
            symbol,
            timestamp: timestamp.trunc_subsecs(0),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check prices, OHLC ordering and the clock-skew bound
    pub fn validate(&self, now: DateTime<Utc>, skew: Duration) -> Result<(), ValidationError> {
        if self.timestamp > now + skew {
            return Err(ValidationError::FutureTimestamp {
                timestamp: self.timestamp,
                now,
            });
        }

        for (field, value) in self.price_fields() {
            if value <= Decimal::ZERO {
                return Err(ValidationError::NonPositivePrice { field, value });
            }
        }

        let floor = self.open.max(self.close).max(self.low);
        if self.high < floor {
            return Err(ValidationError::HighBelowRange {
                high: self.high,
                floor,
            });
        }

        let ceiling = self.open.min(self.close).min(self.high);
        if self.low > ceiling {
            return Err(ValidationError::LowAboveRange {
                low: self.low,
                ceiling,
            });
        }

        Ok(())
    }

    /// Identity of this quote under the given key mode
    pub fn identity_key(&self, mode: IdentityKeyMode) -> IdentityKey {
        let payload_digest = match mode {
            IdentityKeyMode::SymbolTimestamp => String::new(),
            IdentityKeyMode::SymbolTimestampPayload => self.payload_digest(),
        };
        IdentityKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            payload_digest,
        }
    }

    /// SHA-256 over the normalized OHLCV fields, hex encoded
    pub fn payload_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (_, value) in self.price_fields() {
            hasher.update(canonical_text(value).as_bytes());
            hasher.update(b"|");
        }
        hasher.update(self.volume.to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    /// True when OHLCV match, ignoring decimal scale
    pub fn same_payload(&self, other: &Quote) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }

    fn price_fields(&self) -> [(&'static str, Decimal); 4] {
        [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ]
    }
}

/// Unvalidated bar as delivered by upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteDraft {
    pub timestamp: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl QuoteDraft {
    /// Parse and validate into a [`Quote`]
    ///
    /// Naive timestamps (`%Y-%m-%d %H:%M:%S`) are interpreted in `source_tz`;
    /// RFC 3339 timestamps carry their own offset. Local times that do not
    /// exist (DST spring-forward) are unparseable.
    pub fn into_quote(
        &self,
        symbol: &Symbol,
        source_tz: Tz,
        now: DateTime<Utc>,
        skew: Duration,
    ) -> Result<Quote, ValidationError> {
        let timestamp = parse_timestamp(&self.timestamp, source_tz)?;
        let open = parse_price("open", &self.open)?;
        let high = parse_price("high", &self.high)?;
        let low = parse_price("low", &self.low)?;
        let close = parse_price("close", &self.close)?;

        let raw_volume = self.volume.trim();
        let volume: i64 = raw_volume.parse().map_err(|_| ValidationError::InvalidNumber {
            field: "volume",
            raw: self.volume.clone(),
        })?;
        if volume < 0 {
            return Err(ValidationError::NegativeVolume(volume));
        }

        let quote = Quote::new(
            symbol.clone(),
            timestamp,
            open,
            high,
            low,
            close,
            volume as u64,
        );
        quote.validate(now, skew)?;
        Ok(quote)
    }
}

fn parse_price(field: &'static str, raw: &str) -> Result<Decimal, ValidationError> {
    parse_decimal(raw).ok_or_else(|| ValidationError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })
}

fn parse_timestamp(raw: &str, source_tz: Tz) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();
    let unparseable = || ValidationError::UnparseableTimestamp {
        raw: raw.to_string(),
    };

    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M"))
        .map_err(|_| unparseable())?;

    source_tz
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(unparseable)
}
