//! Decimal helpers
//!
//! Prices stay `Decimal` everywhere they are stored or compared; indicator
//! math converts to `f64` at the edge through these helpers.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parse a decimal price as delivered by upstream ("187.4400")
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

/// Lossy conversion used by indicator math
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Convert back from indicator math; `None` for NaN and infinities
pub fn from_f64(value: f64) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f64(value)
    } else {
        None
    }
}

/// Canonical text form used for storage and digests (trailing zeros removed)
pub fn canonical_text(value: Decimal) -> String {
    value.normalize().to_string()
}
