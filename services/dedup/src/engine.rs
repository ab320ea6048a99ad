//! Identity check and canonical write for one envelope
//!
//! Delivery is at-least-once and unordered, so the identity key alone
//! decides the outcome. The first write of a key wins; a later envelope
//! with the same key and the same payload is a `Duplicate`, one with a
//! different payload is a `Conflict` and is discarded.

use chrono::Duration;
use persistence::canonical::{CanonicalStore, InsertOutcome, StoreError};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use types::clock::Clock;
use types::config::PipelineConfig;
use types::envelope::{CanonicalRecord, RawEnvelope};
use types::errors::ValidationError;
use types::ids::{IdentityKeyMode, Symbol};
use types::quote::Quote;

use crate::window::RecentKeys;

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    UnknownSymbol(Symbol),
    Invalid(ValidationError),
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::UnknownSymbol(_) => "unknown_symbol",
            RejectReason::Invalid(e) => e.reason(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Inserted,
    Duplicate,
    /// Same key, different payload; `existing` is the row that stays
    Conflict { existing: Quote },
    Rejected(RejectReason),
}

pub struct DedupEngine {
    store: Arc<CanonicalStore>,
    clock: Arc<dyn Clock>,
    mode: IdentityKeyMode,
    skew: Duration,
    recent: Mutex<RecentKeys>,
}

impl DedupEngine {
    pub fn new(
        store: Arc<CanonicalStore>,
        clock: Arc<dyn Clock>,
        mode: IdentityKeyMode,
        skew: Duration,
        recent_window: usize,
    ) -> Self {
        Self {
            store,
            clock,
            mode,
            skew,
            recent: Mutex::new(RecentKeys::new(recent_window)),
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<CanonicalStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            store,
            clock,
            config.dedup.key_mode,
            config.validation.clock_skew(),
            config.dedup.recent_window,
        )
    }

    pub fn store(&self) -> &Arc<CanonicalStore> {
        &self.store
    }

    pub fn key_mode(&self) -> IdentityKeyMode {
        self.mode
    }

    /// Classify `envelope` and write it if its key is new.
    ///
    /// Only store failures are errors; every other outcome is a value.
    pub fn process(&self, envelope: &RawEnvelope) -> Result<DedupOutcome, StoreError> {
        let quote = &envelope.quote;
        if !self.store.knows(&quote.symbol) {
            warn!(
                symbol = %quote.symbol,
                seq = envelope.source_seq,
                "Rejecting envelope for unknown symbol"
            );
            return Ok(DedupOutcome::Rejected(RejectReason::UnknownSymbol(
                quote.symbol.clone(),
            )));
        }

        let received_at = self.clock.now();
        self.store.mirror_raw(envelope, received_at)?;

        // Judged against ingestion time so replays classify the same way.
        if let Err(error) = quote.validate(envelope.ingested_at, self.skew) {
            warn!(
                symbol = %quote.symbol,
                timestamp = %quote.timestamp,
                reason = error.reason(),
                "Rejecting invalid quote"
            );
            return Ok(DedupOutcome::Rejected(RejectReason::Invalid(error)));
        }

        let key = envelope.identity_key(self.mode);
        if let Some(existing) = self.lock_recent().get(&key) {
            return Ok(self.classify(&key.to_string(), quote, existing));
        }

        let record = CanonicalRecord::new(quote.clone(), received_at);
        match self.store.insert_if_absent(&key, &record)? {
            InsertOutcome::Inserted => {
                debug!(key = %key, "Canonical row inserted");
                self.lock_recent().insert(key, quote.clone());
                Ok(DedupOutcome::Inserted)
            }
            InsertOutcome::AlreadyPresent(existing) => {
                let outcome = self.classify(&key.to_string(), quote, &existing.quote);
                self.lock_recent().insert(key, existing.quote);
                Ok(outcome)
            }
        }
    }

    fn classify(&self, key: &str, incoming: &Quote, existing: &Quote) -> DedupOutcome {
        if incoming.same_payload(existing) {
            debug!(key, "Duplicate discarded");
            DedupOutcome::Duplicate
        } else {
            warn!(
                key,
                existing_close = %existing.close,
                incoming_close = %incoming.close,
                "Conflicting payload for existing key, keeping first write"
            );
            DedupOutcome::Conflict {
                existing: existing.clone(),
            }
        }
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, RecentKeys> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }
}
