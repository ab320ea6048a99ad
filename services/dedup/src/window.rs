//! In-memory bookkeeping in front of the canonical store
//!
//! `RecentKeys` remembers the last N committed identity keys so obvious
//! redeliveries skip the database; the store's uniqueness constraint stays
//! authoritative. `SequenceTracker` watches each publisher's `source_seq`
//! and reports gaps (lost publishes) and replays.

use std::collections::{HashMap, VecDeque};

use tracing::warn;
use types::ids::{IdentityKey, PublisherId};
use types::quote::Quote;

/// Bounded FIFO of recently committed keys with the payload that won.
#[derive(Debug)]
pub struct RecentKeys {
    capacity: usize,
    order: VecDeque<IdentityKey>,
    entries: HashMap<IdentityKey, Quote>,
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(65_536)),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Quote> {
        self.entries.get(key)
    }

    /// Remember `key`; evicts the oldest entry when full.
    pub fn insert(&mut self, key: IdentityKey, quote: Quote) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, quote);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// How a `source_seq` relates to what was seen from its publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceObservation {
    First,
    InOrder,
    /// Sequence numbers `from..=to` were never seen
    Gap { from: u64, to: u64 },
    /// At or below the highest sequence already seen
    Replay,
}

#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<PublisherId, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, publisher: PublisherId, seq: u64) -> SequenceObservation {
        let Some(last) = self.last.get(&publisher).copied() else {
            self.last.insert(publisher, seq);
            return SequenceObservation::First;
        };
        if seq <= last {
            return SequenceObservation::Replay;
        }
        self.last.insert(publisher, seq);
        if seq == last + 1 {
            SequenceObservation::InOrder
        } else {
            warn!(
                publisher = %publisher,
                from = last + 1,
                to = seq - 1,
                "Publisher sequence gap"
            );
            SequenceObservation::Gap {
                from: last + 1,
                to: seq - 1,
            }
        }
    }

    pub fn publishers(&self) -> usize {
        self.last.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use types::ids::{IdentityKeyMode, Symbol};

    fn quote(minute: i64) -> Quote {
        Quote::new(
            Symbol::new("AAPL"),
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap() + Duration::minutes(minute),
            dec!(1),
            dec!(2),
            dec!(1),
            dec!(2),
            5,
        )
    }

    #[test]
    fn test_recent_keys_evicts_oldest() {
        let mut recent = RecentKeys::new(2);
        for minute in 0..3 {
            let q = quote(minute);
            recent.insert(q.identity_key(IdentityKeyMode::SymbolTimestamp), q);
        }
        assert_eq!(recent.len(), 2);
        assert!(recent
            .get(&quote(0).identity_key(IdentityKeyMode::SymbolTimestamp))
            .is_none());
        assert!(recent
            .get(&quote(2).identity_key(IdentityKeyMode::SymbolTimestamp))
            .is_some());
    }

    #[test]
    fn test_recent_keys_keeps_first_payload() {
        let mut recent = RecentKeys::new(4);
        let first = quote(0);
        let key = first.identity_key(IdentityKeyMode::SymbolTimestamp);
        recent.insert(key.clone(), first.clone());

        let mut revised = first.clone();
        revised.close = dec!(1.5);
        recent.insert(key.clone(), revised);
        assert_eq!(recent.get(&key), Some(&first));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_zero_capacity_disables_window() {
        let mut recent = RecentKeys::new(0);
        let q = quote(0);
        recent.insert(q.identity_key(IdentityKeyMode::SymbolTimestamp), q);
        assert!(recent.is_empty());
    }

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::new();
        let a = PublisherId::new();
        let b = PublisherId::new();

        assert_eq!(tracker.observe(a, 1), SequenceObservation::First);
        assert_eq!(tracker.observe(a, 2), SequenceObservation::InOrder);
        assert_eq!(tracker.observe(a, 5), SequenceObservation::Gap { from: 3, to: 4 });
        assert_eq!(tracker.observe(a, 4), SequenceObservation::Replay);
        assert_eq!(tracker.observe(b, 9), SequenceObservation::First);
        assert_eq!(tracker.publishers(), 2);
    }
}
