//! Forward fill on a regular bar grid
//!
//! The grid runs from the first to the last observed bar. With a session it
//! holds only in-session slots of trading days; without one it is every
//! `period` step from the first bar. Missing slots copy the last observed
//! OHLC, up to `cap` in a row; the rest of a longer gap stays missing.
//! Intraday fills never carry a value into the next trading date.

use crate::session::TradingSession;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use types::config::VolumeFill;
use types::period::BarPeriod;
use types::quote::Quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapFillOptions {
    pub cap: usize,
    pub volume: VolumeFill,
}

impl Default for GapFillOptions {
    fn default() -> Self {
        Self {
            cap: 12,
            volume: VolumeFill::Zero,
        }
    }
}

/// A bar on the filled timeline
#[derive(Debug, Clone, PartialEq)]
pub struct FilledBar {
    pub quote: Quote,
    pub filled: bool,
}

impl FilledBar {
    pub fn observed(quote: Quote) -> Self {
        Self { quote, filled: false }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapFillResult {
    pub bars: Vec<FilledBar>,
    /// Grid slots left empty
    pub missing: Vec<DateTime<Utc>>,
}

impl GapFillResult {
    pub fn filled_count(&self) -> usize {
        self.bars.iter().filter(|bar| bar.filled).count()
    }
}

/// Expected slots between `first` and `last` inclusive.
pub fn expected_slots(
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    period: BarPeriod,
    session: Option<&TradingSession>,
) -> BTreeSet<DateTime<Utc>> {
    let mut slots = BTreeSet::new();
    match session {
        Some(session) => {
            let mut date = session.trading_date(first);
            let end = session.trading_date(last);
            while date <= end {
                slots.extend(
                    session
                        .slots(date, period)
                        .into_iter()
                        .filter(|slot| first <= *slot && *slot <= last),
                );
                date += Duration::days(1);
            }
        }
        None => {
            let mut slot = first;
            while slot <= last {
                slots.insert(slot);
                slot += period.duration();
            }
        }
    }
    slots
}

/// Fill gaps in `quotes` (sorted, unique timestamps) on the `period` grid.
pub fn fill_gaps(
    quotes: &[Quote],
    period: BarPeriod,
    session: Option<&TradingSession>,
    options: GapFillOptions,
) -> GapFillResult {
    let (Some(first), Some(last)) = (quotes.first(), quotes.last()) else {
        return GapFillResult::default();
    };

    let observed: BTreeMap<DateTime<Utc>, &Quote> =
        quotes.iter().map(|q| (q.timestamp, q)).collect();
    let mut timeline = expected_slots(first.timestamp, last.timestamp, period, session);
    timeline.extend(observed.keys().copied());

    let intraday = period < BarPeriod::D1;
    let mut result = GapFillResult::default();
    let mut previous: Option<&Quote> = None;
    let mut run = 0usize;

    for slot in timeline {
        if let Some(quote) = observed.get(&slot) {
            result.bars.push(FilledBar::observed((*quote).clone()));
            previous = Some(quote);
            run = 0;
            continue;
        }

        let carry = previous.filter(|prev| {
            let same_date = match session {
                Some(session) if intraday => {
                    session.trading_date(prev.timestamp) == session.trading_date(slot)
                }
                _ => true,
            };
            run < options.cap && same_date
        });
        match carry {
            Some(prev) => {
                result.bars.push(FilledBar {
                    quote: synthesize(prev, slot, options.volume),
                    filled: true,
                });
                run += 1;
            }
            None => result.missing.push(slot),
        }
    }
    result
}

fn synthesize(previous: &Quote, slot: DateTime<Utc>, volume: VolumeFill) -> Quote {
    Quote {
        timestamp: slot,
        volume: match volume {
            VolumeFill::Zero => 0,
            VolumeFill::Carry => previous.volume,
        },
        ..previous.clone()
    }
}
