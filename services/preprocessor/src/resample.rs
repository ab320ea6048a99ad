//! Bar resampling
//!
//! Folds an ordered series into fixed-width buckets aligned in the session
//! timezone. Each output bar is stamped with its bucket start and carries
//! open = first, high = max, low = min, close = last, volume = sum.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use types::period::BarPeriod;
use types::quote::Quote;

/// Resample `quotes` (sorted by timestamp) to `period`.
pub fn resample(quotes: &[Quote], period: BarPeriod, tz: Tz) -> Vec<Quote> {
    let mut out = Vec::new();
    let mut current: Option<Quote> = None;

    for quote in quotes {
        let bucket = period.align(quote.timestamp, tz);
        match current.as_mut() {
            Some(bar) if bar.timestamp == bucket => absorb(bar, quote),
            _ => {
                out.extend(current.take());
                current = Some(open_bucket(quote, bucket));
            }
        }
    }
    out.extend(current);
    out
}

fn open_bucket(quote: &Quote, bucket: DateTime<Utc>) -> Quote {
    Quote {
        timestamp: bucket,
        ..quote.clone()
    }
}

fn absorb(bar: &mut Quote, quote: &Quote) {
    if quote.high > bar.high {
        bar.high = quote.high;
    }
    if quote.low < bar.low {
        bar.low = quote.low;
    }
    bar.close = quote.close;
    bar.volume = bar.volume.saturating_add(quote.volume);
}
