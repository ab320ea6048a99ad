//! Canonical store → preprocessing → processed table

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use persistence::canonical::CanonicalStore;
use preprocessor::pipeline::{preprocess_symbol, PreprocessOptions};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;
use types::envelope::CanonicalRecord;
use types::ids::{IdentityKeyMode, Symbol};
use types::period::BarPeriod;
use types::quote::Quote;

fn at(minute: i64) -> DateTime<Utc> {
    // Friday 09:30 EST
    Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap() + Duration::minutes(minute)
}

fn store(tmp: &TempDir) -> CanonicalStore {
    CanonicalStore::open(
        &tmp.path().join("canonical.db"),
        BTreeMap::from([(Symbol::new("AAPL"), "apple_stock".to_string())]),
    )
    .unwrap()
}

fn insert(store: &CanonicalStore, mode: IdentityKeyMode, minute: i64, close: Decimal) {
    let quote = Quote::new(
        Symbol::new("AAPL"),
        at(minute),
        dec!(100),
        dec!(110),
        dec!(90),
        close,
        1_000,
    );
    let key = quote.identity_key(mode);
    store
        .insert_if_absent(&key, &CanonicalRecord::new(quote, at(minute + 1)))
        .unwrap();
}

#[test]
fn test_processed_table_matches_returned_series() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp);
    let symbol = Symbol::new("AAPL");
    // 09:25 is pre-market; 09:45 and 09:50 are missing
    let rows = [
        (-5, dec!(99)),
        (0, dec!(100)),
        (5, dec!(101)),
        (10, dec!(102)),
        (25, dec!(105)),
    ];
    for (minute, close) in rows {
        insert(&store, IdentityKeyMode::SymbolTimestamp, minute, close);
    }

    let options = PreprocessOptions::default();
    let processed = preprocess_symbol(&store, &symbol, &options, None, None, at(600)).unwrap();

    assert_eq!(processed.drops.outside_session, 1);
    assert_eq!(processed.bars.len(), 6);
    assert_eq!(processed.filled_count(), 2);
    assert_eq!(store.load_processed(&symbol).unwrap(), processed.bars);

    // Canonical rows stay untouched.
    assert_eq!(store.count(&symbol).unwrap(), 5);
}

#[test]
fn test_rerun_replaces_processed_rows() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp);
    let symbol = Symbol::new("AAPL");
    insert(&store, IdentityKeyMode::SymbolTimestamp, 0, dec!(100));
    insert(&store, IdentityKeyMode::SymbolTimestamp, 5, dec!(101));

    let options = PreprocessOptions::default();
    preprocess_symbol(&store, &symbol, &options, None, None, at(600)).unwrap();
    preprocess_symbol(&store, &symbol, &options, None, None, at(700)).unwrap();

    assert_eq!(store.load_processed(&symbol).unwrap().len(), 2);
}

#[test]
fn test_rerun_at_coarser_period_leaves_no_stale_rows() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp);
    let symbol = Symbol::new("AAPL");
    for minute in (0..60).step_by(5) {
        insert(&store, IdentityKeyMode::SymbolTimestamp, minute, dec!(100));
    }

    let options = PreprocessOptions::default();
    let five_minute = preprocess_symbol(&store, &symbol, &options, None, None, at(600)).unwrap();
    assert_eq!(store.load_processed(&symbol).unwrap().len(), five_minute.bars.len());

    let hourly = PreprocessOptions {
        resample: Some(BarPeriod::H1),
        ..PreprocessOptions::default()
    };
    let processed = preprocess_symbol(&store, &symbol, &hourly, None, None, at(700)).unwrap();

    // 09:00 and 10:00 buckets only
    assert_eq!(processed.bars.len(), 2);
    assert_eq!(store.load_processed(&symbol).unwrap(), processed.bars);
}

#[test]
fn test_widened_key_revisions_collapse_to_first() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp);
    let symbol = Symbol::new("AAPL");
    insert(&store, IdentityKeyMode::SymbolTimestampPayload, 0, dec!(100));
    insert(&store, IdentityKeyMode::SymbolTimestampPayload, 0, dec!(101));

    let options = PreprocessOptions::default();
    let processed = preprocess_symbol(&store, &symbol, &options, None, None, at(600)).unwrap();

    assert_eq!(processed.drops.duplicate_timestamps, 1);
    assert_eq!(processed.bars.len(), 1);
    assert_eq!(processed.bars[0].close, dec!(100));
}

#[test]
fn test_range_bounds() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp);
    let symbol = Symbol::new("AAPL");
    for minute in [0, 5, 10, 15] {
        insert(&store, IdentityKeyMode::SymbolTimestamp, minute, dec!(100));
    }

    let options = PreprocessOptions::default();
    let processed =
        preprocess_symbol(&store, &symbol, &options, Some(at(5)), Some(at(10)), at(600)).unwrap();
    let stamps: Vec<DateTime<Utc>> = processed.bars.iter().map(|b| b.timestamp).collect();
    assert_eq!(stamps, vec![at(5), at(10)]);
}
