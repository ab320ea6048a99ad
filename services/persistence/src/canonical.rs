//! Canonical quote store (SQLite)
//!
//! Every tracked symbol gets three tables named from its configured base
//! name `{t}`:
//!
//! - `{t}`: canonical rows, `UNIQUE(symbol, timestamp, payload_digest)`
//! - `{t}_raw`: every delivered envelope, duplicates included
//! - `{t}_processed`: derived columns written by the preprocessor
//!
//! The uniqueness constraint is what makes dedup correct across workers:
//! `insert_if_absent` relies on `ON CONFLICT DO NOTHING`, so two writers
//! racing on one key produce exactly one row. Decimals are stored as text
//! and timestamps as `YYYY-MM-DDTHH:MM:SSZ`, which sorts chronologically.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use types::envelope::{CanonicalRecord, RawEnvelope};
use types::ids::{IdentityKey, Symbol};
use types::period::BarPeriod;
use types::processed::{Indicators, ProcessedBar};
use types::quote::Quote;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Symbol {0} has no table")]
    UnknownSymbol(Symbol),

    #[error("Invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: String, detail: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result of a conditional insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same identity key already exists
    AlreadyPresent(CanonicalRecord),
}

// ── Store ───────────────────────────────────────────────────────────

pub struct CanonicalStore {
    conn: Mutex<Connection>,
    tables: BTreeMap<Symbol, String>,
}

impl CanonicalStore {
    /// Open (or create) the database and ensure every symbol's tables exist.
    pub fn open(path: &Path, tables: BTreeMap<Symbol, String>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 30000;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous  = NORMAL;
        ",
        )?;
        let store = Self::with_connection(conn, tables)?;
        info!(path = %path.display(), symbols = store.tables.len(), "Canonical store opened");
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory(tables: BTreeMap<Symbol, String>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, tables)
    }

    fn with_connection(
        conn: Connection,
        tables: BTreeMap<Symbol, String>,
    ) -> Result<Self, StoreError> {
        for table in tables.values() {
            if !is_safe_identifier(table) {
                return Err(StoreError::InvalidTable(table.clone()));
            }
            conn.execute_batch(&schema(table))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
        })
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.tables.keys()
    }

    pub fn knows(&self, symbol: &Symbol) -> bool {
        self.tables.contains_key(symbol)
    }

    fn table(&self, symbol: &Symbol) -> Result<&str, StoreError> {
        self.tables
            .get(symbol)
            .map(String::as_str)
            .ok_or_else(|| StoreError::UnknownSymbol(symbol.clone()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Write `record` unless a row with `key` exists; never overwrites.
    pub fn insert_if_absent(
        &self,
        key: &IdentityKey,
        record: &CanonicalRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let table = self.table(&key.symbol)?;
        let quote = &record.quote;
        let conn = self.lock()?;

        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table}
                 (symbol, timestamp, payload_digest, open, high, low, close, volume, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (symbol, timestamp, payload_digest) DO NOTHING"
            ),
            params![
                key.symbol.as_str(),
                format_ts(key.timestamp),
                key.payload_digest,
                quote.open.to_string(),
                quote.high.to_string(),
                quote.low.to_string(),
                quote.close.to_string(),
                volume_to_sql(quote.volume),
                format_ts(record.first_seen),
            ],
        )?;
        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = conn
            .query_row(
                &format!(
                    "SELECT symbol, timestamp, open, high, low, close, volume, first_seen
                     FROM {table}
                     WHERE symbol = ?1 AND timestamp = ?2 AND payload_digest = ?3"
                ),
                params![key.symbol.as_str(), format_ts(key.timestamp), key.payload_digest],
                |row| read_canonical(row, table),
            )
            .optional()?
            .ok_or_else(|| StoreError::Corrupt {
                table: table.to_string(),
                detail: format!("conflicting row for {key} vanished"),
            })??;
        Ok(InsertOutcome::AlreadyPresent(existing))
    }

    /// Append an envelope to the raw mirror (no deduplication).
    pub fn mirror_raw(
        &self,
        envelope: &RawEnvelope,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let quote = &envelope.quote;
        let table = self.table(&quote.symbol)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {table}_raw
                 (symbol, timestamp, open, high, low, close, volume,
                  ingested_at, source_seq, publisher_id, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                quote.symbol.as_str(),
                format_ts(quote.timestamp),
                quote.open.to_string(),
                quote.high.to_string(),
                quote.low.to_string(),
                quote.close.to_string(),
                volume_to_sql(quote.volume),
                envelope.ingested_at.to_rfc3339(),
                envelope.source_seq as i64,
                envelope.publisher_id.to_string(),
                received_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Canonical rows for `symbol` within `[from, to]`, oldest first.
    ///
    /// Rows sharing a timestamp (widened identity key) come in first-seen order.
    pub fn load_series(
        &self,
        symbol: &Symbol,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let table = self.table(symbol)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT symbol, timestamp, open, high, low, close, volume, first_seen
             FROM {table}
             WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp, first_seen, rowid"
        ))?;
        let from = from.map(format_ts).unwrap_or_default();
        let to = to.map(format_ts).unwrap_or_else(|| "9999".to_string());

        let rows =
            stmt.query_map(params![symbol.as_str(), from, to], |row| read_canonical(row, table))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    pub fn count(&self, symbol: &Symbol) -> Result<u64, StoreError> {
        self.count_in(symbol, "")
    }

    pub fn raw_count(&self, symbol: &Symbol) -> Result<u64, StoreError> {
        self.count_in(symbol, "_raw")
    }

    fn count_in(&self, symbol: &Symbol, suffix: &str) -> Result<u64, StoreError> {
        let table = self.table(symbol)?;
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table}{suffix} WHERE symbol = ?1"),
            params![symbol.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Replace the processed rows of `symbol` over `[from, to]` in one
    /// transaction.
    ///
    /// The replaced range is widened to cover `bars`, so rows from an
    /// earlier run at another period or with more bars never survive
    /// inside it. `None` bounds are open.
    pub fn write_processed(
        &self,
        symbol: &Symbol,
        period: BarPeriod,
        bars: &[ProcessedBar],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        processed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let table = self.table(symbol)?;
        let lo = from.map(|f| bars.first().map_or(f, |b| f.min(b.timestamp)));
        let hi = to.map(|t| bars.last().map_or(t, |b| t.max(b.timestamp)));

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            &format!(
                "DELETE FROM {table}_processed
                 WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3"
            ),
            params![
                symbol.as_str(),
                lo.map(format_ts).unwrap_or_default(),
                hi.map(format_ts).unwrap_or_else(|| "9999".to_string()),
            ],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table}_processed
                 (symbol, timestamp, period, open, high, low, close, volume, filled,
                  daily_return, ma_short, ma_long, volatility, volume_ma, momentum,
                  cumulative_average, eod_ma, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                          ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ))?;
            for bar in bars {
                let ind = &bar.indicators;
                stmt.execute(params![
                    symbol.as_str(),
                    format_ts(bar.timestamp),
                    period.to_string(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    volume_to_sql(bar.volume),
                    bar.filled,
                    ind.daily_return,
                    ind.ma_short,
                    ind.ma_long,
                    ind.volatility,
                    ind.volume_ma,
                    ind.momentum,
                    ind.cumulative_average,
                    ind.eod_ma,
                    processed_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            symbol = %symbol,
            period = %period,
            removed,
            written = bars.len(),
            "Processed rows replaced"
        );
        Ok(bars.len())
    }

    /// Processed bars for `symbol`, oldest first.
    pub fn load_processed(&self, symbol: &Symbol) -> Result<Vec<ProcessedBar>, StoreError> {
        let table = self.table(symbol)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT timestamp, open, high, low, close, volume, filled,
                    daily_return, ma_short, ma_long, volatility, volume_ma, momentum,
                    cumulative_average, eod_ma
             FROM {table}_processed WHERE symbol = ?1 ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map(params![symbol.as_str()], |row| {
            let fields = (
                row.get::<_, String>(0)?,
                [
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ],
                row.get::<_, i64>(5)?,
                row.get::<_, bool>(6)?,
                Indicators {
                    daily_return: row.get(7)?,
                    ma_short: row.get(8)?,
                    ma_long: row.get(9)?,
                    volatility: row.get(10)?,
                    volume_ma: row.get(11)?,
                    momentum: row.get(12)?,
                    cumulative_average: row.get(13)?,
                    eod_ma: row.get(14)?,
                },
            );
            Ok(fields)
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (ts, [open, high, low, close], volume, filled, indicators) = row?;
            bars.push(ProcessedBar {
                timestamp: parse_ts(&ts, table)?,
                open: parse_decimal(&open, table)?,
                high: parse_decimal(&high, table)?,
                low: parse_decimal(&low, table)?,
                close: parse_decimal(&close, table)?,
                volume: volume.max(0) as u64,
                filled,
                indicators,
            });
        }
        Ok(bars)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn schema(table: &str) -> String {
    format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            symbol          TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            payload_digest  TEXT NOT NULL DEFAULT '',
            open            TEXT NOT NULL,
            high            TEXT NOT NULL,
            low             TEXT NOT NULL,
            close           TEXT NOT NULL,
            volume          INTEGER NOT NULL,
            first_seen      TEXT NOT NULL,
            UNIQUE (symbol, timestamp, payload_digest)
        );
        CREATE TABLE IF NOT EXISTS {table}_raw (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol          TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            open            TEXT NOT NULL,
            high            TEXT NOT NULL,
            low             TEXT NOT NULL,
            close           TEXT NOT NULL,
            volume          INTEGER NOT NULL,
            ingested_at     TEXT NOT NULL,
            source_seq      INTEGER NOT NULL,
            publisher_id    TEXT NOT NULL,
            received_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_raw_ts ON {table}_raw (symbol, timestamp);
        CREATE TABLE IF NOT EXISTS {table}_processed (
            symbol              TEXT NOT NULL,
            timestamp           TEXT NOT NULL,
            period              TEXT NOT NULL,
            open                TEXT NOT NULL,
            high                TEXT NOT NULL,
            low                 TEXT NOT NULL,
            close               TEXT NOT NULL,
            volume              INTEGER NOT NULL,
            filled              INTEGER NOT NULL DEFAULT 0,
            daily_return        REAL,
            ma_short            REAL,
            ma_long             REAL,
            volatility          REAL,
            volume_ma           REAL,
            momentum            REAL,
            cumulative_average  REAL,
            eod_ma              REAL,
            processed_at        TEXT NOT NULL,
            PRIMARY KEY (symbol, timestamp)
        );
    "
    )
}

fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(raw: &str, table: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table: table.to_string(),
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_decimal(raw: &str, table: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt {
        table: table.to_string(),
        detail: format!("bad decimal {raw:?}: {e}"),
    })
}

fn volume_to_sql(volume: u64) -> i64 {
    i64::try_from(volume).unwrap_or(i64::MAX)
}

/// Row mapper; the outer `Result` is SQLite's, the inner one ours.
fn read_canonical(
    row: &Row<'_>,
    table: &str,
) -> rusqlite::Result<Result<CanonicalRecord, StoreError>> {
    let symbol: String = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let prices: [String; 4] = [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?];
    let volume: i64 = row.get(6)?;
    let first_seen: String = row.get(7)?;

    Ok((|| {
        let symbol = Symbol::try_new(&symbol).ok_or_else(|| StoreError::Corrupt {
            table: table.to_string(),
            detail: format!("bad symbol {symbol:?}"),
        })?;
        let quote = Quote::new(
            symbol,
            parse_ts(&timestamp, table)?,
            parse_decimal(&prices[0], table)?,
            parse_decimal(&prices[1], table)?,
            parse_decimal(&prices[2], table)?,
            parse_decimal(&prices[3], table)?,
            volume.max(0) as u64,
        );
        Ok(CanonicalRecord::new(quote, parse_ts(&first_seen, table)?))
    })())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use types::ids::{IdentityKeyMode, PublisherId};

    fn tables() -> BTreeMap<Symbol, String> {
        BTreeMap::from([
            (Symbol::new("AAPL"), "apple_stock".to_string()),
            (Symbol::new("MSFT"), "microsoft_stock".to_string()),
        ])
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
            + chrono::Duration::minutes(i64::from(minute))
    }

    fn quote(symbol: &str, minute: u32, close: Decimal) -> Quote {
        Quote::new(
            Symbol::new(symbol),
            at(minute),
            dec!(100),
            dec!(110),
            dec!(90),
            close,
            1_000,
        )
    }

    fn record(q: &Quote) -> CanonicalRecord {
        CanonicalRecord::new(q.clone(), at(29))
    }

    #[test]
    fn test_insert_then_duplicate() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let q = quote("AAPL", 0, dec!(105));
        let key = q.identity_key(IdentityKeyMode::SymbolTimestamp);

        assert_eq!(store.insert_if_absent(&key, &record(&q)).unwrap(), InsertOutcome::Inserted);
        match store.insert_if_absent(&key, &record(&q)).unwrap() {
            InsertOutcome::AlreadyPresent(existing) => assert_eq!(existing.quote, q),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.count(&Symbol::new("AAPL")).unwrap(), 1);
    }

    #[test]
    fn test_existing_row_never_overwritten() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let first = quote("AAPL", 0, dec!(105));
        let revised = quote("AAPL", 0, dec!(106));
        let key = first.identity_key(IdentityKeyMode::SymbolTimestamp);

        store.insert_if_absent(&key, &record(&first)).unwrap();
        let outcome = store.insert_if_absent(&key, &record(&revised)).unwrap();
        assert!(matches!(
            outcome,
            InsertOutcome::AlreadyPresent(ref e) if e.quote.close == dec!(105)
        ));

        let series = store.load_series(&Symbol::new("AAPL"), None, None).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].quote.close, dec!(105));
    }

    #[test]
    fn test_widened_key_keeps_revisions() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let first = quote("AAPL", 0, dec!(105));
        let revised = quote("AAPL", 0, dec!(106));
        let mode = IdentityKeyMode::SymbolTimestampPayload;

        assert_eq!(
            store.insert_if_absent(&first.identity_key(mode), &record(&first)).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&revised.identity_key(mode), &record(&revised)).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.count(&Symbol::new("AAPL")).unwrap(), 2);
    }

    #[test]
    fn test_unknown_symbol() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let q = quote("TSLA", 0, dec!(105));
        let err = store
            .insert_if_absent(&q.identity_key(IdentityKeyMode::SymbolTimestamp), &record(&q))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSymbol(_)));
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let bad = BTreeMap::from([(Symbol::new("AAPL"), "apple; DROP TABLE x".to_string())]);
        assert!(matches!(
            CanonicalStore::open_in_memory(bad),
            Err(StoreError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_load_series_ordered_and_ranged() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        for minute in [10, 0, 5, 15] {
            let q = quote("AAPL", minute, dec!(101));
            store
                .insert_if_absent(&q.identity_key(IdentityKeyMode::SymbolTimestamp), &record(&q))
                .unwrap();
        }
        let symbol = Symbol::new("AAPL");

        let all = store.load_series(&symbol, None, None).unwrap();
        let minutes: Vec<_> = all.iter().map(|r| r.quote.timestamp).collect();
        assert_eq!(minutes, vec![at(0), at(5), at(10), at(15)]);

        let ranged = store.load_series(&symbol, Some(at(5)), Some(at(10))).unwrap();
        assert_eq!(ranged.len(), 2);
    }

    #[test]
    fn test_raw_mirror_keeps_duplicates() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let q = quote("AAPL", 0, dec!(105));
        let envelope = RawEnvelope::new(q, at(1), 1, PublisherId::new());

        store.mirror_raw(&envelope, at(2)).unwrap();
        store.mirror_raw(&envelope, at(3)).unwrap();
        assert_eq!(store.raw_count(&Symbol::new("AAPL")).unwrap(), 2);
    }

    #[test]
    fn test_processed_upsert() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let symbol = Symbol::new("AAPL");
        let bar = |close: Decimal, ma: Option<f64>| ProcessedBar {
            timestamp: at(0),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close,
            volume: 0,
            filled: true,
            indicators: Indicators {
                ma_short: ma,
                ..Indicators::default()
            },
        };

        store
            .write_processed(&symbol, BarPeriod::M5, &[bar(dec!(101), None)], None, None, at(1))
            .unwrap();
        store
            .write_processed(
                &symbol,
                BarPeriod::M5,
                &[bar(dec!(102), Some(101.5))],
                None,
                None,
                at(2),
            )
            .unwrap();

        let bars = store.load_processed(&symbol).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, dec!(102));
        assert!(bars[0].filled);
        assert_eq!(bars[0].indicators.ma_short, Some(101.5));
        assert_eq!(bars[0].indicators.momentum, None);
    }

    #[test]
    fn test_processed_rewrite_drops_stale_rows() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let symbol = Symbol::new("AAPL");
        let bar = |minute: u32| ProcessedBar {
            timestamp: at(minute),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: 10,
            filled: false,
            indicators: Indicators::default(),
        };
        let five_minute: Vec<ProcessedBar> = (0..12u32).map(|i| bar(i * 5)).collect();
        store
            .write_processed(&symbol, BarPeriod::M5, &five_minute, None, None, at(100))
            .unwrap();

        // Same range again at 1h: one bar, the 5m rows go away
        store
            .write_processed(&symbol, BarPeriod::H1, &[bar(0)], None, None, at(200))
            .unwrap();
        assert_eq!(store.load_processed(&symbol).unwrap(), vec![bar(0)]);
        let periods: Vec<String> = store
            .lock()
            .unwrap()
            .prepare("SELECT period FROM apple_stock_processed")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(periods, vec!["1h".to_string()]);
    }

    #[test]
    fn test_processed_rewrite_keeps_rows_outside_range() {
        let store = CanonicalStore::open_in_memory(tables()).unwrap();
        let symbol = Symbol::new("AAPL");
        let bar = |minute: u32, close: Decimal| ProcessedBar {
            timestamp: at(minute),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close,
            volume: 10,
            filled: false,
            indicators: Indicators::default(),
        };
        let first: Vec<ProcessedBar> = [0, 5, 10, 15].iter().map(|m| bar(*m, dec!(101))).collect();
        store
            .write_processed(&symbol, BarPeriod::M5, &first, None, None, at(100))
            .unwrap();

        // Rerun over [5, 10] now yields only the 10-minute bar
        store
            .write_processed(
                &symbol,
                BarPeriod::M5,
                &[bar(10, dec!(102))],
                Some(at(5)),
                Some(at(10)),
                at(200),
            )
            .unwrap();

        let stamps: Vec<_> = store
            .load_processed(&symbol)
            .unwrap()
            .iter()
            .map(|b| (b.timestamp, b.close))
            .collect();
        assert_eq!(stamps, vec![(at(0), dec!(101)), (at(10), dec!(102)), (at(15), dec!(101))]);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db/canonical.db");
        let q = quote("AAPL", 0, dec!(105));
        let key = q.identity_key(IdentityKeyMode::SymbolTimestamp);
        {
            let store = CanonicalStore::open(&path, tables()).unwrap();
            store.insert_if_absent(&key, &record(&q)).unwrap();
        }
        let store = CanonicalStore::open(&path, tables()).unwrap();
        assert!(matches!(
            store.insert_if_absent(&key, &record(&q)).unwrap(),
            InsertOutcome::AlreadyPresent(_)
        ));
    }
}
