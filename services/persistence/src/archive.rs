//! Raw archive - filesystem object store for fetched batches
//!
//! Each publish tick stores the envelopes it produced under
//! `{root}/raw-data/{symbol}/{YYYYmmdd_HHMMSS}` twice, as a JSON array and
//! as CSV. Blobs are written to a temp file and renamed into place, so a
//! reader never sees a partial blob and rewriting a key replaces it whole.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use types::envelope::RawEnvelope;
use types::ids::Symbol;

const KEY_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Blob not found: {0}")]
    NotFound(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Location of one archived batch
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveKey {
    pub symbol: Symbol,
    pub tick: DateTime<Utc>,
}

impl ArchiveKey {
    pub fn new(symbol: Symbol, tick: DateTime<Utc>) -> Self {
        Self { symbol, tick }
    }

    /// `{symbol}/{YYYYmmdd_HHMMSS}`
    pub fn object_name(&self) -> String {
        format!("{}/{}", self.symbol, self.tick.format(KEY_FORMAT))
    }
}

impl std::fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.object_name())
    }
}

/// Paths written for one key
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedBlob {
    pub json: PathBuf,
    pub csv: PathBuf,
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn put(
        &self,
        key: &ArchiveKey,
        envelopes: &[RawEnvelope],
    ) -> Result<ArchivedBlob, ArchiveError>;

    /// Keys stored for `symbol`, oldest first.
    async fn list(&self, symbol: &Symbol) -> Result<Vec<ArchiveKey>, ArchiveError>;

    async fn get(&self, key: &ArchiveKey) -> Result<Vec<RawEnvelope>, ArchiveError>;
}

#[derive(Debug, serde::Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    symbol: &'a str,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: u64,
    ingested_at: String,
    source_seq: u64,
    publisher_id: String,
}

#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn symbol_dir(&self, symbol: &Symbol) -> PathBuf {
        self.root.join("raw-data").join(symbol.as_str())
    }

    fn blob_path(&self, key: &ArchiveKey, extension: &str) -> PathBuf {
        self.symbol_dir(&key.symbol)
            .join(format!("{}.{extension}", key.tick.format(KEY_FORMAT)))
    }

    fn encode_csv(envelopes: &[RawEnvelope]) -> Result<Vec<u8>, ArchiveError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for envelope in envelopes {
            let quote = &envelope.quote;
            writer.serialize(CsvRow {
                timestamp: quote.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                symbol: quote.symbol.as_str(),
                open: quote.open.to_string(),
                high: quote.high.to_string(),
                low: quote.low.to_string(),
                close: quote.close.to_string(),
                volume: quote.volume,
                ingested_at: envelope.ingested_at.to_rfc3339(),
                source_seq: envelope.source_seq,
                publisher_id: envelope.publisher_id.to_string(),
            })?;
        }
        writer
            .into_inner()
            .map_err(|e| ArchiveError::Csv(e.into_error().into()))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("blob")
        ));
        {
            let mut file = fs::File::create(&tmp_path).await.map_err(io_err(&tmp_path))?;
            file.write_all(bytes).await.map_err(io_err(&tmp_path))?;
            file.sync_all().await.map_err(io_err(&tmp_path))?;
        }
        fs::rename(&tmp_path, path).await.map_err(io_err(path))?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for FsArchive {
    async fn put(
        &self,
        key: &ArchiveKey,
        envelopes: &[RawEnvelope],
    ) -> Result<ArchivedBlob, ArchiveError> {
        let dir = self.symbol_dir(&key.symbol);
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let json_path = self.blob_path(key, "json");
        let csv_path = self.blob_path(key, "csv");

        let json = serde_json::to_vec_pretty(envelopes)?;
        let csv = Self::encode_csv(envelopes)?;

        Self::write_atomic(&json_path, &json).await?;
        Self::write_atomic(&csv_path, &csv).await?;

        debug!(key = %key, records = envelopes.len(), "Archived raw batch");
        Ok(ArchivedBlob {
            json: json_path,
            csv: csv_path,
        })
    }

    async fn list(&self, symbol: &Symbol) -> Result<Vec<ArchiveKey>, ArchiveError> {
        let dir = self.symbol_dir(symbol);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Ok(naive) = NaiveDateTime::parse_from_str(stem, KEY_FORMAT) {
                keys.push(ArchiveKey::new(symbol.clone(), naive.and_utc()));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Vec<RawEnvelope>, ArchiveError> {
        let path = self.blob_path(key, "json");
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(key.object_name()))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}
