//! Publisher watermarks
//!
//! The newest timestamp per symbol below which every bar has been
//! published. Kept in `{topic}/watermarks/{publisher}.json` and replaced
//! atomically, the same way consumer cursors are.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::ids::Symbol;

#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Watermark file {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid publisher name: {0:?}")]
    InvalidPublisher(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    publisher: String,
    watermarks: BTreeMap<Symbol, DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    publisher: String,
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(topic_dir: &Path, publisher: &str) -> Result<Self, WatermarkError> {
        let valid = !publisher.is_empty()
            && publisher
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WatermarkError::InvalidPublisher(publisher.to_string()));
        }
        Ok(Self {
            publisher: publisher.to_string(),
            path: topic_dir.join("watermarks").join(format!("{publisher}.json")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved watermarks; empty when nothing was ever saved.
    pub fn load(&self) -> Result<BTreeMap<Symbol, DateTime<Utc>>, WatermarkError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let file: WatermarkFile =
            serde_json::from_slice(&data).map_err(|source| WatermarkError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.watermarks)
    }

    pub fn save(&self, watermarks: &BTreeMap<Symbol, DateTime<Utc>>) -> Result<(), WatermarkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = WatermarkFile {
            publisher: self.publisher.clone(),
            watermarks: watermarks.clone(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&body).map_err(|source| WatermarkError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path(), "publisher").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_replaces_previous() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path(), "publisher").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 20, 55, 0).unwrap();

        store
            .save(&BTreeMap::from([(Symbol::new("AAPL"), ts), (Symbol::new("MSFT"), ts)]))
            .unwrap();
        store.save(&BTreeMap::from([(Symbol::new("AAPL"), ts)])).unwrap();

        assert_eq!(store.load().unwrap(), BTreeMap::from([(Symbol::new("AAPL"), ts)]));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_reported() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path(), "publisher").unwrap();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{").unwrap();
        assert!(matches!(store.load(), Err(WatermarkError::Corrupt { .. })));
    }

    #[test]
    fn test_publisher_name_validated() {
        let tmp = TempDir::new().unwrap();
        assert!(WatermarkStore::new(tmp.path(), "../escape").is_err());
    }
}
