//! Committed consumer cursors
//!
//! A cursor is the highest topic offset a consumer has fully processed.
//! It lives in `{topic}/cursors/{consumer}.json` and is replaced atomically
//! (temp file, fsync, rename), so a crash leaves either the old or the new
//! value and never a torn file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cursor file {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid consumer name: {0:?}")]
    InvalidConsumer(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CursorFile {
    consumer: String,
    committed: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CursorStore {
    consumer: String,
    path: PathBuf,
}

impl CursorStore {
    pub fn new(topic_dir: &Path, consumer: &str) -> Result<Self, CursorError> {
        let valid = !consumer.is_empty()
            && consumer
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CursorError::InvalidConsumer(consumer.to_string()));
        }
        Ok(Self {
            consumer: consumer.to_string(),
            path: topic_dir.join("cursors").join(format!("{consumer}.json")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed offset, 0 when the consumer has never committed.
    pub fn load(&self) -> Result<u64, CursorError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let file: CursorFile =
            serde_json::from_slice(&data).map_err(|source| CursorError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.committed)
    }

    pub fn store(&self, committed: u64) -> Result<(), CursorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = CursorFile {
            consumer: self.consumer.clone(),
            committed,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&body).map_err(|source| CursorError::Corrupt {
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
