//! Backup store for config mutations
//!
//! Every apply records the target's original state before the first byte is
//! written; undo reads those records back. The store is append-only: undo
//! appends a new record instead of deleting history, so the full mutation
//! trail stays reconstructible.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Name of the JSON index inside the backup directory
const INDEX_FILE: &str = "backups.json";

/// Target state captured before a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OriginalState {
    /// The file did not exist; undo removes it
    Absent,
    /// The file existed with exactly this content
    Present { content: String },
}

impl OriginalState {
    /// Content to diff against ("" when the file was absent)
    pub fn content(&self) -> &str {
        match self {
            Self::Absent => "",
            Self::Present { content } => content,
        }
    }
}

/// One backup entry, persisted in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unique record id (simple UUID), the handle --undo takes
    pub id: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// File the guarded mutation wrote
    pub target_path: PathBuf,
    /// Target state the moment before the mutation
    pub original: OriginalState,
    /// Finding/fix identifier that caused the mutation ("undo:<id>" for reverts)
    pub fix_id: String,
    /// False until the mutation this backup guards actually landed
    pub applied: bool,
}

/// Errors from the backup store
#[derive(Debug, Error)]
pub enum BackupError {
    /// Reading or writing inside the store directory failed
    #[error("backup store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The JSON index no longer parses
    #[error("backup index is corrupt: {source}")]
    Index {
        #[from]
        source: serde_json::Error,
    },
}

/// Append-only backup store backed by one JSON index file.
///
/// Callers serialize access per target through the fix engine; the store
/// itself assumes a single writer.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Open (creating if needed) a store in the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| BackupError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Default store location under the user's config directory
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lamco-portal-doctor").join("backups"))
    }

    /// Record the original state of a target before mutating it.
    ///
    /// The record starts with `applied = false`; flip it with
    /// [`BackupStore::mark_applied`] once the mutation has landed. Present
    /// content is additionally copied to a `.bak` file for easy manual
    /// recovery.
    pub fn record(
        &self,
        target_path: &Path,
        original: OriginalState,
        fix_id: &str,
    ) -> Result<BackupRecord, BackupError> {
        let record = BackupRecord {
            id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            target_path: target_path.to_path_buf(),
            original,
            fix_id: fix_id.to_string(),
            applied: false,
        };

        if let OriginalState::Present { content } = &record.original {
            let file_name = target_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "target".to_string());
            let copy = self.dir.join(format!("{file_name}.{}.bak", record.id));
            fs::write(&copy, content).map_err(|source| BackupError::Io { path: copy, source })?;
        }

        let mut records = self.load_index()?;
        records.push(record.clone());
        self.write_index(&records)?;

        debug!(id = %record.id, target = %record.target_path.display(), "backup recorded");
        Ok(record)
    }

    /// Mark a record's mutation as applied
    pub fn mark_applied(&self, id: &str) -> Result<(), BackupError> {
        let mut records = self.load_index()?;
        for record in &mut records {
            if record.id == id {
                record.applied = true;
            }
        }
        self.write_index(&records)
    }

    /// All records, newest first
    pub fn list(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = self.load_index()?;
        records.reverse();
        Ok(records)
    }

    /// Look a record up by id
    pub fn find(&self, id: &str) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self.load_index()?.into_iter().find(|r| r.id == id))
    }

    /// The most recent applied record, if any
    pub fn latest_applied(&self) -> Result<Option<BackupRecord>, BackupError> {
        Ok(self
            .load_index()?
            .into_iter()
            .rev()
            .find(|r| r.applied))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn load_index(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let path = self.index_path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(BackupError::Io { path, source }),
        }
    }

    /// Write the index atomically (temp file + rename)
    fn write_index(&self, records: &[BackupRecord]) -> Result<(), BackupError> {
        let path = self.index_path();
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));

        let json = serde_json::to_string_pretty(records)?;
        fs::write(&tmp, json).map_err(|source| BackupError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| BackupError::Io { path, source })
    }
}
