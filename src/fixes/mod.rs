//! Transactional fix engine
//!
//! Fixes follow a strict preview -> apply -> (optionally) undo lifecycle:
//!
//! ```text
//! preview(finding)   pure; reads the target, renders a diff
//! apply(plan)        re-reads the target, aborts on concurrent edits,
//!                    backs up, then writes atomically
//! undo(record)       restores the backed-up state, itself recorded
//! ```
//!
//! Config writes are limited to a closed set of targets and serialized per
//! target path, so two applies can never interleave on the same file. The
//! backup write and the content write form one logical transaction: if the
//! backup cannot be recorded, nothing is written.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, OnceLock},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use crate::{
    facts::{self, probes, FactSnapshot},
    rules::{Finding, FixRef},
};

mod backup;
mod diff;

pub use backup::{BackupError, BackupRecord, BackupStore, OriginalState};
pub use diff::{unified_diff, Diff};

/// The closed set of writable config targets. Nothing outside this list is
/// ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixTarget {
    /// The user-level portals.conf
    UserPortalsConf,
}

/// Errors from preview, apply, and undo
#[derive(Debug, Error)]
pub enum FixError {
    /// The finding carries no FixRef
    #[error("finding '{id}' has no automatic fix")]
    NotFixable { id: String },

    /// Target content changed between preview and apply
    #[error("{path} changed since preview; re-run diagnosis and preview again")]
    ConcurrentModification { path: PathBuf },

    /// Backup could not be recorded; the target was left untouched
    #[error("could not back up {path}, nothing was written: {source}")]
    BackupWriteFailed {
        path: PathBuf,
        #[source]
        source: BackupError,
    },

    /// Reading the target failed for a reason other than absence
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing or removing the target failed
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Undo asked for a backup that never guarded a write
    #[error("backup {id} was never applied, nothing to undo")]
    NotApplied { id: String },

    /// systemctl restart failed
    #[error(transparent)]
    ServiceCommand(#[from] probes::ServiceError),

    /// Backup store I/O or index corruption
    #[error("backup store error: {0}")]
    Backup(#[from] BackupError),

    /// No XDG config directory on this system
    #[error("no user config directory could be determined")]
    NoConfigDir,
}

/// What apply() will do, resolved at preview time
#[derive(Debug, Clone, PartialEq, Eq)]
enum FixAction {
    WriteFile {
        target: FixTarget,
        new_content: String,
        /// Target state preview saw; apply revalidates against this
        observed: OriginalState,
    },
    RestartUnits { units: Vec<String> },
}

/// A previewed fix, ready to apply
#[derive(Debug, Clone)]
pub struct FixPlan {
    /// Finding id the plan repairs
    pub fix_id: String,
    /// What apply will do, in one sentence
    pub description: String,
    /// Unified diff for file mutations; `None` for service restarts
    pub diff: Option<Diff>,
    /// Whether undo will be available afterwards
    pub reversible: bool,
    action: FixAction,
}

/// Result of a successful apply or undo
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// File that was written or removed, when the fix touched one
    pub target: Option<PathBuf>,
    /// Backup guarding the mutation (undo handle)
    pub backup: Option<BackupRecord>,
    /// Units restarted, in order
    pub restarted: Vec<String>,
}

/// Serialize mutations per target path, process-wide
fn target_lock(path: &Path) -> Arc<TokioMutex<()>> {
    static LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<TokioMutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut guard = map
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    guard
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(TokioMutex::new(())))
        .clone()
}

fn read_original(path: &Path) -> Result<OriginalState, FixError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(OriginalState::Present { content }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OriginalState::Absent),
        Err(source) => Err(FixError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write via temp file + rename so readers never see a half-written config
fn write_atomic(path: &Path, content: &str) -> Result<(), FixError> {
    let map_err = |source| FixError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(map_err)?;
    }
    let tmp = path.with_extension("conf.tmp");
    fs::write(&tmp, content).map_err(map_err)?;
    fs::rename(&tmp, path).map_err(map_err)
}

fn remove_if_exists(path: &Path) -> Result<(), FixError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(FixError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Render the portals.conf content a SetPreferredBackend fix writes.
///
/// Deterministic for a given backend so preview and apply always agree.
pub fn render_portals_conf(backend: &str) -> String {
    format!(
        "# Generated by lamco-portal-doctor\n\
         # Prefer the '{backend}' backend for portal requests in this session.\n\
         [preferred]\n\
         default={backend}\n"
    )
}

/// The transactional fix engine
#[derive(Debug, Clone)]
pub struct FixEngine {
    portals_conf: PathBuf,
    store: BackupStore,
}

impl FixEngine {
    /// Engine over explicit paths (tests use a tempdir for both)
    pub fn new(portals_conf: impl Into<PathBuf>, store: BackupStore) -> Self {
        Self {
            portals_conf: portals_conf.into(),
            store,
        }
    }

    /// Engine wired to the user's real config locations
    pub fn with_default_paths(backup_dir: Option<PathBuf>) -> Result<Self, FixError> {
        let config_dir = dirs::config_dir().ok_or(FixError::NoConfigDir)?;
        let portals_conf = config_dir.join("xdg-desktop-portal").join("portals.conf");
        let backup_dir = backup_dir
            .or_else(BackupStore::default_dir)
            .ok_or(FixError::NoConfigDir)?;
        Ok(Self::new(portals_conf, BackupStore::new(backup_dir)?))
    }

    /// The path a target resolves to. The closed enum keeps every write
    /// inside the enumerated list.
    pub fn target_path(&self, target: FixTarget) -> &Path {
        match target {
            FixTarget::UserPortalsConf => &self.portals_conf,
        }
    }

    /// The backup store backing apply and undo
    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Compute what applying a finding's fix would do. Read-only.
    pub fn preview(&self, finding: &Finding) -> Result<FixPlan, FixError> {
        let fix = finding.fix.as_ref().ok_or_else(|| FixError::NotFixable {
            id: finding.id.to_string(),
        })?;

        match fix {
            FixRef::SetPreferredBackend { backend } => {
                let target = FixTarget::UserPortalsConf;
                let path = self.target_path(target);
                let observed = read_original(path)?;
                let new_content = render_portals_conf(backend);
                let diff = unified_diff(
                    observed.content(),
                    &new_content,
                    "current portals.conf",
                    "proposed portals.conf",
                );
                Ok(FixPlan {
                    fix_id: finding.id.to_string(),
                    description: fix.describe(),
                    diff: Some(diff),
                    reversible: true,
                    action: FixAction::WriteFile {
                        target,
                        new_content,
                        observed,
                    },
                })
            }
            FixRef::RestartUnits { units } => Ok(FixPlan {
                fix_id: finding.id.to_string(),
                description: fix.describe(),
                diff: None,
                reversible: false,
                action: FixAction::RestartUnits {
                    units: units.clone(),
                },
            }),
        }
    }

    /// Execute a previewed plan.
    ///
    /// File mutations re-read the target under the per-target lock and abort
    /// with [`FixError::ConcurrentModification`] if it no longer matches what
    /// preview saw; the backup record is written before the content.
    pub async fn apply(&self, plan: &FixPlan) -> Result<ApplyOutcome, FixError> {
        match &plan.action {
            FixAction::WriteFile {
                target,
                new_content,
                observed,
            } => {
                let path = self.target_path(*target).to_path_buf();
                let lock = target_lock(&path);
                let _guard = lock.lock().await;

                let current = read_original(&path)?;
                if current != *observed {
                    warn!(target = %path.display(), "target changed since preview, refusing to write");
                    return Err(FixError::ConcurrentModification { path });
                }

                let record = self
                    .store
                    .record(&path, current, &plan.fix_id)
                    .map_err(|source| FixError::BackupWriteFailed {
                        path: path.clone(),
                        source,
                    })?;
                write_atomic(&path, new_content)?;
                self.store.mark_applied(&record.id)?;

                info!(
                    target = %path.display(),
                    backup = %record.id,
                    fix = %plan.fix_id,
                    "config fix applied"
                );
                Ok(ApplyOutcome {
                    target: Some(path),
                    backup: Some(record),
                    restarted: vec![],
                })
            }
            FixAction::RestartUnits { units } => {
                for unit in units {
                    probes::restart_unit(unit)?;
                }
                info!(units = ?units, fix = %plan.fix_id, "units restarted");
                Ok(ApplyOutcome {
                    target: None,
                    backup: None,
                    restarted: units.clone(),
                })
            }
        }
    }

    /// Apply, then collect a fresh snapshot so the caller can confirm the
    /// fix took effect. The confirmation is advisory; some fixes need a
    /// relogin before the stack picks them up.
    pub async fn apply_and_recheck(
        &self,
        plan: &FixPlan,
    ) -> Result<(ApplyOutcome, FactSnapshot), FixError> {
        let outcome = self.apply(plan).await?;
        let snapshot = facts::collect().await;
        Ok((outcome, snapshot))
    }

    /// Restore the state a backup captured.
    ///
    /// The revert is recorded as its own backup (fix id `undo:<original>`),
    /// keeping the mutation history append-only and reconstructible.
    pub async fn undo(&self, record: &BackupRecord) -> Result<ApplyOutcome, FixError> {
        if !record.applied {
            return Err(FixError::NotApplied {
                id: record.id.clone(),
            });
        }

        let path = record.target_path.clone();
        let lock = target_lock(&path);
        let _guard = lock.lock().await;

        let current = read_original(&path)?;
        let undo_record = self
            .store
            .record(&path, current, &format!("undo:{}", record.fix_id))
            .map_err(|source| FixError::BackupWriteFailed {
                path: path.clone(),
                source,
            })?;

        match &record.original {
            OriginalState::Present { content } => write_atomic(&path, content)?,
            OriginalState::Absent => remove_if_exists(&path)?,
        }
        self.store.mark_applied(&undo_record.id)?;

        info!(
            target = %path.display(),
            undone = %record.id,
            "backup restored"
        );
        Ok(ApplyOutcome {
            target: Some(path),
            backup: Some(undo_record),
            restarted: vec![],
        })
    }
}
