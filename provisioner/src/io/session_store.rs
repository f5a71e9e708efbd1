//! On-disk session persistence.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/sessions/active/<id>.json     # in_progress and paused
//! <root>/sessions/completed/<id>.json
//! <root>/sessions/failed/<id>.json
//! ```
//!
//! Saves are atomic (temp file + rename) and move the document between
//! status directories by writing the new location before removing the old,
//! so a crash mid-save leaves a readable session somewhere.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::error::StoreError;
use crate::core::session::Session;
use crate::core::types::{Phase, SessionStatus};

const STATUS_DIRS: [&str; 3] = ["active", "completed", "failed"];

/// Lightweight listing row, deserialized without the full task/command
/// history.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub profile: Option<String>,
    pub phase: PhaseSummary,
}

/// The `phase` object reduced to its current value.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseSummary {
    pub current: Phase,
}

/// Handle to a session root directory. No ambient singleton; tests inject a
/// temporary root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn dir_for(&self, status: SessionStatus) -> PathBuf {
        let name = match status {
            SessionStatus::InProgress | SessionStatus::Paused => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        self.sessions_dir().join(name)
    }

    fn path_in(&self, dir_name: &str, id: &str) -> PathBuf {
        self.sessions_dir().join(dir_name).join(format!("{id}.json"))
    }

    /// Mint a session id: `prov-YYYYMMDD-HHMMSS-XXXX`, local wall-clock time
    /// plus a random hex suffix, regenerated on the (unlikely) collision with
    /// an existing file.
    pub fn new_session_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: u16 = rng.gen_range(0..=0xffff);
            let id = format!("prov-{}-{suffix:04x}", Local::now().format("%Y%m%d-%H%M%S"));
            let taken = STATUS_DIRS
                .iter()
                .any(|dir| self.path_in(dir, &id).exists());
            if !taken {
                return id;
            }
        }
    }

    /// Persist the session under its status directory, refreshing
    /// `updated_at`, then remove stale copies left in other status
    /// directories by an earlier save.
    pub fn save(&self, session: &mut Session) -> Result<(), StoreError> {
        session.updated_at = Utc::now();

        let dir = self.dir_for(session.status);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("{}.json", session.id));
        let mut contents =
            serde_json::to_string_pretty(session).map_err(|source| StoreError::Serialize {
                id: session.id.clone(),
                source,
            })?;
        contents.push('\n');
        write_atomic(&path, &contents)?;
        debug!(id = %session.id, status = ?session.status, path = %path.display(), "session saved");

        for dir_name in STATUS_DIRS {
            let stale = self.path_in(dir_name, &session.id);
            if stale != path && stale.exists() {
                fs::remove_file(&stale).map_err(|source| StoreError::Io {
                    path: stale.clone(),
                    source,
                })?;
                debug!(id = %session.id, from = %stale.display(), "stale session copy removed");
            }
        }
        Ok(())
    }

    /// Load a session by id, searching active, then failed, then completed.
    pub fn load(&self, id: &str) -> Result<Session, StoreError> {
        for dir_name in ["active", "failed", "completed"] {
            let path = self.path_in(dir_name, id);
            if !path.exists() {
                continue;
            }
            let contents = fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let session: Session =
                serde_json::from_str(&contents).map_err(|source| StoreError::Serialize {
                    id: id.to_string(),
                    source,
                })?;
            debug!(id, from = %path.display(), "session loaded");
            return Ok(session);
        }
        Err(StoreError::NotFound { id: id.to_string() })
    }

    /// The most recently updated resumable session (failed or paused), if any.
    pub fn latest_resumable(&self) -> Result<Option<SessionSummary>, StoreError> {
        Ok(self
            .list(None)?
            .into_iter()
            .find(|summary| {
                matches!(summary.status, SessionStatus::Failed | SessionStatus::Paused)
            }))
    }

    /// Summaries of all sessions, newest first, optionally filtered by
    /// status. Unreadable files are skipped with a warning, never fatal.
    pub fn list(&self, status: Option<SessionStatus>) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries = Vec::new();
        for dir_name in STATUS_DIRS {
            let dir = self.sessions_dir().join(dir_name);
            if !dir.exists() {
                continue;
            }
            let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match read_summary(&path) {
                    Ok(summary) => summaries.push(summary),
                    Err(err) => {
                        warn!(path = %path.display(), err = %err, "skipping unreadable session");
                    }
                }
            }
        }
        if let Some(wanted) = status {
            summaries.retain(|summary| summary.status == wanted);
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

fn read_summary(path: &Path) -> anyhow::Result<SessionSummary> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(|source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
