//! Typed error taxonomy for the provisioning core.
//!
//! Manifest and transition errors are programmer-facing and abort the
//! operation that raised them. Install-step failures are *data*: they are
//! recorded into the session document, never surfaced through these types.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::{Phase, SessionStatus, TaskStatus};

/// A manifest failed to load or validate. Fatal for the whole load: a single
/// broken file must not silently disable unrelated tasks.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("{}: task key '{key}' does not match id field '{id}'", path.display())]
    IdMismatch { path: PathBuf, key: String, id: String },

    #[error("{}: duplicate definition of '{id}' within the same layer", path.display())]
    Duplicate { path: PathBuf, id: String },

    #[error("{}: task '{id}' detection needs check_command or installed_indicator", path.display())]
    MissingDetection { path: PathBuf, id: String },

    #[error("{}: task '{id}' has no install steps", path.display())]
    EmptyInstall { path: PathBuf, id: String },

    #[error("{}: question '{question}' in profile '{id}' must offer 2-5 lettered options", path.display())]
    BadQuestion {
        path: PathBuf,
        id: String,
        question: String,
    },

    #[error("{}: '{owner}' references unknown task '{reference}' in {field}", path.display())]
    DanglingReference {
        path: PathBuf,
        owner: String,
        field: String,
        reference: String,
    },
}

/// The requested task set cannot be turned into a valid ordered plan.
/// Resolution choices are the user's, never the resolver's.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown task '{id}'{}", requested_by.as_ref().map(|r| format!(" (required by '{r}')")).unwrap_or_default())]
    UnknownTask {
        id: String,
        requested_by: Option<String>,
    },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("task '{task}' needs one of {{{}}}; choose one", alternatives.join(", "))]
    UnsatisfiedChoice {
        task: String,
        alternatives: Vec<String>,
    },

    #[error("tasks '{first}' and '{second}' conflict with each other")]
    Conflict { first: String, second: String },
}

/// An illegal phase or task-status transition. Always a sequencing bug in
/// the caller; rejected before any state is mutated.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("illegal phase transition {from:?} -> {to:?}")]
    Phase { from: Phase, to: Phase },

    #[error("task '{id}' cannot move {from:?} -> {to:?}")]
    Task {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("session '{id}' is {status:?} and no longer accepts mutation")]
    SessionClosed { id: String, status: SessionStatus },

    #[error("session '{id}' is {status:?}; only completed sessions can be expanded")]
    NotExpandable { id: String, status: SessionStatus },

    #[error("no task '{id}' in this session")]
    UnknownTask { id: String },

    #[error("plan can only be set during planning (current phase {phase:?})")]
    PlanLocked { phase: Phase },
}

/// Session persistence failed. Atomic-save failures abort the triggering
/// operation rather than leave unsaved state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session '{id}' not found in active, failed, or completed stores")]
    NotFound { id: String },

    #[error("session store io at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize session '{id}': {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}
