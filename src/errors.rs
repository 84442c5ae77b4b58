//! Typed error hierarchy for reqforge.
//!
//! One enum per subsystem:
//! - `GitError`: version-control shell-outs
//! - `HubError`: event log and fan-out
//! - `PoolError`: worker pool admission
//! - `CodegenError`: job orchestration (trigger, cancel, lookups)

use thiserror::Error;

/// Errors from the git driver. Messages are redacted before construction,
/// so they are safe to log and to surface to users.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {message}")]
    CommandFailed { op: &'static str, message: String },

    #[error("Failed to spawn git for {op}: {source}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("No access token available for push")]
    MissingToken,
}

/// Errors from the event hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Event store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from the worker pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Errors from the codegen service and its collaborators.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Job {id} already finished")]
    AlreadyFinished { id: i64 },

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Hub(#[from] HubError),
}
