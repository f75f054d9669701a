//! Error types for ledgersync.

use thiserror::Error;

use crate::model::work::{Status, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// The caller no longer holds a live lease on the work item. Another
    /// worker, the reconciler or an operator reset has taken it over.
    #[error("lease on work item {0} is no longer held by this worker")]
    LeaseLost(WorkId),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
