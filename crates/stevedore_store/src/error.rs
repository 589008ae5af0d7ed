//! Store error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("sealer failure: {0}")]
    Seal(String),

    #[error("no encryption key configured; refusing to persist credentials")]
    SealerUnavailable,

    #[error("data directory is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("corrupt row {context}: {message}")]
    Corrupt { context: String, message: String },
}

impl StoreError {
    pub(crate) fn corrupt(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
