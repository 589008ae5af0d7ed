//! Upload error taxonomy.

use thiserror::Error;

use stevedore_protocol::types::UploadMode;
use stevedore_store::StoreError;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provider does not support {mode:?} uploads: {reason}")]
    CapabilityDenied {
        mode: UploadMode,
        reason: &'static str,
    },

    #[error("upload exceeds the session byte budget")]
    BudgetExceeded,

    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    #[error("upload session has expired")]
    Expired,

    #[error("upload session is already committed")]
    AlreadyCommitted,

    #[error("session mode does not allow this operation")]
    WrongMode,

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error(transparent)]
    Engine(#[from] stevedore_engine::EngineError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
