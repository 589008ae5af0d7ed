//! Engine error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transfer engine not found ({0})")]
    Missing(String),

    #[error("transfer engine {found} is older than the required {required}")]
    Incompatible { found: String, required: String },

    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine output was not parseable: {0}")]
    Output(String),

    #[error("zip artifact error: {0}")]
    Zip(String),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}
