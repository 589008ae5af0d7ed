//! Durable store for the Stevedore control plane.
//!
//! Single SQLite database, accessed through sqlx. The store is the
//! source of truth for profiles, jobs, upload sessions, multipart
//! state, the object index and favorites; everything else is derived
//! in-memory state.
//!
//! Two hard rules live here:
//! - job status transitions are guarded inside the `UPDATE ... WHERE`
//!   so an illegal transition is an atomic no-op, and
//! - credential blobs only cross this boundary through the sealer.

mod error;
mod index;
mod jobs;
pub mod lock;
mod profiles;
mod schema;
pub mod sealer;
mod uploads;

pub use error::StoreError;
pub use index::{Favorite, IndexedObject, NewFavorite};
pub use jobs::{JobFilter, JobStatusUpdate, NewJob};
pub use lock::{DataDirLock, LockError};
pub use profiles::{NewProfile, ProfileUpdate};
pub use sealer::{AesGcmSealer, PlainSealer, Sealer};
pub use uploads::{MultipartState, NewUploadSession};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the SQLite-backed store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    sealer: Arc<dyn Sealer>,
}

impl Store {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &Path, sealer: Arc<dyn Sealer>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool, sealer };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(sealer: Arc<dyn Sealer>) -> Result<Self> {
        // A single connection keeps the :memory: database alive and
        // shared across all callers of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        let store = Self { pool, sealer };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) fn sealer(&self) -> &dyn Sealer {
        self.sealer.as_ref()
    }

    /// Close the pool; pending writes are flushed first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
