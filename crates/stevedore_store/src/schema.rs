//! Schema creation — all CREATE TABLE statements live here.

use tracing::info;

use crate::{Result, Store};

const SCHEMA_VERSION: i64 = 1;

impl Store {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL for concurrent readers; foreign keys drive the cascades.
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                endpoint TEXT,
                region TEXT,
                flags TEXT NOT NULL DEFAULT '{}',
                secrets_sealed BLOB,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                progress TEXT,
                result TEXT,
                error TEXT,
                error_code TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_jobs_status ON jobs(status)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_jobs_finished ON jobs(finished_at)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_jobs_profile ON jobs(profile_id)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS upload_sessions (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                bucket TEXT NOT NULL,
                prefix TEXT,
                mode TEXT NOT NULL,
                staging_dir TEXT,
                bytes_budget INTEGER NOT NULL DEFAULT 0,
                bytes_tracked INTEGER NOT NULL DEFAULT 0,
                committed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_uploads_expiry ON upload_sessions(expires_at)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS multipart_uploads (
                upload_id TEXT NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
                logical_path TEXT NOT NULL,
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                provider_upload_id TEXT NOT NULL,
                part_size INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (upload_id, logical_path)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS object_index (
                profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT,
                last_modified TEXT,
                indexed_at TEXT NOT NULL,
                PRIMARY KEY (profile_id, bucket, object_key)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS favorites (
                id TEXT PRIMARY KEY,
                profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                bucket TEXT NOT NULL,
                prefix TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(self.pool())
            .await?;
        match version {
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
                    .bind(SCHEMA_VERSION)
                    .execute(self.pool())
                    .await?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                // Migrations slot in here once version 2 exists.
                info!("schema version {v} found, current is {SCHEMA_VERSION}");
            }
        }

        Ok(())
    }
}
