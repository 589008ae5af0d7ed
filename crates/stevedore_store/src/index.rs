//! Object index and favorites.
//!
//! The index is a search accelerator refreshed by `s3_index_objects`
//! jobs; it is never authoritative. Refresh replaces the indexed slice
//! (profile, bucket, prefix) in one transaction so a search never sees
//! a half-applied refresh.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use stevedore_protocol::ids::ProfileId;

use crate::{Result, Store, StoreError};

/// One indexed object.
#[derive(Debug, Clone, FromRow)]
pub struct IndexedObject {
    pub profile_id: String,
    pub bucket: String,
    pub object_key: String,
    pub size: i64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Favorite {
    pub id: String,
    pub profile_id: String,
    pub bucket: String,
    pub prefix: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFavorite {
    pub profile_id: ProfileId,
    pub bucket: String,
    pub prefix: String,
    pub name: String,
}

impl Store {
    /// Replace the indexed slice for (profile, bucket, prefix) with
    /// `entries`: (key, size, etag, last_modified).
    pub async fn replace_index_prefix(
        &self,
        profile_id: &ProfileId,
        bucket: &str,
        prefix: &str,
        entries: &[(String, u64, Option<String>, Option<DateTime<Utc>>)],
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"DELETE FROM object_index
               WHERE profile_id = ?1 AND bucket = ?2
                 AND (object_key = ?3 OR object_key LIKE ?3 || '%')"#,
        )
        .bind(profile_id.as_str())
        .bind(bucket)
        .bind(prefix)
        .execute(&mut *tx)
        .await?;

        for (key, size, etag, last_modified) in entries {
            sqlx::query(
                r#"INSERT INTO object_index
                   (profile_id, bucket, object_key, size, etag, last_modified, indexed_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                   ON CONFLICT(profile_id, bucket, object_key) DO UPDATE SET
                       size = excluded.size,
                       etag = excluded.etag,
                       last_modified = excluded.last_modified,
                       indexed_at = excluded.indexed_at"#,
            )
            .bind(profile_id.as_str())
            .bind(bucket)
            .bind(key)
            .bind(*size as i64)
            .bind(etag)
            .bind(last_modified)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Substring search over indexed keys.
    pub async fn search_index(
        &self,
        profile_id: &ProfileId,
        bucket: Option<&str>,
        query: &str,
        limit: u32,
    ) -> Result<Vec<IndexedObject>> {
        // Escape LIKE metacharacters so a literal search stays literal.
        let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let rows = sqlx::query_as(
            r#"SELECT * FROM object_index
               WHERE profile_id = ?1
                 AND (?2 IS NULL OR bucket = ?2)
                 AND object_key LIKE '%' || ?3 || '%' ESCAPE '\'
               ORDER BY bucket, object_key
               LIMIT ?4"#,
        )
        .bind(profile_id.as_str())
        .bind(bucket)
        .bind(escaped)
        .bind(limit.clamp(1, 1000) as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Favorites
    // ------------------------------------------------------------------

    pub async fn create_favorite(&self, new: NewFavorite) -> Result<Favorite> {
        let id = stevedore_protocol::ids::new_ulid();
        sqlx::query(
            r#"INSERT INTO favorites (id, profile_id, bucket, prefix, name, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(&id)
        .bind(new.profile_id.as_str())
        .bind(&new.bucket)
        .bind(&new.prefix)
        .bind(&new.name)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        let row: Favorite = sqlx::query_as("SELECT * FROM favorites WHERE id = ?1")
            .bind(&id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("favorite {id}")))?;
        Ok(row)
    }

    pub async fn list_favorites(&self, profile_id: Option<&ProfileId>) -> Result<Vec<Favorite>> {
        let rows = sqlx::query_as(
            r#"SELECT * FROM favorites
               WHERE (?1 IS NULL OR profile_id = ?1)
               ORDER BY created_at DESC"#,
        )
        .bind(profile_id.map(|p| p.as_str().to_string()))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn delete_favorite(&self, id: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM favorites WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealer::PlainSealer;
    use crate::NewProfile;
    use std::sync::Arc;
    use stevedore_protocol::types::{ProfileFlags, ProfileSecrets, Provider};

    async fn store_with_profile() -> (Store, ProfileId) {
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: None,
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets::default(),
            })
            .await
            .unwrap();
        (store, profile.id)
    }

    #[tokio::test]
    async fn refresh_replaces_the_slice() {
        let (store, profile_id) = store_with_profile().await;
        store
            .replace_index_prefix(
                &profile_id,
                "media",
                "photos/",
                &[
                    ("photos/a.jpg".into(), 100, None, None),
                    ("photos/b.jpg".into(), 200, None, None),
                ],
            )
            .await
            .unwrap();

        // Second refresh drops a.jpg.
        store
            .replace_index_prefix(
                &profile_id,
                "media",
                "photos/",
                &[("photos/b.jpg".into(), 250, Some("etag-b".into()), None)],
            )
            .await
            .unwrap();

        let hits = store
            .search_index(&profile_id, Some("media"), "photos", 100)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_key, "photos/b.jpg");
        assert_eq!(hits[0].size, 250);
    }

    #[tokio::test]
    async fn search_escapes_like_wildcards() {
        let (store, profile_id) = store_with_profile().await;
        store
            .replace_index_prefix(
                &profile_id,
                "media",
                "",
                &[
                    ("reports/q1_summary.csv".into(), 10, None, None),
                    ("reports/q1-summary.csv".into(), 10, None, None),
                ],
            )
            .await
            .unwrap();

        // '_' must match literally, not as a single-char wildcard.
        let hits = store
            .search_index(&profile_id, None, "q1_", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object_key, "reports/q1_summary.csv");
    }

    #[tokio::test]
    async fn favorites_crud() {
        let (store, profile_id) = store_with_profile().await;
        let favorite = store
            .create_favorite(NewFavorite {
                profile_id: profile_id.clone(),
                bucket: "media".into(),
                prefix: "photos/".into(),
                name: "holiday shots".into(),
            })
            .await
            .unwrap();

        let listed = store.list_favorites(Some(&profile_id)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "holiday shots");

        assert!(store.delete_favorite(&favorite.id).await.unwrap());
        assert!(store.list_favorites(None).await.unwrap().is_empty());
    }
}
