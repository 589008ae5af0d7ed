//! Profile rows and the sealed credential path.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use stevedore_protocol::ids::ProfileId;
use stevedore_protocol::types::{Profile, ProfileFlags, ProfileSecrets, Provider};

use crate::{Result, Store, StoreError};

#[derive(Debug, Clone, FromRow)]
struct ProfileRow {
    id: String,
    name: String,
    provider: String,
    endpoint: Option<String>,
    region: Option<String>,
    flags: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProfileRow {
    fn into_profile(self) -> Result<Profile> {
        let context = format!("profiles/{}", self.id);
        Ok(Profile {
            id: ProfileId::parse(&self.id).map_err(|e| StoreError::corrupt(&context, e))?,
            name: self.name,
            provider: self
                .provider
                .parse::<Provider>()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            endpoint: self.endpoint,
            region: self.region,
            flags: serde_json::from_str::<ProfileFlags>(&self.flags)
                .map_err(|e| StoreError::corrupt(&context, e))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub name: String,
    pub provider: Provider,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub flags: ProfileFlags,
    pub secrets: ProfileSecrets,
}

/// Partial update; `None` keeps the stored value. `secrets` replaces
/// the whole sealed bundle when present.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub endpoint: Option<Option<String>>,
    pub region: Option<Option<String>>,
    pub flags: Option<ProfileFlags>,
    pub secrets: Option<ProfileSecrets>,
}

impl Store {
    pub async fn create_profile(&self, new: NewProfile) -> Result<Profile> {
        let id = ProfileId::new();
        let now = Utc::now();
        let sealed = self.seal_secrets(&new.secrets)?;
        sqlx::query(
            r#"INSERT INTO profiles
               (id, name, provider, endpoint, region, flags, secrets_sealed, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"#,
        )
        .bind(id.as_str())
        .bind(&new.name)
        .bind(new.provider.as_str())
        .bind(&new.endpoint)
        .bind(&new.region)
        .bind(serde_json::to_string(&new.flags).map_err(|e| StoreError::corrupt("flags", e))?)
        .bind(sealed)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_profile(&id).await
    }

    pub async fn get_profile(&self, id: &ProfileId) -> Result<Profile> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT id, name, provider, endpoint, region, flags, created_at, updated_at \
             FROM profiles WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("profile {id}")))?
            .into_profile()
    }

    /// The only path that returns plaintext credentials.
    pub async fn get_profile_secrets(&self, id: &ProfileId) -> Result<ProfileSecrets> {
        let sealed: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT secrets_sealed FROM profiles WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(self.pool())
                .await?;
        let sealed = sealed.ok_or_else(|| StoreError::NotFound(format!("profile {id}")))?;
        match sealed {
            None => Ok(ProfileSecrets::default()),
            Some(blob) => {
                let plain = self.sealer().unseal(&blob)?;
                serde_json::from_slice(&plain)
                    .map_err(|e| StoreError::corrupt(format!("profiles/{id}/secrets"), e))
            }
        }
    }

    pub async fn update_profile(&self, id: &ProfileId, update: ProfileUpdate) -> Result<Profile> {
        let current = self.get_profile(id).await?;
        let name = update.name.unwrap_or(current.name);
        let endpoint = update.endpoint.unwrap_or(current.endpoint);
        let region = update.region.unwrap_or(current.region);
        let flags = update.flags.unwrap_or(current.flags);
        let sealed = update
            .secrets
            .as_ref()
            .map(|s| self.seal_secrets(s))
            .transpose()?;

        sqlx::query(
            r#"UPDATE profiles SET
                   name = ?1,
                   endpoint = ?2,
                   region = ?3,
                   flags = ?4,
                   secrets_sealed = COALESCE(?5, secrets_sealed),
                   updated_at = ?6
               WHERE id = ?7"#,
        )
        .bind(&name)
        .bind(&endpoint)
        .bind(&region)
        .bind(serde_json::to_string(&flags).map_err(|e| StoreError::corrupt("flags", e))?)
        .bind(sealed)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?;

        self.get_profile(id).await
    }

    /// Cascades to jobs, upload sessions, multipart state, the object
    /// index and favorites through the foreign keys.
    pub async fn delete_profile(&self, id: &ProfileId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM profiles WHERE id = ?1")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(
            "SELECT id, name, provider, endpoint, region, flags, created_at, updated_at \
             FROM profiles ORDER BY name ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ProfileRow::into_profile).collect()
    }

    fn seal_secrets(&self, secrets: &ProfileSecrets) -> Result<Option<Vec<u8>>> {
        let plain =
            serde_json::to_vec(secrets).map_err(|e| StoreError::corrupt("secrets", e))?;
        Ok(Some(self.sealer().seal(&plain)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::sealer::{AesGcmSealer, PlainSealer};
    use std::sync::Arc;
    use stevedore_protocol::types::JobType;

    fn secrets() -> ProfileSecrets {
        ProfileSecrets {
            access_key_id: Some("AKIAEXAMPLE".into()),
            secret_access_key: Some("wJalrXUtnFEMI".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn secrets_round_trip_through_the_sealer() {
        let store = Store::open_in_memory(Arc::new(AesGcmSealer::new(&[9u8; 32])))
            .await
            .unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "aws".into(),
                provider: Provider::AwsS3,
                endpoint: None,
                region: Some("eu-central-1".into()),
                flags: ProfileFlags::default(),
                secrets: secrets(),
            })
            .await
            .unwrap();

        let loaded = store.get_profile_secrets(&profile.id).await.unwrap();
        assert_eq!(loaded.access_key_id.as_deref(), Some("AKIAEXAMPLE"));
        assert_eq!(loaded.secret_access_key.as_deref(), Some("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn sealed_blob_never_stores_plaintext() {
        let store = Store::open_in_memory(Arc::new(AesGcmSealer::new(&[9u8; 32])))
            .await
            .unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "aws".into(),
                provider: Provider::AwsS3,
                endpoint: None,
                region: None,
                flags: ProfileFlags::default(),
                secrets: secrets(),
            })
            .await
            .unwrap();

        let blob: Vec<u8> =
            sqlx::query_scalar("SELECT secrets_sealed FROM profiles WHERE id = ?1")
                .bind(profile.id.as_str())
                .fetch_one(store.pool())
                .await
                .unwrap();
        let haystack = String::from_utf8_lossy(&blob);
        assert!(!haystack.contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn delete_profile_cascades_to_jobs() {
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets::default(),
            })
            .await
            .unwrap();
        let job = store
            .create_job(NewJob {
                profile_id: profile.id.clone(),
                job_type: JobType::S3IndexObjects,
                payload: serde_json::json!({"bucket": "b"}),
            })
            .await
            .unwrap();

        assert!(store.delete_profile(&profile.id).await.unwrap());
        assert!(matches!(
            store.get_job(&job.id).await,
            Err(crate::StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn partial_update_keeps_unset_fields() {
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: Some("http://old:9000".into()),
                region: None,
                flags: ProfileFlags::default(),
                secrets: secrets(),
            })
            .await
            .unwrap();

        let updated = store
            .update_profile(
                &profile.id,
                ProfileUpdate {
                    endpoint: Some(Some("http://new:9000".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "minio");
        assert_eq!(updated.endpoint.as_deref(), Some("http://new:9000"));

        // Secrets untouched by the partial update.
        let loaded = store.get_profile_secrets(&profile.id).await.unwrap();
        assert_eq!(loaded.access_key_id.as_deref(), Some("AKIAEXAMPLE"));
    }
}
