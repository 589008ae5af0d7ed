//! Provider-signed upload URLs for the S3 family.
//!
//! Signing is local: no request leaves the machine until the client
//! uses the URL. Multipart completion and abort do talk to the
//! provider.

use std::time::Duration;

use aws_config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;

use stevedore_protocol::types::{Profile, ProfileSecrets};

use crate::error::UploadError;

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug)]
pub struct Presigner {
    client: Client,
}

impl Presigner {
    /// Build a client for one profile. Only called for providers whose
    /// capability row says presigning is supported.
    pub fn for_profile(profile: &Profile, secrets: &ProfileSecrets) -> Result<Self, UploadError> {
        let access_key = secrets
            .access_key_id
            .clone()
            .ok_or_else(|| UploadError::Provider("profile has no access key".to_string()))?;
        let secret_key = secrets
            .secret_access_key
            .clone()
            .ok_or_else(|| UploadError::Provider("profile has no secret key".to_string()))?;
        let credentials = aws_credential_types::Credentials::new(
            access_key,
            secret_key,
            secrets.session_token.clone(),
            None,
            "stevedore-profile",
        );

        let region = profile
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(profile.flags.force_path_style);
        if let Some(endpoint) = &profile.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }

    /// Presigned single PUT.
    pub async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, UploadError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        Ok(request.uri().to_string())
    }

    /// Start a provider multipart upload; returns the provider upload id.
    pub async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, UploadError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| UploadError::Provider("provider returned no upload id".to_string()))
    }

    /// Presigned PUT for one part.
    pub async fn presign_part(
        &self,
        bucket: &str,
        key: &str,
        provider_upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Result<String, UploadError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        let request = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(provider_upload_id)
            .part_number(part_number)
            .presigned(config)
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        Ok(request.uri().to_string())
    }

    /// Complete a multipart upload from the parts the provider has
    /// seen. Clients upload parts out of band, so the part list comes
    /// from the provider, not from us.
    pub async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        provider_upload_id: &str,
    ) -> Result<(), UploadError> {
        let listed = self
            .client
            .list_parts()
            .bucket(bucket)
            .key(key)
            .upload_id(provider_upload_id)
            .send()
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;

        let mut parts: Vec<CompletedPart> = listed
            .parts()
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .set_part_number(p.part_number())
                    .set_e_tag(p.e_tag().map(str::to_string))
                    .build()
            })
            .collect();
        parts.sort_by_key(|p| p.part_number());

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(provider_upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        Ok(())
    }

    pub async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        provider_upload_id: &str,
    ) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(provider_upload_id)
            .send()
            .await
            .map_err(|e| UploadError::Provider(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_protocol::ids::ProfileId;
    use stevedore_protocol::types::{ProfileFlags, Provider};

    fn profile() -> (Profile, ProfileSecrets) {
        (
            Profile {
                id: ProfileId::new(),
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: None,
                flags: ProfileFlags {
                    force_path_style: true,
                    ..Default::default()
                },
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            ProfileSecrets {
                access_key_id: Some("minioadmin".into()),
                secret_access_key: Some("miniosecret".into()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn presigned_put_is_signed_locally() {
        let (profile, secrets) = profile();
        let presigner = Presigner::for_profile(&profile, &secrets).unwrap();
        let url = presigner
            .presign_put("incoming", "drop/a.bin", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/incoming/drop/a.bin"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=600"));
        // The secret itself never appears in the URL.
        assert!(!url.contains("miniosecret"));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let (profile, _) = profile();
        let err = Presigner::for_profile(&profile, &ProfileSecrets::default()).unwrap_err();
        assert!(matches!(err, UploadError::Provider(_)));
    }
}
