//! Provider capability matrix.
//!
//! A plain values table keyed by provider tag, exposed at `/api/meta`
//! and enforced at the HTTP boundary before a job or upload session is
//! dispatched. Not polymorphism: a capability is data.

use serde::{Deserialize, Serialize};

use crate::types::Provider;

/// One feature flag, with a reason when unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlag {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

const YES: CapabilityFlag = CapabilityFlag {
    supported: true,
    reason: None,
};

const fn no(reason: &'static str) -> CapabilityFlag {
    CapabilityFlag {
        supported: false,
        reason: Some(reason),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(deserialize = "'de: 'static"))]
pub struct ProviderCapabilities {
    pub bucket_crud: CapabilityFlag,
    pub object_crud: CapabilityFlag,
    pub job_transfer: CapabilityFlag,
    pub bucket_policy: CapabilityFlag,
    pub gcs_iam_policy: CapabilityFlag,
    pub azure_container_access_policy: CapabilityFlag,
    pub presigned_upload: CapabilityFlag,
    pub presigned_multipart_upload: CapabilityFlag,
    pub direct_upload: CapabilityFlag,
}

const S3_FAMILY: ProviderCapabilities = ProviderCapabilities {
    bucket_crud: YES,
    object_crud: YES,
    job_transfer: YES,
    bucket_policy: YES,
    gcs_iam_policy: no("IAM policies are a GCS feature"),
    azure_container_access_policy: no("container access policies are an Azure feature"),
    presigned_upload: YES,
    presigned_multipart_upload: YES,
    direct_upload: YES,
};

const AZURE_BLOB: ProviderCapabilities = ProviderCapabilities {
    bucket_crud: YES,
    object_crud: YES,
    job_transfer: YES,
    bucket_policy: no("bucket policies are an S3 feature"),
    gcs_iam_policy: no("IAM policies are a GCS feature"),
    azure_container_access_policy: YES,
    presigned_upload: no("SAS-based upload URLs are not issued by this server"),
    presigned_multipart_upload: no("block-list uploads are not driven through presigned URLs"),
    direct_upload: YES,
};

const GCP_GCS: ProviderCapabilities = ProviderCapabilities {
    bucket_crud: YES,
    object_crud: YES,
    job_transfer: YES,
    bucket_policy: no("bucket policies are an S3 feature"),
    gcs_iam_policy: YES,
    azure_container_access_policy: no("container access policies are an Azure feature"),
    presigned_upload: no("V4 signed URLs are not issued by this server"),
    presigned_multipart_upload: no("V4 signed URLs are not issued by this server"),
    direct_upload: YES,
};

const OCI_NATIVE: ProviderCapabilities = ProviderCapabilities {
    bucket_crud: YES,
    object_crud: YES,
    job_transfer: YES,
    bucket_policy: no("bucket policies are an S3 feature"),
    gcs_iam_policy: no("IAM policies are a GCS feature"),
    azure_container_access_policy: no("container access policies are an Azure feature"),
    presigned_upload: no("use the OCI S3-compatibility endpoint for presigned uploads"),
    presigned_multipart_upload: no("use the OCI S3-compatibility endpoint for presigned uploads"),
    direct_upload: YES,
};

/// Capability row for one provider.
pub fn capabilities_for(provider: Provider) -> &'static ProviderCapabilities {
    match provider {
        Provider::AwsS3 | Provider::S3Compatible | Provider::OciS3Compat => &S3_FAMILY,
        Provider::AzureBlob => &AZURE_BLOB,
        Provider::GcpGcs => &GCP_GCS,
        Provider::OciObjectStorage => &OCI_NATIVE,
    }
}

impl ProviderCapabilities {
    /// Flag for one upload mode.
    pub fn upload_mode(&self, mode: crate::types::UploadMode) -> CapabilityFlag {
        match mode {
            crate::types::UploadMode::Staging => self.job_transfer,
            crate::types::UploadMode::Direct => self.direct_upload,
            crate::types::UploadMode::Presigned => self.presigned_upload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UploadMode;

    #[test]
    fn every_provider_has_a_row() {
        for p in Provider::ALL {
            let caps = capabilities_for(p);
            assert!(caps.job_transfer.supported, "{p} must support transfers");
        }
    }

    #[test]
    fn unsupported_flags_carry_reasons() {
        for p in Provider::ALL {
            let caps = capabilities_for(p);
            for flag in [
                caps.bucket_policy,
                caps.gcs_iam_policy,
                caps.azure_container_access_policy,
                caps.presigned_upload,
                caps.presigned_multipart_upload,
            ] {
                if !flag.supported {
                    assert!(flag.reason.is_some());
                }
            }
        }
    }

    #[test]
    fn presign_is_s3_family_only() {
        assert!(capabilities_for(Provider::AwsS3).presigned_upload.supported);
        assert!(!capabilities_for(Provider::AzureBlob).presigned_upload.supported);
        assert!(!capabilities_for(Provider::GcpGcs)
            .upload_mode(UploadMode::Presigned)
            .supported);
    }
}
