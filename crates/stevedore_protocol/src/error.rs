//! Normalized error taxonomy and the stderr classifier.
//!
//! Backends report the same failure in a dozen dialects; the classifier
//! folds them into one closed enum that drives both the retry policy and
//! the HTTP error envelope. It is pure and table-driven: classification
//! is a first-match scan over ordered keyword groups, so
//! `classify(s) == classify(s)` for any fixed `s`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provider-agnostic failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedErrorCode {
    InvalidCredentials,
    AccessDenied,
    NotFound,
    RateLimited,
    SignatureMismatch,
    RequestTimeSkewed,
    Conflict,
    UpstreamTimeout,
    EndpointUnreachable,
    NetworkError,
    InvalidConfig,
    Canceled,
    ServerRestarted,
    ValidationError,
    TransferEngineMissing,
    TransferEngineIncompatible,
    Unknown,
}

impl NormalizedErrorCode {
    pub const ALL: [NormalizedErrorCode; 17] = [
        NormalizedErrorCode::InvalidCredentials,
        NormalizedErrorCode::AccessDenied,
        NormalizedErrorCode::NotFound,
        NormalizedErrorCode::RateLimited,
        NormalizedErrorCode::SignatureMismatch,
        NormalizedErrorCode::RequestTimeSkewed,
        NormalizedErrorCode::Conflict,
        NormalizedErrorCode::UpstreamTimeout,
        NormalizedErrorCode::EndpointUnreachable,
        NormalizedErrorCode::NetworkError,
        NormalizedErrorCode::InvalidConfig,
        NormalizedErrorCode::Canceled,
        NormalizedErrorCode::ServerRestarted,
        NormalizedErrorCode::ValidationError,
        NormalizedErrorCode::TransferEngineMissing,
        NormalizedErrorCode::TransferEngineIncompatible,
        NormalizedErrorCode::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedErrorCode::InvalidCredentials => "invalid_credentials",
            NormalizedErrorCode::AccessDenied => "access_denied",
            NormalizedErrorCode::NotFound => "not_found",
            NormalizedErrorCode::RateLimited => "rate_limited",
            NormalizedErrorCode::SignatureMismatch => "signature_mismatch",
            NormalizedErrorCode::RequestTimeSkewed => "request_time_skewed",
            NormalizedErrorCode::Conflict => "conflict",
            NormalizedErrorCode::UpstreamTimeout => "upstream_timeout",
            NormalizedErrorCode::EndpointUnreachable => "endpoint_unreachable",
            NormalizedErrorCode::NetworkError => "network_error",
            NormalizedErrorCode::InvalidConfig => "invalid_config",
            NormalizedErrorCode::Canceled => "canceled",
            NormalizedErrorCode::ServerRestarted => "server_restarted",
            NormalizedErrorCode::ValidationError => "validation_error",
            NormalizedErrorCode::TransferEngineMissing => "transfer_engine_missing",
            NormalizedErrorCode::TransferEngineIncompatible => "transfer_engine_incompatible",
            NormalizedErrorCode::Unknown => "unknown",
        }
    }

    /// Only transient backend conditions are worth another attempt.
    /// Signature mismatches are deterministic — retrying burns time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NormalizedErrorCode::RateLimited
                | NormalizedErrorCode::UpstreamTimeout
                | NormalizedErrorCode::EndpointUnreachable
                | NormalizedErrorCode::NetworkError
        )
    }

    /// Short operator-facing hint surfaced via `/api/meta` and the
    /// error envelope.
    pub fn recommended_action(&self) -> &'static str {
        match self {
            NormalizedErrorCode::InvalidCredentials => {
                "Check the profile's access key and secret."
            }
            NormalizedErrorCode::AccessDenied => {
                "The credentials lack permission for this bucket or operation."
            }
            NormalizedErrorCode::NotFound => "The bucket, key or prefix does not exist.",
            NormalizedErrorCode::RateLimited => {
                "The backend is throttling; the job retries automatically."
            }
            NormalizedErrorCode::SignatureMismatch => {
                "Check the secret key and the endpoint's signature version."
            }
            NormalizedErrorCode::RequestTimeSkewed => {
                "The local clock is too far from the backend's; sync the system time."
            }
            NormalizedErrorCode::Conflict => {
                "The target changed underneath the operation; inspect and re-submit."
            }
            NormalizedErrorCode::UpstreamTimeout => {
                "The backend timed out; the job retries automatically."
            }
            NormalizedErrorCode::EndpointUnreachable => {
                "Check the endpoint URL and DNS reachability."
            }
            NormalizedErrorCode::NetworkError => {
                "A connection dropped mid-transfer; the job retries automatically."
            }
            NormalizedErrorCode::InvalidConfig => {
                "The profile configuration is incomplete or malformed."
            }
            NormalizedErrorCode::Canceled => "The job was canceled.",
            NormalizedErrorCode::ServerRestarted => {
                "The server restarted while the job was running; re-submit if needed."
            }
            NormalizedErrorCode::ValidationError => "The request payload was rejected.",
            NormalizedErrorCode::TransferEngineMissing => {
                "The transfer engine binary was not found; check the engine path."
            }
            NormalizedErrorCode::TransferEngineIncompatible => {
                "The transfer engine is too old; upgrade it."
            }
            NormalizedErrorCode::Unknown => "Inspect the job log for details.",
        }
    }
}

impl fmt::Display for NormalizedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormalizedErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NormalizedErrorCode::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown normalized error code: {s}"))
    }
}

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub code: NormalizedErrorCode,
    pub retryable: bool,
}

impl Classification {
    fn of(code: NormalizedErrorCode) -> Self {
        Self {
            code,
            retryable: code.is_retryable(),
        }
    }
}

// Ordered first-match table. Order is load-bearing:
// config errors before not-found (backends report a missing config
// section as "not found"), signature before credentials, credentials
// before access-denied, not-found before conflict.
const CLASSIFIER_TABLE: &[(&[&str], NormalizedErrorCode)] = &[
    (
        &[
            "section not found in config",
            "didn't find section in config",
            "config file not found",
            "couldn't find type field in config",
            "failed to load config",
            "missing required configuration",
        ],
        NormalizedErrorCode::InvalidConfig,
    ),
    (
        &[
            "signaturedoesnotmatch",
            "signature we calculated does not match",
            "signature mismatch",
        ],
        NormalizedErrorCode::SignatureMismatch,
    ),
    (
        &[
            "requesttimetooskewed",
            "request time and the current time",
            "clock skew",
        ],
        NormalizedErrorCode::RequestTimeSkewed,
    ),
    (
        &[
            "invalidaccesskeyid",
            "invalid access key",
            "authenticationfailed",
            "invalid_grant",
            "invalid credentials",
            "authorizationheadermalformed",
            "401 unauthorized",
            "expiredtoken",
        ],
        NormalizedErrorCode::InvalidCredentials,
    ),
    (
        &[
            "accessdenied",
            "access denied",
            "403 forbidden",
            "insufficientaccountpermissions",
            "not authorized",
            "permission denied",
            "authorizationpermissionmismatch",
        ],
        NormalizedErrorCode::AccessDenied,
    ),
    (
        &[
            "nosuchbucket",
            "nosuchkey",
            "nosuchupload",
            "blobnotfound",
            "containernotfound",
            "404 not found",
            "notfound",
            "does not exist",
            "directory not found",
            "object not found",
            "no such object",
        ],
        NormalizedErrorCode::NotFound,
    ),
    (
        &[
            "bucketnotempty",
            "409 conflict",
            "conflict",
            "precondition failed",
            "preconditionfailed",
        ],
        NormalizedErrorCode::Conflict,
    ),
    (
        &[
            "slowdown",
            "toomanyrequests",
            "too many requests",
            "429",
            "requestlimitexceeded",
            "throttl",
            "rate exceeded",
            "serverbusy",
        ],
        NormalizedErrorCode::RateLimited,
    ),
    (
        &[
            "requesttimeout",
            "deadline exceeded",
            "timed out",
            "timeout",
            "context deadline",
        ],
        NormalizedErrorCode::UpstreamTimeout,
    ),
    (
        &[
            "no such host",
            "dns",
            "connection refused",
            "no route to host",
            "name or service not known",
            "could not resolve",
        ],
        NormalizedErrorCode::EndpointUnreachable,
    ),
    (
        &[
            "connection reset",
            "broken pipe",
            "unexpected eof",
            "tls handshake",
            "certificate",
            "network is unreachable",
            "transport connection broken",
            "connection closed",
        ],
        NormalizedErrorCode::NetworkError,
    ),
    (
        &["executable file not found", "no such file or directory: rclone"],
        NormalizedErrorCode::TransferEngineMissing,
    ),
];

/// Map a raw engine/backend error message to a normalized code.
///
/// `canceled` reflects the execution episode's cancellation token and
/// dominates everything: a killed child produces arbitrary stderr.
pub fn classify(raw: &str, canceled: bool) -> Classification {
    if canceled {
        return Classification {
            code: NormalizedErrorCode::Canceled,
            retryable: false,
        };
    }
    let needle = raw.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return Classification::of(NormalizedErrorCode::Unknown);
    }
    for (keywords, code) in CLASSIFIER_TABLE {
        if keywords.iter().any(|k| needle.contains(k)) {
            return Classification::of(*code);
        }
    }
    Classification::of(NormalizedErrorCode::Unknown)
}

// ============================================================================
// HTTP error envelope
// ============================================================================

/// `normalizedError` member of the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedError {
    pub code: NormalizedErrorCode,
    pub retryable: bool,
}

impl From<NormalizedErrorCode> for NormalizedError {
    fn from(code: NormalizedErrorCode) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
        }
    }
}

/// Body of every error response the boundary renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Legacy string code kept for existing clients (`job_queue_full`,
    /// `db_error`, ...).
    pub code: String,
    pub message: String,
    pub normalized_error: NormalizedError,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_dominates() {
        let c = classify("SlowDown: please reduce your request rate", true);
        assert_eq!(c.code, NormalizedErrorCode::Canceled);
        assert!(!c.retryable);
    }

    #[test]
    fn empty_input_is_unknown() {
        assert_eq!(classify("", false).code, NormalizedErrorCode::Unknown);
        assert_eq!(classify("   \n", false).code, NormalizedErrorCode::Unknown);
    }

    #[test]
    fn config_errors_win_over_not_found() {
        // Backends report a missing remote as a config-section lookup
        // failure; that must not classify as not_found.
        let c = classify("Failed to create file system: section not found in config", false);
        assert_eq!(c.code, NormalizedErrorCode::InvalidConfig);
    }

    #[test]
    fn signature_wins_over_credentials() {
        let c = classify(
            "SignatureDoesNotMatch: check your key and signing method (invalid access key?)",
            false,
        );
        assert_eq!(c.code, NormalizedErrorCode::SignatureMismatch);
        assert!(!c.retryable);
    }

    #[test]
    fn credentials_win_over_access_denied() {
        let c = classify("InvalidAccessKeyId: AccessDenied for this request", false);
        assert_eq!(c.code, NormalizedErrorCode::InvalidCredentials);
    }

    #[test]
    fn not_found_wins_over_conflict() {
        let c = classify("NoSuchBucket: conflict while resolving target", false);
        assert_eq!(c.code, NormalizedErrorCode::NotFound);
    }

    #[test]
    fn retryable_set_is_exact() {
        let retryable: Vec<_> = NormalizedErrorCode::ALL
            .into_iter()
            .filter(|c| c.is_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![
                NormalizedErrorCode::RateLimited,
                NormalizedErrorCode::UpstreamTimeout,
                NormalizedErrorCode::EndpointUnreachable,
                NormalizedErrorCode::NetworkError,
            ]
        );
    }

    #[test]
    fn classifier_is_deterministic() {
        let samples = [
            "SlowDown",
            "connection reset by peer",
            "NoSuchKey",
            "gibberish nobody has seen",
        ];
        for s in samples {
            assert_eq!(classify(s, false), classify(s, false));
        }
    }

    #[test]
    fn throttling_variants_map_to_rate_limited() {
        for s in ["SlowDown", "HTTP 429 returned", "Request throttled by backend"] {
            let c = classify(s, false);
            assert_eq!(c.code, NormalizedErrorCode::RateLimited, "{s}");
            assert!(c.retryable);
        }
    }
}
