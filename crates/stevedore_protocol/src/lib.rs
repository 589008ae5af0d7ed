//! Shared protocol types for the Stevedore control plane.
//!
//! Everything the components agree on lives here: identifiers, the job
//! state machine, per-type job payloads and their validation rules, the
//! normalized error taxonomy and its classifier, realtime event frames,
//! the provider capability matrix, and the runtime settings record.
//!
//! This crate performs no I/O. The store, scheduler, engine and HTTP
//! boundary all depend on it; it depends on none of them.

pub mod capabilities;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod ids;
pub mod types;

pub use capabilities::{capabilities_for, CapabilityFlag, ProviderCapabilities};
pub use config::{parse_duration, RestartPolicy, RetryPolicy, Settings};
pub use error::{
    classify, ApiErrorBody, Classification, ErrorEnvelope, NormalizedError, NormalizedErrorCode,
};
pub use events::{
    DeletedReason, Event, EventKind, JobCompletedPayload, JobLogPayload, JobProgressPayload,
    JobsDeletedPayload,
};
pub use ids::{IdParseError, JobId, ProfileId, UploadId};
pub use types::{
    check_local_path, validate_payload, BatchPair, BatchPayload, CopyObjectPayload,
    CopyPrefixPayload, DeleteObjectsPayload, DeletePrefixPayload, IndexObjectsPayload, Job,
    JobStatus, JobType, Profile, ProfileFlags, ProfileSecrets, Progress, Provider,
    SyncLocalToS3Payload, SyncS3ToLocalPayload, UploadMode, UploadRefPayload, UploadSession,
    ValidationContext, ValidationError, ZipObjectsPayload, ZipPrefixPayload, MAX_BATCH_ITEMS,
};
