//! Upload session management.
//!
//! Three modes on one session record: staged files collected on local
//! disk and shipped by a transfer job, direct streaming through the
//! engine, and provider-presigned (single or multipart) PUTs. Sessions
//! carry a byte budget and a TTL; expiry sweeps the session and its
//! staging tree no matter what state the client left it in.

mod error;
mod manager;
pub mod paths;
pub mod presign;

pub use error::UploadError;
pub use manager::{CommitOutcome, NewSessionRequest, PresignedPart, UploadManager};
pub use paths::sanitize_relative_path;
pub use presign::Presigner;
