//! Transfer-engine supervision.
//!
//! Each execution episode spawns the external transfer binary (an
//! rclone-compatible CLI) with a whitelisted argv, credentials in the
//! environment, and a per-episode remote-config file. stdout is parsed
//! as structured JSON log records into a progress model; stderr is
//! captured to the per-job log file and kept (bounded) for the error
//! classifier. Cancellation kills the whole child process group.

pub mod binary;
mod error;
pub mod joblog;
pub mod plan;
pub mod progress;
pub mod supervisor;

pub use binary::{EngineInfo, EngineProbe};
pub use error::EngineError;
pub use joblog::JobLogWriter;
pub use plan::{PlanInput, RemoteSpec, ZipSelection, REMOTE_NAME};
pub use progress::{EngineLogRecord, ProgressMode, ProgressTracker, StatsBlock};
pub use supervisor::{
    EngineSettings, EngineSupervisor, EpisodeHooks, EpisodeOutcome, EpisodeOutput, IndexedEntry,
};
