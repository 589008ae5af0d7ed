//! Job scheduler for the Stevedore control plane.
//!
//! Owns the in-memory side of the job lifecycle: admission into a
//! bounded ready queue, a fixed worker pool driving execution episodes
//! through the engine supervisor, retry with jittered exponential
//! backoff, cooperative cancellation, crash recovery at startup and the
//! retention sweeper. The store stays the source of truth; everything
//! here can be rebuilt from it.

pub mod manager;
pub mod metrics;
pub mod retry;
mod worker;

pub use manager::{DeleteJobError, JobManager, SubmitError};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use retry::backoff_delay;
