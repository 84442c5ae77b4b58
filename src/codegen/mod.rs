//! The code-generation job pipeline: worker pool, per-job executor, job
//! registry and the service that ties them together.

pub mod credentials;
pub mod executor;
pub mod models;
pub mod pool;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{ExecutorDeps, JobContext, JobExecutor, JobOutcome};
pub use models::{Job, JobStatus, RequirementStatus};
pub use pool::WorkerPool;
pub use registry::JobRegistry;
pub use service::{CodegenService, JobNotifier, JobPage, TracingNotifier};
