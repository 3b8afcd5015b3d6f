//! Persistent job queue: model, store, and scheduler.

pub mod job;
pub mod scheduler;
pub mod store;
pub mod testing;

pub use job::{Job, JobStatus, JobType};
pub use scheduler::{JobContext, JobError, JobHandler, JobScheduler, SchedulerConfig};
pub use store::{JobStore, PostgresJobStore};
