//! Orchestrator service: configuration, job queue, LM broker transport,
//! Postgres repositories, external-service clients, and the job workers
//! that drive the extraction core.

pub mod broker;
pub mod clients;
pub mod config;
pub mod jobs;
pub mod kernel;
pub mod rate_limit;
pub mod repos;
pub mod workers;

pub use config::Config;
pub use kernel::ServerKernel;
