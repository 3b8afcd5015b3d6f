//! Postgres repositories implementing the core storage contracts.

pub mod boilerplate;
pub mod entities;
pub mod extractions;
pub mod projects;
pub mod reports;
pub mod sources;
pub mod vectors;

pub use boilerplate::PgBoilerplateRepo;
pub use entities::PgEntityRepo;
pub use extractions::PgExtractionRepo;
pub use projects::PgProjectRepo;
pub use reports::PgReportRepo;
pub use sources::PgSourceRepo;
pub use vectors::PgVectorRepo;

/// Map a sqlx error into the core's storage error.
pub(crate) fn storage_err(e: sqlx::Error) -> extraction::ExtractionError {
    extraction::ExtractionError::Storage(Box::new(e))
}
