//! Storage boundary for the job engine.
//!
//! Everything a batch touches (eligible source rows, target associations and the job
//! record itself) goes through one [`Session`], so a batch commits or rolls back as a
//! whole.
//!
//! ## Components
//!
//! - `Storage`: opens sessions (one transaction each)
//! - `Session`: queries and writes inside a transaction
//! - `UnitOfWork`: scoped guard that rolls back on every exit path that didn't commit
//! - `InMemoryStorage` / `PostgresStorage`: implementations

pub mod in_memory;
pub mod postgres;
pub mod unit_of_work;

pub use in_memory::{InMemorySession, InMemoryStorage};
pub use postgres::{PostgresSession, PostgresStorage};
pub use unit_of_work::{UnitOfWork, with_unit_of_work};

use std::sync::Arc;

use collectionjobs_core::{CollectionId, CompanyId, JobId};

use crate::jobs::types::{JobRecord, JobUpdate};

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("transaction already finished")]
    TransactionFinished,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Opens transactional sessions.
pub trait Storage: Send + Sync + 'static {
    type Session: Session;

    /// Begin a new transaction.
    fn begin(&self) -> Result<Self::Session, StoreError>;
}

/// One transaction against the store.
///
/// Writes become visible to other sessions only after `commit`. A session that is
/// neither committed nor rolled back must not leak its writes.
pub trait Session {
    /// Members of `source`, restricted to `selected` when it is non-empty,
    /// ordered by company id and windowed by `offset`/`limit`.
    fn eligible_companies(
        &mut self,
        source: CollectionId,
        selected: &[CompanyId],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CompanyId>, StoreError>;

    /// Associate `companies` with `target`. Pairs that already exist are skipped.
    ///
    /// Returns the number of associations actually created.
    fn insert_associations(
        &mut self,
        target: CollectionId,
        companies: &[CompanyId],
    ) -> Result<u64, StoreError>;

    /// Whether a collection with this id exists.
    fn collection_exists(&mut self, collection: CollectionId) -> Result<bool, StoreError>;

    /// Insert a new job record.
    fn create_job(&mut self, record: &JobRecord) -> Result<(), StoreError>;

    /// Apply a partial update to an existing job record.
    fn update_job(&mut self, id: JobId, update: &JobUpdate) -> Result<(), StoreError>;

    /// Load a job record by id.
    fn get_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Oldest active job reading from `source` or writing to `target`.
    fn find_overlapping_active_job(
        &mut self,
        source: CollectionId,
        target: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Oldest active job that uses `collection` as either its source or its target.
    fn active_job_for_collection(
        &mut self,
        collection: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// All active jobs, oldest first.
    fn list_active_jobs(&mut self) -> Result<Vec<JobRecord>, StoreError>;

    /// Make this session's writes durable.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard this session's writes.
    fn rollback(&mut self) -> Result<(), StoreError>;
}

impl<S: Storage> Storage for Arc<S> {
    type Session = S::Session;

    fn begin(&self) -> Result<Self::Session, StoreError> {
        (**self).begin()
    }
}
