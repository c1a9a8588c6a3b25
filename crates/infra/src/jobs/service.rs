//! Job creation, status lookups and crash recovery on top of the engine.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use collectionjobs_core::{CollectionId, CompanyId, DomainError, JobId};

use super::engine::JobSubmitter;
use super::error::{EngineError, JobError};
use super::message::Message;
use super::types::{ImportState, JobRecord};
use crate::storage::{with_unit_of_work, Session, Storage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),
    #[error("job {job_id} is already running on one of these collections")]
    ActiveJobConflict { job_id: JobId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Entry point for callers that start and inspect import jobs.
pub struct JobService<S: Storage, Q: JobSubmitter> {
    storage: Arc<S>,
    submitter: Q,
}

impl<S: Storage, Q: JobSubmitter> JobService<S, Q> {
    pub fn new(storage: Arc<S>, submitter: Q) -> Self {
        Self { storage, submitter }
    }

    /// Persist a new `active` import job and submit its first message.
    ///
    /// The job record is committed before the message is submitted. If submission
    /// fails the record stays `active` and is picked up by [`Self::resume_active_jobs`].
    #[instrument(skip(self, selected_company_ids), fields(selected = selected_company_ids.len()))]
    pub fn create_import_job(
        &self,
        source: CollectionId,
        target: CollectionId,
        selected_company_ids: Vec<CompanyId>,
    ) -> Result<JobId, ServiceError> {
        if source == target {
            return Err(DomainError::validation("source and target collections must differ").into());
        }

        let id = JobId::new();
        let state = ImportState::new(source, target, selected_company_ids);

        with_unit_of_work(self.storage.as_ref(), |session| -> Result<(), ServiceError> {
            if !session.collection_exists(target)? {
                return Err(ServiceError::CollectionNotFound(target));
            }
            if let Some(active) = session.find_overlapping_active_job(source, target)? {
                return Err(ServiceError::ActiveJobConflict { job_id: active.id });
            }
            let record = JobRecord::new_import(id, &state)
                .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
            session.create_job(&record)?;
            Ok(())
        })?;

        let message = Message::import_companies(id, &state)?;
        if let Err(err) = self.submitter.submit(message) {
            warn!(job_id = %id, error = %err, "job created but not submitted; it will run on resume");
            return Err(err.into());
        }

        info!(job_id = %id, "import job submitted");
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Result<Option<JobRecord>, ServiceError> {
        self.read(|session| session.get_job(id))
    }

    /// The active job reading from or writing to `collection`, if any.
    pub fn active_job_for_collection(
        &self,
        collection: CollectionId,
    ) -> Result<Option<JobRecord>, ServiceError> {
        self.read(|session| session.active_job_for_collection(collection))
    }

    /// Resubmit every `active` job from its persisted state.
    ///
    /// Jobs that already have a message in flight are skipped, as are records whose
    /// state cannot be turned back into a message. Returns how many were resubmitted.
    #[instrument(skip(self))]
    pub fn resume_active_jobs(&self) -> Result<usize, ServiceError> {
        let active = self.read(|session| session.list_active_jobs())?;
        let mut resumed = 0;

        for record in active {
            let message = match Message::from_state(record.id, record.job_type.clone(), &record.state) {
                Ok(message) => message,
                Err(err) => {
                    error!(job_id = %record.id, error = %err, "cannot resume job from its stored state");
                    continue;
                }
            };

            match self.submitter.submit(message) {
                Ok(()) => {
                    debug!(job_id = %record.id, progress = %record.message, "job resumed");
                    resumed += 1;
                }
                Err(EngineError::JobAlreadyQueued(id)) => {
                    debug!(job_id = %id, "job already in flight; not resubmitted");
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(resumed, "active jobs resumed");
        Ok(resumed)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&mut S::Session) -> Result<T, StoreError>,
    ) -> Result<T, ServiceError> {
        Ok(with_unit_of_work(self.storage.as_ref(), f)?)
    }
}
