//! Import job: copy company memberships from one collection into another.
//!
//! Each invocation is one step of a state machine: read a bounded window of eligible
//! source members at `cursor`, associate them with the target, persist the advanced
//! cursor on the job record, and report whether another step is needed.
//!
//! Re-running a window is harmless. Associations that already exist are skipped, and
//! the cursor advances by rows inspected rather than rows inserted.

use tracing::info;

use collectionjobs_core::JobId;

use super::error::JobError;
use super::message::{Message, to_payload};
use super::types::{ImportState, JobStatus, JobUpdate, progress_message};
use crate::storage::Session;

/// Rows processed per invocation of the import handler.
pub const IMPORT_BATCH_SIZE: u64 = 25;

/// Largest window a handler will read in one step.
pub const MAX_IMPORT_BATCH_SIZE: u64 = 10_000;

/// Result of one import step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// More eligible rows remain past the new cursor.
    Continue(ImportState),
    /// Every eligible row has been inspected.
    Done(ImportState),
}

/// Handler for `import_companies_to_collection` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportCompaniesHandler {
    batch_size: u64,
}

impl Default for ImportCompaniesHandler {
    fn default() -> Self {
        Self::new(IMPORT_BATCH_SIZE)
    }
}

impl ImportCompaniesHandler {
    /// Handler with a custom window size, clamped to `1..=MAX_IMPORT_BATCH_SIZE`.
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_IMPORT_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Run one step for `message` and return its continuation, if any.
    pub fn handle<S: Session>(
        &self,
        message: &Message,
        session: &mut S,
    ) -> Result<Option<Message>, JobError> {
        let state: ImportState = message.decode()?;
        info!(
            job_id = %message.id,
            source = %state.source_collection_id,
            target = %state.target_collection_id,
            cursor = state.cursor,
            "importing companies to collection"
        );

        match self.step(session, message.id, state)? {
            Step::Continue(next) => Ok(Some(message.continuation(to_payload(&next)?))),
            Step::Done(_) => Ok(None),
        }
    }

    /// Advance `state` by one window and persist the result on job `job_id`.
    pub fn step<S: Session>(
        &self,
        session: &mut S,
        job_id: JobId,
        mut state: ImportState,
    ) -> Result<Step, JobError> {
        // One extra row tells us whether another window exists.
        let mut batch = session.eligible_companies(
            state.source_collection_id,
            &state.selected_company_ids,
            state.cursor,
            self.batch_size.saturating_add(1),
        )?;
        let has_more = batch.len() as u64 > self.batch_size;
        if has_more {
            batch.truncate(self.batch_size as usize);
        }

        let inserted = session.insert_associations(state.target_collection_id, &batch)?;
        state.cursor += batch.len() as u64;

        let update = JobUpdate {
            status: (!has_more).then_some(JobStatus::Completed),
            message: Some(progress_message(state.cursor)),
            state: Some(
                serde_json::to_value(&state).map_err(|e| JobError::InvalidPayload(e.to_string()))?,
            ),
        };
        session.update_job(job_id, &update)?;

        info!(
            job_id = %job_id,
            inspected = batch.len(),
            inserted,
            cursor = state.cursor,
            has_more,
            "import batch applied"
        );

        Ok(if has_more {
            Step::Continue(state)
        } else {
            Step::Done(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobRecord;
    use crate::storage::{InMemoryStorage, Storage, with_unit_of_work};
    use collectionjobs_core::{CollectionId, CompanyId};

    struct Fixture {
        storage: InMemoryStorage,
        source: CollectionId,
        target: CollectionId,
    }

    fn fixture(members: impl IntoIterator<Item = i64>) -> Fixture {
        let storage = InMemoryStorage::new();
        let source = CollectionId::new();
        let target = CollectionId::new();
        storage.add_collection(source, "My List");
        storage.add_collection(target, "Liked Companies");
        storage.add_companies(source, members.into_iter().map(CompanyId::new));
        Fixture {
            storage,
            source,
            target,
        }
    }

    fn create_job(fx: &Fixture, selected: Vec<CompanyId>) -> (JobId, ImportState) {
        let state = ImportState::new(fx.source, fx.target, selected);
        let record = JobRecord::new_import(JobId::new(), &state).unwrap();
        let mut session = fx.storage.begin().unwrap();
        session.create_job(&record).unwrap();
        session.commit().unwrap();
        (record.id, state)
    }

    fn run_step(fx: &Fixture, handler: &ImportCompaniesHandler, job_id: JobId, state: ImportState) -> Step {
        with_unit_of_work(&fx.storage, |session| handler.step(session, job_id, state)).unwrap()
    }

    /// Drive a job to completion, returning the cursor after every step.
    fn run_to_completion(fx: &Fixture, handler: &ImportCompaniesHandler, job_id: JobId, mut state: ImportState) -> Vec<u64> {
        let mut cursors = Vec::new();
        loop {
            match run_step(fx, handler, job_id, state) {
                Step::Continue(next) => {
                    cursors.push(next.cursor);
                    state = next;
                }
                Step::Done(last) => {
                    cursors.push(last.cursor);
                    return cursors;
                }
            }
        }
    }

    #[test]
    fn sixty_rows_take_three_batches() {
        let fx = fixture(1..=60);
        let (job_id, state) = create_job(&fx, vec![]);

        let cursors = run_to_completion(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert_eq!(cursors, vec![25, 50, 60]);
        let job = fx.storage.job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.message, "60 items");
        assert_eq!(job.state["cursor"], 60);
        assert_eq!(fx.storage.collection_companies(fx.target).len(), 60);
    }

    #[test]
    fn intermediate_batches_leave_job_active() {
        let fx = fixture(1..=60);
        let (job_id, state) = create_job(&fx, vec![]);

        let step = run_step(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert!(matches!(step, Step::Continue(ref s) if s.cursor == 25));
        let job = fx.storage.job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.message, "25 items");
    }

    #[test]
    fn selection_limits_the_copy() {
        let fx = fixture(1..=60);
        let selected: Vec<CompanyId> = (11..=20).map(CompanyId::new).collect();
        let (job_id, state) = create_job(&fx, selected.clone());

        let step = run_step(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert!(matches!(step, Step::Done(ref s) if s.cursor == 10));
        assert_eq!(fx.storage.collection_companies(fx.target), selected);
        assert_eq!(fx.storage.job(job_id).unwrap().message, "10 items");
    }

    #[test]
    fn empty_source_completes_immediately() {
        let fx = fixture(std::iter::empty::<i64>());
        let (job_id, state) = create_job(&fx, vec![]);

        let step = run_step(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert!(matches!(step, Step::Done(ref s) if s.cursor == 0));
        let job = fx.storage.job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.message, "0 items");
    }

    #[test]
    fn selection_excluding_everything_completes_immediately() {
        let fx = fixture(1..=60);
        let (job_id, state) = create_job(&fx, vec![CompanyId::new(1000)]);

        let step = run_step(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert!(matches!(step, Step::Done(ref s) if s.cursor == 0));
        assert!(fx.storage.collection_companies(fx.target).is_empty());
    }

    #[test]
    fn existing_members_still_advance_the_cursor() {
        let fx = fixture(1..=30);
        fx.storage.add_companies(fx.target, (1..=10).map(CompanyId::new));
        let (job_id, state) = create_job(&fx, vec![]);

        let cursors = run_to_completion(&fx, &ImportCompaniesHandler::default(), job_id, state);

        assert_eq!(cursors, vec![25, 30]);
        assert_eq!(fx.storage.collection_companies(fx.target).len(), 30);
    }

    #[test]
    fn replaying_a_processed_window_is_idempotent() {
        let fx = fixture(1..=60);
        let (job_id, state) = create_job(&fx, vec![]);
        let handler = ImportCompaniesHandler::default();

        run_to_completion(&fx, &handler, job_id, state.clone());
        let after_first = fx.storage.collection_companies(fx.target);

        // Crash-recovery replay from an already-processed cursor.
        let replay = ImportState { cursor: 25, ..state };
        let cursors = run_to_completion(&fx, &handler, job_id, replay);

        assert_eq!(cursors, vec![50, 60]);
        assert_eq!(fx.storage.collection_companies(fx.target), after_first);
        assert_eq!(fx.storage.job(job_id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn handle_returns_continuation_with_same_identity() {
        let fx = fixture(1..=30);
        let (job_id, state) = create_job(&fx, vec![]);
        let message = Message::import_companies(job_id, &state).unwrap();
        let handler = ImportCompaniesHandler::default();

        let next = with_unit_of_work(&fx.storage, |session| handler.handle(&message, session))
            .unwrap()
            .unwrap();
        assert_eq!(next.id, message.id);
        assert_eq!(next.message_type, message.message_type);
        assert_eq!(next.decode::<ImportState>().unwrap().cursor, 25);

        let last = with_unit_of_work(&fx.storage, |session| handler.handle(&next, session)).unwrap();
        assert!(last.is_none());
    }

    #[test]
    fn missing_job_record_fails_the_batch_without_side_effects() {
        let fx = fixture(1..=5);
        let state = ImportState::new(fx.source, fx.target, vec![]);

        let result = with_unit_of_work(&fx.storage, |session| {
            ImportCompaniesHandler::default().step(session, JobId::new(), state)
        });

        assert!(matches!(result, Err(JobError::Store(_))));
        assert!(fx.storage.collection_companies(fx.target).is_empty());
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        assert_eq!(ImportCompaniesHandler::new(0).batch_size(), 1);
    }

    #[test]
    fn oversized_batch_is_capped_and_still_copies() {
        let handler = ImportCompaniesHandler::new(u64::MAX);
        assert_eq!(handler.batch_size(), MAX_IMPORT_BATCH_SIZE);

        let fx = fixture(1..=30);
        let (job_id, state) = create_job(&fx, vec![]);
        let step = run_step(&fx, &handler, job_id, state);

        assert!(matches!(step, Step::Done(ref s) if s.cursor == 30));
        assert_eq!(fx.storage.collection_companies(fx.target).len(), 30);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: a job finishes in ceil(eligible / batch) steps (at least one),
            /// the cursor never goes backwards, and it ends at the eligible count.
            #[test]
            fn terminates_with_monotonic_cursor(
                members in proptest::collection::btree_set(0i64..500, 0..120),
                selected in proptest::collection::vec(0i64..500, 0..40),
                batch_size in 1u64..40,
            ) {
                let fx = fixture(members.iter().copied());
                let selected: Vec<CompanyId> = selected.into_iter().map(CompanyId::new).collect();
                let eligible = members
                    .iter()
                    .filter(|m| selected.is_empty() || selected.contains(&CompanyId::new(**m)))
                    .count() as u64;
                let (job_id, state) = create_job(&fx, selected);
                let handler = ImportCompaniesHandler::new(batch_size);

                let cursors = run_to_completion(&fx, &handler, job_id, state);

                let expected_steps = eligible.div_ceil(batch_size).max(1);
                prop_assert_eq!(cursors.len() as u64, expected_steps);
                prop_assert!(cursors.windows(2).all(|w| w[0] <= w[1]));
                prop_assert_eq!(*cursors.last().unwrap(), eligible);
                prop_assert_eq!(fx.storage.collection_companies(fx.target).len() as u64, eligible);
            }

            /// Property: applying the same window twice yields the same association set.
            #[test]
            fn window_application_is_idempotent(
                members in proptest::collection::btree_set(0i64..200, 0..80),
                cursor in 0u64..80,
            ) {
                let fx = fixture(members.iter().copied());
                let (job_id, state) = create_job(&fx, vec![]);
                let handler = ImportCompaniesHandler::default();
                let window = ImportState { cursor, ..state };

                run_step(&fx, &handler, job_id, window.clone());
                let once = fx.storage.collection_companies(fx.target);
                run_step(&fx, &handler, job_id, window);
                let twice = fx.storage.collection_companies(fx.target);

                prop_assert_eq!(once, twice);
            }
        }
    }
}
