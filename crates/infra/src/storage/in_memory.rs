//! In-memory storage for tests/dev.
//!
//! Sessions stage their writes and apply them atomically under one write lock on
//! commit, so a rolled-back or abandoned session leaves no trace. Reads inside a
//! session see committed data plus the session's own staged writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use collectionjobs_core::{CollectionId, CompanyId, JobId};

use super::{Session, Storage, StoreError};
use crate::jobs::types::{JobRecord, JobStatus, JobUpdate};

#[derive(Debug, Default)]
struct Tables {
    collections: HashMap<CollectionId, String>,
    /// `(collection, company)` pairs; the set makes the pair unique.
    associations: BTreeSet<(CollectionId, CompanyId)>,
    jobs: HashMap<JobId, JobRecord>,
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Associations {
        target: CollectionId,
        companies: Vec<CompanyId>,
    },
    CreateJob(JobRecord),
    UpdateJob {
        id: JobId,
        update: JobUpdate,
        at: DateTime<Utc>,
    },
}

/// In-memory store of collections, memberships and job records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a collection.
    pub fn add_collection(&self, id: CollectionId, name: impl Into<String>) {
        self.write_tables().collections.insert(id, name.into());
    }

    /// Add members to a collection, registering the collection if needed.
    pub fn add_companies(
        &self,
        collection: CollectionId,
        companies: impl IntoIterator<Item = CompanyId>,
    ) {
        let mut tables = self.write_tables();
        tables
            .collections
            .entry(collection)
            .or_insert_with(|| collection.to_string());
        for company in companies {
            tables.associations.insert((collection, company));
        }
    }

    /// Committed members of a collection, ordered by company id.
    pub fn collection_companies(&self, collection: CollectionId) -> Vec<CompanyId> {
        members(&self.read_tables(), collection).collect()
    }

    /// Committed job record.
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.read_tables().jobs.get(&id).cloned()
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Storage for InMemoryStorage {
    type Session = InMemorySession;

    fn begin(&self) -> Result<Self::Session, StoreError> {
        Ok(InMemorySession {
            tables: self.tables.clone(),
            staged: Vec::new(),
            finished: false,
        })
    }
}

/// Session over [`InMemoryStorage`].
#[derive(Debug)]
pub struct InMemorySession {
    tables: Arc<RwLock<Tables>>,
    staged: Vec<StagedWrite>,
    finished: bool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.ensure_open()?;
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("in-memory tables poisoned".to_string()))
    }

    fn staged_members(&self, collection: CollectionId) -> impl Iterator<Item = CompanyId> + '_ {
        self.staged
            .iter()
            .filter_map(move |write| match write {
                StagedWrite::Associations { target, companies } if *target == collection => {
                    Some(companies.iter().copied())
                }
                _ => None,
            })
            .flatten()
    }

    /// Job records as this session sees them: committed rows overlaid with staged writes.
    fn jobs_view(&self) -> Result<HashMap<JobId, JobRecord>, StoreError> {
        let mut jobs = self.read()?.jobs.clone();
        for write in &self.staged {
            match write {
                StagedWrite::CreateJob(record) => {
                    jobs.insert(record.id, record.clone());
                }
                StagedWrite::UpdateJob { id, update, at } => {
                    if let Some(record) = jobs.get_mut(id) {
                        record.apply(update, *at);
                    }
                }
                StagedWrite::Associations { .. } => {}
            }
        }
        Ok(jobs)
    }

    fn oldest_active(
        &self,
        matches: impl Fn(&JobRecord) -> bool,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut active: Vec<JobRecord> = self
            .jobs_view()?
            .into_values()
            .filter(|job| job.status == JobStatus::Active && matches(job))
            .collect();
        active.sort_by_key(|job| (job.created_at, job.id));
        Ok(active.into_iter().next())
    }
}

fn members(tables: &Tables, collection: CollectionId) -> impl Iterator<Item = CompanyId> + '_ {
    tables
        .associations
        .range((collection, CompanyId::new(i64::MIN))..=(collection, CompanyId::new(i64::MAX)))
        .map(|(_, company)| *company)
}

impl Session for InMemorySession {
    fn eligible_companies(
        &mut self,
        source: CollectionId,
        selected: &[CompanyId],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CompanyId>, StoreError> {
        let mut eligible: BTreeSet<CompanyId> = members(&*self.read()?, source).collect();
        eligible.extend(self.staged_members(source));

        Ok(eligible
            .into_iter()
            .filter(|company| selected.is_empty() || selected.contains(company))
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    fn insert_associations(
        &mut self,
        target: CollectionId,
        companies: &[CompanyId],
    ) -> Result<u64, StoreError> {
        let mut existing: BTreeSet<CompanyId> = {
            let tables = self.read()?;
            if !tables.collections.contains_key(&target) {
                return Err(StoreError::Constraint(format!(
                    "collection {target} does not exist"
                )));
            }
            members(&tables, target).collect()
        };
        existing.extend(self.staged_members(target));

        let fresh: Vec<CompanyId> = companies
            .iter()
            .copied()
            .filter(|company| existing.insert(*company))
            .collect();
        let inserted = fresh.len() as u64;

        if !fresh.is_empty() {
            self.staged.push(StagedWrite::Associations {
                target,
                companies: fresh,
            });
        }
        Ok(inserted)
    }

    fn collection_exists(&mut self, collection: CollectionId) -> Result<bool, StoreError> {
        Ok(self.read()?.collections.contains_key(&collection))
    }

    fn create_job(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        if self.jobs_view()?.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", record.id)));
        }
        self.staged.push(StagedWrite::CreateJob(record.clone()));
        Ok(())
    }

    fn update_job(&mut self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        if !self.jobs_view()?.contains_key(&id) {
            return Err(StoreError::JobNotFound(id));
        }
        self.staged.push(StagedWrite::UpdateJob {
            id,
            update: update.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn get_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs_view()?.remove(&id))
    }

    fn find_overlapping_active_job(
        &mut self,
        source: CollectionId,
        target: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.oldest_active(|job| job.overlaps(source, target))
    }

    fn active_job_for_collection(
        &mut self,
        collection: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.oldest_active(|job| job.touches(collection))
    }

    fn list_active_jobs(&mut self) -> Result<Vec<JobRecord>, StoreError> {
        let mut active: Vec<JobRecord> = self
            .jobs_view()?
            .into_values()
            .filter(|job| job.status == JobStatus::Active)
            .collect();
        active.sort_by_key(|job| (job.created_at, job.id));
        Ok(active)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;

        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Storage("in-memory tables poisoned".to_string()))?;

        // Validate against the latest committed state before applying anything.
        for write in &self.staged {
            match write {
                StagedWrite::CreateJob(record) if tables.jobs.contains_key(&record.id) => {
                    return Err(StoreError::Conflict(format!(
                        "job {} already exists",
                        record.id
                    )));
                }
                StagedWrite::UpdateJob { id, .. }
                    if !tables.jobs.contains_key(id) && !self.creates(*id) =>
                {
                    return Err(StoreError::JobNotFound(*id));
                }
                _ => {}
            }
        }

        for write in self.staged.drain(..) {
            match write {
                StagedWrite::Associations { target, companies } => {
                    for company in companies {
                        tables.associations.insert((target, company));
                    }
                }
                StagedWrite::CreateJob(record) => {
                    tables.jobs.insert(record.id, record);
                }
                StagedWrite::UpdateJob { id, update, at } => {
                    if let Some(record) = tables.jobs.get_mut(&id) {
                        record.apply(&update, at);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        self.staged.clear();
        Ok(())
    }
}

impl InMemorySession {
    fn creates(&self, id: JobId) -> bool {
        self.staged
            .iter()
            .any(|write| matches!(write, StagedWrite::CreateJob(record) if record.id == id))
    }
}
