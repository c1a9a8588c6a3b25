//! Core job types: durable job records and the import job's resumption state.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use collectionjobs_core::{CollectionId, CompanyId, DomainError, JobId};

use super::message::MessageType;

/// Job status as persisted on the job record.
///
/// There is no failed state: a job whose batch keeps failing stays `Active`
/// with the progress of its last committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and still has work left
    Active,
    /// Last batch observed no remaining work
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Durable record of a job.
///
/// `state` holds the same shape as the payload of the job's latest message, so a
/// restarted process can rebuild the message from the record alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: MessageType,
    pub status: JobStatus,
    /// Human-readable progress, e.g. "50 items"
    pub message: String,
    pub state: serde_json::Value,
    pub source_collection_id: CollectionId,
    pub target_collection_id: CollectionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// New `active` record for an import job that has not run any batch yet.
    pub fn new_import(id: JobId, state: &ImportState) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            id,
            job_type: MessageType::ImportCompaniesToCollection,
            status: JobStatus::Active,
            message: progress_message(state.cursor),
            state: serde_json::to_value(state)?,
            source_collection_id: state.source_collection_id,
            target_collection_id: state.target_collection_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &JobUpdate, at: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(message) = &update.message {
            self.message = message.clone();
        }
        if let Some(state) = &update.state {
            self.state = state.clone();
        }
        self.updated_at = at;
    }

    /// Whether this record and a prospective job would touch the same collections.
    ///
    /// Two jobs overlap when they read from the same source or write to the same target.
    pub fn overlaps(&self, source: CollectionId, target: CollectionId) -> bool {
        self.source_collection_id == source || self.target_collection_id == target
    }

    pub fn touches(&self, collection: CollectionId) -> bool {
        self.source_collection_id == collection || self.target_collection_id == collection
    }
}

/// Partial update of a job record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub message: Option<String>,
    pub state: Option<serde_json::Value>,
}

/// Resumption state of an import job.
///
/// `cursor` counts the source rows inspected so far. It only ever grows, and it
/// includes rows that were already present in the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    pub source_collection_id: CollectionId,
    pub target_collection_id: CollectionId,
    /// Allow-list of source members to copy; empty means all of them.
    #[serde(default)]
    pub selected_company_ids: Vec<CompanyId>,
    #[serde(default)]
    pub cursor: u64,
}

impl ImportState {
    pub fn new(
        source_collection_id: CollectionId,
        target_collection_id: CollectionId,
        selected_company_ids: Vec<CompanyId>,
    ) -> Self {
        Self {
            source_collection_id,
            target_collection_id,
            selected_company_ids,
            cursor: 0,
        }
    }
}

/// Progress string stored on the job record.
pub fn progress_message(cursor: u64) -> String {
    format!("{cursor} items")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [JobStatus::Active, JobStatus::Completed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("failed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn state_defaults_missing_cursor_and_selection() {
        let source = CollectionId::new();
        let target = CollectionId::new();
        let json = serde_json::json!({
            "source_collection_id": source,
            "target_collection_id": target,
        });

        let state: ImportState = serde_json::from_value(json).unwrap();
        assert_eq!(state.cursor, 0);
        assert!(state.selected_company_ids.is_empty());
    }

    #[test]
    fn new_import_record_starts_active_with_zero_items() {
        let state = ImportState::new(CollectionId::new(), CollectionId::new(), vec![]);
        let record = JobRecord::new_import(JobId::new(), &state).unwrap();

        assert_eq!(record.status, JobStatus::Active);
        assert_eq!(record.message, "0 items");
        assert_eq!(record.state["cursor"], 0);
    }

    #[test]
    fn apply_only_touches_provided_fields() {
        let state = ImportState::new(CollectionId::new(), CollectionId::new(), vec![]);
        let mut record = JobRecord::new_import(JobId::new(), &state).unwrap();
        let before = record.clone();

        record.apply(
            &JobUpdate {
                message: Some(progress_message(25)),
                ..Default::default()
            },
            Utc::now(),
        );

        assert_eq!(record.status, before.status);
        assert_eq!(record.state, before.state);
        assert_eq!(record.message, "25 items");
    }

    #[test]
    fn overlap_matches_same_source_or_same_target() {
        let (a, b, c) = (CollectionId::new(), CollectionId::new(), CollectionId::new());
        let record = JobRecord::new_import(JobId::new(), &ImportState::new(a, b, vec![])).unwrap();

        assert!(record.overlaps(a, c));
        assert!(record.overlaps(c, b));
        assert!(!record.overlaps(c, a));
        assert!(record.touches(a));
        assert!(!record.touches(c));
    }
}
