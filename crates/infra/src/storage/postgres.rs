//! Postgres-backed storage.
//!
//! Each [`PostgresSession`] wraps one SQLx transaction. Workers are plain OS threads,
//! so every statement is driven to completion with `Handle::block_on` on the runtime
//! that owns the connection pool. Do not call into this store from a task running on
//! that same runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! The duplicate `(company_id, collection_id)` pair is never surfaced as a conflict:
//! the association insert resolves it with `ON CONFLICT DO NOTHING`.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use collectionjobs_core::{CollectionId, CompanyId, JobId};

use super::{Session, Storage, StoreError};
use crate::jobs::message::MessageType;
use crate::jobs::types::{JobRecord, JobStatus, JobUpdate};

const JOB_COLUMNS: &str = r#"
    id,
    job_type,
    status,
    message,
    state,
    source_collection_id,
    target_collection_id,
    created_at,
    updated_at
"#;

/// Postgres-backed storage.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; each session checks out one
/// connection for the lifetime of its transaction.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresStorage {
    /// Create a store that drives queries on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the collection and job tables if they are missing.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

const SCHEMA: &str = include_str!("../../migrations/0001_collection_jobs.sql");

impl Storage for PostgresStorage {
    type Session = PostgresSession;

    fn begin(&self) -> Result<Self::Session, StoreError> {
        let tx = self
            .runtime
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;

        Ok(PostgresSession {
            tx: Some(tx),
            runtime: self.runtime.clone(),
        })
    }
}

/// One Postgres transaction. Dropping it without commit rolls it back.
#[derive(Debug)]
pub struct PostgresSession {
    tx: Option<Transaction<'static, Postgres>>,
    runtime: Handle,
}

impl PostgresSession {
    fn parts(&mut self) -> Result<(&Handle, &mut Transaction<'static, Postgres>), StoreError> {
        let tx = self.tx.as_mut().ok_or(StoreError::TransactionFinished)?;
        Ok((&self.runtime, tx))
    }

    fn fetch_jobs(&mut self, sql: &str, collections: &[CollectionId]) -> Result<Vec<JobRecord>, StoreError> {
        let (runtime, tx) = self.parts()?;
        let ids: Vec<uuid::Uuid> = collections.iter().map(|c| *c.as_uuid()).collect();

        let rows = runtime
            .block_on(async {
                let mut query = sqlx::query(sql);
                for id in &ids {
                    query = query.bind(id);
                }
                query.fetch_all(&mut **tx).await
            })
            .map_err(|e| map_sqlx_error("fetch_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

impl Session for PostgresSession {
    #[instrument(skip(self, selected), fields(source = %source, selected = selected.len()), err)]
    fn eligible_companies(
        &mut self,
        source: CollectionId,
        selected: &[CompanyId],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<CompanyId>, StoreError> {
        let (runtime, tx) = self.parts()?;
        let selected: Vec<i64> = selected.iter().map(CompanyId::get).collect();

        let rows = runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT company_id
                    FROM company_collection_associations
                    WHERE collection_id = $1
                      AND (cardinality($2::bigint[]) = 0 OR company_id = ANY($2::bigint[]))
                    ORDER BY company_id ASC
                    OFFSET $3
                    LIMIT $4
                    "#,
                )
                .bind(source.as_uuid())
                .bind(&selected)
                .bind(to_i64(offset)?)
                .bind(to_i64(limit)?)
                .fetch_all(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("eligible_companies", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("company_id")
                    .map(CompanyId::new)
                    .map_err(|e| map_sqlx_error("eligible_companies", e))
            })
            .collect()
    }

    #[instrument(skip(self, companies), fields(target = %target, batch = companies.len()), err)]
    fn insert_associations(
        &mut self,
        target: CollectionId,
        companies: &[CompanyId],
    ) -> Result<u64, StoreError> {
        if companies.is_empty() {
            return Ok(0);
        }
        let (runtime, tx) = self.parts()?;
        let companies: Vec<i64> = companies.iter().map(CompanyId::get).collect();

        let result = runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO company_collection_associations (company_id, collection_id)
                    SELECT company_id, $2
                    FROM UNNEST($1::bigint[]) AS batch(company_id)
                    ON CONFLICT (company_id, collection_id) DO NOTHING
                    "#,
                )
                .bind(&companies)
                .bind(target.as_uuid())
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("insert_associations", e))?;

        debug!(inserted = result.rows_affected(), "inserted associations");
        Ok(result.rows_affected())
    }

    fn collection_exists(&mut self, collection: CollectionId) -> Result<bool, StoreError> {
        let (runtime, tx) = self.parts()?;

        let row = runtime
            .block_on(
                sqlx::query("SELECT EXISTS (SELECT 1 FROM company_collections WHERE id = $1) AS present")
                    .bind(collection.as_uuid())
                    .fetch_one(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("collection_exists", e))?;

        row.try_get::<bool, _>("present")
            .map_err(|e| map_sqlx_error("collection_exists", e))
    }

    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    fn create_job(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let (runtime, tx) = self.parts()?;

        runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        id,
                        job_type,
                        status,
                        message,
                        state,
                        source_collection_id,
                        target_collection_id,
                        created_at,
                        updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(record.id.as_uuid())
                .bind(record.job_type.as_str())
                .bind(record.status.as_str())
                .bind(&record.message)
                .bind(Json(&record.state))
                .bind(record.source_collection_id.as_uuid())
                .bind(record.target_collection_id.as_uuid())
                .bind(record.created_at)
                .bind(record.updated_at)
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("create_job", e))?;

        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %id), err)]
    fn update_job(&mut self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        let (runtime, tx) = self.parts()?;

        let result = runtime
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = COALESCE($2, status),
                        message = COALESCE($3, message),
                        state = COALESCE($4, state),
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(update.status.map(|s| s.as_str()))
                .bind(update.message.as_deref())
                .bind(update.state.as_ref().map(Json))
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    fn get_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let (runtime, tx) = self.parts()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");

        let row = runtime
            .block_on(sqlx::query(&sql).bind(id.as_uuid()).fetch_optional(&mut **tx))
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    fn find_overlapping_active_job(
        &mut self,
        source: CollectionId,
        target: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'active'
              AND (source_collection_id = $1 OR target_collection_id = $2)
            ORDER BY created_at ASC
            LIMIT 1
            "#
        );
        Ok(self.fetch_jobs(&sql, &[source, target])?.into_iter().next())
    }

    fn active_job_for_collection(
        &mut self,
        collection: CollectionId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'active'
              AND (source_collection_id = $1 OR target_collection_id = $1)
            ORDER BY created_at ASC
            LIMIT 1
            "#
        );
        Ok(self.fetch_jobs(&sql, &[collection])?.into_iter().next())
    }

    fn list_active_jobs(&mut self) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'active' ORDER BY created_at ASC"
        );
        self.fetch_jobs(&sql, &[])
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        self.runtime
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit", e))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        self.runtime
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Storage(format!("value out of range: {value}")))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode job row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let state: Json<serde_json::Value> = row.try_get("state").map_err(decode)?;

    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: MessageType::from(job_type),
        status,
        message: row.try_get("message").map_err(decode)?,
        state: state.0,
        source_collection_id: CollectionId::from_uuid(
            row.try_get("source_collection_id").map_err(decode)?,
        ),
        target_collection_id: CollectionId::from_uuid(
            row.try_get("target_collection_id").map_err(decode)?,
        ),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
