//! Postgres-backed durable queue.
//!
//! ## Locking
//!
//! Every mutation of a `jobs` row happens inside a transaction holding that
//! row's lock:
//!
//! - `dequeue` selects with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//!   never claim the same row and never wait on each other
//! - `complete`/`fail` lock the row by id (`FOR UPDATE`) and re-check the
//!   caller's [`Claim`]; a reclaimed or finished attempt changes nothing
//! - `move_to_dead_letter` locks the row and skips terminal jobs
//! - `cleanup_stale_jobs` skips rows another reaper is already handling
//!
//! ## Error Mapping
//!
//! | Outcome                                   | QueueError        |
//! |-------------------------------------------|-------------------|
//! | Option outside `INTEGER` range            | `InvalidOptions`  |
//! | `ON CONFLICT` on idempotency key, no row  | `Duplicate`       |
//! | Column decode failure                     | `InvalidRow`      |
//! | Anything else (other constraint failures) | `Database`        |
//!
//! History appends after a terminal transition run after the commit; their
//! failure is logged and does not undo the transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use bizops_core::TenantId;

use super::{
    FailOutcome, JobQueue, QueueError, STALE_JOB_ERROR, claim_holds, lifecycle, retention_cutoff,
    validate_options,
};
use crate::history::postgres::{insert_dead_letter, insert_history};
use crate::history::{DeadLetter, JobHistory};
use crate::types::{Claim, EnqueueOptions, FailureDecision, Job, JobId, JobState, ScheduleId};

const JOB_COLUMNS: &str = r#"
    id, tenant_id, job_type, payload, priority, state, max_retries, retry_count,
    last_error, errors, run_at, started_at, first_started_at, completed_at,
    timeout_seconds, worker_id, idempotency_key, schedule_id, created_at, updated_at
"#;

/// Postgres-backed [`JobQueue`].
///
/// `Send + Sync`; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Best-effort history append outside the transition's transaction.
    async fn append_history(&self, job: &Job, entry: &JobHistory) {
        let result = match self.pool.acquire().await {
            Ok(mut conn) => insert_history(&mut conn, entry).await,
            Err(e) => Err(map_sqlx_error("acquire", e)),
        };
        if let Err(e) = result {
            lifecycle::history_append_failed(job, &e);
        }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, payload, opts), fields(tenant_id = %tenant_id), err)]
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        job_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        validate_options(&opts)?;
        let job = Job::new(tenant_id, job_type, payload, opts, Utc::now());

        let inserted = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            INSERT INTO jobs (
                id, tenant_id, job_type, payload, priority, state, max_retries, retry_count,
                errors, run_at, timeout_seconds, idempotency_key, schedule_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, '{}', $7, $8, $9, $10, $11, $11)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(to_i32("max_retries", job.max_retries)?)
        .bind(job.run_at)
        .bind(to_i32("timeout_seconds", job.timeout_seconds)?)
        .bind(&job.idempotency_key)
        .bind(job.schedule_id.map(|s| s.0))
        .bind(job.created_at)
        .fetch_optional(&*self.pool)
        .await;

        match inserted {
            Ok(Some(_)) => {
                lifecycle::enqueued(&job);
                Ok(job)
            }
            Ok(None) => {
                let key = job.idempotency_key.unwrap_or_default();
                lifecycle::duplicate(&tenant_id, job_type, &key);
                Err(QueueError::Duplicate { key })
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut tx = self.begin("dequeue").await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'pending' AND run_at <= $1
            ORDER BY priority DESC, run_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dequeue_select", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        job.mark_running(worker_id, now);
        write_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("dequeue_commit", e))?;

        lifecycle::dequeued(&job);
        Ok(Some(job))
    }

    #[instrument(skip(self, result), fields(job_id = %claim.job_id, worker_id = %claim.worker_id), err)]
    async fn complete(&self, claim: &Claim, result: Option<Vec<u8>>) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut tx = self.begin("complete").await?;

        let Some(mut job) = lock_job(&mut tx, claim.job_id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueError::JobNotFound(claim.job_id));
        };

        if !claim_holds(&job, claim, "complete") {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(());
        }

        job.mark_completed(now);
        write_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("complete_commit", e))?;
        lifecycle::completed(&job);

        self.append_history(&job, &JobHistory::completed(&job, result, now))
            .await;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %claim.job_id, worker_id = %claim.worker_id), err)]
    async fn fail(&self, claim: &Claim, error: &str) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let mut tx = self.begin("fail").await?;

        let Some(mut job) = lock_job(&mut tx, claim.job_id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueError::JobNotFound(claim.job_id));
        };

        if !claim_holds(&job, claim, "fail") {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(FailOutcome::Ignored);
        }

        let worker_id = job.worker_id.clone();
        let (outcome, history) = apply_failure(&mut tx, &mut job, error, now).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("fail_commit", e))?;

        lifecycle::failed(&job, worker_id.as_deref(), error, &outcome);
        if let Some(entry) = history {
            self.append_history(&job, &entry).await;
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn move_to_dead_letter(&self, job_id: JobId, final_error: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut tx = self.begin("move_to_dead_letter").await?;

        let Some(mut job) = lock_job(&mut tx, job_id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueError::JobNotFound(job_id));
        };

        if job.state.is_terminal() {
            lifecycle::not_running(&job, "move_to_dead_letter");
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(());
        }

        let worker_id = job.worker_id.clone();
        let entry = dead_letter(&mut tx, &mut job, final_error, now).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter_commit", e))?;

        lifecycle::failed(&job, worker_id.as_deref(), final_error, &FailOutcome::DeadLettered);
        self.append_history(&job, &entry).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn cleanup_stale_jobs(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut tx = self.begin("cleanup_stale_jobs").await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = 'running'
              AND started_at + timeout_seconds * INTERVAL '1 second' < $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cleanup_stale_select", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = job_from_row(row)?;
            let worker_id = job.worker_id.clone();
            lifecycle::stale_reclaimed(&job, worker_id.as_deref());
            let (outcome, history) = apply_failure(&mut tx, &mut job, STALE_JOB_ERROR, now).await?;
            reclaimed.push((job, worker_id, outcome, history));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cleanup_stale_commit", e))?;

        for (job, worker_id, outcome, history) in &reclaimed {
            lifecycle::failed(job, worker_id.as_deref(), STALE_JOB_ERROR, outcome);
            if let Some(entry) = history {
                self.append_history(job, entry).await;
            }
        }

        Ok(reclaimed.len() as u64)
    }

    #[instrument(skip(self), err)]
    async fn delete_completed_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = retention_cutoff(Utc::now(), older_than);

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'dead') AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_completed_jobs", e))?;

        Ok(result.rows_affected())
    }

    async fn queue_length(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'pending'")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_length", e))?;
        Ok(count.max(0) as u64)
    }

    async fn queue_length_by_type(&self, job_type: &str) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE state = 'pending' AND job_type = $1",
        )
        .bind(job_type)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_length_by_type", e))?;
        Ok(count.max(0) as u64)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }
}

/// Lock one row by id for the rest of the transaction.
async fn lock_job(conn: &mut PgConnection, job_id: JobId) -> Result<Option<Job>, QueueError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;

    row.as_ref().map(job_from_row).transpose()
}

/// Persist the mutable columns of a job.
async fn write_job(conn: &mut PgConnection, job: &Job) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = $2,
            retry_count = $3,
            last_error = $4,
            errors = $5,
            run_at = $6,
            started_at = $7,
            first_started_at = $8,
            completed_at = $9,
            worker_id = $10,
            updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.state.as_str())
    .bind(to_i32("retry_count", job.retry_count)?)
    .bind(&job.last_error)
    .bind(&job.errors)
    .bind(job.run_at)
    .bind(job.started_at)
    .bind(job.first_started_at)
    .bind(job.completed_at)
    .bind(&job.worker_id)
    .bind(job.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

/// Retry or dead-letter a locked job. Returns the history row to append after commit.
async fn apply_failure(
    conn: &mut PgConnection,
    job: &mut Job,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(FailOutcome, Option<JobHistory>), QueueError> {
    match job.failure_decision(now) {
        FailureDecision::Retry {
            retry_count,
            run_at,
        } => {
            job.mark_retry(error, retry_count, run_at, now);
            write_job(conn, job).await?;
            Ok((
                FailOutcome::Retrying {
                    retry_count,
                    run_at,
                },
                None,
            ))
        }
        FailureDecision::DeadLetter => {
            let history = dead_letter(conn, job, error, now).await?;
            Ok((FailOutcome::DeadLettered, Some(history)))
        }
    }
}

async fn dead_letter(
    conn: &mut PgConnection,
    job: &mut Job,
    final_error: &str,
    now: DateTime<Utc>,
) -> Result<JobHistory, QueueError> {
    job.mark_dead(final_error, now);
    write_job(conn, job).await?;
    insert_dead_letter(conn, &DeadLetter::from_dead_job(job, now)).await?;
    Ok(JobHistory::failed(job, final_error, now))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => QueueError::Database(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::ColumnDecode { index, source } => {
            QueueError::InvalidRow(format!("{operation}: column {index}: {source}"))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Database(format!("connection pool closed during {operation}"))
        }
        other => QueueError::Database(format!("{operation}: {other}")),
    }
}

pub(crate) fn to_i32(column: &str, value: u32) -> Result<i32, QueueError> {
    i32::try_from(value).map_err(|_| QueueError::InvalidRow(format!("{column} out of range: {value}")))
}

pub(crate) fn to_u32(column: &str, value: i32) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::InvalidRow(format!("{column} is negative: {value}")))
}

// SQLx row mapping

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, QueueError> {
    let decode = |e: sqlx::Error| QueueError::InvalidRow(format!("jobs: {e}"));

    let state: String = row.try_get("state").map_err(decode)?;
    let schedule_id: Option<uuid::Uuid> = row.try_get("schedule_id").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        priority: row.try_get("priority").map_err(decode)?,
        state: state.parse::<JobState>().map_err(QueueError::InvalidRow)?,
        max_retries: to_u32("max_retries", row.try_get("max_retries").map_err(decode)?)?,
        retry_count: to_u32("retry_count", row.try_get("retry_count").map_err(decode)?)?,
        last_error: row.try_get("last_error").map_err(decode)?,
        errors: row.try_get("errors").map_err(decode)?,
        run_at: row.try_get("run_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        first_started_at: row.try_get("first_started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        timeout_seconds: to_u32("timeout_seconds", row.try_get("timeout_seconds").map_err(decode)?)?,
        worker_id: row.try_get("worker_id").map_err(decode)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        schedule_id: schedule_id.map(ScheduleId::from_uuid),
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}
