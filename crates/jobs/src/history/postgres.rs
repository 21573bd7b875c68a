//! Postgres-backed history and dead-letter store.
//!
//! `job_history` is append-only. `dead_letters` rows are only ever updated
//! by acknowledgement and never deleted here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;

use bizops_core::{TenantId, UserId};

use super::{DeadLetter, HistoryFilter, HistoryPage, HistoryStatus, HistoryStore, JobHistory, JobMetrics};
use crate::queue::QueueError;
use crate::queue::postgres::{map_sqlx_error, to_i32, to_u32};
use crate::types::{DeadLetterId, HistoryId, JobId, ScheduleId};

const HISTORY_COLUMNS: &str = r#"
    id, job_id, tenant_id, job_type, payload, status, result, error, attempts,
    started_at, completed_at, duration_ms, worker_id, schedule_id
"#;

const DEAD_LETTER_COLUMNS: &str = r#"
    id, job_id, tenant_id, job_type, payload, errors, total_attempts,
    first_attempted_at, last_attempted_at, acknowledged, acknowledged_by,
    acknowledged_at, created_at
"#;

/// Postgres-backed [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: Arc<PgPool>,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

/// Append one history row.
pub(crate) async fn insert_history(
    conn: &mut PgConnection,
    entry: &JobHistory,
) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        INSERT INTO job_history (
            id, job_id, tenant_id, job_type, payload, status, result, error, attempts,
            started_at, completed_at, duration_ms, worker_id, schedule_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.job_id.as_uuid())
    .bind(entry.tenant_id.as_uuid())
    .bind(&entry.job_type)
    .bind(&entry.payload)
    .bind(entry.status.as_str())
    .bind(&entry.result)
    .bind(&entry.error)
    .bind(to_i32("attempts", entry.attempts)?)
    .bind(entry.started_at)
    .bind(entry.completed_at)
    .bind(entry.duration_ms)
    .bind(&entry.worker_id)
    .bind(entry.schedule_id.map(|s| s.0))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_history", e))?;
    Ok(())
}

/// Insert the dead letter for a job that just died.
pub(crate) async fn insert_dead_letter(
    conn: &mut PgConnection,
    dead_letter: &DeadLetter,
) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (
            id, job_id, tenant_id, job_type, payload, errors, total_attempts,
            first_attempted_at, last_attempted_at, acknowledged, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10)
        "#,
    )
    .bind(dead_letter.id.as_uuid())
    .bind(dead_letter.job_id.as_uuid())
    .bind(dead_letter.tenant_id.as_uuid())
    .bind(&dead_letter.job_type)
    .bind(&dead_letter.payload)
    .bind(&dead_letter.errors)
    .bind(to_i32("total_attempts", dead_letter.total_attempts)?)
    .bind(dead_letter.first_attempted_at)
    .bind(dead_letter.last_attempted_at)
    .bind(dead_letter.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self), err)]
    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, QueueError> {
        // Optional predicates collapse to TRUE when their parameter is NULL,
        // so a single parameterized statement serves every filter combination.
        const PREDICATES: &str = r#"
            ($1::uuid IS NULL OR tenant_id = $1)
            AND ($2::text IS NULL OR job_type = $2)
            AND ($3::text IS NULL OR status = $3)
            AND ($4::timestamptz IS NULL OR started_at >= $4)
            AND ($5::timestamptz IS NULL OR started_at < $5)
            AND ($6::uuid IS NULL OR schedule_id = $6)
        "#;

        let tenant = filter.tenant_id.map(|t| *t.as_uuid());
        let status = filter.status.map(|s| s.as_str());
        let schedule = filter.schedule_id.map(|s| s.0);

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM job_history WHERE {PREDICATES}"
        ))
        .bind(tenant)
        .bind(filter.job_type.as_deref())
        .bind(status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(schedule)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_history", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM job_history
            WHERE {PREDICATES}
            ORDER BY started_at DESC, id DESC
            LIMIT $7 OFFSET $8
            "#
        ))
        .bind(tenant)
        .bind(filter.job_type.as_deref())
        .bind(status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(schedule)
        .bind(i64::from(filter.effective_limit()))
        .bind(i64::from(filter.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_history", e))?;

        let items = rows
            .iter()
            .map(history_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HistoryPage {
            items,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, history_id = %history_id), err)]
    async fn get_history(
        &self,
        tenant_id: TenantId,
        history_id: HistoryId,
    ) -> Result<Option<JobHistory>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM job_history WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(history_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_history", e))?;

        row.as_ref().map(history_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        acknowledged: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE tenant_id = $1 AND acknowledged = $2
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(acknowledged)
        .bind(i64::from(limit.clamp(1, super::MAX_PAGE_SIZE)))
        .bind(i64::from(offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, dead_letter_id = %dead_letter_id, user_id = %user_id),
        err
    )]
    async fn acknowledge_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        user_id: UserId,
    ) -> Result<DeadLetter, QueueError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE dead_letters
            SET acknowledged = TRUE, acknowledged_by = $3, acknowledged_at = $4
            WHERE id = $1 AND tenant_id = $2 AND acknowledged = FALSE
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        ))
        .bind(dead_letter_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acknowledge_dead_letter", e))?;

        match row {
            Some(row) => dead_letter_from_row(&row),
            None => Err(QueueError::NotFound(format!(
                "unacknowledged dead letter {dead_letter_id}"
            ))),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn metrics(&self, tenant_id: TenantId) -> Result<JobMetrics, QueueError> {
        let since = Utc::now() - chrono::Duration::hours(24);

        let queue = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'running') AS running
            FROM jobs
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("metrics_queue", e))?;

        let recent = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS succeeded,
                COALESCE(AVG(duration_ms), 0)::float8 AS avg_duration_ms
            FROM job_history
            WHERE tenant_id = $1 AND completed_at >= $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("metrics_history", e))?;

        let dead_letter_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dead_letters WHERE tenant_id = $1 AND acknowledged = FALSE",
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("metrics_dead_letters", e))?;

        let count = |row: &sqlx::postgres::PgRow, column: &str| -> Result<u64, QueueError> {
            row.try_get::<i64, _>(column)
                .map(|v| v.max(0) as u64)
                .map_err(|e| QueueError::InvalidRow(format!("metrics.{column}: {e}")))
        };

        let total = count(&recent, "total")?;
        let succeeded = count(&recent, "succeeded")?;
        let avg_duration_ms: f64 = recent
            .try_get("avg_duration_ms")
            .map_err(|e| QueueError::InvalidRow(format!("metrics.avg_duration_ms: {e}")))?;

        Ok(JobMetrics {
            pending_count: count(&queue, "pending")?,
            running_count: count(&queue, "running")?,
            jobs_last_24h: total,
            success_last_24h: succeeded,
            success_rate: JobMetrics::success_rate(total, succeeded),
            avg_duration_ms,
            dead_letter_count: dead_letter_count.max(0) as u64,
        })
    }
}

// SQLx row mapping

fn history_from_row(row: &sqlx::postgres::PgRow) -> Result<JobHistory, QueueError> {
    let decode = |e: sqlx::Error| QueueError::InvalidRow(format!("job_history: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let started_at: DateTime<Utc> = row.try_get("started_at").map_err(decode)?;
    let schedule_id: Option<uuid::Uuid> = row.try_get("schedule_id").map_err(decode)?;

    Ok(JobHistory {
        id: HistoryId::from_uuid(row.try_get("id").map_err(decode)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status: status.parse::<HistoryStatus>().map_err(QueueError::InvalidRow)?,
        result: row.try_get("result").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        attempts: to_u32("attempts", row.try_get("attempts").map_err(decode)?)?,
        started_at,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        duration_ms: row.try_get("duration_ms").map_err(decode)?,
        worker_id: row.try_get("worker_id").map_err(decode)?,
        schedule_id: schedule_id.map(ScheduleId::from_uuid),
    })
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, QueueError> {
    let decode = |e: sqlx::Error| QueueError::InvalidRow(format!("dead_letters: {e}"));

    let acknowledged_by: Option<uuid::Uuid> = row.try_get("acknowledged_by").map_err(decode)?;

    Ok(DeadLetter {
        id: DeadLetterId::from_uuid(row.try_get("id").map_err(decode)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        errors: row.try_get("errors").map_err(decode)?,
        total_attempts: to_u32("total_attempts", row.try_get("total_attempts").map_err(decode)?)?,
        first_attempted_at: row.try_get("first_attempted_at").map_err(decode)?,
        last_attempted_at: row.try_get("last_attempted_at").map_err(decode)?,
        acknowledged: row.try_get("acknowledged").map_err(decode)?,
        acknowledged_by: acknowledged_by.map(UserId::from_uuid),
        acknowledged_at: row.try_get("acknowledged_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}
