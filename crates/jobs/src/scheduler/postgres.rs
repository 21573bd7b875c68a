//! Postgres-backed schedule store.
//!
//! `claim_due` opens a transaction and locks due rows with
//! `FOR UPDATE SKIP LOCKED`; a second scheduler ticking at the same moment
//! sees only the rows nobody holds. The batch's writes commit together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use bizops_core::TenantId;

use super::SchedulerError;
use super::cron::ScheduleInterval;
use super::schedule::Schedule;
use super::store::{DueSchedules, ScheduleStore};
use crate::types::ScheduleId;

const SCHEDULE_COLUMNS: &str = r#"
    id, tenant_id, name, job_type, payload_template, cron_expression, interval_tag,
    enabled, timezone, last_run_at, next_run_at, run_count, fail_count, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresScheduleStore {
    pool: Arc<PgPool>,
}

impl PostgresScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id, tenant_id = %schedule.tenant_id), err)]
    async fn insert(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, tenant_id, name, job_type, payload_template, cron_expression, interval_tag,
                enabled, timezone, last_run_at, next_run_at, run_count, fail_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.tenant_id.as_uuid())
        .bind(&schedule.name)
        .bind(&schedule.job_type)
        .bind(&schedule.payload_template)
        .bind(&schedule.cron_expression)
        .bind(schedule.interval.map(|i| i.as_str()))
        .bind(schedule.enabled)
        .bind(&schedule.timezone)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(i32::try_from(schedule.run_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(schedule.fail_count).unwrap_or(i32::MAX))
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_schedule", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id), err)]
    async fn get(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Option<Schedule>, SchedulerError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(schedule_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_schedule", e))?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id, tenant_id = %schedule.tenant_id), err)]
    async fn update(&self, schedule: &Schedule) -> Result<bool, SchedulerError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET name = $3,
                job_type = $4,
                payload_template = $5,
                cron_expression = $6,
                interval_tag = $7,
                enabled = $8,
                timezone = $9,
                next_run_at = $10,
                updated_at = $11
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.tenant_id.as_uuid())
        .bind(&schedule.name)
        .bind(&schedule.job_type)
        .bind(&schedule.payload_template)
        .bind(&schedule.cron_expression)
        .bind(schedule.interval.map(|i| i.as_str()))
        .bind(schedule.enabled)
        .bind(&schedule.timezone)
        .bind(schedule.next_run_at)
        .bind(schedule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_schedule", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, schedule_id = %schedule_id), err)]
    async fn delete(&self, tenant_id: TenantId, schedule_id: ScheduleId) -> Result<bool, SchedulerError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1 AND tenant_id = $2")
            .bind(schedule_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_schedule", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<Schedule>, SchedulerError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE tenant_id = $1 ORDER BY name, id"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_schedules", e))?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Box<dyn DueSchedules>, SchedulerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_due_begin", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE enabled AND next_run_at <= $1
            ORDER BY next_run_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let schedules = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(PostgresDueSchedules { tx, schedules }))
    }
}

struct PostgresDueSchedules {
    tx: Transaction<'static, Postgres>,
    schedules: Vec<Schedule>,
}

#[async_trait]
impl DueSchedules for PostgresDueSchedules {
    fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    async fn record_run(
        &mut self,
        schedule_id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        // A savepoint keeps one failed update from aborting the whole batch.
        let mut savepoint = self
            .tx
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_run_savepoint", e))?;
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = $2, next_run_at = $3, run_count = run_count + 1, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(schedule_id.as_uuid())
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&mut *savepoint)
        .await
        .map_err(|e| map_sqlx_error("record_run", e))?;
        savepoint
            .commit()
            .await
            .map_err(|e| map_sqlx_error("record_run_release", e))
    }

    async fn record_failure(
        &mut self,
        schedule_id: ScheduleId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut savepoint = self
            .tx
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_failure_savepoint", e))?;
        sqlx::query(
            "UPDATE schedules SET fail_count = fail_count + 1, updated_at = $2 WHERE id = $1",
        )
        .bind(schedule_id.as_uuid())
        .bind(at)
        .execute(&mut *savepoint)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;
        savepoint
            .commit()
            .await
            .map_err(|e| map_sqlx_error("record_failure_release", e))
    }

    async fn commit(self: Box<Self>) -> Result<(), SchedulerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("claim_due_commit", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SchedulerError {
    match err {
        sqlx::Error::Database(db_err) => SchedulerError::Database(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        other => SchedulerError::Database(format!("{operation}: {other}")),
    }
}

fn to_u32(column: &str, value: i32) -> Result<u32, SchedulerError> {
    u32::try_from(value)
        .map_err(|_| SchedulerError::Database(format!("schedules.{column} is negative: {value}")))
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<Schedule, SchedulerError> {
    let decode = |e: sqlx::Error| SchedulerError::Database(format!("schedules: {e}"));

    let interval: Option<String> = row.try_get("interval_tag").map_err(decode)?;

    Ok(Schedule {
        id: ScheduleId::from_uuid(row.try_get("id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        job_type: row.try_get("job_type").map_err(decode)?,
        payload_template: row.try_get("payload_template").map_err(decode)?,
        cron_expression: row.try_get("cron_expression").map_err(decode)?,
        interval: interval
            .as_deref()
            .map(str::parse::<ScheduleInterval>)
            .transpose()?,
        enabled: row.try_get("enabled").map_err(decode)?,
        timezone: row.try_get("timezone").map_err(decode)?,
        last_run_at: row.try_get("last_run_at").map_err(decode)?,
        next_run_at: row.try_get("next_run_at").map_err(decode)?,
        run_count: to_u32("run_count", row.try_get("run_count").map_err(decode)?)?,
        fail_count: to_u32("fail_count", row.try_get("fail_count").map_err(decode)?)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobQueue, PostgresJobQueue};
    use crate::scheduler::{ScheduleDefinition, Scheduler, SchedulerConfig};
    use crate::schema::testing;

    /// Two schedulers tick the same due row: one job, both see the row advanced.
    #[tokio::test]
    async fn racing_schedulers_enqueue_once() {
        let Some(db) = testing::database().await else { return };
        let store = Arc::new(PostgresScheduleStore::new(db.pool.clone()));
        let queue = Arc::new(PostgresJobQueue::new(db.pool.clone()));
        let a = Scheduler::new(SchedulerConfig::default(), store.clone(), queue.clone());
        let b = Scheduler::new(SchedulerConfig::default(), store.clone(), queue.clone());

        let tenant = TenantId::new();
        let mut schedule = a
            .create_schedule(tenant, ScheduleDefinition::new("hourly", "report").with_cron("0 * * * *"))
            .await
            .unwrap();
        let now = Utc::now();
        schedule.next_run_at = now;
        store.update(&schedule).await.unwrap();

        let (ra, rb) = tokio::join!(a.tick_at(now), b.tick_at(now));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.enqueued + rb.enqueued, 1);
        assert_eq!(ra.failed + rb.failed, 0);
        assert_eq!(queue.queue_length_by_type("report").await.unwrap(), 1);

        let stored = store.get(tenant, schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_run_at.map(|t| t.timestamp_micros()), Some(now.timestamp_micros()));
        assert_eq!(stored.next_run_at, schedule.advance(now));
    }
}
