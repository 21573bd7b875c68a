//! Database schema for the job platform.
//!
//! Every statement is idempotent so [`migrate`] can run on each process start.

use sqlx::PgPool;
use tracing::info;

use crate::queue::QueueError;
use crate::queue::postgres::map_sqlx_error;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id                UUID PRIMARY KEY,
            tenant_id         UUID NOT NULL,
            job_type          TEXT NOT NULL,
            payload           BYTEA NOT NULL,
            priority          INTEGER NOT NULL DEFAULT 0,
            state             TEXT NOT NULL DEFAULT 'pending',
            max_retries       INTEGER NOT NULL DEFAULT 3,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            last_error        TEXT NULL,
            errors            TEXT[] NOT NULL DEFAULT '{}',
            run_at            TIMESTAMPTZ NOT NULL,
            started_at        TIMESTAMPTZ NULL,
            first_started_at  TIMESTAMPTZ NULL,
            completed_at      TIMESTAMPTZ NULL,
            timeout_seconds   INTEGER NOT NULL DEFAULT 1800,
            worker_id         TEXT NULL,
            idempotency_key   TEXT NULL,
            schedule_id       UUID NULL,
            created_at        TIMESTAMPTZ NOT NULL,
            updated_at        TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "jobs_idempotency_key",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS jobs_idempotency_key_idx
            ON jobs (idempotency_key)
            WHERE idempotency_key IS NOT NULL
        "#,
    ),
    (
        "jobs_dequeue",
        r#"
        CREATE INDEX IF NOT EXISTS jobs_dequeue_idx
            ON jobs (state, priority DESC, run_at)
        "#,
    ),
    (
        "job_history",
        r#"
        CREATE TABLE IF NOT EXISTS job_history (
            id            UUID PRIMARY KEY,
            job_id        UUID NOT NULL,
            tenant_id     UUID NOT NULL,
            job_type      TEXT NOT NULL,
            payload       BYTEA NOT NULL,
            status        TEXT NOT NULL,
            result        BYTEA NULL,
            error         TEXT NULL,
            attempts      INTEGER NOT NULL,
            started_at    TIMESTAMPTZ NOT NULL,
            completed_at  TIMESTAMPTZ NOT NULL,
            duration_ms   BIGINT NOT NULL,
            worker_id     TEXT NULL,
            schedule_id   UUID NULL
        )
        "#,
    ),
    (
        "job_history_tenant",
        r#"
        CREATE INDEX IF NOT EXISTS job_history_tenant_started_idx
            ON job_history (tenant_id, started_at DESC)
        "#,
    ),
    (
        "dead_letters",
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id                  UUID PRIMARY KEY,
            job_id              UUID NOT NULL,
            tenant_id           UUID NOT NULL,
            job_type            TEXT NOT NULL,
            payload             BYTEA NOT NULL,
            errors              TEXT[] NOT NULL,
            total_attempts      INTEGER NOT NULL,
            first_attempted_at  TIMESTAMPTZ NOT NULL,
            last_attempted_at   TIMESTAMPTZ NOT NULL,
            acknowledged        BOOLEAN NOT NULL DEFAULT FALSE,
            acknowledged_by     UUID NULL,
            acknowledged_at     TIMESTAMPTZ NULL,
            created_at          TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "dead_letters_tenant",
        r#"
        CREATE INDEX IF NOT EXISTS dead_letters_tenant_idx
            ON dead_letters (tenant_id, acknowledged, created_at DESC)
        "#,
    ),
    (
        "schedules",
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id                UUID PRIMARY KEY,
            tenant_id         UUID NOT NULL,
            name              TEXT NOT NULL,
            job_type          TEXT NOT NULL,
            payload_template  BYTEA NOT NULL,
            cron_expression   TEXT NULL,
            interval_tag      TEXT NULL,
            enabled           BOOLEAN NOT NULL DEFAULT TRUE,
            timezone          TEXT NOT NULL DEFAULT 'UTC',
            last_run_at       TIMESTAMPTZ NULL,
            next_run_at       TIMESTAMPTZ NOT NULL,
            run_count         INTEGER NOT NULL DEFAULT 0,
            fail_count        INTEGER NOT NULL DEFAULT 0,
            created_at        TIMESTAMPTZ NOT NULL,
            updated_at        TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "schedules_due",
        r#"
        CREATE INDEX IF NOT EXISTS schedules_due_idx
            ON schedules (next_run_at)
            WHERE enabled
        "#,
    ),
];

/// Create tables and indexes that do not exist yet.
pub async fn migrate(pool: &PgPool) -> Result<(), QueueError> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(&format!("migrate {name}"), e))?;
    }
    info!(statements = STATEMENTS.len(), "job schema up to date");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared access to the database named by `DATABASE_URL`.
    //!
    //! Tests holding a [`TestDatabase`] run one at a time and start from empty tables.

    use sqlx::PgPool;
    use sqlx::postgres::PgPoolOptions;
    use tokio::sync::{Mutex, MutexGuard};

    static DATABASE_LOCK: Mutex<()> = Mutex::const_new(());

    pub(crate) struct TestDatabase {
        pub(crate) pool: PgPool,
        _guard: MutexGuard<'static, ()>,
    }

    /// `None` when `DATABASE_URL` is unset.
    pub(crate) async fn database() -> Option<TestDatabase> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let guard = DATABASE_LOCK.lock().await;
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .expect("failed to connect to DATABASE_URL");
        super::migrate(&pool).await.expect("migration failed");
        sqlx::query("TRUNCATE jobs, job_history, dead_letters, schedules")
            .execute(&pool)
            .await
            .expect("failed to reset tables");
        Some(TestDatabase {
            pool,
            _guard: guard,
        })
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let Some(db) = database().await else { return };
        super::migrate(&db.pool).await.unwrap();
        super::migrate(&db.pool).await.unwrap();
    }
}
