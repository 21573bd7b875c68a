//! Job daemon: worker pool, scheduler and retention sweeper over one Postgres pool.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use bizops_jobs::{
    HandlerRegistry, HandlerResult, Job, JobContext, JobHandler, PlatformConfig, PostgresJobQueue,
    PostgresScheduleStore, RetentionSweeper, Scheduler, WorkerPool, schema,
};

/// Accepts any payload and does nothing; useful for smoke-testing a deployment.
struct Noop;

#[async_trait]
impl JobHandler for Noop {
    async fn handle(&self, _ctx: JobContext, job: &Job) -> HandlerResult {
        tracing::debug!(job_id = %job.id, "noop job ran");
        Ok(None)
    }
}

fn registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.must_register("noop", Noop);
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bizops_observability::init();

    let config = PlatformConfig::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    schema::migrate(&pool).await.context("applying schema")?;

    let queue = Arc::new(PostgresJobQueue::new(pool.clone()));
    let registry = Arc::new(registry());
    tracing::info!(job_types = ?registry.types(), "handlers registered");

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let worker = WorkerPool::new(config.worker.clone(), queue.clone(), registry);
    tasks.spawn({
        let token = shutdown.child_token();
        async move { worker.run(token).await }
    });

    if config.scheduler_enabled {
        let store = Arc::new(PostgresScheduleStore::new(pool.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), store, queue.clone());
        tasks.spawn({
            let token = shutdown.child_token();
            async move { scheduler.run(token).await }
        });
    } else {
        tracing::info!("scheduler disabled");
    }

    let sweeper = RetentionSweeper::new(config.retention.clone(), queue);
    tasks.spawn({
        let token = shutdown.child_token();
        async move { sweeper.run(token).await }
    });

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "component task failed");
        }
    }
    pool.close().await;
    tracing::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
