//! Bounded-concurrency job consumption.
//!
//! ## Run loop
//!
//! Every `poll_interval` the pool claims jobs until all `concurrency` slots
//! are busy or the queue has nothing eligible. Each claimed job runs as its
//! own task:
//!
//! 1. resolve the handler (a missing one fails the attempt)
//! 2. run it under a child cancellation token with panics caught; once the
//!    job's deadline passes the token is cancelled and the attempt is recorded
//!    as timed out when the handler returns
//! 3. report `complete` or `fail` to the queue
//!
//! Stale-job cleanup runs on its own interval from the same loop.
//!
//! ## Shutdown
//!
//! Cancelling the pool's token stops claiming and cancels every in-flight
//! handler's context. The pool then waits up to `shutdown_timeout`; tasks
//! still running after that are detached and their rows are recovered later
//! by stale cleanup.

mod context;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{JobQueue, QueueError};
use crate::registry::HandlerRegistry;
use crate::types::Job;

pub use context::JobContext;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded on every claimed job.
    pub id: String,
    /// Maximum concurrent handler invocations
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout: Duration,
    pub stale_cleanup_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            stale_cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl WorkerConfig {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_stale_cleanup_interval(mut self, interval: Duration) -> Self {
        self.stale_cleanup_interval = interval;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: usize,
    /// Pending jobs across the whole queue.
    pub queue_length: u64,
}

pub struct WorkerPool<Q> {
    config: WorkerConfig,
    queue: Arc<Q>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<Counters>,
}

impl<Q: JobQueue + 'static> WorkerPool<Q> {
    pub fn new(config: WorkerConfig, queue: Arc<Q>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            queue,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn metrics(&self) -> Result<WorkerMetrics, QueueError> {
        Ok(WorkerMetrics {
            worker_id: self.config.id.clone(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            queue_length: self.queue.queue_length().await?,
        })
    }

    /// Consume jobs until `token` is cancelled, then drain.
    pub async fn run(&self, token: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut activities = JoinSet::new();

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.config.stale_cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            worker_id = %self.config.id,
            concurrency = self.config.concurrency,
            poll_interval = ?self.config.poll_interval,
            "worker pool started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = poll.tick() => self.fill_slots(&slots, &mut activities, &token).await,
                _ = cleanup.tick() => self.cleanup_stale().await,
                Some(finished) = activities.join_next(), if !activities.is_empty() => {
                    self.reap(finished);
                }
            }
        }

        self.drain(activities).await;
    }

    async fn fill_slots(
        &self,
        slots: &Arc<Semaphore>,
        activities: &mut JoinSet<()>,
        token: &CancellationToken,
    ) {
        while !token.is_cancelled() {
            let Ok(permit) = slots.clone().try_acquire_owned() else {
                break;
            };

            let job = match self.queue.dequeue(&self.config.id).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id = %self.config.id, error = %e, "dequeue failed");
                    break;
                }
            };

            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            let activity = Activity {
                queue: self.queue.clone(),
                registry: self.registry.clone(),
                counters: self.counters.clone(),
                worker_id: self.config.id.clone(),
                token: token.child_token(),
            };
            activities.spawn(async move {
                activity.run(job).await;
                drop(permit);
            });
        }
    }

    async fn cleanup_stale(&self) {
        match self.queue.cleanup_stale_jobs().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(worker_id = %self.config.id, reclaimed, "stale jobs reclaimed"),
            Err(e) => error!(worker_id = %self.config.id, error = %e, "stale job cleanup failed"),
        }
    }

    fn reap(&self, finished: Result<(), JoinError>) {
        if let Err(e) = finished {
            error!(worker_id = %self.config.id, error = %e, "job task aborted");
        }
    }

    async fn drain(&self, mut activities: JoinSet<()>) {
        info!(
            worker_id = %self.config.id,
            in_flight = activities.len(),
            "worker pool stopping"
        );

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(finished) = activities.join_next().await {
                self.reap(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.config.id,
                abandoned = activities.len(),
                "shutdown timeout elapsed; abandoning in-flight jobs"
            );
            activities.detach_all();
        }

        info!(worker_id = %self.config.id, "worker pool stopped");
    }
}

/// Everything one job task needs, detached from the pool's lifetime.
struct Activity<Q> {
    queue: Arc<Q>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<Counters>,
    worker_id: String,
    token: CancellationToken,
}

impl<Q: JobQueue> Activity<Q> {
    async fn run(self, job: Job) {
        let outcome = self.execute(&job).await;
        let claim = job.claim();

        match outcome {
            Ok(result) => match self.queue.complete(&claim, result).await {
                Ok(()) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    worker_id = %self.worker_id,
                    error = %e,
                    "failed to record job completion"
                ),
            },
            Err(message) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    tenant_id = %job.tenant_id,
                    priority = job.priority,
                    retry_count = job.retry_count,
                    worker_id = %self.worker_id,
                    error = %message,
                    "job attempt failed"
                );
                if let Err(e) = self.queue.fail(&claim, &message).await {
                    error!(
                        job_id = %job.id,
                        worker_id = %self.worker_id,
                        error = %e,
                        "failed to record job failure"
                    );
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Run the handler; `Err` carries the message recorded against the attempt.
    async fn execute(&self, job: &Job) -> Result<Option<Vec<u8>>, String> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(format!("no handler for job type: {}", job.job_type));
        };

        let timeout = Duration::from_secs(u64::from(job.timeout_seconds));
        let deadline = job
            .deadline()
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(i64::from(job.timeout_seconds)));
        let job_token = self.token.child_token();
        let ctx = JobContext::new(job_token.clone(), deadline, self.worker_id.as_str());
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(timeout);

        debug!(job_id = %job.id, job_type = %job.job_type, worker_id = %self.worker_id, "handler started");

        let handler_run = AssertUnwindSafe(handler.handle(ctx, job)).catch_unwind();
        tokio::pin!(handler_run);

        tokio::select! {
            res = &mut handler_run => return match res {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(panic) => Err(format!("job panicked: {}", panic_message(panic.as_ref()))),
            },
            _ = tokio::time::sleep(remaining) => {}
        }

        // Deadline passed: signal the handler and wait for it to give up.
        job_token.cancel();
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id = %self.worker_id,
            timeout_seconds = job.timeout_seconds,
            "job deadline passed; waiting for handler to stop"
        );
        let _ = handler_run.await;
        Err(format!("job timed out after {}s", job.timeout_seconds))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
