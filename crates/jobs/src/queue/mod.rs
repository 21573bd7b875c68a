//! Durable queue boundary.
//!
//! Exactly-once enqueue under an idempotency key, at-most-once concurrent
//! execution of any job. Implementations never retry storage operations;
//! the scheduler and worker retry naturally on their next tick.

pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use bizops_core::TenantId;

use crate::types::{Claim, EnqueueOptions, Job, JobId};

pub use postgres::PostgresJobQueue;

/// Error text recorded for jobs reclaimed by stale cleanup.
pub const STALE_JOB_ERROR: &str = "job timed out";

/// Queue (and history) storage error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// History row, dead letter or other record missing (or belonging to another tenant).
    #[error("{0} not found")]
    NotFound(String),

    #[error("duplicate job for idempotency key {key}")]
    Duplicate { key: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Rejected before anything was written.
    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),
}

impl QueueError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, QueueError::Duplicate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::JobNotFound(_) | QueueError::NotFound(_))
    }
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued as `pending`, eligible again at `run_at`.
    Retrying {
        retry_count: u32,
        run_at: DateTime<Utc>,
    },
    /// Retry budget spent; a dead letter was written.
    DeadLettered,
    /// The claim no longer holds the row (completed, reclaimed or re-claimed); nothing changed.
    Ignored,
}

/// The durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new `pending` job.
    ///
    /// Fails with [`QueueError::Duplicate`] when another row carries the same
    /// idempotency key; nothing is inserted in that case.
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        job_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError>;

    /// Claim the highest-priority eligible job (`pending`, `run_at <= now`),
    /// earliest `run_at` first, skipping rows claimed concurrently.
    ///
    /// Returns `None` when no job is available.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// `running -> completed` plus a `completed` history row.
    ///
    /// No-op unless `claim` still holds the row (see [`Job::is_claimed_by`]).
    /// A failed history append is logged; completion stands.
    async fn complete(&self, claim: &Claim, result: Option<Vec<u8>>) -> Result<(), QueueError>;

    /// Record a failed attempt: requeue with backoff while budget remains,
    /// otherwise dead-letter. [`FailOutcome::Ignored`] when `claim` is stale.
    async fn fail(&self, claim: &Claim, error: &str) -> Result<FailOutcome, QueueError>;

    /// Dead-letter a live job with `final_error` appended to its recorded errors.
    async fn move_to_dead_letter(&self, job_id: JobId, final_error: &str) -> Result<(), QueueError>;

    /// Fail every `running` job whose `started_at + timeout_seconds` has passed
    /// with [`STALE_JOB_ERROR`]. Returns the number of reclaimed jobs.
    async fn cleanup_stale_jobs(&self) -> Result<u64, QueueError>;

    /// Remove `completed` and `dead` rows finished before `now - older_than`.
    /// History and dead letters are untouched.
    async fn delete_completed_jobs(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Number of `pending` jobs.
    async fn queue_length(&self) -> Result<u64, QueueError>;

    /// Number of `pending` jobs of one type.
    async fn queue_length_by_type(&self, job_type: &str) -> Result<u64, QueueError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;
}

/// Whether `claim` may finish `job`; logs why not.
pub(crate) fn claim_holds(job: &Job, claim: &Claim, operation: &'static str) -> bool {
    if job.is_claimed_by(claim) {
        true
    } else if job.state != crate::types::JobState::Running {
        lifecycle::not_running(job, operation);
        false
    } else {
        lifecycle::claim_lost(job, claim, operation);
        false
    }
}

/// Reject options the `jobs` columns (`INTEGER`) cannot hold.
pub(crate) fn validate_options(opts: &EnqueueOptions) -> Result<(), QueueError> {
    for (field, value) in [
        ("max_retries", opts.max_retries),
        ("timeout_seconds", opts.timeout_seconds),
    ] {
        if i32::try_from(value).is_err() {
            return Err(QueueError::InvalidOptions(format!(
                "{field} {value} exceeds {}",
                i32::MAX
            )));
        }
    }
    Ok(())
}

/// Cut-off instant for `delete_completed_jobs`.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, older_than: Duration) -> DateTime<Utc> {
    let retention = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Structured lifecycle events shared by every queue implementation.
pub(crate) mod lifecycle {
    use tracing::{debug, info, warn};

    use super::FailOutcome;
    use crate::types::Job;

    pub(crate) fn enqueued(job: &Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            priority = job.priority,
            retry_count = job.retry_count,
            run_at = %job.run_at,
            "job enqueued"
        );
    }

    pub(crate) fn duplicate(tenant_id: &bizops_core::TenantId, job_type: &str, key: &str) {
        debug!(tenant_id = %tenant_id, job_type, idempotency_key = key, "duplicate enqueue suppressed");
    }

    pub(crate) fn dequeued(job: &Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            priority = job.priority,
            retry_count = job.retry_count,
            worker_id = job.worker_id.as_deref().unwrap_or_default(),
            "job dequeued"
        );
    }

    pub(crate) fn completed(job: &Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            priority = job.priority,
            retry_count = job.retry_count,
            worker_id = job.worker_id.as_deref().unwrap_or_default(),
            "job completed"
        );
    }

    /// `job` is the row after the failure was applied.
    pub(crate) fn failed(job: &Job, worker_id: Option<&str>, error: &str, outcome: &FailOutcome) {
        match outcome {
            FailOutcome::Retrying { run_at, .. } => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                tenant_id = %job.tenant_id,
                priority = job.priority,
                retry_count = job.retry_count,
                worker_id = worker_id.unwrap_or_default(),
                run_at = %run_at,
                error,
                "job failed, retry scheduled"
            ),
            FailOutcome::DeadLettered => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                tenant_id = %job.tenant_id,
                priority = job.priority,
                retry_count = job.retry_count,
                worker_id = worker_id.unwrap_or_default(),
                attempts = job.errors.len(),
                error,
                "job moved to dead letter"
            ),
            FailOutcome::Ignored => {}
        }
    }

    pub(crate) fn not_running(job: &Job, operation: &'static str) {
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            state = %job.state,
            operation,
            "job is not running; nothing to do"
        );
    }

    /// `claim` no longer holds `job` (reclaimed, finished, or claimed again).
    pub(crate) fn claim_lost(job: &Job, claim: &crate::types::Claim, operation: &'static str) {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            state = %job.state,
            retry_count = job.retry_count,
            worker_id = job.worker_id.as_deref().unwrap_or_default(),
            claim_worker_id = %claim.worker_id,
            claim_retry_count = claim.retry_count,
            operation,
            "stale claim ignored"
        );
    }

    pub(crate) fn stale_reclaimed(job: &Job, worker_id: Option<&str>) {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            priority = job.priority,
            retry_count = job.retry_count,
            worker_id = worker_id.unwrap_or_default(),
            "stale running job reclaimed"
        );
    }

    pub(crate) fn history_append_failed(job: &Job, error: &dyn std::fmt::Display) {
        tracing::error!(
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            error = %error,
            "failed to append job history; terminal state stands"
        );
    }
}
