//! Core job types and the retry policy.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bizops_core::TenantId;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub Uuid);

        impl $t {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique job identifier.
    JobId
);
uuid_id!(
    /// Identifier of a recurring schedule.
    ScheduleId
);
uuid_id!(
    /// Identifier of a terminal-attempt history row.
    HistoryId
);
uuid_id!(
    /// Identifier of a dead-letter row.
    DeadLetterId
);

pub const PRIORITY_LOW: i32 = -10;
pub const PRIORITY_NORMAL: i32 = 0;
pub const PRIORITY_HIGH: i32 = 10;
pub const PRIORITY_CRITICAL: i32 = 20;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 1800;

/// Largest exponent used by [`backoff`]; keeps the delay representable.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Delay before the retry with index `retry_count`: `2^retry_count` seconds.
///
/// The first retry (`retry_count == 1`) waits 2 s, then 4, 8, 16, ...
pub fn backoff(retry_count: u32) -> Duration {
    Duration::from_secs(1u64 << retry_count.min(MAX_BACKOFF_EXPONENT))
}

/// Lifecycle state of a row in `jobs`.
///
/// `Failed` only ever appears transiently; attempts that fail either go back
/// to `Pending` or end in `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Encode a value as a JSON job payload.
pub fn json_payload<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher wins.
    pub priority: i32,
    /// Earliest eligible instant; `None` means now.
    pub run_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub timeout_seconds: u32,
    /// At most one row in `jobs` carries a given key.
    pub idempotency_key: Option<String>,
    /// Set by the scheduler; copied into history, never interpreted by the queue.
    pub schedule_id: Option<ScheduleId>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            run_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            idempotency_key: None,
            schedule_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

/// A background job (one row of `jobs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Selects the handler.
    pub job_type: String,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub state: JobState,
    pub max_retries: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Every attempt's error, oldest first.
    pub errors: Vec<String>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub first_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u32,
    /// Set while `Running`.
    pub worker_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub schedule_id: Option<ScheduleId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One worker's hold on one attempt of a running job.
///
/// Reported back with `complete`/`fail`. Every requeue bumps `retry_count`,
/// so a claim from an attempt that was reclaimed no longer matches the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: String,
    pub retry_count: u32,
}

/// What happens to a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to `Pending` with the new retry index, eligible again at `run_at`.
    Retry {
        retry_count: u32,
        run_at: DateTime<Utc>,
    },
    /// Budget spent.
    DeadLetter,
}

impl Job {
    /// Build a fresh `Pending` job.
    pub fn new(
        tenant_id: TenantId,
        job_type: impl Into<String>,
        payload: Vec<u8>,
        opts: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            job_type: job_type.into(),
            payload,
            priority: opts.priority,
            state: JobState::Pending,
            max_retries: opts.max_retries,
            retry_count: 0,
            last_error: None,
            errors: Vec::new(),
            run_at: opts.run_at.unwrap_or(now),
            started_at: None,
            first_started_at: None,
            completed_at: None,
            timeout_seconds: opts.timeout_seconds,
            worker_id: None,
            idempotency_key: opts.idempotency_key.filter(|k| !k.is_empty()),
            schedule_id: opts.schedule_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode a payload produced by [`json_payload`].
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// The claim held on this attempt (meaningful while `Running`).
    pub fn claim(&self) -> Claim {
        Claim {
            job_id: self.id,
            worker_id: self.worker_id.clone().unwrap_or_default(),
            retry_count: self.retry_count,
        }
    }

    /// Whether `claim` still holds this row: running, same worker, same attempt.
    pub fn is_claimed_by(&self, claim: &Claim) -> bool {
        self.state == JobState::Running
            && self.retry_count == claim.retry_count
            && self.worker_id.as_deref() == Some(claim.worker_id.as_str())
    }

    /// Number of attempts made so far, counting the one in progress.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Instant after which a running attempt counts as timed out.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|started| started + chrono::Duration::seconds(i64::from(self.timeout_seconds)))
    }

    /// A running job whose deadline has passed (its worker likely died).
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.deadline().is_some_and(|d| d < now)
    }

    /// Claim the job for `worker_id`.
    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.started_at = Some(now);
        self.first_started_at.get_or_insert(now);
        self.worker_id = Some(worker_id.to_string());
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Decide between retry and dead letter for a failure observed at `now`.
    ///
    /// Retries while `retry_count + 1 < max_retries`. `run_at` never moves backwards.
    pub fn failure_decision(&self, now: DateTime<Utc>) -> FailureDecision {
        if self.retry_count + 1 < self.max_retries {
            let retry_count = self.retry_count + 1;
            let delay = chrono::Duration::from_std(backoff(retry_count))
                .unwrap_or(chrono::Duration::MAX);
            let run_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            FailureDecision::Retry {
                retry_count,
                run_at: run_at.max(self.run_at),
            }
        } else {
            FailureDecision::DeadLetter
        }
    }

    /// Apply a retry: record the error and release the claim.
    pub fn mark_retry(&mut self, error: &str, retry_count: u32, run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.record_error(error);
        self.state = JobState::Pending;
        self.retry_count = retry_count;
        self.run_at = run_at;
        self.started_at = None;
        self.worker_id = None;
        self.updated_at = now;
    }

    /// Terminal failure: record the final error and transition to `Dead`.
    pub fn mark_dead(&mut self, final_error: &str, now: DateTime<Utc>) {
        self.record_error(final_error);
        self.state = JobState::Dead;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.errors.push(error.to_string());
    }
}
