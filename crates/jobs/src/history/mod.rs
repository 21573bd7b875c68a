//! Terminal outcomes, dead letters and the human-in-the-loop step.

pub mod postgres;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use bizops_core::{TenantId, UserId};

use crate::queue::{JobQueue, QueueError};
use crate::types::{DeadLetterId, EnqueueOptions, HistoryId, Job, JobId, ScheduleId};

pub use postgres::PostgresHistoryStore;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Outcome recorded for a terminal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(HistoryStatus::Completed),
            "failed" => Ok(HistoryStatus::Failed),
            other => Err(format!("unknown history status: {other}")),
        }
    }
}

/// Immutable record of a terminal attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: HistoryId,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub status: HistoryStatus,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub worker_id: Option<String>,
    pub schedule_id: Option<ScheduleId>,
}

impl JobHistory {
    fn from_job(
        job: &Job,
        status: HistoryStatus,
        result: Option<Vec<u8>>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let started_at = job.started_at.unwrap_or(now);
        Self {
            id: HistoryId::new(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            status,
            result,
            error,
            attempts: job.attempts(),
            started_at,
            completed_at: now,
            duration_ms: (now - started_at).num_milliseconds().max(0),
            worker_id: job.worker_id.clone(),
            schedule_id: job.schedule_id,
        }
    }

    pub(crate) fn completed(job: &Job, result: Option<Vec<u8>>, now: DateTime<Utc>) -> Self {
        Self::from_job(job, HistoryStatus::Completed, result, None, now)
    }

    pub(crate) fn failed(job: &Job, error: &str, now: DateTime<Utc>) -> Self {
        Self::from_job(job, HistoryStatus::Failed, None, Some(error.to_string()), now)
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub job_type: String,
    pub payload: Vec<u8>,
    /// One entry per attempt, in order.
    pub errors: Vec<String>,
    pub total_attempts: u32,
    pub first_attempted_at: DateTime<Utc>,
    pub last_attempted_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<UserId>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build from a job already marked dead (its `errors` include the final one).
    pub(crate) fn from_dead_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id: job.id,
            tenant_id: job.tenant_id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            errors: job.errors.clone(),
            total_attempts: job.errors.len() as u32,
            first_attempted_at: job.first_started_at.unwrap_or(job.created_at),
            last_attempted_at: job.started_at.unwrap_or(now),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: now,
        }
    }
}

/// History query predicates. All are optional except paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFilter {
    pub tenant_id: Option<TenantId>,
    pub job_type: Option<String>,
    pub status: Option<HistoryStatus>,
    /// Inclusive lower bound on `started_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub to: Option<DateTime<Utc>>,
    pub schedule_id: Option<ScheduleId>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            tenant_id: None,
            job_type: None,
            status: None,
            from: None,
            to: None,
            schedule_id: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl HistoryFilter {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub(crate) fn matches(&self, h: &JobHistory) -> bool {
        self.tenant_id.is_none_or(|t| h.tenant_id == t)
            && self.job_type.as_deref().is_none_or(|t| h.job_type == t)
            && self.status.is_none_or(|s| h.status == s)
            && self.from.is_none_or(|from| h.started_at >= from)
            && self.to.is_none_or(|to| h.started_at < to)
            && self.schedule_id.is_none_or(|s| h.schedule_id == Some(s))
    }
}

/// One page of history, newest `started_at` first, plus the unpaged total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub items: Vec<JobHistory>,
    pub total: u64,
}

/// Per-tenant operational metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub pending_count: u64,
    pub running_count: u64,
    /// Terminal attempts in the last 24 hours.
    pub jobs_last_24h: u64,
    pub success_last_24h: u64,
    /// Percentage in `[0, 100]`; 0 when nothing finished in the window.
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    /// Unacknowledged dead letters.
    pub dead_letter_count: u64,
}

impl JobMetrics {
    pub(crate) fn success_rate(total: u64, succeeded: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            succeeded as f64 * 100.0 / total as f64
        }
    }
}

/// Read side of history and dead letters.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, QueueError>;

    async fn get_history(
        &self,
        tenant_id: TenantId,
        history_id: HistoryId,
    ) -> Result<Option<JobHistory>, QueueError>;

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        acknowledged: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetter>, QueueError>;

    /// Mark a dead letter acknowledged.
    ///
    /// An already-acknowledged (or missing) row yields [`QueueError::NotFound`]
    /// and is left unchanged.
    async fn acknowledge_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        user_id: UserId,
    ) -> Result<DeadLetter, QueueError>;

    async fn metrics(&self, tenant_id: TenantId) -> Result<JobMetrics, QueueError>;
}

/// History and dead-letter management over a store and the queue.
pub struct HistoryService<H, Q> {
    history: Arc<H>,
    queue: Arc<Q>,
}

impl<H, Q> Clone for HistoryService<H, Q> {
    fn clone(&self) -> Self {
        Self {
            history: self.history.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<H: HistoryStore, Q: JobQueue> HistoryService<H, Q> {
    pub fn new(history: Arc<H>, queue: Arc<Q>) -> Self {
        Self { history, queue }
    }

    pub async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, QueueError> {
        self.history.list_history(filter).await
    }

    pub async fn get_history(
        &self,
        tenant_id: TenantId,
        history_id: HistoryId,
    ) -> Result<JobHistory, QueueError> {
        self.history
            .get_history(tenant_id, history_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("history {history_id}")))
    }

    pub async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        acknowledged: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        self.history
            .list_dead_letters(tenant_id, acknowledged, limit, offset)
            .await
    }

    pub async fn acknowledge_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        user_id: UserId,
    ) -> Result<DeadLetter, QueueError> {
        let dead_letter = self
            .history
            .acknowledge_dead_letter(tenant_id, dead_letter_id, user_id)
            .await?;
        info!(
            dead_letter_id = %dead_letter.id,
            job_id = %dead_letter.job_id,
            tenant_id = %tenant_id,
            user_id = %user_id,
            "dead letter acknowledged"
        );
        Ok(dead_letter)
    }

    /// Enqueue a fresh job with the type and payload of a history row.
    ///
    /// The new job has default retry budget and priority, runs now, and is not
    /// linked to the old attempt.
    pub async fn retry(&self, tenant_id: TenantId, history_id: HistoryId) -> Result<Job, QueueError> {
        let entry = self.get_history(tenant_id, history_id).await?;
        let job = self
            .queue
            .enqueue(
                entry.tenant_id,
                &entry.job_type,
                entry.payload,
                EnqueueOptions::default().with_run_at(Utc::now()),
            )
            .await?;
        info!(
            history_id = %history_id,
            job_id = %job.id,
            previous_job_id = %entry.job_id,
            tenant_id = %tenant_id,
            "job re-enqueued from history"
        );
        Ok(job)
    }

    pub async fn metrics(&self, tenant_id: TenantId) -> Result<JobMetrics, QueueError> {
        self.history.metrics(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    fn service(backend: &Arc<InMemoryBackend>) -> HistoryService<InMemoryBackend, InMemoryBackend> {
        HistoryService::new(backend.clone(), backend.clone())
    }

    async fn finish(backend: &InMemoryBackend, tenant: TenantId, job_type: &str, ok: bool) -> Job {
        let job = backend
            .enqueue(tenant, job_type, vec![7, 7], EnqueueOptions::default().with_max_retries(1))
            .await
            .unwrap();
        let claim = backend.dequeue("w1").await.unwrap().unwrap().claim();
        if ok {
            backend.complete(&claim, Some(vec![1])).await.unwrap();
        } else {
            backend.fail(&claim, "boom").await.unwrap();
        }
        job
    }

    #[tokio::test]
    async fn history_is_tenant_scoped_and_filterable() {
        let backend = InMemoryBackend::arc();
        let svc = service(&backend);
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        finish(&backend, t1, "a", true).await;
        finish(&backend, t1, "b", false).await;
        finish(&backend, t2, "a", true).await;

        let page = svc.list_history(&HistoryFilter::for_tenant(t1)).await.unwrap();
        assert_eq!(page.total, 2);

        let failed = svc
            .list_history(&HistoryFilter {
                status: Some(HistoryStatus::Failed),
                ..HistoryFilter::for_tenant(t1)
            })
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.items[0].job_type, "b");
        assert_eq!(failed.items[0].error.as_deref(), Some("boom"));

        let other = svc.get_history(t2, failed.items[0].id).await.unwrap_err();
        assert!(other.is_not_found());
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let backend = InMemoryBackend::arc();
        let svc = service(&backend);
        let tenant = TenantId::new();

        for job_type in ["first", "second", "third"] {
            finish(&backend, tenant, job_type, true).await;
            backend.advance_clock(chrono::Duration::seconds(1));
        }

        let page = svc
            .list_history(&HistoryFilter {
                limit: 2,
                ..HistoryFilter::for_tenant(tenant)
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        let types: Vec<_> = page.items.iter().map(|h| h.job_type.as_str()).collect();
        assert_eq!(types, ["third", "second"]);

        let rest = svc
            .list_history(&HistoryFilter {
                limit: 2,
                offset: 2,
                ..HistoryFilter::for_tenant(tenant)
            })
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].job_type, "first");
    }

    #[tokio::test]
    async fn acknowledge_is_one_shot() {
        let backend = InMemoryBackend::arc();
        let svc = service(&backend);
        let tenant = TenantId::new();
        let user = UserId::new();

        finish(&backend, tenant, "doomed", false).await;

        let open = svc.list_dead_letters(tenant, false, 10, 0).await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(!open[0].acknowledged);

        let acked = svc
            .acknowledge_dead_letter(tenant, open[0].id, user)
            .await
            .unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by, Some(user));
        assert!(acked.acknowledged_at.is_some());

        let again = svc.acknowledge_dead_letter(tenant, open[0].id, user).await;
        assert!(matches!(again, Err(QueueError::NotFound(_))));

        assert!(svc.list_dead_letters(tenant, false, 10, 0).await.unwrap().is_empty());
        assert_eq!(svc.list_dead_letters(tenant, true, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_enqueues_fresh_job_with_same_payload() {
        let backend = InMemoryBackend::arc();
        let svc = service(&backend);
        let tenant = TenantId::new();

        let original = finish(&backend, tenant, "doomed", false).await;
        let entry = svc
            .list_history(&HistoryFilter::for_tenant(tenant))
            .await
            .unwrap()
            .items
            .remove(0);

        let retried = svc.retry(tenant, entry.id).await.unwrap();
        assert_ne!(retried.id, original.id);
        assert_eq!(retried.job_type, "doomed");
        assert_eq!(retried.payload, vec![7, 7]);
        assert_eq!(retried.max_retries, 3);
        assert_eq!(retried.retry_count, 0);
        assert_eq!(backend.queue_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn metrics_summarise_last_day() {
        let backend = InMemoryBackend::arc();
        let svc = service(&backend);
        let tenant = TenantId::new();

        finish(&backend, tenant, "a", true).await;
        finish(&backend, tenant, "a", true).await;
        finish(&backend, tenant, "a", true).await;
        finish(&backend, tenant, "b", false).await;
        backend
            .enqueue(tenant, "later", vec![], EnqueueOptions::default())
            .await
            .unwrap();

        let m = svc.metrics(tenant).await.unwrap();
        assert_eq!(m.pending_count, 1);
        assert_eq!(m.running_count, 0);
        assert_eq!(m.jobs_last_24h, 4);
        assert_eq!(m.success_last_24h, 3);
        assert!((m.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(m.dead_letter_count, 1);

        let empty = svc.metrics(TenantId::new()).await.unwrap();
        assert_eq!(empty, JobMetrics::default());
    }
}
