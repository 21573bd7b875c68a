//! In-process stand-in for the Postgres stores.
//!
//! One mutex guards every table, so each operation is atomic. Schedule
//! claims are tracked explicitly to mimic `FOR UPDATE SKIP LOCKED`. The clock
//! can be moved forward to make backoff and schedules observable without
//! sleeping. Not a production queue: nothing here survives the process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bizops_core::{TenantId, UserId};

use crate::history::{
    DeadLetter, HistoryFilter, HistoryPage, HistoryStore, JobHistory, JobMetrics, MAX_PAGE_SIZE,
};
use crate::queue::{
    FailOutcome, JobQueue, QueueError, STALE_JOB_ERROR, claim_holds, lifecycle, retention_cutoff,
    validate_options,
};
use crate::scheduler::{DueSchedules, Schedule, ScheduleStore, SchedulerError};
use crate::types::{
    Claim, DeadLetterId, EnqueueOptions, FailureDecision, HistoryId, Job, JobId, JobState, ScheduleId,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    history: Vec<JobHistory>,
    dead_letters: Vec<DeadLetter>,
    schedules: HashMap<ScheduleId, Schedule>,
    claimed_schedules: HashSet<ScheduleId>,
    clock_offset: chrono::Duration,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    /// Shared failure path of `fail` and stale cleanup.
    fn fail_running(
        &mut self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.state != JobState::Running {
            lifecycle::not_running(job, "fail");
            return Ok(FailOutcome::Ignored);
        }

        let worker_id = job.worker_id.clone();
        let outcome = match job.failure_decision(now) {
            FailureDecision::Retry {
                retry_count,
                run_at,
            } => {
                job.mark_retry(error, retry_count, run_at, now);
                FailOutcome::Retrying {
                    retry_count,
                    run_at,
                }
            }
            FailureDecision::DeadLetter => {
                job.mark_dead(error, now);
                FailOutcome::DeadLettered
            }
        };
        let job = job.clone();

        if outcome == FailOutcome::DeadLettered {
            self.dead_letters.push(DeadLetter::from_dead_job(&job, now));
            self.history.push(JobHistory::failed(&job, error, now));
        }
        lifecycle::failed(&job, worker_id.as_deref(), error, &outcome);
        Ok(outcome)
    }
}

/// Test double implementing [`JobQueue`], [`HistoryStore`] and [`ScheduleStore`].
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The backend's current instant (wall clock plus any advance).
    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now()
    }

    pub fn advance_clock(&self, by: chrono::Duration) {
        self.lock().clock_offset += by;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobQueue for InMemoryBackend {
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        job_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        validate_options(&opts)?;
        let mut state = self.lock();
        let job = Job::new(tenant_id, job_type, payload, opts, state.now());

        if let Some(key) = &job.idempotency_key {
            if state
                .jobs
                .values()
                .any(|j| j.idempotency_key.as_ref() == Some(key))
            {
                lifecycle::duplicate(&tenant_id, job_type, key);
                return Err(QueueError::Duplicate { key: key.clone() });
            }
        }

        state.jobs.insert(job.id, job.clone());
        lifecycle::enqueued(&job);
        Ok(job)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let next = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.run_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.run_at.cmp(&a.run_at))
                    .then(b.id.cmp(&a.id))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_running(worker_id, now);
        let job = job.clone();
        lifecycle::dequeued(&job);
        Ok(Some(job))
    }

    async fn complete(&self, claim: &Claim, result: Option<Vec<u8>>) -> Result<(), QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let job = state
            .jobs
            .get_mut(&claim.job_id)
            .ok_or(QueueError::JobNotFound(claim.job_id))?;
        if !claim_holds(job, claim, "complete") {
            return Ok(());
        }

        job.mark_completed(now);
        let job = job.clone();
        lifecycle::completed(&job);
        state.history.push(JobHistory::completed(&job, result, now));
        Ok(())
    }

    async fn fail(&self, claim: &Claim, error: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let job = state
            .jobs
            .get(&claim.job_id)
            .ok_or(QueueError::JobNotFound(claim.job_id))?;
        if !claim_holds(job, claim, "fail") {
            return Ok(FailOutcome::Ignored);
        }
        state.fail_running(claim.job_id, error, now)
    }

    async fn move_to_dead_letter(&self, job_id: JobId, final_error: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.state.is_terminal() {
            lifecycle::not_running(job, "move_to_dead_letter");
            return Ok(());
        }

        let worker_id = job.worker_id.clone();
        job.mark_dead(final_error, now);
        let job = job.clone();
        state.dead_letters.push(DeadLetter::from_dead_job(&job, now));
        state.history.push(JobHistory::failed(&job, final_error, now));
        lifecycle::failed(&job, worker_id.as_deref(), final_error, &FailOutcome::DeadLettered);
        Ok(())
    }

    async fn cleanup_stale_jobs(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_stale(now))
            .map(|j| j.id)
            .collect();

        for job_id in &stale {
            if let Some(job) = state.jobs.get(job_id) {
                lifecycle::stale_reclaimed(job, job.worker_id.as_deref());
            }
            state.fail_running(*job_id, STALE_JOB_ERROR, now)?;
        }
        Ok(stale.len() as u64)
    }

    async fn delete_completed_jobs(&self, older_than: Duration) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let cutoff = retention_cutoff(state.now(), older_than);

        let before = state.jobs.len();
        state.jobs.retain(|_, j| {
            !(j.state.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn queue_length(&self) -> Result<u64, QueueError> {
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .count() as u64)
    }

    async fn queue_length_by_type(&self, job_type: &str) -> Result<u64, QueueError> {
        let state = self.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.job_type == job_type)
            .count() as u64)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }
}

#[async_trait]
impl HistoryStore for InMemoryBackend {
    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, QueueError> {
        let state = self.lock();
        let mut matching: Vec<JobHistory> = state
            .history
            .iter()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.effective_limit() as usize)
            .collect();
        Ok(HistoryPage { items, total })
    }

    async fn get_history(
        &self,
        tenant_id: TenantId,
        history_id: HistoryId,
    ) -> Result<Option<JobHistory>, QueueError> {
        let state = self.lock();
        Ok(state
            .history
            .iter()
            .find(|h| h.id == history_id && h.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        acknowledged: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.lock();
        let mut matching: Vec<DeadLetter> = state
            .dead_letters
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.acknowledged == acknowledged)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit.clamp(1, MAX_PAGE_SIZE) as usize)
            .collect())
    }

    async fn acknowledge_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        user_id: UserId,
    ) -> Result<DeadLetter, QueueError> {
        let mut state = self.lock();
        let now = state.now();

        let dead_letter = state
            .dead_letters
            .iter_mut()
            .find(|d| d.id == dead_letter_id && d.tenant_id == tenant_id && !d.acknowledged)
            .ok_or_else(|| {
                QueueError::NotFound(format!("unacknowledged dead letter {dead_letter_id}"))
            })?;

        dead_letter.acknowledged = true;
        dead_letter.acknowledged_by = Some(user_id);
        dead_letter.acknowledged_at = Some(now);
        Ok(dead_letter.clone())
    }

    async fn metrics(&self, tenant_id: TenantId) -> Result<JobMetrics, QueueError> {
        let state = self.lock();
        let since = state.now() - chrono::Duration::hours(24);

        let count_state = |s: JobState| {
            state
                .jobs
                .values()
                .filter(|j| j.tenant_id == tenant_id && j.state == s)
                .count() as u64
        };

        let recent: Vec<&JobHistory> = state
            .history
            .iter()
            .filter(|h| h.tenant_id == tenant_id && h.completed_at >= since)
            .collect();
        let total = recent.len() as u64;
        let succeeded = recent
            .iter()
            .filter(|h| h.status == crate::history::HistoryStatus::Completed)
            .count() as u64;
        let avg_duration_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|h| h.duration_ms as f64).sum::<f64>() / recent.len() as f64
        };

        Ok(JobMetrics {
            pending_count: count_state(JobState::Pending),
            running_count: count_state(JobState::Running),
            jobs_last_24h: total,
            success_last_24h: succeeded,
            success_rate: JobMetrics::success_rate(total, succeeded),
            avg_duration_ms,
            dead_letter_count: state
                .dead_letters
                .iter()
                .filter(|d| d.tenant_id == tenant_id && !d.acknowledged)
                .count() as u64,
        })
    }
}

#[async_trait]
impl ScheduleStore for InMemoryBackend {
    async fn insert(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if state.schedules.contains_key(&schedule.id) {
            return Err(SchedulerError::Database(format!(
                "schedule {} already exists",
                schedule.id
            )));
        }
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Option<Schedule>, SchedulerError> {
        Ok(self
            .lock()
            .schedules
            .get(&schedule_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn update(&self, schedule: &Schedule) -> Result<bool, SchedulerError> {
        let mut state = self.lock();
        let Some(stored) = state
            .schedules
            .get_mut(&schedule.id)
            .filter(|s| s.tenant_id == schedule.tenant_id)
        else {
            return Ok(false);
        };

        // Run bookkeeping belongs to the tick and is not overwritten here.
        stored.name = schedule.name.clone();
        stored.job_type = schedule.job_type.clone();
        stored.payload_template = schedule.payload_template.clone();
        stored.cron_expression = schedule.cron_expression.clone();
        stored.interval = schedule.interval;
        stored.enabled = schedule.enabled;
        stored.timezone = schedule.timezone.clone();
        stored.next_run_at = schedule.next_run_at;
        stored.updated_at = schedule.updated_at;
        Ok(true)
    }

    async fn delete(&self, tenant_id: TenantId, schedule_id: ScheduleId) -> Result<bool, SchedulerError> {
        let mut state = self.lock();
        let owned = state
            .schedules
            .get(&schedule_id)
            .is_some_and(|s| s.tenant_id == tenant_id);
        if owned {
            state.schedules.remove(&schedule_id);
        }
        Ok(owned)
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<Schedule>, SchedulerError> {
        let state = self.lock();
        let mut schedules: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(schedules)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Box<dyn DueSchedules>, SchedulerError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut due: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.is_due(now) && !state.claimed_schedules.contains(&s.id))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit as usize);

        state.claimed_schedules.extend(due.iter().map(|s| s.id));

        Ok(Box::new(MemoryDueSchedules {
            state: self.state.clone(),
            schedules: due,
            outcomes: Vec::new(),
        }))
    }
}

enum TickOutcome {
    Ran {
        schedule_id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    },
    Failed {
        schedule_id: ScheduleId,
        at: DateTime<Utc>,
    },
}

/// Claimed batch; outcomes apply on commit, claims release on drop.
struct MemoryDueSchedules {
    state: Arc<Mutex<MemoryState>>,
    schedules: Vec<Schedule>,
    outcomes: Vec<TickOutcome>,
}

#[async_trait]
impl DueSchedules for MemoryDueSchedules {
    fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    async fn record_run(
        &mut self,
        schedule_id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.outcomes.push(TickOutcome::Ran {
            schedule_id,
            ran_at,
            next_run_at,
        });
        Ok(())
    }

    async fn record_failure(
        &mut self,
        schedule_id: ScheduleId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.outcomes.push(TickOutcome::Failed { schedule_id, at });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SchedulerError> {
        let mut this = self;
        let outcomes = std::mem::take(&mut this.outcomes);
        let mut state = this.state.lock().unwrap_or_else(PoisonError::into_inner);

        for outcome in outcomes {
            match outcome {
                TickOutcome::Ran {
                    schedule_id,
                    ran_at,
                    next_run_at,
                } => {
                    if let Some(s) = state.schedules.get_mut(&schedule_id) {
                        s.last_run_at = Some(ran_at);
                        s.next_run_at = next_run_at;
                        s.run_count += 1;
                        s.updated_at = ran_at;
                    }
                }
                TickOutcome::Failed { schedule_id, at } => {
                    if let Some(s) = state.schedules.get_mut(&schedule_id) {
                        s.fail_count += 1;
                        s.updated_at = at;
                    }
                }
            }
        }
        // Release before `this` drops and takes the lock again.
        drop(state);
        Ok(())
    }
}

impl Drop for MemoryDueSchedules {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for s in &self.schedules {
            state.claimed_schedules.remove(&s.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_run_at() {
        let backend = InMemoryBackend::new();
        let tenant = TenantId::new();
        let now = backend.now();

        let low = backend
            .enqueue(tenant, "t", vec![], EnqueueOptions::default().with_priority(-10))
            .await
            .unwrap();
        let late = backend
            .enqueue(
                tenant,
                "t",
                vec![],
                EnqueueOptions::default().with_priority(10).with_run_at(now),
            )
            .await
            .unwrap();
        let early = backend
            .enqueue(
                tenant,
                "t",
                vec![],
                EnqueueOptions::default()
                    .with_priority(10)
                    .with_run_at(now - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();
        backend
            .enqueue(
                tenant,
                "t",
                vec![],
                EnqueueOptions::default()
                    .with_priority(100)
                    .with_run_at(now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let order: Vec<JobId> = [
            backend.dequeue("w").await.unwrap(),
            backend.dequeue("w").await.unwrap(),
            backend.dequeue("w").await.unwrap(),
        ]
        .into_iter()
        .flatten()
        .map(|j| j.id)
        .collect();
        assert_eq!(order, [early.id, late.id, low.id]);
        assert!(backend.dequeue("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_twice_is_a_no_op() {
        let backend = InMemoryBackend::new();
        backend
            .enqueue(TenantId::new(), "t", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        let claim = backend.dequeue("w").await.unwrap().unwrap().claim();
        backend.complete(&claim, None).await.unwrap();
        backend.complete(&claim, None).await.unwrap();
        assert_eq!(backend.lock().history.len(), 1);
        assert_eq!(backend.fail(&claim, "late").await.unwrap(), FailOutcome::Ignored);

        let unknown = Claim {
            job_id: JobId::new(),
            ..claim
        };
        assert!(backend.complete(&unknown, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn late_report_from_a_reclaimed_attempt_is_ignored() {
        let backend = InMemoryBackend::new();
        let job = backend
            .enqueue(
                TenantId::new(),
                "t",
                vec![],
                EnqueueOptions::default().with_timeout_seconds(1),
            )
            .await
            .unwrap();

        let old = backend.dequeue("old-worker").await.unwrap().unwrap().claim();
        backend.advance_clock(chrono::Duration::seconds(2));
        assert_eq!(backend.cleanup_stale_jobs().await.unwrap(), 1);
        backend.advance_clock(chrono::Duration::seconds(3));
        let new = backend.dequeue("new-worker").await.unwrap().unwrap().claim();
        assert_eq!(new.job_id, job.id);

        backend.complete(&old, Some(vec![1])).await.unwrap();
        assert_eq!(backend.fail(&old, "late").await.unwrap(), FailOutcome::Ignored);
        let current = backend.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.state, JobState::Running);
        assert_eq!(current.worker_id.as_deref(), Some("new-worker"));
        assert!(backend.lock().history.is_empty());

        backend.complete(&new, Some(vec![2])).await.unwrap();
        let history = backend.lock().history.clone();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result.as_deref(), Some(&[2u8][..]));
        assert_eq!(history[0].worker_id.as_deref(), Some("new-worker"));
    }

    #[tokio::test]
    async fn same_worker_reclaiming_its_job_does_not_revive_the_old_claim() {
        let backend = InMemoryBackend::new();
        backend
            .enqueue(
                TenantId::new(),
                "t",
                vec![],
                EnqueueOptions::default().with_timeout_seconds(1),
            )
            .await
            .unwrap();

        let old = backend.dequeue("w").await.unwrap().unwrap().claim();
        backend.advance_clock(chrono::Duration::seconds(2));
        backend.cleanup_stale_jobs().await.unwrap();
        backend.advance_clock(chrono::Duration::seconds(3));
        let new = backend.dequeue("w").await.unwrap().unwrap().claim();
        assert_ne!(old, new);

        assert_eq!(backend.fail(&old, "late").await.unwrap(), FailOutcome::Ignored);
        assert!(matches!(
            backend.fail(&new, "real").await.unwrap(),
            FailOutcome::Retrying { retry_count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn out_of_range_options_are_rejected_before_insert() {
        let backend = InMemoryBackend::new();
        let tenant = TenantId::new();

        let err = backend
            .enqueue(
                tenant,
                "t",
                vec![],
                EnqueueOptions::default().with_max_retries(3_000_000_000),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(ref m) if m.contains("max_retries")));

        let err = backend
            .enqueue(
                tenant,
                "t",
                vec![],
                EnqueueOptions::default().with_timeout_seconds(u32::MAX),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(ref m) if m.contains("timeout_seconds")));
        assert_eq!(backend.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retention_deletes_only_old_terminal_rows() {
        let backend = InMemoryBackend::new();
        let tenant = TenantId::new();
        let done = backend
            .enqueue(tenant, "t", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        let claim = backend.dequeue("w").await.unwrap().unwrap().claim();
        backend.complete(&claim, None).await.unwrap();
        let waiting = backend
            .enqueue(tenant, "t", vec![], EnqueueOptions::default())
            .await
            .unwrap();

        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(backend.delete_completed_jobs(week).await.unwrap(), 0);

        backend.advance_clock(chrono::Duration::days(8));
        assert_eq!(backend.delete_completed_jobs(week).await.unwrap(), 1);
        assert!(backend.get_job(done.id).await.unwrap().is_none());
        assert!(backend.get_job(waiting.id).await.unwrap().is_some());
        // History outlives the job row.
        assert_eq!(backend.lock().history.len(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn block_on<F: std::future::Future>(f: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(f)
        }

        proptest! {
            /// Each idempotency key admits exactly one row; keyless enqueues always insert.
            #[test]
            fn idempotency_key_admits_one_row(keys in prop::collection::vec(prop::option::of(0u8..4), 1..24)) {
                let backend = InMemoryBackend::new();
                let tenant = TenantId::new();
                let mut seen = HashSet::new();
                let mut inserted = 0u64;

                for key in &keys {
                    let opts = match key {
                        Some(k) => EnqueueOptions::default().with_idempotency_key(format!("k{k}")),
                        None => EnqueueOptions::default(),
                    };
                    let result = block_on(backend.enqueue(tenant, "t", vec![], opts));
                    match key {
                        Some(k) if !seen.insert(*k) => prop_assert!(result.unwrap_err().is_duplicate()),
                        _ => {
                            prop_assert!(result.is_ok());
                            inserted += 1;
                        }
                    }
                }

                prop_assert_eq!(block_on(backend.queue_length()).unwrap(), inserted);
            }

            /// Concurrent dequeuers never claim the same job twice and together drain the queue.
            #[test]
            fn every_job_is_claimed_at_most_once(jobs in 1usize..40, workers in 1usize..8) {
                let claimed = block_on(async {
                    let backend = InMemoryBackend::arc();
                    for _ in 0..jobs {
                        backend
                            .enqueue(TenantId::new(), "t", vec![], EnqueueOptions::default())
                            .await
                            .unwrap();
                    }

                    let mut tasks = tokio::task::JoinSet::new();
                    for w in 0..workers {
                        let backend = backend.clone();
                        tasks.spawn(async move {
                            let mut mine = Vec::new();
                            while let Some(job) = backend.dequeue(&format!("w{w}")).await.unwrap() {
                                mine.push(job.id);
                                tokio::task::yield_now().await;
                            }
                            mine
                        });
                    }

                    let mut all = Vec::new();
                    while let Some(mine) = tasks.join_next().await {
                        all.extend(mine.unwrap());
                    }
                    all
                });

                let unique: HashSet<JobId> = claimed.iter().copied().collect();
                prop_assert_eq!(unique.len(), claimed.len());
                prop_assert_eq!(claimed.len(), jobs);
            }
        }
    }
}
