//! Turns due schedules into queue insertions.
//!
//! A tick locks every due schedule (skipping rows another scheduler holds),
//! enqueues one job per schedule under a minute-granular idempotency key and
//! advances `next_run_at`. Two schedulers racing inside the same minute
//! therefore produce one job: the loser's enqueue is absorbed as a duplicate.

pub mod cron;
pub mod postgres;
mod schedule;
mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bizops_core::TenantId;

use crate::queue::{JobQueue, QueueError};
use crate::types::{EnqueueOptions, ScheduleId};

pub use cron::{CronPattern, ScheduleInterval};
pub use postgres::PostgresScheduleStore;
pub use schedule::{Schedule, ScheduleDefinition};
pub use store::{DueSchedules, ScheduleStore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule not found: {0}")]
    NotFound(ScheduleId),

    #[error("invalid schedule: {0}")]
    Validation(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Most schedules claimed per tick; the rest wait for the next one.
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Outcome counts of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub enqueued: usize,
    /// Another scheduler already produced this tick's job.
    pub duplicates: usize,
    pub failed: usize,
}

/// Idempotency key of a schedule's job for the minute containing `now`.
pub fn idempotency_key(schedule_id: ScheduleId, now: DateTime<Utc>) -> String {
    format!("schedule-{}-{}", schedule_id, now.timestamp().div_euclid(60))
}

pub struct Scheduler<S, Q> {
    config: SchedulerConfig,
    store: Arc<S>,
    queue: Arc<Q>,
}

impl<S: ScheduleStore, Q: JobQueue> Scheduler<S, Q> {
    pub fn new(config: SchedulerConfig, store: Arc<S>, queue: Arc<Q>) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    pub async fn create_schedule(
        &self,
        tenant_id: TenantId,
        def: ScheduleDefinition,
    ) -> Result<Schedule, SchedulerError> {
        check_definition(&def)?;
        let schedule = Schedule::new(tenant_id, def, Utc::now());
        self.store.insert(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            tenant_id = %tenant_id,
            job_type = %schedule.job_type,
            next_run_at = %schedule.next_run_at,
            "schedule created"
        );
        Ok(schedule)
    }

    pub async fn get_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Schedule, SchedulerError> {
        self.store
            .get(tenant_id, schedule_id)
            .await?
            .ok_or(SchedulerError::NotFound(schedule_id))
    }

    /// Replace the definition; `next_run_at` is recomputed from now.
    pub async fn update_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
        def: ScheduleDefinition,
    ) -> Result<Schedule, SchedulerError> {
        check_definition(&def)?;
        let mut schedule = self.get_schedule(tenant_id, schedule_id).await?;
        schedule.redefine(def, Utc::now());
        self.save(&schedule).await?;
        info!(
            schedule_id = %schedule_id,
            tenant_id = %tenant_id,
            next_run_at = %schedule.next_run_at,
            "schedule updated"
        );
        Ok(schedule)
    }

    pub async fn delete_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<(), SchedulerError> {
        if !self.store.delete(tenant_id, schedule_id).await? {
            return Err(SchedulerError::NotFound(schedule_id));
        }
        info!(schedule_id = %schedule_id, tenant_id = %tenant_id, "schedule deleted");
        Ok(())
    }

    /// Enable and restart the rule from now, so missed runs are not replayed.
    pub async fn enable_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.get_schedule(tenant_id, schedule_id).await?;
        let now = Utc::now();
        schedule.enabled = true;
        schedule.next_run_at = schedule.advance(now);
        schedule.updated_at = now;
        self.save(&schedule).await?;
        info!(schedule_id = %schedule_id, tenant_id = %tenant_id, "schedule enabled");
        Ok(schedule)
    }

    pub async fn disable_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.get_schedule(tenant_id, schedule_id).await?;
        schedule.enabled = false;
        schedule.updated_at = Utc::now();
        self.save(&schedule).await?;
        info!(schedule_id = %schedule_id, tenant_id = %tenant_id, "schedule disabled");
        Ok(schedule)
    }

    pub async fn list_schedules(&self, tenant_id: TenantId) -> Result<Vec<Schedule>, SchedulerError> {
        self.store.list(tenant_id).await
    }

    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    ///
    /// A failed enqueue only bumps the schedule's `fail_count`; its
    /// `next_run_at` stays put so the next tick tries again. A schedule whose
    /// outcome cannot be recorded is logged and skipped; the rest of the batch
    /// still commits.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut batch = self.store.claim_due(now, self.config.batch_size).await?;
        let due = batch.schedules().to_vec();
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for schedule in &due {
            let key = idempotency_key(schedule.id, now);
            let opts = EnqueueOptions::default()
                .with_run_at(now)
                .with_idempotency_key(key.clone())
                .with_schedule(schedule.id);

            match self
                .queue
                .enqueue(
                    schedule.tenant_id,
                    &schedule.job_type,
                    schedule.payload_template.clone(),
                    opts,
                )
                .await
            {
                Ok(job) => {
                    report.enqueued += 1;
                    let next_run_at = schedule.advance(now);
                    if let Err(e) = batch.record_run(schedule.id, now, next_run_at).await {
                        unrecorded(schedule, "record_run", &e);
                    }
                    info!(
                        schedule_id = %schedule.id,
                        tenant_id = %schedule.tenant_id,
                        job_id = %job.id,
                        job_type = %schedule.job_type,
                        next_run_at = %next_run_at,
                        "scheduled job enqueued"
                    );
                }
                Err(e) if e.is_duplicate() => {
                    report.duplicates += 1;
                    if let Err(e) = batch.record_run(schedule.id, now, schedule.advance(now)).await {
                        unrecorded(schedule, "record_run", &e);
                    }
                    debug!(
                        schedule_id = %schedule.id,
                        idempotency_key = %key,
                        "scheduled job already enqueued for this minute"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    if let Err(e) = batch.record_failure(schedule.id, now).await {
                        unrecorded(schedule, "record_failure", &e);
                    }
                    warn!(
                        schedule_id = %schedule.id,
                        tenant_id = %schedule.tenant_id,
                        job_type = %schedule.job_type,
                        error = %e,
                        "failed to enqueue scheduled job"
                    );
                }
            }
        }

        batch.commit().await?;
        if report.due > 0 {
            debug!(
                due = report.due,
                enqueued = report.enqueued,
                duplicates = report.duplicates,
                failed = report.failed,
                "scheduler tick"
            );
        }
        Ok(report)
    }

    /// Tick every `tick_interval` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_interval = ?self.config.tick_interval, "scheduler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    async fn save(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
        if self.store.update(schedule).await? {
            Ok(())
        } else {
            Err(SchedulerError::NotFound(schedule.id))
        }
    }
}

fn unrecorded(schedule: &Schedule, operation: &'static str, error: &SchedulerError) {
    error!(
        schedule_id = %schedule.id,
        tenant_id = %schedule.tenant_id,
        operation,
        error = %error,
        "failed to record schedule outcome; it stays due"
    );
}

fn check_definition(def: &ScheduleDefinition) -> Result<(), SchedulerError> {
    def.validate()?;
    if def.has_unrecognised_cron() {
        warn!(
            name = %def.name,
            cron_expression = def.cron_expression.as_deref().unwrap_or_default(),
            fallback = def.interval.map_or("4h", |i| i.as_str()),
            "unrecognised cron expression; falling back"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::types::JobState;
    use chrono::{TimeZone, Timelike};

    type TestScheduler = Scheduler<InMemoryBackend, InMemoryBackend>;

    fn scheduler(backend: &Arc<InMemoryBackend>) -> TestScheduler {
        Scheduler::new(SchedulerConfig::default(), backend.clone(), backend.clone())
    }

    /// Create a schedule and make it due at the backend's current instant.
    async fn due_schedule(
        backend: &Arc<InMemoryBackend>,
        sched: &TestScheduler,
        tenant: TenantId,
        def: ScheduleDefinition,
    ) -> Schedule {
        let mut schedule = sched.create_schedule(tenant, def).await.unwrap();
        schedule.next_run_at = backend.now();
        backend.update(&schedule).await.unwrap();
        schedule
    }

    #[test]
    fn idempotency_key_is_minute_granular() {
        let id = ScheduleId::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5).unwrap();
        assert_eq!(idempotency_key(id, t), idempotency_key(id, t + chrono::Duration::seconds(50)));
        assert_ne!(idempotency_key(id, t), idempotency_key(id, t + chrono::Duration::seconds(60)));
        assert_eq!(idempotency_key(id, t), format!("schedule-{id}-{}", t.timestamp() / 60));
    }

    #[tokio::test]
    async fn crud_is_tenant_scoped() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let other = TenantId::new();

        let s = sched
            .create_schedule(tenant, ScheduleDefinition::new("b-digest", "digest").with_cron("0 6 * * *"))
            .await
            .unwrap();
        sched
            .create_schedule(tenant, ScheduleDefinition::new("a-sync", "sync"))
            .await
            .unwrap();

        let names: Vec<_> = sched
            .list_schedules(tenant)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["a-sync", "b-digest"]);
        assert!(sched.list_schedules(other).await.unwrap().is_empty());

        assert!(matches!(
            sched.get_schedule(other, s.id).await,
            Err(SchedulerError::NotFound(id)) if id == s.id
        ));
        assert!(sched.delete_schedule(other, s.id).await.is_err());

        sched.delete_schedule(tenant, s.id).await.unwrap();
        assert!(matches!(
            sched.delete_schedule(tenant, s.id).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let err = sched
            .create_schedule(TenantId::new(), ScheduleDefinition::new("", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        // Unrecognised cron is accepted and falls back to the interval.
        let s = sched
            .create_schedule(
                TenantId::new(),
                ScheduleDefinition::new("n", "t")
                    .with_cron("*/5 * * * *")
                    .with_interval(ScheduleInterval::Daily),
            )
            .await
            .unwrap();
        assert_eq!(s.next_run_at - s.created_at, chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn tick_enqueues_due_schedule_and_advances() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let schedule = due_schedule(
            &backend,
            &sched,
            tenant,
            ScheduleDefinition::new("hourly", "report")
                .with_cron("0 * * * *")
                .with_payload(vec![4, 2]),
        )
        .await;

        let now = backend.now();
        let report = sched.tick_at(now).await.unwrap();
        assert_eq!(
            report,
            TickReport {
                due: 1,
                enqueued: 1,
                duplicates: 0,
                failed: 0
            }
        );

        let job = backend.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(job.job_type, "report");
        assert_eq!(job.payload, vec![4, 2]);
        assert_eq!(job.schedule_id, Some(schedule.id));
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.idempotency_key, Some(idempotency_key(schedule.id, now)));

        let stored = sched.get_schedule(tenant, schedule.id).await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_run_at, Some(now));
        assert_eq!(stored.next_run_at, CronPattern::Hourly.next_after(now));

        // Not due again until the next hour.
        assert_eq!(sched.tick_at(now).await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn second_tick_in_same_minute_is_absorbed_as_duplicate() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let schedule = due_schedule(
            &backend,
            &sched,
            tenant,
            ScheduleDefinition::new("hourly", "report").with_cron("0 * * * *"),
        )
        .await;

        let now = backend.now();
        sched.tick_at(now).await.unwrap();

        // A second scheduler that read the row before it advanced.
        let mut stale = sched.get_schedule(tenant, schedule.id).await.unwrap();
        stale.next_run_at = now;
        backend.update(&stale).await.unwrap();

        let report = sched.tick_at(now).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.enqueued, 0);
        assert_eq!(backend.queue_length_by_type("report").await.unwrap(), 1);

        let stored = sched.get_schedule(tenant, schedule.id).await.unwrap();
        assert_eq!(stored.next_run_at, CronPattern::Hourly.next_after(now));
        assert_eq!(stored.fail_count, 0);
    }

    #[tokio::test]
    async fn concurrent_claims_do_not_overlap() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        due_schedule(&backend, &sched, TenantId::new(), ScheduleDefinition::new("s", "report")).await;

        let now = backend.now();
        let held = backend.claim_due(now, 10).await.unwrap();
        assert_eq!(held.schedules().len(), 1);

        // The row is locked by `held`; this tick sees nothing.
        assert_eq!(sched.tick_at(now).await.unwrap().due, 0);

        drop(held);
        assert_eq!(sched.tick_at(now).await.unwrap().enqueued, 1);
    }

    #[tokio::test]
    async fn hourly_interval_spaces_runs_one_hour_apart() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        due_schedule(
            &backend,
            &sched,
            tenant,
            ScheduleDefinition::new("hourly", "ping").with_interval(ScheduleInterval::Hourly),
        )
        .await;

        // Tick at fixed instants; the backend clock keeps moving with wall time.
        let base = backend.now();
        let mut run_ats = Vec::new();
        for hour in 0..3 {
            let report = sched.tick_at(base + chrono::Duration::hours(hour)).await.unwrap();
            assert_eq!(report.enqueued, 1);
            let job = backend.dequeue("w").await.unwrap().unwrap();
            run_ats.push(job.run_at);
            backend.complete(&job.claim(), None).await.unwrap();
            backend.advance_clock(chrono::Duration::hours(1));
        }

        assert_eq!(run_ats[0], base);
        assert_eq!(run_ats[1] - run_ats[0], chrono::Duration::hours(1));
        assert_eq!(run_ats[2] - run_ats[1], chrono::Duration::hours(1));
        // Half an hour past the last run is not due.
        let report = sched
            .tick_at(base + chrono::Duration::minutes(150))
            .await
            .unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn disabled_schedules_do_not_fire_and_enable_restarts_from_now() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let schedule = due_schedule(
            &backend,
            &sched,
            tenant,
            ScheduleDefinition::new("s", "report").with_interval(ScheduleInterval::Daily),
        )
        .await;

        sched.disable_schedule(tenant, schedule.id).await.unwrap();
        assert_eq!(sched.tick_at(backend.now()).await.unwrap().due, 0);

        let enabled = sched.enable_schedule(tenant, schedule.id).await.unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at > Utc::now());
        assert_eq!(sched.tick_at(backend.now()).await.unwrap().due, 0);
        assert_eq!(backend.queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_recomputes_next_run_from_new_rule() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let s = sched
            .create_schedule(tenant, ScheduleDefinition::new("s", "report").with_interval(ScheduleInterval::Weekly))
            .await
            .unwrap();

        let updated = sched
            .update_schedule(
                tenant,
                s.id,
                ScheduleDefinition::new("s2", "report").with_cron("0 */4 * * *"),
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "s2");
        assert_eq!(updated.next_run_at.hour() % 4, 0);
        assert!(updated.next_run_at - Utc::now() <= chrono::Duration::hours(4));
    }

    #[tokio::test]
    async fn produced_jobs_are_pending_now() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        due_schedule(&backend, &sched, tenant, ScheduleDefinition::new("s", "report")).await;

        let now = backend.now();
        sched.tick_at(now).await.unwrap();
        let job = backend.dequeue("w").await.unwrap().unwrap();
        assert_eq!(job.run_at, now);
        assert_eq!(backend.get_job(job.id).await.unwrap().unwrap().state, JobState::Running);
    }

    /// Delegates to the in-memory store but cannot record runs of one schedule.
    struct UnrecordableStore {
        inner: Arc<InMemoryBackend>,
        broken: ScheduleId,
    }

    struct UnrecordableBatch {
        inner: Box<dyn DueSchedules>,
        broken: ScheduleId,
    }

    #[async_trait::async_trait]
    impl ScheduleStore for UnrecordableStore {
        async fn insert(&self, schedule: &Schedule) -> Result<(), SchedulerError> {
            self.inner.insert(schedule).await
        }

        async fn get(
            &self,
            tenant_id: TenantId,
            schedule_id: ScheduleId,
        ) -> Result<Option<Schedule>, SchedulerError> {
            self.inner.get(tenant_id, schedule_id).await
        }

        async fn update(&self, schedule: &Schedule) -> Result<bool, SchedulerError> {
            self.inner.update(schedule).await
        }

        async fn delete(&self, tenant_id: TenantId, schedule_id: ScheduleId) -> Result<bool, SchedulerError> {
            self.inner.delete(tenant_id, schedule_id).await
        }

        async fn list(&self, tenant_id: TenantId) -> Result<Vec<Schedule>, SchedulerError> {
            self.inner.list(tenant_id).await
        }

        async fn claim_due(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> Result<Box<dyn DueSchedules>, SchedulerError> {
            Ok(Box::new(UnrecordableBatch {
                inner: self.inner.claim_due(now, limit).await?,
                broken: self.broken,
            }))
        }
    }

    #[async_trait::async_trait]
    impl DueSchedules for UnrecordableBatch {
        fn schedules(&self) -> &[Schedule] {
            self.inner.schedules()
        }

        async fn record_run(
            &mut self,
            schedule_id: ScheduleId,
            ran_at: DateTime<Utc>,
            next_run_at: DateTime<Utc>,
        ) -> Result<(), SchedulerError> {
            if schedule_id == self.broken {
                return Err(SchedulerError::Database("connection reset".into()));
            }
            self.inner.record_run(schedule_id, ran_at, next_run_at).await
        }

        async fn record_failure(
            &mut self,
            schedule_id: ScheduleId,
            at: DateTime<Utc>,
        ) -> Result<(), SchedulerError> {
            self.inner.record_failure(schedule_id, at).await
        }

        async fn commit(self: Box<Self>) -> Result<(), SchedulerError> {
            self.inner.commit().await
        }
    }

    #[tokio::test]
    async fn unrecordable_schedule_does_not_abort_the_batch() {
        let backend = InMemoryBackend::arc();
        let sched = scheduler(&backend);
        let tenant = TenantId::new();
        let broken = due_schedule(&backend, &sched, tenant, ScheduleDefinition::new("a", "report")).await;
        let healthy = due_schedule(&backend, &sched, tenant, ScheduleDefinition::new("b", "report")).await;

        let flaky = Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(UnrecordableStore {
                inner: backend.clone(),
                broken: broken.id,
            }),
            backend.clone(),
        );
        let now = backend.now();
        let report = flaky.tick_at(now).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.enqueued, 2);

        let advanced = sched.get_schedule(tenant, healthy.id).await.unwrap();
        assert_eq!(advanced.run_count, 1);
        assert_eq!(advanced.last_run_at, Some(now));

        // Still due; its next tick in the same minute is absorbed as a duplicate.
        let stuck = sched.get_schedule(tenant, broken.id).await.unwrap();
        assert_eq!(stuck.run_count, 0);
        assert!(stuck.is_due(now));
        let retry = sched.tick_at(now).await.unwrap();
        assert_eq!((retry.due, retry.duplicates), (1, 1));
        assert_eq!(backend.queue_length_by_type("report").await.unwrap(), 2);
    }
}
