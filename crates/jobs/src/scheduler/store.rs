use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bizops_core::TenantId;

use super::SchedulerError;
use super::schedule::Schedule;
use crate::types::ScheduleId;

/// Persistence for schedules.
///
/// Reads and writes outside a tick are tenant-scoped: a schedule of another
/// tenant behaves as missing.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, schedule: &Schedule) -> Result<(), SchedulerError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> Result<Option<Schedule>, SchedulerError>;

    /// Overwrite a stored schedule. Returns `false` when no row matched.
    async fn update(&self, schedule: &Schedule) -> Result<bool, SchedulerError>;

    /// Returns `false` when no row matched.
    async fn delete(&self, tenant_id: TenantId, schedule_id: ScheduleId) -> Result<bool, SchedulerError>;

    /// Every schedule of the tenant, ordered by name.
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<Schedule>, SchedulerError>;

    /// Lock up to `limit` enabled schedules with `next_run_at <= now`, skipping
    /// rows another scheduler holds. The locks last until the batch is
    /// committed or dropped.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Box<dyn DueSchedules>, SchedulerError>;
}

/// A locked batch of due schedules.
///
/// Dropping the batch without [`commit`](DueSchedules::commit) releases the
/// locks and discards recorded outcomes.
#[async_trait]
pub trait DueSchedules: Send {
    fn schedules(&self) -> &[Schedule];

    /// The tick fired: set `last_run_at`, `next_run_at` and bump `run_count`.
    async fn record_run(
        &mut self,
        schedule_id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// The enqueue failed: bump `fail_count`, keep `next_run_at`.
    async fn record_failure(
        &mut self,
        schedule_id: ScheduleId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    async fn commit(self: Box<Self>) -> Result<(), SchedulerError>;
}
