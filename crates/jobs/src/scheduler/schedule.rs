use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bizops_core::TenantId;

use super::SchedulerError;
use super::cron::{CronPattern, ScheduleInterval, next_run};
use crate::types::ScheduleId;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// A tenant-scoped recurrence that produces jobs on tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub job_type: String,
    /// Payload of every job this schedule produces.
    pub payload_template: Vec<u8>,
    /// Authoritative when recognised; otherwise `interval` applies.
    pub cron_expression: Option<String>,
    pub interval: Option<ScheduleInterval>,
    pub enabled: bool,
    /// Stored for display; next-run arithmetic is UTC.
    pub timezone: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub run_count: u32,
    pub fail_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub(crate) fn new(tenant_id: TenantId, def: ScheduleDefinition, now: DateTime<Utc>) -> Self {
        let next_run_at = next_run(def.cron_expression.as_deref(), def.interval, now);
        Self {
            id: ScheduleId::new(),
            tenant_id,
            name: def.name,
            job_type: def.job_type,
            payload_template: def.payload_template,
            cron_expression: def.cron_expression,
            interval: def.interval,
            enabled: def.enabled,
            timezone: def.timezone,
            last_run_at: None,
            next_run_at,
            run_count: 0,
            fail_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the definition and recompute `next_run_at` from `now`.
    pub(crate) fn redefine(&mut self, def: ScheduleDefinition, now: DateTime<Utc>) {
        self.name = def.name;
        self.job_type = def.job_type;
        self.payload_template = def.payload_template;
        self.cron_expression = def.cron_expression;
        self.interval = def.interval;
        self.enabled = def.enabled;
        self.timezone = def.timezone;
        self.next_run_at = self.advance(now);
        self.updated_at = now;
    }

    /// Next run strictly derived from `now` under this schedule's rule.
    pub fn advance(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_run(self.cron_expression.as_deref(), self.interval, now)
    }

    /// The cron expression, when it is one the scheduler recognises.
    pub fn cron_pattern(&self) -> Option<CronPattern> {
        self.cron_expression.as_deref().and_then(CronPattern::parse)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }
}

/// Caller-supplied fields of a schedule, for create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub job_type: String,
    pub payload_template: Vec<u8>,
    pub cron_expression: Option<String>,
    pub interval: Option<ScheduleInterval>,
    pub enabled: bool,
    pub timezone: String,
}

impl ScheduleDefinition {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            payload_template: Vec::new(),
            cron_expression: None,
            interval: None,
            enabled: true,
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_template = payload;
        self
    }

    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_expression = Some(expr.into());
        self
    }

    pub fn with_interval(mut self, interval: ScheduleInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation("schedule name is required".into()));
        }
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::Validation("job type is required".into()));
        }
        Ok(())
    }

    /// A cron string was given but is outside the recognised vocabulary.
    pub(crate) fn has_unrecognised_cron(&self) -> bool {
        self.cron_expression
            .as_deref()
            .is_some_and(|expr| CronPattern::parse(expr).is_none())
    }
}
