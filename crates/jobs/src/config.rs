//! Process configuration read from the environment.
//!
//! | Variable                       | Default         |
//! |--------------------------------|-----------------|
//! | `DATABASE_URL`                 | required        |
//! | `DATABASE_MAX_CONNECTIONS`     | `10` (min `2`)  |
//! | `WORKER_ID`                    | `worker-<uuid>` |
//! | `WORKER_CONCURRENCY`           | `5`             |
//! | `WORKER_POLL_INTERVAL_MS`      | `1000`          |
//! | `WORKER_SHUTDOWN_TIMEOUT_SECS` | `30`            |
//! | `SCHEDULER_TICK_SECS`          | `30`            |
//! | `SCHEDULER_ENABLED`            | `true`          |
//! | `JOB_RETENTION_HOURS`          | `168`           |
//! | `RETENTION_SWEEP_SECS`         | `3600`          |
//!
//! A scheduler tick holds one pooled connection for its locked batch while
//! enqueueing on another, so the pool needs at least two.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retention::RetentionConfig;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;

/// Smallest pool that lets a scheduler tick make progress.
pub const MIN_DATABASE_CONNECTIONS: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub scheduler_enabled: bool,
    pub retention: RetentionConfig,
}

impl PlatformConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let mut worker = WorkerConfig::default();
        if let Some(id) = get("WORKER_ID") {
            worker = worker.with_id(id);
        }
        let concurrency: usize = parse(&get, "WORKER_CONCURRENCY", 5)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                value: concurrency.to_string(),
                reason: "must be at least 1".into(),
            });
        }
        worker = worker
            .with_concurrency(concurrency)
            .with_poll_interval(Duration::from_millis(parse(&get, "WORKER_POLL_INTERVAL_MS", 1000)?))
            .with_shutdown_timeout(Duration::from_secs(parse(&get, "WORKER_SHUTDOWN_TIMEOUT_SECS", 30)?));

        let scheduler = SchedulerConfig::default()
            .with_tick_interval(Duration::from_secs(parse(&get, "SCHEDULER_TICK_SECS", 30)?));

        let retention_hours: u64 = parse(&get, "JOB_RETENTION_HOURS", 168)?;
        let retention_secs = retention_hours.checked_mul(3600).ok_or_else(|| ConfigError::Invalid {
            key: "JOB_RETENTION_HOURS",
            value: retention_hours.to_string(),
            reason: "too large".into(),
        })?;
        let retention = RetentionConfig::default()
            .with_retention(Duration::from_secs(retention_secs))
            .with_sweep_interval(Duration::from_secs(parse(&get, "RETENTION_SWEEP_SECS", 3600)?));

        let database_max_connections: u32 = parse(&get, "DATABASE_MAX_CONNECTIONS", 10)?;
        if database_max_connections < MIN_DATABASE_CONNECTIONS {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: database_max_connections.to_string(),
                reason: format!(
                    "must be at least {MIN_DATABASE_CONNECTIONS}: a scheduler tick holds one connection while enqueueing on another"
                ),
            });
        }

        Ok(Self {
            database_url,
            database_max_connections,
            worker,
            scheduler,
            scheduler_enabled: parse(&get, "SCHEDULER_ENABLED", true)?,
            retention,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = PlatformConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/jobs")])).unwrap();
        assert_eq!(config.database_url, "postgres://localhost/jobs");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.shutdown_timeout, Duration::from_secs(30));
        assert!(config.worker.id.starts_with("worker-"));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
        assert!(config.scheduler_enabled);
        assert_eq!(config.retention.retention, Duration::from_secs(168 * 3600));
        assert_eq!(config.retention.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = PlatformConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("DATABASE_MAX_CONNECTIONS", "25"),
            ("WORKER_ID", "billing-1"),
            ("WORKER_CONCURRENCY", " 12 "),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("WORKER_SHUTDOWN_TIMEOUT_SECS", "5"),
            ("SCHEDULER_TICK_SECS", "10"),
            ("SCHEDULER_ENABLED", "false"),
            ("JOB_RETENTION_HOURS", "24"),
        ]))
        .unwrap();
        assert_eq!(config.database_max_connections, 25);
        assert_eq!(config.worker.id, "billing-1");
        assert_eq!(config.worker.concurrency, 12);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(10));
        assert!(!config.scheduler_enabled);
        assert_eq!(config.retention.retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            PlatformConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
        assert_eq!(
            PlatformConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = PlatformConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("WORKER_CONCURRENCY", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. }));
        assert!(err.to_string().contains("\"lots\""));

        let err = PlatformConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("WORKER_CONCURRENCY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. }));
    }

    #[test]
    fn retention_hours_that_overflow_are_rejected() {
        let huge = u64::MAX.to_string();
        let err = PlatformConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("JOB_RETENTION_HOURS", huge.as_str()),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JOB_RETENTION_HOURS", .. }));
    }

    #[test]
    fn pool_must_fit_a_scheduler_tick() {
        for size in ["0", "1"] {
            let err = PlatformConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://db/jobs"),
                ("DATABASE_MAX_CONNECTIONS", size),
            ]))
            .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "DATABASE_MAX_CONNECTIONS", .. }));
        }

        let config = PlatformConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("DATABASE_MAX_CONNECTIONS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.database_max_connections, MIN_DATABASE_CONNECTIONS);
    }
}
