//! Durable background-job platform.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped, typed by a string tag and carry an opaque payload
//! - The relational store is the only coordination point: claims use
//!   `FOR UPDATE SKIP LOCKED`, duplicates are absorbed by an idempotency index
//! - Failed attempts are retried with exponential backoff (`2^retry_count` s)
//!   until the retry budget is spent, then dead-lettered for a human to acknowledge
//! - Terminal outcomes are recorded in an append-only history
//!
//! ## Components
//!
//! - [`JobQueue`]: enqueue/dequeue/complete/fail, stale reclamation, retention
//! - [`Scheduler`]: turns recurring [`Schedule`]s into queue insertions
//! - [`WorkerPool`]: bounded-concurrency consumer with timeouts and panic isolation
//! - [`HandlerRegistry`]: job type → [`JobHandler`]
//! - [`HistoryService`]: history, dead letters, retry, metrics

pub mod config;
pub mod history;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod scheduler;
pub mod schema;
pub mod types;
pub mod worker;

pub use config::{ConfigError, PlatformConfig};
pub use history::{
    DeadLetter, HistoryFilter, HistoryPage, HistoryService, HistoryStatus, HistoryStore,
    JobHistory, JobMetrics, PostgresHistoryStore,
};
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryBackend;
pub use queue::{FailOutcome, JobQueue, PostgresJobQueue, QueueError};
pub use registry::{HandlerRegistry, HandlerResult, JobHandler, RegistryError};
pub use retention::{RetentionConfig, RetentionSweeper};
pub use scheduler::{
    PostgresScheduleStore, Schedule, ScheduleDefinition, ScheduleInterval, ScheduleStore,
    Scheduler, SchedulerConfig, SchedulerError, TickReport,
};
pub use types::{
    Claim, DeadLetterId, EnqueueOptions, HistoryId, Job, JobId, JobState, ScheduleId, backoff,
    json_payload,
};
pub use worker::{JobContext, WorkerConfig, WorkerMetrics, WorkerPool};
