//! Job type → handler bindings.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::Job;
use crate::worker::JobContext;

/// What a handler returns: an optional result blob, or the error recorded
/// against the attempt.
pub type HandlerResult = anyhow::Result<Option<Vec<u8>>>;

/// Executes jobs of one type.
///
/// Handlers must tolerate being run more than once for the same job and
/// should return promptly once `ctx` is cancelled.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: &Job) -> HandlerResult;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler already registered for job type: {0}")]
    AlreadyRegistered(String),
}

/// Thread-safe registry, populated at startup and read for the worker's lifetime.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&job_type) {
            return Err(RegistryError::AlreadyRegistered(job_type));
        }
        debug!(job_type = %job_type, "job handler registered");
        handlers.insert(job_type, Arc::new(handler));
        Ok(())
    }

    /// Like [`register`](Self::register) for program initialisation.
    ///
    /// # Panics
    ///
    /// If a handler is already registered for `job_type`.
    pub fn must_register(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        if let Err(e) = self.register(job_type, handler) {
            panic!("{e}");
        }
    }

    /// Register a bare async function.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(job_type, FnHandler::new(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Returns whether a handler was removed.
    pub fn unregister(&self, job_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_type)
            .is_some()
    }
}

struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut> {
    fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, job: &Job) -> HandlerResult {
        (self.f)(ctx, job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizops_core::TenantId;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use crate::types::EnqueueOptions;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, _ctx: JobContext, job: &Job) -> HandlerResult {
            Ok(Some(job.payload.clone()))
        }
    }

    fn ctx() -> JobContext {
        JobContext::new(CancellationToken::new(), Utc::now(), "w1")
    }

    fn job(job_type: &str) -> Job {
        Job::new(TenantId::new(), job_type, vec![1, 2, 3], EnqueueOptions::default(), Utc::now())
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Echo).unwrap();
        assert_eq!(
            registry.register("echo", Echo),
            Err(RegistryError::AlreadyRegistered("echo".into()))
        );
        assert!(registry.has("echo"));
        assert!(!registry.has("other"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn must_register_panics_on_duplicate() {
        let registry = HandlerRegistry::new();
        registry.must_register("echo", Echo);
        registry.must_register("echo", Echo);
    }

    #[test]
    fn types_are_sorted_and_unregister_removes() {
        let registry = HandlerRegistry::new();
        registry.must_register("zeta", Echo);
        registry.must_register("alpha", Echo);
        assert_eq!(registry.types(), ["alpha", "zeta"]);

        assert!(registry.unregister("zeta"));
        assert!(!registry.unregister("zeta"));
        assert_eq!(registry.types(), ["alpha"]);
        assert!(registry.get("zeta").is_none());
    }

    #[tokio::test]
    async fn registered_handlers_run() {
        let registry = HandlerRegistry::new();
        registry.must_register("echo", Echo);
        registry
            .register_fn("len", |_ctx, job: Job| async move {
                Ok::<_, anyhow::Error>(Some(vec![job.payload.len() as u8]))
            })
            .unwrap();

        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.handle(ctx(), &job("echo")).await.unwrap(), Some(vec![1, 2, 3]));

        let len = registry.get("len").unwrap();
        assert_eq!(len.handle(ctx(), &job("len")).await.unwrap(), Some(vec![3]));
    }

    #[test]
    fn lookup_is_shareable_across_threads() {
        let registry = Arc::new(HandlerRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let job_type = format!("t{i}");
                    registry.register(job_type.clone(), Echo).unwrap();
                    registry.has(&job_type)
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(registry.types().len(), 4);
    }
}
