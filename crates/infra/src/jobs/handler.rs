//! Handler boundary: what a worker runs for a leased job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sluice_core::{ExecutionLogEntry, JobId, JobKind, JobRecord};

use super::store::{JobStore, JobStoreError};

/// Handler failure, with a hint whether trying again could help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Fatal(m) => m,
        }
    }
}

/// Appends execution log entries to the job being handled.
///
/// Appends go through the store's ownership check, so a handler whose lease
/// was reclaimed cannot write into the new owner's log.
#[derive(Clone)]
pub struct ExecutionLogSink {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker: String,
}

impl ExecutionLogSink {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, worker: impl Into<String>) -> Self {
        Self {
            store,
            job_id,
            worker: worker.into(),
        }
    }

    pub async fn record(&self, entry: ExecutionLogEntry) -> Result<usize, JobStoreError> {
        self.store
            .append_execution_log(self.job_id, &self.worker, entry)
            .await
    }
}

impl core::fmt::Debug for ExecutionLogSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionLogSink")
            .field("job_id", &self.job_id)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Per-job context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    cancel: CancellationToken,
    logs: ExecutionLogSink,
}

impl JobContext {
    pub fn new(cancel: CancellationToken, logs: ExecutionLogSink) -> Self {
        Self { cancel, logs }
    }

    /// Cancelled on shutdown or when the lease is lost.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn logs(&self) -> &ExecutionLogSink {
        &self.logs
    }
}

/// Kind-specific work.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobRecord, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.0)(job.clone(), ctx.clone()).await
    }
}

/// Static mapping from job kind to handler, built at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: JobKind, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn with(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait::async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &JobRecord, _ctx: &JobContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lists_kinds_in_order() {
        let registry = HandlerRegistry::new()
            .with(JobKind::CodeIntelIndex, Noop)
            .with(JobKind::BatchSpecResolution, Noop);

        assert_eq!(
            registry.kinds(),
            vec![JobKind::BatchSpecResolution, JobKind::CodeIntelIndex]
        );
        assert!(registry.get(JobKind::PermissionsSync).is_none());
        assert!(registry.get(JobKind::CodeIntelIndex).is_some());
    }

    #[test]
    fn handler_error_hint() {
        assert!(HandlerError::retryable("timeout").is_retryable());
        let fatal = HandlerError::fatal("bad spec");
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.message(), "bad spec");
        assert_eq!(fatal.to_string(), "bad spec");
    }
}
