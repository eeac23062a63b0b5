//! Executor for deferred (background) recomputes.
//!
//! One tokio task is spawned per submitted recompute; a semaphore bounds how
//! many run at once, the rest wait their turn without blocking the
//! submitter. Failures and panics are reported to an injected [`ErrorSink`]
//! and never reach the original caller.

use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use metrics::counter;
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, error, info_span};
use tracing_error::SpanTrace;

use crate::domain::entities::CacheKey;

const METRIC_DEFERRED_FAILED_TOTAL: &str = "tierstash_deferred_failed_total";

pub type DeferredError = Box<dyn StdError + Send + Sync + 'static>;

/// Identifies a deferred recompute in logs and failure reports.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub function: String,
    pub key: CacheKey,
    pub args: String,
}

/// A deferred recompute that returned an error or panicked.
#[derive(Debug)]
pub struct DeferredFailure {
    pub task: DeferredTask,
    /// The error followed by its sources, outermost first.
    pub messages: Vec<String>,
    pub panicked: bool,
    pub span_trace: SpanTrace,
}

impl DeferredFailure {
    fn from_error(task: DeferredTask, error: &(dyn StdError + 'static)) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            task,
            messages,
            panicked: false,
            span_trace: SpanTrace::capture(),
        }
    }

    fn from_panic(task: DeferredTask, payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self {
            task,
            messages: vec![message],
            panicked: true,
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Receives deferred recompute failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: &DeferredFailure);
}

/// Logs failures at error level with the full error chain and span trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: &DeferredFailure) {
        error!(
            target = "application::worker",
            function = %failure.task.function,
            args = %failure.task.args,
            key = %failure.task.key,
            panicked = failure.panicked,
            error = %failure.messages.join(": "),
            span_trace = %failure.span_trace,
            "exception in deferred recompute"
        );
    }
}

struct ExecutorInner {
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
    sink: Arc<dyn ErrorSink>,
}

#[derive(Clone)]
pub struct DeferredExecutor {
    inner: Arc<ExecutorInner>,
}

impl DeferredExecutor {
    pub fn new(concurrency: NonZeroUsize) -> Self {
        Self::with_error_sink(concurrency, Arc::new(TracingErrorSink))
    }

    pub fn with_error_sink(concurrency: NonZeroUsize, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                permits: Arc::new(Semaphore::new(concurrency.get())),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                sink,
            }),
        }
    }

    /// Run `work` in the background, then `cleanup` on every exit path.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<W, C>(&self, task: DeferredTask, work: W, cleanup: C)
    where
        W: Future<Output = Result<(), DeferredError>> + Send + 'static,
        C: Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let span = info_span!(
            "deferred_recompute",
            function = %task.function,
            key = %task.key
        );

        tokio::spawn(
            async move {
                // The semaphore is never closed, so acquisition only fails on shutdown.
                let permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
                let outcome = AssertUnwindSafe(work).catch_unwind().await;
                cleanup.await;
                drop(permit);

                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(DeferredFailure::from_error(task, &*err)),
                    Err(payload) => Some(DeferredFailure::from_panic(task, payload)),
                };
                if let Some(failure) = failure {
                    counter!(METRIC_DEFERRED_FAILED_TOTAL).increment(1);
                    inner.sink.report(&failure);
                }

                if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    inner.idle.notify_waiters();
                }
            }
            .instrument(span),
        );
    }

    /// Number of submitted recomputes that have not finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted recompute has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
