//! Bounded call dispatcher.
//!
//! Every attempt of every remote call is one task on a service-mode
//! [`WorkQueue`] with `max_concurrent` lanes, so at most that many calls are
//! on the wire at once for a given dispatcher. Backoff sleeps happen outside
//! the lanes: a retry is deferred onto the queue as a fresh task and holds no
//! slot while it waits.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, warn};

use super::queue::{Completion, NoopObserver, Task, WorkQueue};
use super::retry::{Classification, RetryPolicy, classify};
use crate::error::{CallError, Error, Result};
use crate::remote::{CallDescriptor, Transport};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_attempt, start_call_span};

/// Outcome of a dispatched call: a body, absence (`None`), or a failure.
pub type CallResult = std::result::Result<Option<serde_json::Value>, CallError>;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Lanes, i.e. concurrent remote calls.
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retry: RetryPolicy::default(),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    queue: WorkQueue,
    retry: RetryPolicy,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone and no attempt pending: let the lanes exit.
        let _ = self.queue.pause();
    }
}

/// Applies the retry policy to remote calls and runs every attempt through a
/// bounded queue. Clones share the same lanes.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Must be called from within a tokio runtime; the lanes start
    /// immediately.
    pub fn new(transport: Arc<dyn Transport>, config: DispatchConfig) -> Result<Self> {
        config.retry.validate()?;
        if config.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let queue = WorkQueue::with_observer(
            "dispatch",
            config.max_concurrent,
            Completion::Never,
            Arc::new(NoopObserver),
        )?;
        queue.start()?;

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                queue,
                retry: config.retry,
            }),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.queue.lanes()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Calls currently on the wire.
    pub fn inflight(&self) -> usize {
        self.inner.queue.inflight()
    }

    /// Issue `call`, retrying transient failures.
    ///
    /// Resolves to `Ok(Some(body))` on success, `Ok(None)` when the remote
    /// reports absence, and `Err` on a terminal failure or once the retry
    /// budget is spent.
    pub async fn call(&self, call: CallDescriptor) -> CallResult {
        let (reply, rx) = oneshot::channel();
        self.inner
            .queue
            .push(self.attempt(Arc::new(call), 0, reply));
        rx.await.unwrap_or(Err(CallError::Shutdown))
    }

    fn attempt(
        &self,
        call: Arc<CallDescriptor>,
        attempt: u32,
        reply: oneshot::Sender<CallResult>,
    ) -> Task {
        let this = self.clone();
        Task::new("remote-call", async move {
            let span = start_call_span(call.method.as_str(), &call.path);
            let started = Instant::now();

            let outcome = this
                .inner
                .transport
                .issue(&call)
                .instrument(span.clone())
                .await;

            let status = outcome.as_ref().ok().map(|r| r.status);
            record_attempt(&span, attempt, status);
            metrics::call_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("method", call.method.to_string())],
            );

            let label = match classify(outcome) {
                Classification::Success(body) => {
                    let _ = reply.send(Ok(body));
                    "success"
                }
                Classification::Absence => {
                    let _ = reply.send(Ok(None));
                    "absent"
                }
                Classification::Terminal(error) => {
                    debug!(method = %call.method, path = %call.path, %error, "call failed");
                    let _ = reply.send(Err(error));
                    "terminal"
                }
                Classification::Retryable(error) if this.inner.retry.allows_retry_after(attempt) => {
                    let delay = this.inner.retry.delay_for_attempt(attempt);
                    debug!(
                        method = %call.method,
                        path = %call.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying call after backoff"
                    );
                    metrics::remote_retries()
                        .add(1, &[KeyValue::new("method", call.method.to_string())]);
                    let next = this.attempt(Arc::clone(&call), attempt + 1, reply);
                    this.inner.queue.defer(delay, next);
                    "retry"
                }
                Classification::Retryable(error) => {
                    warn!(
                        method = %call.method,
                        path = %call.path,
                        attempts = attempt + 1,
                        %error,
                        "call failed after all retry attempts"
                    );
                    let _ = reply.send(Err(CallError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    }));
                    "exhausted"
                }
            };

            metrics::remote_calls().add(
                1,
                &[
                    KeyValue::new("method", call.method.to_string()),
                    KeyValue::new("outcome", label),
                ],
            );
            Ok(())
        })
    }
}
