//! Asynchronous API call dispatcher.
//!
//! Producers enqueue calls and return immediately; a fixed pool of workers
//! executes them against the remote API. Guarantees:
//!
//! - At most one call per object key executes at a time.
//! - Calls for one key run in enqueue order, after coalescing through the
//!   relevance table.
//! - Workers serve the key that has been runnable longest.
//! - Every accepted call gets exactly one outcome. The dispatcher never
//!   retries; that is the producer's decision.
//!
//! The dispatcher is an explicitly owned value, cheap to clone, shared with
//! whoever needs to enqueue.

mod error;
mod outcome;
mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api_calls::{ApiCall, RelevanceTable};
use crate::client::ApiClient;

pub use error::EnqueueError;
pub use outcome::{CallError, CallHandle, CallOutcome, OnFinish};

use outcome::Reporter;
use queue::{CallQueue, QueuedCall};

/// Default bound on outstanding calls.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 16;

/// Default time `close` waits for queued calls to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bound on queued plus in-flight calls across all keys.
    pub queue_capacity: usize,

    pub workers: usize,

    /// How long `close` waits before dropping what is still queued.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Summary of a `close`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Calls outstanding when close began that finished before the deadline.
    /// Calls still executing at the deadline count as neither.
    pub drained: usize,
    /// Calls reported `DroppedOnClose`.
    pub dropped: usize,
}

/// Dispatcher handle.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn ApiClient>,
    queue: CallQueue,
    capacity: Arc<Semaphore>,
    config: DispatcherConfig,

    /// Cancelled when close begins; wakes producers blocked on capacity.
    closing: CancellationToken,
    closed: AtomicBool,
    /// Admission holds it shared across the closed check and the push;
    /// close holds it exclusively while setting `closed`. Nothing lands in
    /// the queue after close has seen it.
    admission: RwLock<()>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher with default worker count and drain timeout.
    pub fn new(
        client: Arc<dyn ApiClient>,
        queue_capacity: usize,
        relevances: RelevanceTable,
    ) -> Self {
        Self::with_config(
            client,
            relevances,
            DispatcherConfig {
                queue_capacity,
                ..DispatcherConfig::default()
            },
        )
    }

    pub fn with_config(
        client: Arc<dyn ApiClient>,
        relevances: RelevanceTable,
        mut config: DispatcherConfig,
    ) -> Self {
        if config.queue_capacity == 0 {
            warn!("Dispatch queue capacity of 0 would block every producer, using 1");
            config.queue_capacity = 1;
        }
        config.workers = config.workers.max(1);

        Self {
            inner: Arc::new(Inner {
                client,
                queue: CallQueue::new(relevances),
                capacity: Arc::new(Semaphore::new(config.queue_capacity)),
                config,
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
                admission: RwLock::new(()),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the worker pool. Calls enqueued before this wait until it runs.
    ///
    /// Must be called within a tokio runtime. Calling it again is a no-op.
    pub fn run(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            workers = self.inner.config.workers,
            queue_capacity = self.inner.config.queue_capacity,
            "Starting API dispatcher"
        );

        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                inner.run_worker(worker).await;
            }));
        }
    }

    /// Enqueue a call, waiting for capacity if the queue is full.
    pub async fn enqueue(
        &self,
        ctx: &CancellationToken,
        call: ApiCall,
    ) -> Result<CallHandle, EnqueueError> {
        self.enqueue_with(ctx, call, None).await
    }

    /// Enqueue a call with a completion callback.
    ///
    /// `on_finish` runs exactly once with the call's outcome if the call is
    /// accepted, and never if enqueue returns an error.
    pub async fn enqueue_with(
        &self,
        ctx: &CancellationToken,
        call: ApiCall,
        on_finish: Option<OnFinish>,
    ) -> Result<CallHandle, EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }

        let permit = tokio::select! {
            biased;
            _ = self.inner.closing.cancelled() => return Err(EnqueueError::Closed),
            _ = ctx.cancelled() => return Err(EnqueueError::Cancelled),
            permit = Arc::clone(&self.inner.capacity).acquire_owned() => {
                permit.map_err(|_| EnqueueError::Closed)?
            }
        };

        self.admit(ctx, call, permit, on_finish)
    }

    /// Enqueue without waiting. Fails with `QueueFull` when at capacity.
    pub fn try_enqueue(
        &self,
        ctx: &CancellationToken,
        call: ApiCall,
        on_finish: Option<OnFinish>,
    ) -> Result<CallHandle, EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(EnqueueError::Cancelled);
        }

        let permit = match Arc::clone(&self.inner.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(EnqueueError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                })
            }
            Err(TryAcquireError::Closed) => return Err(EnqueueError::Closed),
        };

        self.admit(ctx, call, permit, on_finish)
    }

    fn admit(
        &self,
        ctx: &CancellationToken,
        call: ApiCall,
        permit: OwnedSemaphorePermit,
        on_finish: Option<OnFinish>,
    ) -> Result<CallHandle, EnqueueError> {
        let admission = self
            .inner
            .admission
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }

        let call_id = call.id();
        let (reporter, handle) = Reporter::new(call_id, call.key().clone(), call.kind(), on_finish);
        let entry = QueuedCall {
            call,
            reporter,
            token: ctx.clone(),
            permit,
            enqueued_at: Instant::now(),
        };

        let pushed = self.inner.queue.push(entry);
        drop(admission);

        match pushed {
            Ok(admitted) => {
                debug!(
                    call_id = %call_id,
                    key = %handle.key(),
                    kind = %handle.kind(),
                    merged = admitted.merged,
                    superseded = admitted.superseded.len(),
                    "Enqueued API call"
                );
                for old in admitted.superseded {
                    debug!(
                        call_id = %old.call.id(),
                        key = %old.call.key(),
                        kind = %old.call.kind(),
                        by = %call_id,
                        "API call superseded"
                    );
                    old.reporter.report(CallOutcome::Superseded { by: call_id });
                }
                Ok(handle)
            }
            Err((err, entry)) => {
                debug!(call_id = %call_id, error = %err, "API call rejected");
                entry.reporter.dismiss();
                Err(err)
            }
        }
    }

    /// Stop accepting calls and drain.
    ///
    /// Waits up to the drain timeout for queued and in-flight calls to
    /// finish. Calls still queued at the deadline are reported
    /// `DroppedOnClose`; calls already executing run to completion and
    /// report normally. Only the first call does anything.
    pub async fn close(&self) -> CloseReport {
        {
            let _admission = self
                .inner
                .admission
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return CloseReport::default();
            }
        }

        let outstanding = self.queued_len() + self.in_flight_len();
        info!(
            queued = self.queued_len(),
            in_flight = self.in_flight_len(),
            drain_timeout_ms = self.inner.config.drain_timeout.as_millis() as u64,
            "Closing API dispatcher"
        );

        self.inner.closing.cancel();
        self.inner.queue.ready_signal.notify_waiters();

        let drained_in_time =
            tokio::time::timeout(self.inner.config.drain_timeout, self.inner.queue.wait_idle())
                .await
                .is_ok();

        let mut dropped = 0;
        let mut running = 0;
        if !drained_in_time {
            running = self.in_flight_len();
            for entry in self.inner.queue.drain_pending() {
                warn!(
                    call_id = %entry.call.id(),
                    key = %entry.call.key(),
                    kind = %entry.call.kind(),
                    "Dropping API call on close"
                );
                entry.reporter.report(CallOutcome::DroppedOnClose);
                dropped += 1;
            }
        }
        self.inner.queue.ready_signal.notify_waiters();

        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if drained_in_time {
            for worker in workers {
                let _ = worker.await;
            }
        }
        // otherwise in-flight calls finish on their own

        let report = CloseReport {
            drained: outstanding.saturating_sub(dropped + running),
            dropped,
        };
        info!(
            drained = report.drained,
            dropped = report.dropped,
            "API dispatcher closed"
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Calls waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.inner.queue.queued_len()
    }

    /// Calls currently executing.
    pub fn in_flight_len(&self) -> usize {
        self.inner.queue.in_flight_len()
    }
}

impl Inner {
    async fn run_worker(&self, worker: usize) {
        debug!(worker, "Dispatcher worker started");

        loop {
            let notified = self.queue.ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.queue.next() {
                self.execute(worker, entry).await;
                continue;
            }

            if self.closed.load(Ordering::SeqCst) && self.queue.queued_len() == 0 {
                break;
            }

            notified.await;
        }

        debug!(worker, "Dispatcher worker stopped");
    }

    async fn execute(&self, worker: usize, entry: QueuedCall) {
        let QueuedCall {
            call,
            reporter,
            token,
            permit,
            enqueued_at,
        } = entry;

        let outcome = if token.is_cancelled() {
            CallOutcome::Cancelled
        } else {
            let started = Instant::now();
            let result = call.execute(self.client.as_ref()).await;
            debug!(
                worker,
                call_id = %call.id(),
                key = %call.key(),
                kind = %call.kind(),
                queued_ms = started.duration_since(enqueued_at).as_millis() as u64,
                took_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Executed API call"
            );
            match result {
                Ok(state) => CallOutcome::Succeeded(state),
                Err(e) => {
                    warn!(
                        call_id = %call.id(),
                        key = %call.key(),
                        kind = %call.kind(),
                        error = %e,
                        "API call failed"
                    );
                    CallOutcome::Failed(e)
                }
            }
        };

        // Report while the key is still marked in flight so outcome
        // handlers for one key never overlap.
        reporter.report(outcome);
        self.queue.complete(call.key());
        drop(permit);
    }
}
