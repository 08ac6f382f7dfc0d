//! Call queue partitioned by object key.
//!
//! Each key owns a partition holding its pending calls in FIFO order and
//! whether a call for it is in flight. Keys that have pending calls and no
//! call in flight sit in the ready list, ordered by when they became
//! runnable, so workers always serve the key that has waited longest.
//!
//! Lock order: partition, then ready list. The ready list is never held
//! while taking a partition lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use sked_id::{CallId, ObjectKey};
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api_calls::{ApiCall, Relevance, RelevanceTable};

use super::error::EnqueueError;
use super::outcome::Reporter;

/// A call waiting in (or taken from) the queue.
pub(crate) struct QueuedCall {
    pub(crate) call: ApiCall,
    pub(crate) reporter: Reporter,
    pub(crate) token: CancellationToken,
    /// Held until the call's outcome is reported.
    pub(crate) permit: OwnedSemaphorePermit,
    pub(crate) enqueued_at: Instant,
}

/// Calls removed from the queue by an incoming call.
pub(crate) struct Admitted {
    pub(crate) superseded: Vec<QueuedCall>,
    pub(crate) merged: bool,
}

#[derive(Default)]
struct Partition {
    pending: VecDeque<QueuedCall>,
    in_flight: Option<CallId>,
    /// True while the key is in the ready list or has a call in flight.
    scheduled: bool,
}

impl Partition {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none() && !self.scheduled
    }
}

pub(crate) struct CallQueue {
    partitions: DashMap<ObjectKey, Partition>,
    ready: Mutex<VecDeque<ObjectKey>>,
    relevances: RelevanceTable,

    queued: AtomicUsize,
    in_flight: AtomicUsize,

    /// Signalled when a key becomes runnable or the queue is closing.
    pub(crate) ready_signal: Notify,
    /// Signalled when nothing is queued or in flight.
    idle_signal: Notify,
}

impl CallQueue {
    pub(crate) fn new(relevances: RelevanceTable) -> Self {
        Self {
            partitions: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            relevances,
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            ready_signal: Notify::new(),
            idle_signal: Notify::new(),
        }
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn lock_ready(&self) -> MutexGuard<'_, VecDeque<ObjectKey>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a call, coalescing it with what is queued for its key.
    ///
    /// The incoming call is compared against the tail of its key's queue.
    /// `Replace` drops the tail and compares again against the new tail;
    /// `Merge` folds into the tail; `Append` queues behind it; `Reject`
    /// refuses the call. The cascade is decided before anything is removed,
    /// so a rejection leaves the queue untouched.
    pub(crate) fn push(&self, entry: QueuedCall) -> Result<Admitted, (EnqueueError, QueuedCall)> {
        let key = entry.call.key().clone();
        let incoming = entry.call.kind();

        let mut partition = self.partitions.entry(key.clone()).or_default();

        let mut replaced = 0;
        let mut stop = None;
        for queued in partition.pending.iter().rev() {
            match self.relevances.relevance(queued.call.kind(), incoming) {
                Relevance::Replace => replaced += 1,
                other => {
                    stop = Some((queued.call.kind(), other));
                    break;
                }
            }
        }

        if let Some((queued, Relevance::Reject)) = stop {
            return Err((
                EnqueueError::Rejected {
                    key,
                    queued,
                    incoming,
                },
                entry,
            ));
        }

        let mut superseded = Vec::with_capacity(replaced + 1);
        for _ in 0..replaced {
            if let Some(old) = partition.pending.pop_back() {
                superseded.push(old);
            }
        }

        let merged = matches!(stop, Some((_, Relevance::Merge)));
        let entry = match partition.pending.pop_back() {
            Some(older) if merged => {
                let QueuedCall {
                    call: older_call,
                    reporter: older_reporter,
                    token: older_token,
                    permit,
                    enqueued_at,
                } = older;
                // keep the older slot's place and permit, the incoming
                // call's identity and reporter
                superseded.push(QueuedCall {
                    call: older_call.clone(),
                    reporter: older_reporter,
                    token: older_token,
                    permit: entry.permit,
                    enqueued_at,
                });
                QueuedCall {
                    call: ApiCall::merge(older_call, entry.call),
                    reporter: entry.reporter,
                    token: entry.token,
                    permit,
                    enqueued_at,
                }
            }
            Some(older) => {
                partition.pending.push_back(older);
                entry
            }
            None => entry,
        };

        partition.pending.push_back(entry);
        // every superseded entry, including a merged one, was counted
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(superseded.len(), Ordering::SeqCst);

        if !partition.scheduled {
            partition.scheduled = true;
            self.lock_ready().push_back(key);
            self.ready_signal.notify_one();
        }

        Ok(Admitted { superseded, merged })
    }

    /// Take the next runnable call, marking its key in flight.
    ///
    /// Returns `None` when no key is runnable.
    pub(crate) fn next(&self) -> Option<QueuedCall> {
        loop {
            let key = self.lock_ready().pop_front()?;

            let mut partition = match self.partitions.get_mut(&key) {
                Some(partition) => partition,
                None => continue,
            };

            match partition.pending.pop_front() {
                Some(entry) => {
                    partition.in_flight = Some(entry.call.id());
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Some(entry);
                }
                None => {
                    partition.scheduled = false;
                    drop(partition);
                    self.partitions.remove_if(&key, |_, p| p.is_idle());
                }
            }
        }
    }

    /// Mark the in-flight call for `key` finished and requeue the key if it
    /// has more work.
    pub(crate) fn complete(&self, key: &ObjectKey) {
        let mut idle_key = false;
        if let Some(mut partition) = self.partitions.get_mut(key) {
            if partition.in_flight.take().is_some() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            if partition.pending.is_empty() {
                partition.scheduled = false;
                idle_key = true;
            } else {
                self.lock_ready().push_back(key.clone());
                self.ready_signal.notify_one();
            }
        }

        if idle_key {
            self.partitions.remove_if(key, |_, p| p.is_idle());
        }
        self.notify_if_idle();
    }

    /// Remove every pending call. In-flight calls are left alone.
    pub(crate) fn drain_pending(&self) -> Vec<QueuedCall> {
        let mut drained = Vec::new();
        for mut partition in self.partitions.iter_mut() {
            drained.extend(partition.pending.drain(..));
            partition.scheduled = partition.in_flight.is_some();
        }
        self.partitions.retain(|_, p| !p.is_idle());
        self.lock_ready().clear();
        self.queued.fetch_sub(drained.len(), Ordering::SeqCst);
        self.notify_if_idle();
        drained
    }

    /// Wait until nothing is queued or in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queued_len() == 0 && self.in_flight_len() == 0
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle_signal.notify_waiters();
        }
    }
}
