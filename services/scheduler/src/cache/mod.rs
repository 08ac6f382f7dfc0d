//! Optimistic cache of assumed object state.
//!
//! Scheduling cycles write an *assumed* state the moment they decide, long
//! before the remote API has seen the decision. Reads overlay the assumed
//! state on the last *confirmed* state, so concurrent cycles see each
//! other's pending decisions.
//!
//! An assumption ends in one of three ways:
//!
//! - **Confirm**: the call carrying it succeeded; its result becomes the
//!   confirmed state.
//! - **Forget**: the call failed, was cancelled or dropped, or the producer
//!   rolled back.
//! - **Expiry**: the TTL passed with no call outstanding for it.
//!
//! Entries are held in a sharded map, so operations on unrelated keys do not
//! contend on one lock.

mod sweep;

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use sked_id::{CallId, ObjectKey, ObjectKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api_calls::ApiCall;
use crate::dispatcher::{CallHandle, CallOutcome, Dispatcher, EnqueueError, OnFinish};
use crate::model::ObjectState;

pub use sweep::CLEANUP_PERIOD;

#[derive(Debug, Clone)]
struct Assumption {
    state: ObjectState,
    /// `None` never expires.
    expires_at: Option<Instant>,
    /// The queued or in-flight call that will resolve this assumption.
    pending_call: Option<CallId>,
}

impl Assumption {
    /// Expired assumptions with a call still outstanding stay until the
    /// call reports.
    fn is_expired(&self, now: Instant) -> bool {
        self.pending_call.is_none() && self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    confirmed: Option<ObjectState>,
    assumed: Option<Assumption>,
}

impl CacheEntry {
    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.assumed.is_none()
    }

    fn view(&self, now: Instant) -> Option<&ObjectState> {
        match &self.assumed {
            Some(assumed) if !assumed.is_expired(now) => Some(&assumed.state),
            _ => self.confirmed.as_ref(),
        }
    }
}

/// The optimistic cache.
pub struct Cache {
    entries: DashMap<ObjectKey, CacheEntry>,
    ttl: Duration,
    dispatcher: Option<Dispatcher>,
}

impl Cache {
    /// Create a cache and start its expiry sweep.
    ///
    /// `ttl` is the default lifetime of an assumption; zero means
    /// assumptions never expire. The sweep stops when `ctx` is cancelled.
    /// Must be called within a tokio runtime.
    pub fn new(ctx: &CancellationToken, ttl: Duration, dispatcher: Option<Dispatcher>) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: DashMap::new(),
            ttl,
            dispatcher,
        });
        sweep::spawn_cleanup_task(Arc::downgrade(&cache), ctx.clone(), CLEANUP_PERIOD);
        info!(ttl_ms = ttl.as_millis() as u64, "Optimistic cache started");
        cache
    }

    /// Default assumption TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Dispatcher that `dispatch` enqueues on, if any.
    pub fn dispatcher(&self) -> Option<&Dispatcher> {
        self.dispatcher.as_ref()
    }

    /// Record an assumed state, replacing any earlier assumption for the key.
    pub fn assume(&self, state: ObjectState, ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        let key = state.key.clone();
        debug!(key = %key, node = ?state.node_name, "Assuming object state");

        self.entries.entry(key).or_default().assumed = Some(Assumption {
            state,
            expires_at,
            pending_call: None,
        });
    }

    /// Replace the confirmed state and drop any assumption.
    pub fn confirm(&self, key: &ObjectKey, state: ObjectState) {
        debug!(key = %key, "Confirming object state");
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.confirmed = Some(state);
        entry.assumed = None;
    }

    /// Drop the assumption for `key`, keeping the confirmed state.
    /// Forgetting a key with no assumption does nothing.
    pub fn forget(&self, key: &ObjectKey) {
        let forgot = self
            .entries
            .get_mut(key)
            .and_then(|mut entry| entry.assumed.take())
            .is_some();
        if forgot {
            debug!(key = %key, "Forgot assumed object state");
            self.entries.remove_if(key, |_, entry| entry.is_empty());
        }
    }

    /// Sync a state observed from the remote source of truth.
    /// Assumptions are left alone.
    pub fn observe(&self, state: ObjectState) {
        let key = state.key.clone();
        self.entries.entry(key).or_default().confirmed = Some(state);
    }

    /// The remote object is gone.
    pub fn observe_deleted(&self, key: &ObjectKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.confirmed = None;
        }
        self.entries.remove_if(key, |_, entry| entry.is_empty());
    }

    /// Current view of an object: unexpired assumption, else confirmed.
    pub fn get(&self, key: &ObjectKey) -> Option<ObjectState> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.view(now).cloned())
    }

    /// Last confirmed state, ignoring assumptions.
    pub fn confirmed(&self, key: &ObjectKey) -> Option<ObjectState> {
        self.entries
            .get(key)
            .and_then(|entry| entry.confirmed.clone())
    }

    pub fn is_assumed(&self, key: &ObjectKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.assumed.as_ref().map(|a| !a.is_expired(now)))
            .unwrap_or(false)
    }

    pub fn assumed_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.assumed.as_ref().is_some_and(|a| !a.is_expired(now)))
            .count()
    }

    /// Current view of every known object of `kind`, sorted by key.
    pub fn list(&self, kind: ObjectKind, include_assumed: bool) -> Vec<ObjectState> {
        let now = Instant::now();
        let mut objects: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.key().kind() == kind)
            .filter_map(|entry| {
                if include_assumed {
                    entry.view(now).cloned()
                } else {
                    entry.confirmed.clone()
                }
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }

    /// Enqueue `call` and reconcile its outcome into the cache.
    ///
    /// The assumption for the call's key (if any) is linked to the call so
    /// it does not expire while the call is outstanding. On success the
    /// result is confirmed; on failure, cancellation or drop the assumption
    /// is forgotten. A cache built without a dispatcher fails with `Closed`.
    pub async fn dispatch(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        call: ApiCall,
    ) -> Result<CallHandle, EnqueueError> {
        let dispatcher = self.dispatcher.as_ref().ok_or(EnqueueError::Closed)?;

        let key = call.key().clone();
        let call_id = call.id();
        let previous = self.link(&key, Some(call_id));

        let cache = Arc::downgrade(self);
        let callback_key = key.clone();
        let on_finish: OnFinish = Box::new(move |call_id: CallId, outcome: &CallOutcome| {
            if let Some(cache) = Weak::upgrade(&cache) {
                cache.reconcile(call_id, outcome, &callback_key);
            }
        });

        match dispatcher.enqueue_with(ctx, call, Some(on_finish)).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.relink(&key, call_id, previous);
                Err(e)
            }
        }
    }

    /// Point the key's assumption at `call`, returning what it pointed at.
    fn link(&self, key: &ObjectKey, call: Option<CallId>) -> Option<CallId> {
        self.entries
            .get_mut(key)
            .and_then(|mut entry| {
                entry
                    .assumed
                    .as_mut()
                    .map(|a| std::mem::replace(&mut a.pending_call, call))
            })
            .flatten()
    }

    /// Undo `link` if nothing has replaced it since.
    fn relink(&self, key: &ObjectKey, call_id: CallId, previous: Option<CallId>) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Some(assumed) = entry.assumed.as_mut() {
                if assumed.pending_call == Some(call_id) {
                    assumed.pending_call = previous;
                }
            }
        }
    }

    /// Fold a call outcome into the entry for `key`.
    ///
    /// Only an assumption still linked to `call_id` is resolved; a newer
    /// assumption made while the call was outstanding survives.
    fn reconcile(&self, call_id: CallId, outcome: &CallOutcome, key: &ObjectKey) {
        let Some(mut entry) = self.entries.get_mut(key) else {
            if let CallOutcome::Succeeded(Some(state)) = outcome {
                self.observe(state.clone());
            }
            return;
        };

        let linked = entry
            .assumed
            .as_ref()
            .is_some_and(|a| a.pending_call == Some(call_id));

        match outcome {
            CallOutcome::Succeeded(state) => {
                entry.confirmed = state.clone();
                if linked {
                    entry.assumed = None;
                }
                debug!(key = %key, call_id = %call_id, "Confirmed from API call");
            }
            CallOutcome::Superseded { .. } => {
                // the superseding call carries the intent; if it did not
                // come through the cache, the TTL takes over
                if let Some(assumed) = entry.assumed.as_mut().filter(|_| linked) {
                    assumed.pending_call = None;
                }
            }
            CallOutcome::Failed(_) | CallOutcome::Cancelled | CallOutcome::DroppedOnClose => {
                if linked {
                    entry.assumed = None;
                    debug!(
                        key = %key,
                        call_id = %call_id,
                        outcome = outcome.as_str(),
                        "Forgot assumed state after API call"
                    );
                }
            }
        }

        drop(entry);
        self.entries.remove_if(key, |_, entry| entry.is_empty());
    }

    /// Drop expired assumptions. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        self.entries.retain(|key, entry| {
            if entry.assumed.as_ref().is_some_and(|a| a.is_expired(now)) {
                debug!(key = %key, "Assumed object state expired");
                entry.assumed = None;
                expired += 1;
            }
            !entry.is_empty()
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_calls::{CallKind, RelevanceTable};
    use crate::client::{ApiError, InMemoryClient};
    use crate::dispatcher::DispatcherConfig;
    use crate::model::Binding;

    fn pod(name: &str) -> ObjectState {
        ObjectState::new(ObjectKey::pod("ns", name), format!("uid-{name}"))
    }

    fn cache(ttl: Duration) -> Arc<Cache> {
        Cache::new(&CancellationToken::new(), ttl, None)
    }

    fn dispatcher(client: Arc<InMemoryClient>) -> Dispatcher {
        Dispatcher::with_config(
            client,
            RelevanceTable::standard(),
            DispatcherConfig {
                queue_capacity: 8,
                workers: 2,
                drain_timeout: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn test_assumption_overlays_confirmed() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.observe(pod("foo"));

        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        assert_eq!(cache.get(&key).unwrap().node_name.as_deref(), Some("node-a"));
        assert_eq!(cache.confirmed(&key).unwrap().node_name, None);
        assert!(cache.is_assumed(&key));

        cache.forget(&key);
        assert_eq!(cache.get(&key), Some(pod("foo")));
        assert!(!cache.is_assumed(&key));

        // forgetting again changes nothing
        cache.forget(&key);
        assert_eq!(cache.get(&key), Some(pod("foo")));
    }

    #[tokio::test]
    async fn test_confirm_replaces_assumption() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);

        cache.confirm(&key, pod("foo").with_node("node-b"));
        assert_eq!(cache.get(&key).unwrap().node_name.as_deref(), Some("node-b"));
        assert_eq!(cache.assumed_count(), 0);
    }

    #[tokio::test]
    async fn test_forget_without_confirmed_removes_entry() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.assume(pod("foo"), Duration::ZERO);
        cache.forget(&key);
        assert_eq!(cache.get(&key), None);
        assert!(cache.list(ObjectKind::Pod, true).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_assumption_expires_after_ttl() {
        let cache = cache(Duration::from_secs(5));
        let key = ObjectKey::pod("ns", "foo");
        cache.observe(pod("foo"));
        cache.assume(pod("foo").with_node("node-a"), cache.ttl());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_assumed(&key));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!cache.is_assumed(&key));
        assert_eq!(cache.get(&key), Some(pod("foo")));

        // the sweep has run by now and reclaimed it
        tokio::time::sleep(CLEANUP_PERIOD * 2).await;
        assert_eq!(cache.cleanup_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(cache.is_assumed(&key));
    }

    #[tokio::test]
    async fn test_list_with_and_without_assumed() {
        let cache = cache(Duration::ZERO);
        cache.observe(pod("a"));
        cache.observe(pod("b"));
        cache.observe(ObjectState::new(ObjectKey::node("node-a"), "n1"));
        cache.assume(pod("b").with_node("node-a"), Duration::ZERO);

        let assumed = cache.list(ObjectKind::Pod, true);
        assert_eq!(assumed.len(), 2);
        assert_eq!(assumed[1].node_name.as_deref(), Some("node-a"));

        let confirmed = cache.list(ObjectKind::Pod, false);
        assert!(confirmed.iter().all(|pod| pod.node_name.is_none()));
    }

    #[tokio::test]
    async fn test_observe_deleted_keeps_assumption() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.observe(pod("foo"));
        cache.observe_deleted(&key);
        assert_eq!(cache.get(&key), None);

        cache.assume(pod("foo"), Duration::ZERO);
        cache.observe_deleted(&key);
        assert!(cache.is_assumed(&key));
    }

    #[tokio::test]
    async fn test_dispatch_without_dispatcher_is_closed() {
        let cache = cache(Duration::ZERO);
        let err = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_dispatch_success_confirms() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        let dispatcher = dispatcher(Arc::clone(&client));
        dispatcher.run();
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        let key = ObjectKey::pod("ns", "foo");

        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        let handle = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap();

        assert!(handle.wait().await.is_success());
        assert!(!cache.is_assumed(&key));
        assert_eq!(
            cache.confirmed(&key).unwrap().node_name.as_deref(),
            Some("node-a")
        );
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_dispatch_failure_forgets() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        client.fail_calls(CallKind::Bind, ApiError::Transport("binding error".into()));
        let dispatcher = dispatcher(Arc::clone(&client));
        dispatcher.run();
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        let key = ObjectKey::pod("ns", "foo");

        cache.observe(pod("foo"));
        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        let handle = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap();

        assert!(matches!(handle.wait().await, CallOutcome::Failed(_)));
        assert!(!cache.is_assumed(&key));
        assert_eq!(cache.get(&key), Some(pod("foo")));
        dispatcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_call_holds_assumption_past_ttl() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        let dispatcher = dispatcher(Arc::clone(&client));
        let cache = Cache::new(
            &CancellationToken::new(),
            Duration::from_secs(1),
            Some(dispatcher.clone()),
        );
        let key = ObjectKey::pod("ns", "foo");

        cache.assume(pod("foo").with_node("node-a"), cache.ttl());
        let handle = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.is_assumed(&key));

        dispatcher.run();
        assert!(handle.wait().await.is_success());
        assert!(!cache.is_assumed(&key));
        dispatcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_on_close_forgets() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        let dispatcher = dispatcher(Arc::clone(&client));
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        let key = ObjectKey::pod("ns", "foo");

        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        let handle = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap();

        // never started, so the drain deadline passes with the call queued
        dispatcher.close().await;
        assert_eq!(handle.wait().await, CallOutcome::DroppedOnClose);
        assert!(!cache.is_assumed(&key));
        assert_eq!(cache.get(&key), None);
    }

    #[tokio::test]
    async fn test_cancelled_queued_call_forgets() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        let dispatcher = dispatcher(Arc::clone(&client));
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        let key = ObjectKey::pod("ns", "foo");
        let ctx = CancellationToken::new();

        cache.observe(pod("foo"));
        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        let handle = cache
            .dispatch(&ctx, ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")))
            .await
            .unwrap();
        ctx.cancel();

        dispatcher.run();
        assert_eq!(handle.wait().await, CallOutcome::Cancelled);
        assert!(!cache.is_assumed(&key));
        assert_eq!(cache.get(&key), Some(pod("foo")));
        assert!(client.executed().await.is_empty());
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_observe_keeps_assumption() {
        let cache = cache(Duration::ZERO);
        let key = ObjectKey::pod("ns", "foo");
        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);

        cache.observe(pod("foo").with_label("tier", "web"));
        assert_eq!(cache.get(&key).unwrap().node_name.as_deref(), Some("node-a"));
        assert_eq!(
            cache.confirmed(&key).unwrap(),
            pod("foo").with_label("tier", "web")
        );
    }

    #[test]
    fn test_cache_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Cache>();
        assert_send_sync::<Dispatcher>();
    }

    #[tokio::test]
    async fn test_newer_assumption_survives_older_call() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        client.fail_calls(CallKind::Bind, ApiError::Transport("binding error".into()));
        let dispatcher = dispatcher(Arc::clone(&client));
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        let key = ObjectKey::pod("ns", "foo");

        cache.assume(pod("foo").with_node("node-a"), Duration::ZERO);
        let handle = cache
            .dispatch(
                &CancellationToken::new(),
                ApiCall::bind(Binding::to_node(&pod("foo"), "node-a")),
            )
            .await
            .unwrap();
        cache.assume(pod("foo").with_node("node-b"), Duration::ZERO);

        dispatcher.run();
        assert!(matches!(handle.wait().await, CallOutcome::Failed(_)));
        assert_eq!(cache.get(&key).unwrap().node_name.as_deref(), Some("node-b"));
        dispatcher.close().await;
    }
}
