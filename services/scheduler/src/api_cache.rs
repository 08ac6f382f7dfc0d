//! Read view over the optimistic cache, plus the API calls plugins issue
//! through it.
//!
//! Plugins never talk to the dispatcher directly. Calls sent through the
//! view are linked to the cache so their outcomes confirm or forget the
//! matching assumptions.

use std::sync::Arc;

use sked_id::{ObjectKey, ObjectKind};
use tokio_util::sync::CancellationToken;

use crate::api_calls::ApiCall;
use crate::cache::Cache;
use crate::dispatcher::{CallError, CallHandle, EnqueueError};
use crate::model::{Binding, ObjectState, StatusPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheViewConfig {
    /// Overlay assumed state on reads. Off, reads see only confirmed state.
    pub include_assumed: bool,
}

impl Default for CacheViewConfig {
    fn default() -> Self {
        Self {
            include_assumed: true,
        }
    }
}

/// Scheduler-facing view of the cache.
#[derive(Clone)]
pub struct CacheView {
    config: CacheViewConfig,
    cache: Arc<Cache>,
}

impl CacheView {
    pub fn new(config: CacheViewConfig, cache: Arc<Cache>) -> Self {
        Self { config, cache }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn config(&self) -> CacheViewConfig {
        self.config
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ObjectState> {
        if self.config.include_assumed {
            self.cache.get(key)
        } else {
            self.cache.confirmed(key)
        }
    }

    pub fn list(&self, kind: ObjectKind) -> Vec<ObjectState> {
        self.cache.list(kind, self.config.include_assumed)
    }

    /// Queue a binding. The caller is expected to have assumed the bound
    /// state already.
    pub async fn bind_pod(
        &self,
        ctx: &CancellationToken,
        binding: Binding,
    ) -> Result<CallHandle, EnqueueError> {
        self.cache.dispatch(ctx, ApiCall::bind(binding)).await
    }

    pub async fn patch_status(
        &self,
        ctx: &CancellationToken,
        key: ObjectKey,
        patch: StatusPatch,
    ) -> Result<CallHandle, EnqueueError> {
        self.cache
            .dispatch(ctx, ApiCall::status_patch(key, patch))
            .await
    }

    /// Wait for a queued call to finish.
    ///
    /// Cancelling `ctx` stops the wait, not the call.
    pub async fn wait_on_finish(
        &self,
        ctx: &CancellationToken,
        handle: CallHandle,
    ) -> Result<(), CallError> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(CallError::Cancelled),
            outcome = handle.wait() => outcome.into_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api_calls::{CallKind, RelevanceTable};
    use crate::client::{ApiError, InMemoryClient};
    use crate::dispatcher::Dispatcher;
    use crate::model::{Condition, ConditionStatus};

    fn pod(name: &str) -> ObjectState {
        ObjectState::new(ObjectKey::pod("ns", name), format!("uid-{name}"))
    }

    fn view(client: Arc<InMemoryClient>, config: CacheViewConfig) -> (Dispatcher, CacheView) {
        let dispatcher = Dispatcher::new(client, 16, RelevanceTable::standard());
        dispatcher.run();
        let cache = Cache::new(&CancellationToken::new(), Duration::ZERO, Some(dispatcher.clone()));
        (dispatcher, CacheView::new(config, cache))
    }

    #[tokio::test]
    async fn test_reads_respect_include_assumed() {
        let client = Arc::new(InMemoryClient::new());
        let key = ObjectKey::pod("ns", "foo");

        let (_d, with) = view(Arc::clone(&client), CacheViewConfig::default());
        with.cache().observe(pod("foo"));
        with.cache().assume(pod("foo").with_node("node-a"), Duration::ZERO);
        assert_eq!(with.get(&key).unwrap().node_name.as_deref(), Some("node-a"));

        let without = CacheView::new(
            CacheViewConfig {
                include_assumed: false,
            },
            Arc::clone(with.cache()),
        );
        assert_eq!(without.get(&key).unwrap().node_name, None);
        assert_eq!(without.list(ObjectKind::Pod), vec![pod("foo")]);
    }

    #[tokio::test]
    async fn test_patch_status_and_wait() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        let (dispatcher, view) = view(Arc::clone(&client), CacheViewConfig::default());
        let ctx = CancellationToken::new();
        let key = ObjectKey::pod("ns", "foo");

        let patch = StatusPatch::condition(
            Condition::new("PodScheduled", ConditionStatus::False).with_reason("Unschedulable"),
        );
        let handle = view.patch_status(&ctx, key.clone(), patch).await.unwrap();
        view.wait_on_finish(&ctx, handle).await.unwrap();

        let confirmed = view.get(&key).unwrap();
        assert_eq!(
            confirmed.condition("PodScheduled").map(|c| c.status),
            Some(ConditionStatus::False)
        );
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_wait_on_finish_surfaces_failure() {
        let client = Arc::new(InMemoryClient::with_objects([pod("foo")]));
        client.fail_calls(CallKind::Bind, ApiError::Transport("binding error".into()));
        let (dispatcher, view) = view(Arc::clone(&client), CacheViewConfig::default());
        let ctx = CancellationToken::new();

        let handle = view
            .bind_pod(&ctx, Binding::to_node(&pod("foo"), "node-a"))
            .await
            .unwrap();
        let err = view.wait_on_finish(&ctx, handle).await.unwrap_err();
        assert_eq!(
            err,
            CallError::Api(ApiError::Transport("binding error".into()))
        );
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_wait_on_finish_cancelled_leaves_call_running() {
        let client = Arc::new(
            InMemoryClient::with_objects([pod("foo")]).with_latency(Duration::from_millis(50)),
        );
        let (dispatcher, view) = view(Arc::clone(&client), CacheViewConfig::default());
        let ctx = CancellationToken::new();

        let handle = view
            .bind_pod(&ctx, Binding::to_node(&pod("foo"), "node-a"))
            .await
            .unwrap();
        let waiter = ctx.child_token();
        waiter.cancel();
        assert_eq!(
            view.wait_on_finish(&waiter, handle).await,
            Err(CallError::Cancelled)
        );

        dispatcher.close().await;
        assert_eq!(client.bindings().await.len(), 1);
    }
}
