//! Commits a placement decision by binding a pod to its node.
//!
//! Three modes, chosen at construction:
//!
//! - `Sync`: call the API inline; the result is the real outcome.
//! - `Async`: queue the binding through the cache view and return at once.
//!   The returned handle, or the cache's later state, carries the outcome.
//! - `AsyncAwait`: queue the binding, then wait for its outcome.
//!
//! A `Sync` failure, or a binding that could not be queued, forgets the
//! pod's assumed placement. Once a binding is queued, its outcome is
//! reconciled by the cache against the assumption it was linked to.

use std::fmt;

use sked_id::ObjectKey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api_cache::CacheView;
use crate::client::ApiError;
use crate::dispatcher::{CallError, CallHandle, EnqueueError};
use crate::framework::{CycleState, Handle};
use crate::model::{Binding, ObjectState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    Sync,
    Async,
    AsyncAwait,
}

impl BindMode {
    pub fn is_async(&self) -> bool {
        !matches!(self, Self::Sync)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::AsyncAwait => "async_await",
        }
    }
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BindError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("binding not queued: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("binding cancelled")]
    Cancelled,

    #[error("binding dropped: dispatcher closed before it executed")]
    DroppedOnClose,

    #[error("{0} binding requires an API cacher with a dispatcher on the framework handle")]
    MissingCacher(BindMode),
}

impl From<CallError> for BindError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Api(e) => Self::Api(e),
            CallError::Cancelled => Self::Cancelled,
            CallError::DroppedOnClose => Self::DroppedOnClose,
        }
    }
}

/// Default binding plugin.
pub struct Binder {
    handle: Handle,
    mode: BindMode,
}

impl Binder {
    pub const NAME: &'static str = "DefaultBinder";

    /// Fails if `mode` is asynchronous and `handle` has no API cacher
    /// backed by a dispatcher.
    pub fn new(handle: Handle, mode: BindMode) -> Result<Self, BindError> {
        if mode.is_async() && (handle.api_cacher().is_none() || handle.dispatcher().is_none()) {
            return Err(BindError::MissingCacher(mode));
        }
        Ok(Self { handle, mode })
    }

    pub fn mode(&self) -> BindMode {
        self.mode
    }

    /// Bind `pod` to `node`.
    ///
    /// Returns the call handle in `Async` mode and `None` otherwise.
    pub async fn bind(
        &self,
        ctx: &CancellationToken,
        state: &CycleState,
        pod: &ObjectState,
        node: &str,
    ) -> Result<Option<CallHandle>, BindError> {
        info!(
            key = %pod.key,
            node = %node,
            mode = %self.mode,
            cycle_id = %state.cycle_id(),
            "Attempting to bind pod to node"
        );
        let binding = Binding::to_node(pod, node);

        let result = match self.mode {
            BindMode::Sync => self.bind_sync(ctx, &binding).await.map(|()| None),
            BindMode::Async | BindMode::AsyncAwait => {
                self.bind_async(ctx, state, binding).await
            }
        };

        if let Err(e) = &result {
            warn!(key = %pod.key, node = %node, error = %e, "Failed to bind pod");
            // once a call is queued, the cache resolves the assumption it
            // was linked to and leaves newer ones alone
            if !self.mode.is_async() || matches!(e, BindError::Enqueue(_)) {
                self.forget(&pod.key);
            }
        }
        result
    }

    /// Cancellation is only honoured before the request goes out; once sent,
    /// the binding runs to completion so the cache matches the remote.
    async fn bind_sync(&self, ctx: &CancellationToken, binding: &Binding) -> Result<(), BindError> {
        if ctx.is_cancelled() {
            return Err(BindError::Cancelled);
        }
        let bound = self.handle.client().bind(binding).await?;

        if let Some(cache) = self.handle.cache() {
            cache.confirm(&binding.key, bound);
        }
        debug!(key = %binding.key, node = %binding.node_name(), "Bound pod");
        Ok(())
    }

    async fn bind_async(
        &self,
        ctx: &CancellationToken,
        state: &CycleState,
        binding: Binding,
    ) -> Result<Option<CallHandle>, BindError> {
        let cacher = self.cacher()?;

        let handle = cacher.bind_pod(ctx, binding).await?;
        state.record_call(handle.call_id());
        debug!(call_id = %handle.call_id(), key = %handle.key(), "Queued binding");

        match self.mode {
            BindMode::AsyncAwait => {
                cacher.wait_on_finish(ctx, handle).await?;
                Ok(None)
            }
            _ => Ok(Some(handle)),
        }
    }

    fn cacher(&self) -> Result<&CacheView, BindError> {
        self.handle
            .api_cacher()
            .ok_or(BindError::MissingCacher(self.mode))
    }

    fn forget(&self, key: &ObjectKey) {
        if let Some(cache) = self.handle.cache() {
            cache.forget(key);
        }
    }
}
