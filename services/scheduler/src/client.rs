//! Remote API client interface and in-memory implementation.
//!
//! The dispatcher's workers share one client, so implementations must be
//! safe for concurrent use.
//!
//! `InMemoryClient` stands in for the real control-plane API in the binary
//! and in tests. It keeps objects in memory, applies the same preconditions
//! a real API server would (uid and resource-version checks, no rebinding)
//! and can be told to fail or slow down specific call kinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sked_id::{ObjectKey, ObjectKind};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::api_calls::{CallKind, CallPayload};
use crate::model::{Binding, DeleteOptions, ObjectState, StatusPatch};

/// Errors returned by the remote API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    /// Precondition failed or the object was modified concurrently.
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },

    #[error("invalid request for {key}: {message}")]
    Invalid { key: ObjectKey, message: String },

    /// The request never got a definitive answer.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    fn conflict(key: &ObjectKey, message: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.clone(),
            message: message.into(),
        }
    }
}

/// Typed mutations against named remote objects.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Create the binding subresource, assigning the object to a node.
    async fn bind(&self, binding: &Binding) -> Result<ObjectState, ApiError>;

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &StatusPatch,
    ) -> Result<ObjectState, ApiError>;

    async fn delete(&self, key: &ObjectKey, options: &DeleteOptions) -> Result<(), ApiError>;

    /// Replace the object. Fails with a conflict if `object.resource_version`
    /// is stale.
    async fn update(&self, object: &ObjectState) -> Result<ObjectState, ApiError>;

    async fn get(&self, key: &ObjectKey) -> Result<ObjectState, ApiError>;

    async fn list(&self, kind: ObjectKind) -> Result<Vec<ObjectState>, ApiError>;
}

/// A mutation the in-memory client received.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCall {
    pub key: ObjectKey,
    pub payload: CallPayload,
}

impl ExecutedCall {
    pub fn kind(&self) -> CallKind {
        self.payload.kind()
    }
}

/// In-process API client.
#[derive(Default)]
pub struct InMemoryClient {
    objects: RwLock<HashMap<ObjectKey, ObjectState>>,

    /// Errors returned for every call of a kind until cleared.
    failures: DashMap<CallKind, ApiError>,

    /// Artificial delay applied to every mutation.
    latency: Option<Duration>,

    executed: Mutex<Vec<ExecutedCall>>,

    /// Mutations currently executing, per key.
    active: DashMap<ObjectKey, usize>,
    max_active_per_key: AtomicUsize,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client pre-populated with `objects`.
    pub fn with_objects(objects: impl IntoIterator<Item = ObjectState>) -> Self {
        let objects = objects
            .into_iter()
            .map(|object| (object.key.clone(), object))
            .collect();
        Self {
            objects: RwLock::new(objects),
            ..Self::default()
        }
    }

    /// Delay every mutation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every call of `kind` with `error` until [`clear_failures`] is called.
    ///
    /// [`clear_failures`]: Self::clear_failures
    pub fn fail_calls(&self, kind: CallKind, error: ApiError) {
        self.failures.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub async fn insert(&self, object: ObjectState) {
        self.objects.write().await.insert(object.key.clone(), object);
    }

    /// All mutations received so far, in arrival order. Failed calls are
    /// included.
    pub async fn executed(&self) -> Vec<ExecutedCall> {
        self.executed.lock().await.clone()
    }

    /// Bindings received so far, including failed ones.
    pub async fn bindings(&self) -> Vec<Binding> {
        self.executed
            .lock()
            .await
            .iter()
            .filter_map(|call| match &call.payload {
                CallPayload::Bind(binding) => Some(binding.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of mutations ever observed executing at once for a
    /// single key.
    pub fn max_active_per_key(&self) -> usize {
        self.max_active_per_key.load(Ordering::SeqCst)
    }

    /// Shared prologue of every mutation: record, track concurrency, delay,
    /// apply injected failures.
    async fn begin(&self, key: &ObjectKey, payload: CallPayload) -> Result<ActiveGuard<'_>, ApiError> {
        let kind = payload.kind();
        self.executed.lock().await.push(ExecutedCall {
            key: key.clone(),
            payload,
        });

        let guard = ActiveGuard::enter(self, key);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.failures.get(&kind).map(|e| e.value().clone()) {
            debug!(key = %key, kind = %kind, error = %error, "Injected API failure");
            return Err(error);
        }

        Ok(guard)
    }
}

#[async_trait]
impl ApiClient for InMemoryClient {
    async fn bind(&self, binding: &Binding) -> Result<ObjectState, ApiError> {
        let _active = self
            .begin(&binding.key, CallPayload::Bind(binding.clone()))
            .await?;

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(&binding.key)
            .ok_or_else(|| ApiError::NotFound(binding.key.clone()))?;

        if let Some(uid) = &binding.uid {
            if uid != &object.uid {
                return Err(ApiError::conflict(&binding.key, "uid precondition failed"));
            }
        }
        if let Some(node) = &object.node_name {
            return Err(ApiError::conflict(
                &binding.key,
                format!("already assigned to node {node}"),
            ));
        }

        object.node_name = Some(binding.node_name().to_string());
        object.resource_version += 1;
        Ok(object.clone())
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &StatusPatch,
    ) -> Result<ObjectState, ApiError> {
        let _active = self
            .begin(key, CallPayload::StatusPatch(patch.clone()))
            .await?;

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| ApiError::NotFound(key.clone()))?;

        let mut patched = patch.apply_to(object);
        patched.resource_version += 1;
        *object = patched.clone();
        Ok(patched)
    }

    async fn delete(&self, key: &ObjectKey, options: &DeleteOptions) -> Result<(), ApiError> {
        let _active = self
            .begin(key, CallPayload::Delete(options.clone()))
            .await?;

        let mut objects = self.objects.write().await;
        let object = objects
            .get(key)
            .ok_or_else(|| ApiError::NotFound(key.clone()))?;

        if let Some(uid) = &options.uid {
            if uid != &object.uid {
                return Err(ApiError::conflict(key, "uid precondition failed"));
            }
        }

        objects.remove(key);
        Ok(())
    }

    async fn update(&self, object: &ObjectState) -> Result<ObjectState, ApiError> {
        let _active = self
            .begin(&object.key, CallPayload::Update(object.clone()))
            .await?;

        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(&object.key)
            .ok_or_else(|| ApiError::NotFound(object.key.clone()))?;

        if stored.resource_version != object.resource_version {
            return Err(ApiError::conflict(
                &object.key,
                format!(
                    "resource version {} is stale, current is {}",
                    object.resource_version, stored.resource_version
                ),
            ));
        }

        let mut updated = object.clone();
        updated.resource_version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn get(&self, key: &ObjectKey) -> Result<ObjectState, ApiError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.clone()))
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<ObjectState>, ApiError> {
        let mut objects: Vec<_> = self
            .objects
            .read()
            .await
            .values()
            .filter(|object| object.key.kind() == kind)
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

/// Counts a mutation as executing for its key until dropped.
struct ActiveGuard<'a> {
    client: &'a InMemoryClient,
    key: ObjectKey,
}

impl<'a> ActiveGuard<'a> {
    fn enter(client: &'a InMemoryClient, key: &ObjectKey) -> Self {
        let active = {
            let mut count = client.active.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        client.max_active_per_key.fetch_max(active, Ordering::SeqCst);
        Self {
            client,
            key: key.clone(),
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.client.active.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
    }
}
