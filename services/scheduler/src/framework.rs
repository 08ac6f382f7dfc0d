//! Shared state handed to scheduling plugins.

use std::sync::{Arc, Mutex, PoisonError};

use sked_id::{CallId, CycleId};

use crate::api_cache::CacheView;
use crate::cache::Cache;
use crate::client::ApiClient;
use crate::dispatcher::Dispatcher;

/// Everything a plugin may need to reach the outside world.
///
/// The cache view, and the dispatcher behind its cache, are present only
/// when API calls run asynchronously.
#[derive(Clone)]
pub struct Handle {
    client: Arc<dyn ApiClient>,
    cache: Option<Arc<Cache>>,
    api_cacher: Option<CacheView>,
}

impl Handle {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self {
            client,
            cache: None,
            api_cacher: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Also sets the cache to the view's.
    pub fn with_api_cacher(mut self, view: CacheView) -> Self {
        self.cache = Some(Arc::clone(view.cache()));
        self.api_cacher = Some(view);
        self
    }

    pub fn client(&self) -> &Arc<dyn ApiClient> {
        &self.client
    }

    /// Dispatcher the cache enqueues on, if any.
    pub fn dispatcher(&self) -> Option<&Dispatcher> {
        self.cache.as_ref().and_then(|cache| cache.dispatcher())
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub fn api_cacher(&self) -> Option<&CacheView> {
        self.api_cacher.as_ref()
    }
}

/// Per-cycle scratch state.
#[derive(Debug)]
pub struct CycleState {
    cycle_id: CycleId,
    dispatched: Mutex<Vec<CallId>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            cycle_id: CycleId::new(),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn cycle_id(&self) -> CycleId {
        self.cycle_id
    }

    /// Note a call issued during this cycle.
    pub fn record_call(&self, call_id: CallId) {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call_id);
    }

    /// Calls issued during this cycle, in order.
    pub fn dispatched_calls(&self) -> Vec<CallId> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}
