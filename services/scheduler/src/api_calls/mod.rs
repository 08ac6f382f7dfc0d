//! API calls the scheduler issues against the remote API.
//!
//! A call is a closed variant: the set of kinds is fixed, so the relevance
//! table over pairs of kinds can be checked for totality up front.

mod relevance;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sked_id::{CallId, ObjectKey};

use crate::client::{ApiClient, ApiError};
use crate::model::{Binding, DeleteOptions, ObjectState, StatusPatch};

pub use relevance::{Relevance, RelevanceError, RelevanceTable};

/// Kind of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CallKind {
    Bind,
    StatusPatch,
    Delete,
    Update,
}

impl CallKind {
    pub const ALL: [CallKind; 4] = [Self::Bind, Self::StatusPatch, Self::Delete, Self::Update];

    pub(crate) const COUNT: usize = Self::ALL.len();

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Bind => 0,
            Self::StatusPatch => 1,
            Self::Delete => 2,
            Self::Update => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::StatusPatch => "status-patch",
            Self::Delete => "delete",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an API call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallPayload {
    Bind(Binding),
    StatusPatch(StatusPatch),
    Delete(DeleteOptions),
    Update(ObjectState),
}

impl CallPayload {
    pub fn kind(&self) -> CallKind {
        match self {
            Self::Bind(_) => CallKind::Bind,
            Self::StatusPatch(_) => CallKind::StatusPatch,
            Self::Delete(_) => CallKind::Delete,
            Self::Update(_) => CallKind::Update,
        }
    }
}

/// A unit of work for the dispatcher.
///
/// Immutable once accepted, except that the dispatcher may replace or merge
/// it with a newer call for the same key.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCall {
    id: CallId,
    key: ObjectKey,
    created_at: DateTime<Utc>,
    payload: CallPayload,
}

impl ApiCall {
    fn new(key: ObjectKey, payload: CallPayload) -> Self {
        Self {
            id: CallId::new(),
            key,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn bind(binding: Binding) -> Self {
        Self::new(binding.key.clone(), CallPayload::Bind(binding))
    }

    pub fn status_patch(key: ObjectKey, patch: StatusPatch) -> Self {
        Self::new(key, CallPayload::StatusPatch(patch))
    }

    pub fn delete(key: ObjectKey, options: DeleteOptions) -> Self {
        Self::new(key, CallPayload::Delete(options))
    }

    pub fn update(object: ObjectState) -> Self {
        Self::new(object.key.clone(), CallPayload::Update(object))
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn kind(&self) -> CallKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &CallPayload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Combines a queued call with a newer call of the same kind.
    ///
    /// The result keeps the identity of `newer`. Status patches fold their
    /// payloads; for every other kind the newer payload wins outright.
    pub(crate) fn merge(older: ApiCall, newer: ApiCall) -> ApiCall {
        let ApiCall {
            id,
            key,
            created_at,
            payload,
        } = newer;
        let payload = match (older.payload, payload) {
            (CallPayload::StatusPatch(old), CallPayload::StatusPatch(new)) => {
                CallPayload::StatusPatch(old.merge(new))
            }
            (_, payload) => payload,
        };
        ApiCall {
            id,
            key,
            created_at,
            payload,
        }
    }

    /// Executes the call. Returns the resulting object state, or `None` for
    /// a delete.
    pub async fn execute(&self, client: &dyn ApiClient) -> Result<Option<ObjectState>, ApiError> {
        match &self.payload {
            CallPayload::Bind(binding) => client.bind(binding).await.map(Some),
            CallPayload::StatusPatch(patch) => client.patch_status(&self.key, patch).await.map(Some),
            CallPayload::Delete(options) => client.delete(&self.key, options).await.map(|()| None),
            CallPayload::Update(object) => client.update(object).await.map(Some),
        }
    }
}
