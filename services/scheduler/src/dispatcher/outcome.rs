//! Call outcomes and the handles producers await them through.

use sked_id::{CallId, ObjectKey};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::api_calls::CallKind;
use crate::client::ApiError;
use crate::model::ObjectState;

/// Final result of an accepted call. Reported exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Executed successfully. `None` for deletes.
    Succeeded(Option<ObjectState>),

    /// Executed and the remote API returned an error.
    Failed(ApiError),

    /// Removed from the queue by a newer call for the same key.
    Superseded { by: CallId },

    /// Its cancellation token fired before a worker picked it up.
    Cancelled,

    /// Still queued when the dispatcher's drain deadline passed.
    DroppedOnClose,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Superseded { .. } => "superseded",
            Self::Cancelled => "cancelled",
            Self::DroppedOnClose => "dropped_on_close",
        }
    }

    /// Collapse into a result for callers that only care whether their
    /// intent took effect.
    ///
    /// Being superseded is not an error: the newer call carries the intent.
    pub fn into_result(self) -> Result<(), CallError> {
        match self {
            Self::Succeeded(_) | Self::Superseded { .. } => Ok(()),
            Self::Failed(e) => Err(CallError::Api(e)),
            Self::Cancelled => Err(CallError::Cancelled),
            Self::DroppedOnClose => Err(CallError::DroppedOnClose),
        }
    }
}

/// A call that did not take effect.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("call cancelled before execution")]
    Cancelled,

    #[error("call dropped: dispatcher closed before it executed")]
    DroppedOnClose,
}

/// Callback run with the outcome of one call, on the worker that finished it.
///
/// Runs before the next call for the same key may start, so callbacks for
/// one key never overlap. Must not block.
pub type OnFinish = Box<dyn FnOnce(CallId, &CallOutcome) + Send + Sync + 'static>;

/// Handle for awaiting a call's outcome. Dropping it is fine.
#[derive(Debug)]
pub struct CallHandle {
    call_id: CallId,
    key: ObjectKey,
    kind: CallKind,
    rx: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> CallOutcome {
        // The reporter always sends before it goes away.
        self.rx.await.unwrap_or(CallOutcome::DroppedOnClose)
    }
}

/// Delivers one call's outcome to its handle and callbacks.
///
/// Dropped without reporting, it reports `DroppedOnClose`, so no accepted
/// call ends without an outcome.
pub(crate) struct Reporter {
    call_id: CallId,
    tx: Option<oneshot::Sender<CallOutcome>>,
    on_finish: Vec<OnFinish>,
}

impl Reporter {
    pub(crate) fn new(
        call_id: CallId,
        key: ObjectKey,
        kind: CallKind,
        on_finish: Option<OnFinish>,
    ) -> (Self, CallHandle) {
        let (tx, rx) = oneshot::channel();
        let reporter = Self {
            call_id,
            tx: Some(tx),
            on_finish: on_finish.into_iter().collect(),
        };
        let handle = CallHandle {
            call_id,
            key,
            kind,
            rx,
        };
        (reporter, handle)
    }

    pub(crate) fn report(mut self, outcome: CallOutcome) {
        self.deliver(outcome);
    }

    /// Discard without reporting. Only for calls that were never accepted.
    pub(crate) fn dismiss(mut self) {
        self.tx = None;
        self.on_finish.clear();
    }

    fn deliver(&mut self, outcome: CallOutcome) {
        for callback in self.on_finish.drain(..) {
            callback(self.call_id, &outcome);
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if self.tx.is_some() || !self.on_finish.is_empty() {
            self.deliver(CallOutcome::DroppedOnClose);
        }
    }
}
