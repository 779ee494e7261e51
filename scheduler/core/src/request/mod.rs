//! Requests and Their Lifecycle
//!
//! A [`Request`] is what callers hand to the scheduler: a [`Query`] or a
//! [`Decision`] plus a success and a failure continuation. On submission the
//! continuations move into a shared lifecycle record, and the caller gets a
//! [`RequestHandle`] to observe or cancel the request.
//!
//! # State Machine
//!
//! ```text
//!             submit                 dispatch
//!  (new) ──────────────► Waiting ─────────────► Running ───► Completed
//!    │                      │                      │
//!    │ rejected             │ shutdown             │ cancel
//!    v                      v                      v
//!  Completed            Cancelled              Cancelled
//! ```
//!
//! Every transition out of `Waiting`/`Running` happens under the lifecycle
//! lock and takes the continuations out of it, so at most one continuation is
//! ever invoked per request.

pub mod decision;
pub mod query;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::CallKind;
use crate::error::RequestError;
use crate::routing::EngineResponse;

use self::decision::{Decision, SimulationState};
use self::query::Query;

// ============================================================================
// Identity and States
// ============================================================================

/// Unique identifier of a submitted request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Queued, waiting for a free connection
    Waiting,
    /// Bound to a connection, call in flight
    Running,
    /// A continuation has fired
    Completed,
    /// Cancelled by the caller or dropped at shutdown
    Cancelled,
}

impl RequestState {
    /// Whether the request can no longer change state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// User-visible result of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    /// Rejected before reaching a backend
    SyntaxError,
    /// The engine or the transport reported a failure, or the property does not hold
    Error,
    /// Cancelled; neither success nor failure
    Unknown,
    /// The property holds, or the step produced a new state
    Successful,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyntaxError => write!(f, "SYNTAX_ERROR"),
            Self::Error => write!(f, "ERROR"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Successful => write!(f, "SUCCESSFUL"),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

type VerdictFn = Box<dyn FnOnce(bool) + Send>;
type SimulationFn = Box<dyn FnOnce(SimulationState) + Send>;
type FailureFn = Box<dyn FnOnce(RequestError) + Send>;

/// Callback that sees every classified response of a running request
pub type ResponseObserver = Arc<dyn Fn(&RequestId, &EngineResponse) + Send + Sync>;

/// The payload a request transports
#[derive(Clone, Debug, PartialEq)]
pub enum RequestKind {
    /// Declarative query, answered with a verdict
    Query(Query),
    /// Simulation step, answered with a new state
    Decision(Decision),
}

impl RequestKind {
    /// The engine RPC this payload goes to
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        match self {
            Self::Query(_) => CallKind::Query,
            Self::Decision(_) => CallKind::Decision,
        }
    }
}

enum SuccessHandler {
    Verdict(VerdictFn),
    Simulation(SimulationFn),
}

pub(crate) struct Continuations {
    success: SuccessHandler,
    failure: FailureFn,
}

impl Continuations {
    fn accepts(&self, outcome: &Outcome) -> bool {
        matches!(
            (&self.success, outcome),
            (SuccessHandler::Verdict(_), Outcome::Verdict(_))
                | (SuccessHandler::Simulation(_), Outcome::Simulation(_))
                | (_, Outcome::Failed(_))
        )
    }

    fn invoke(self, outcome: Outcome) {
        match (self.success, outcome) {
            (SuccessHandler::Verdict(f), Outcome::Verdict(holds)) => f(holds),
            (SuccessHandler::Simulation(f), Outcome::Simulation(state)) => f(state),
            (_, Outcome::Failed(err)) => (self.failure)(err),
            (_, _) => (self.failure)(RequestError::unrecognized_response()),
        }
    }
}

/// An analysis request with its continuations
pub struct Request {
    backend: String,
    kind: RequestKind,
    continuations: Continuations,
    observer: Option<ResponseObserver>,
}

impl Request {
    /// Request running `query` on the query's backend
    ///
    /// `on_success` receives whether the checked property holds.
    pub fn query<S, F>(query: Query, on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(bool) + Send + 'static,
        F: FnOnce(RequestError) + Send + 'static,
    {
        Self {
            backend: query.backend().to_string(),
            kind: RequestKind::Query(query),
            continuations: Continuations {
                success: SuccessHandler::Verdict(Box::new(on_success)),
                failure: Box::new(on_failure),
            },
            observer: None,
        }
    }

    /// Request taking a simulation step on `backend`
    ///
    /// `on_state` receives the simulation state produced by the step.
    pub fn decision<S, F>(
        backend: impl Into<String>,
        decision: Decision,
        on_state: S,
        on_failure: F,
    ) -> Self
    where
        S: FnOnce(SimulationState) + Send + 'static,
        F: FnOnce(RequestError) + Send + 'static,
    {
        Self {
            backend: backend.into(),
            kind: RequestKind::Decision(decision),
            continuations: Continuations {
                success: SuccessHandler::Simulation(Box::new(on_state)),
                failure: Box::new(on_failure),
            },
            observer: None,
        }
    }

    /// Attach an observer for every classified response
    #[must_use]
    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: Fn(&RequestId, &EngineResponse) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Target backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Payload
    #[must_use]
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub(crate) fn into_parts(
        self,
    ) -> (String, RequestKind, Continuations, Option<ResponseObserver>) {
        (self.backend, self.kind, self.continuations, self.observer)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("backend", &self.backend)
            .field("kind", &self.kind)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Terminal result handed to the continuations
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outcome {
    Verdict(bool),
    Simulation(SimulationState),
    Failed(RequestError),
}

impl Outcome {
    fn status(&self) -> QueryStatus {
        match self {
            Self::Verdict(true) | Self::Simulation(_) => QueryStatus::Successful,
            Self::Verdict(false) => QueryStatus::Error,
            Self::Failed(err) => err.status(),
        }
    }
}

struct Lifecycle {
    state: RequestState,
    status: Option<QueryStatus>,
    forced_cancel: bool,
    continuations: Option<Continuations>,
}

struct RequestShared {
    id: RequestId,
    backend: String,
    kind: CallKind,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    settled: Notify,
}

/// Caller-side handle to a submitted request
///
/// Cheap to clone; all clones observe the same request.
#[derive(Clone)]
pub struct RequestHandle {
    shared: Arc<RequestShared>,
}

impl RequestHandle {
    pub(crate) fn new(backend: String, kind: CallKind, continuations: Continuations) -> Self {
        Self {
            shared: Arc::new(RequestShared {
                id: RequestId::new(),
                backend,
                kind,
                lifecycle: Mutex::new(Lifecycle {
                    state: RequestState::Waiting,
                    status: None,
                    forced_cancel: false,
                    continuations: Some(continuations),
                }),
                cancel: CancellationToken::new(),
                settled: Notify::new(),
            }),
        }
    }

    /// Request identifier
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    /// Target backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.shared.backend
    }

    /// Engine RPC the request targets
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        self.shared.kind
    }

    /// Current scheduling state
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.shared.lifecycle.lock().state
    }

    /// User-visible status, once the request has resolved
    #[must_use]
    pub fn status(&self) -> Option<QueryStatus> {
        self.shared.lifecycle.lock().status
    }

    /// Whether the request is bound to a connection right now
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == RequestState::Running
    }

    /// Whether the request ended through [`QueryScheduler::cancel`](crate::QueryScheduler::cancel)
    #[must_use]
    pub fn is_forced_cancel(&self) -> bool {
        self.shared.lifecycle.lock().forced_cancel
    }

    /// Wait until the request reaches a terminal state
    ///
    /// Returns the resolved status, or `None` for a request dropped from the
    /// queue at shutdown.
    pub async fn settled(&self) -> Option<QueryStatus> {
        loop {
            let notified = self.shared.settled.notified();
            {
                let life = self.shared.lifecycle.lock();
                if life.state.is_terminal() {
                    return life.status;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// `Waiting` → `Running`
    pub(crate) fn start(&self) -> bool {
        let mut life = self.shared.lifecycle.lock();
        if life.state != RequestState::Waiting {
            return false;
        }
        life.state = RequestState::Running;
        true
    }

    /// Resolve a running request; no-op unless it is still `Running`
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        self.resolve(RequestState::Running, RequestState::Completed, outcome, false)
    }

    /// Fail a request that never made it into a queue
    pub(crate) fn reject(&self, error: RequestError) -> bool {
        self.resolve(
            RequestState::Waiting,
            RequestState::Completed,
            Outcome::Failed(error),
            false,
        )
    }

    /// Cancel a running request; idempotent, no-op unless `Running`
    pub(crate) fn cancel(&self) -> bool {
        self.resolve(
            RequestState::Running,
            RequestState::Cancelled,
            Outcome::Failed(RequestError::cancelled()),
            true,
        )
    }

    /// Drop a queued request without invoking any continuation
    pub(crate) fn abandon(&self) -> bool {
        let dropped = {
            let mut life = self.shared.lifecycle.lock();
            if life.state != RequestState::Waiting {
                return false;
            }
            life.state = RequestState::Cancelled;
            life.continuations.take()
        };
        drop(dropped);
        self.shared.settled.notify_waiters();
        true
    }

    fn resolve(
        &self,
        from: RequestState,
        to: RequestState,
        outcome: Outcome,
        forced: bool,
    ) -> bool {
        let (continuations, outcome) = {
            let mut life = self.shared.lifecycle.lock();
            if life.state != from {
                return false;
            }
            let continuations = life.continuations.take();
            let outcome = match &continuations {
                Some(c) if !c.accepts(&outcome) => {
                    Outcome::Failed(RequestError::unrecognized_response())
                }
                _ => outcome,
            };
            life.state = to;
            life.status = Some(outcome.status());
            life.forced_cancel |= forced;
            (continuations, outcome)
        };

        if forced {
            self.shared.cancel.cancel();
        }
        if let Some(continuations) = continuations {
            run_caller_code(&self.shared.id, "continuation", || continuations.invoke(outcome));
        }
        self.shared.settled.notify_waiters();
        true
    }
}

/// Run code supplied by the caller of `submit`
///
/// A panic is logged and contained: the worker running it still owns a
/// connection that must go back to the pool.
pub(crate) fn run_caller_code(request_id: &RequestId, what: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(%request_id, what, panic = %message, "Caller code panicked");
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let life = self.shared.lifecycle.lock();
        f.debug_struct("RequestHandle")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.backend)
            .field("kind", &self.shared.kind)
            .field("state", &life.state)
            .field("status", &life.status)
            .finish()
    }
}
