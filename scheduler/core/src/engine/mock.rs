//! Scripted Mock Engine
//!
//! In-process stand-in for engine processes, used by unit and integration
//! tests. Replies are scripted per call in FIFO order; when the script runs
//! dry the default reply is used. The mock records every call and tracks how
//! many calls are in flight at once, which lets tests assert pool bounds.
//!
//! ```ignore
//! let engine = MockEngine::new();
//! engine.push_reply(MockReply::Respond(vec![RawResponse::refinement(true)]));
//! let (gate, reply) = MockReply::gated();
//! engine.push_reply(reply);
//! // ... submit two requests; the second stays in flight until:
//! gate.release(vec![RawResponse::consistency(false)]);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::{
    CallKind, EngineCall, EngineConnector, EngineTransport, RawResponse, ResponseStream,
    TransportError,
};

/// Scripted reply to one call
#[derive(Debug)]
pub enum MockReply {
    /// Stream these responses, then complete
    Respond(Vec<RawResponse>),
    /// Fail the call before any stream is returned
    Fail(TransportError),
    /// Stream these responses, then fail
    StreamError(Vec<RawResponse>, TransportError),
    /// Wait, then stream these responses
    Delayed(Duration, Vec<RawResponse>),
    /// Never answer and never complete
    Hang,
    /// Answer when the paired [`MockGate`] is released
    Gated(oneshot::Receiver<Vec<RawResponse>>),
}

impl MockReply {
    /// Create a gated reply together with the gate that releases it
    #[must_use]
    pub fn gated() -> (MockGate, Self) {
        let (tx, rx) = oneshot::channel();
        (MockGate { tx }, Self::Gated(rx))
    }
}

/// Releases a [`MockReply::Gated`] reply
#[derive(Debug)]
pub struct MockGate {
    tx: oneshot::Sender<Vec<RawResponse>>,
}

impl MockGate {
    /// Deliver `responses` on the gated stream
    ///
    /// Returns `false` if the stream was already dropped (call aborted).
    pub fn release(self, responses: Vec<RawResponse>) -> bool {
        self.tx.send(responses).is_ok()
    }
}

struct MockState {
    script: Mutex<VecDeque<MockReply>>,
    default_reply: Mutex<Vec<RawResponse>>,
    calls: Mutex<Vec<EngineCall>>,
    call_arrived: Notify,
    connections: Mutex<Vec<(String, usize)>>,
    refused_backends: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    honor_deadline: AtomicBool,
    healthy: AtomicBool,
}

/// Decrements the in-flight counter when a response stream is dropped
struct InFlightGuard {
    state: Arc<MockState>,
}

impl InFlightGuard {
    fn enter(state: &Arc<MockState>) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            state: state.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted engine implementing both [`EngineConnector`] and [`EngineTransport`]
///
/// Clones share state, so one instance can serve as connector for every
/// backend while tests keep a handle for scripting and assertions.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Mock whose default reply is an empty, completing stream
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(VecDeque::new()),
                default_reply: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                call_arrived: Notify::new(),
                connections: Mutex::new(Vec::new()),
                refused_backends: Mutex::new(HashSet::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                honor_deadline: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Mock answering every unscripted call with `responses`
    #[must_use]
    pub fn answering(responses: Vec<RawResponse>) -> Self {
        let engine = Self::new();
        engine.set_default_reply(responses);
        engine
    }

    /// Queue a reply for the next unanswered call
    pub fn push_reply(&self, reply: MockReply) {
        self.state.script.lock().push_back(reply);
    }

    /// Replace the reply used once the script is exhausted
    pub fn set_default_reply(&self, responses: Vec<RawResponse>) {
        *self.state.default_reply.lock() = responses;
    }

    /// Make the transport itself fail calls whose deadline expires
    pub fn set_honor_deadline(&self, honor: bool) {
        self.state.honor_deadline.store(honor, Ordering::SeqCst);
    }

    /// Result of [`EngineTransport::health_check`]
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Refuse connections to `backend`
    pub fn refuse_backend(&self, backend: impl Into<String>) {
        self.state.refused_backends.lock().insert(backend.into());
    }

    /// All calls received so far, in arrival order
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.calls.lock().clone()
    }

    /// Number of calls received so far
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Calls of one kind
    #[must_use]
    pub fn calls_of(&self, kind: CallKind) -> Vec<EngineCall> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` calls have arrived
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let arrived = self.state.call_arrived.notified();
            if self.call_count() >= count {
                return;
            }
            arrived.await;
        }
    }

    /// Connections opened through the connector, as `(backend, index)`
    #[must_use]
    pub fn connections(&self) -> Vec<(String, usize)> {
        self.state.connections.lock().clone()
    }

    /// Calls whose response stream is still alive
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live response streams
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> MockReply {
        if let Some(reply) = self.state.script.lock().pop_front() {
            return reply;
        }
        MockReply::Respond(self.state.default_reply.lock().clone())
    }
}

fn ok_all(responses: Vec<RawResponse>) -> impl Iterator<Item = Result<RawResponse, TransportError>> {
    responses.into_iter().map(Ok)
}

fn expire_at(inner: ResponseStream, deadline: Duration) -> ResponseStream {
    let expires = Instant::now() + deadline;
    stream::unfold(Some(inner), move |inner| async move {
        let mut inner = inner?;
        match tokio::time::timeout_at(expires, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransportError::deadline_exceeded(format!(
                    "deadline exceeded after {}ms",
                    deadline.as_millis()
                ))),
                None,
            )),
        }
    })
    .boxed()
}

#[async_trait]
impl EngineTransport for MockEngine {
    async fn call(
        &self,
        call: EngineCall,
        deadline: Duration,
    ) -> Result<ResponseStream, TransportError> {
        self.state.calls.lock().push(call);
        self.state.call_arrived.notify_waiters();

        let stream: ResponseStream = match self.next_reply() {
            MockReply::Respond(responses) => stream::iter(ok_all(responses)).boxed(),
            MockReply::Fail(err) => return Err(err),
            MockReply::StreamError(responses, err) => {
                stream::iter(ok_all(responses).chain(std::iter::once(Err(err)))).boxed()
            }
            MockReply::Delayed(delay, responses) => stream::once(async move {
                tokio::time::sleep(delay).await;
                responses
            })
            .flat_map(|responses| stream::iter(ok_all(responses)))
            .boxed(),
            MockReply::Hang => stream::pending::<Result<RawResponse, TransportError>>().boxed(),
            MockReply::Gated(rx) => stream::once(rx)
                .flat_map(|released| stream::iter(ok_all(released.unwrap_or_default())))
                .boxed(),
        };

        let stream = if self.state.honor_deadline.load(Ordering::SeqCst) {
            expire_at(stream, deadline)
        } else {
            stream
        };

        let guard = InFlightGuard::enter(&self.state);
        Ok(stream
            .map(move |item| {
                let _live = &guard;
                item
            })
            .boxed())
    }

    async fn health_check(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineConnector for MockEngine {
    async fn connect(
        &self,
        backend: &str,
        index: usize,
    ) -> Result<Arc<dyn EngineTransport>, TransportError> {
        if self.state.refused_backends.lock().contains(backend) {
            return Err(TransportError::new(format!(
                "UNAVAILABLE: connection to {backend} refused"
            )));
        }
        self.state
            .connections
            .lock()
            .push((backend.to_string(), index));
        Ok(Arc::new(self.clone()))
    }
}
