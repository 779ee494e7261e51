//! Query Scheduler
//!
//! The orchestrator: validates submitted requests, queues them per backend,
//! binds them to free connections, runs the engine call under a deadline and
//! hands the reply to the [`ResponseRouter`].
//!
//! # Execution Model
//!
//! Each backend has a [`BackendScheduler`] owning one [`ConnectionPool`] and
//! one [`RequestQueue`]. A worker task exists per checked-out connection: it
//! runs a request, then either picks up the next queued request on the same
//! connection or returns the connection to the pool. Parallelism per backend
//! is therefore bounded by the pool size, without a thread per request.
//!
//! ```text
//! submit ─► validate ─► queue.push ─► dispatch ─► pool.acquire_for(queue.pop)
//!                                                        │
//!               ┌───────────── worker ◄──────────────────┘
//!               │  start ─► call(payload, deadline) ─► route
//!               └─► pool.release_or_handoff(queue.pop) ─► next request | idle
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection_pool::{no_connections, ConnectionPool, EngineConnection, PoolManager, PoolStats};
use super::queue::RequestQueue;
use super::response_router::{classify_transport_error, EngineResponse, ResponseRouter};
use super::stats::{BackendStatsAtomic, SchedulerStats};
use crate::config::{load_config_from_path, BackendSettings, SchedulerConfig};
use crate::engine::{EngineCall, EngineConnector};
use crate::error::{ErrorKind, RequestError, SchedulerError};
use crate::project::ProjectGateway;
use crate::request::{
    run_caller_code, Outcome, Request, RequestHandle, RequestId, RequestKind, ResponseObserver,
};
use crate::validation::QueryValidator;

// ============================================================================
// Queued Work
// ============================================================================

/// A validated request waiting for a connection
struct QueuedRequest {
    handle: RequestHandle,
    call: EngineCall,
    observer: Option<ResponseObserver>,
    enqueued_at: Instant,
}

/// How an engine call ended, as far as statistics are concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallEnd {
    Routed,
    DeadlineExceeded,
    TransportFailed,
    EmptyStream,
    Cancelled,
    DroppedLate,
}

// ============================================================================
// Backend Scheduler
// ============================================================================

/// Scheduler of a single backend
pub(crate) struct BackendScheduler {
    name: String,
    settings: BackendSettings,
    deadline: Duration,
    pool: Arc<ConnectionPool>,
    queue: RequestQueue<QueuedRequest>,
    running: Mutex<HashMap<RequestId, RequestHandle>>,
    stats: BackendStatsAtomic,
    router: Arc<ResponseRouter>,
    runtime: Handle,
    /// Cleared once by `QueryScheduler::shutdown`, shared by all backends
    accepting: Arc<AtomicBool>,
}

impl BackendScheduler {
    fn enqueue(self: &Arc<Self>, request: QueuedRequest) {
        self.stats.record_submitted();
        let request_id = request.handle.id();
        let depth = self.queue.push(request);
        debug!(backend = %self.name, %request_id, depth, "Request queued");

        // Shutdown may have drained the queue between the caller's check and the push
        if !self.accepting.load(Ordering::SeqCst) {
            for request in self.queue.drain() {
                request.handle.abandon();
            }
            return;
        }
        self.dispatch();
    }

    /// Start workers while connections are idle and requests are waiting
    fn dispatch(self: &Arc<Self>) {
        while let Some((conn, request)) = self.pool.acquire_for(|| self.queue.pop()) {
            let this = Arc::clone(self);
            self.runtime.spawn(async move { this.drive(conn, request).await });
        }
    }

    /// Worker loop of one checked-out connection
    async fn drive(self: Arc<Self>, mut conn: EngineConnection, mut request: QueuedRequest) {
        loop {
            self.execute(&conn, request).await;
            conn.touch();
            match self.pool.release_or_handoff(conn, || self.queue.pop()) {
                Some((next_conn, next)) => {
                    debug!(
                        backend = %self.name,
                        connection = next_conn.index(),
                        request_id = %next.handle.id(),
                        "Connection handed to next request"
                    );
                    conn = next_conn;
                    request = next;
                }
                None => break,
            }
        }
    }

    async fn execute(&self, conn: &EngineConnection, request: QueuedRequest) {
        let QueuedRequest {
            handle,
            call,
            observer,
            enqueued_at,
        } = request;

        // Shutdown clears `accepting` before it collects `running`
        {
            let mut running = self.running.lock();
            if !self.accepting.load(Ordering::SeqCst) {
                drop(running);
                debug!(backend = %self.name, request_id = %handle.id(), "Dropping request popped during shutdown");
                handle.abandon();
                return;
            }
            if !handle.start() {
                debug!(backend = %self.name, request_id = %handle.id(), "Skipping request that is no longer waiting");
                return;
            }
            running.insert(handle.id(), handle.clone());
        }
        self.stats.record_dispatched();

        let span = info_span!(
            "engine_call",
            backend = %self.name,
            request_id = %handle.id(),
            connection = conn.index(),
            kind = %call.kind,
        );
        let end = async {
            debug!(
                queued_ms = u64::try_from(enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Request dispatched"
            );
            self.run_call(conn, &handle, call, observer.as_ref()).await
        }
        .instrument(span)
        .await;

        if end == CallEnd::DroppedLate {
            self.stats.record_dropped_late();
        }
        self.running.lock().remove(&handle.id());
        self.stats
            .record_finished(handle.status(), end == CallEnd::DeadlineExceeded);
    }

    /// Issue the call and resolve the request from its first reply
    ///
    /// The deadline starts here, at dispatch. Cancellation drops the response
    /// stream, which aborts the call without closing the connection.
    async fn run_call(
        &self,
        conn: &EngineConnection,
        handle: &RequestHandle,
        call: EngineCall,
        observer: Option<&ResponseObserver>,
    ) -> CallEnd {
        let token = handle.cancellation_token();
        let deadline = Instant::now() + self.deadline;
        let transport = conn.transport();

        let opened = tokio::select! {
            biased;
            () = token.cancelled() => return CallEnd::Cancelled,
            opened = tokio::time::timeout_at(deadline, transport.call(call, self.deadline)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return self.fail(handle, classify_transport_error(&err)),
            Err(_) => return self.fail(handle, RequestError::deadline_exceeded()),
        };

        let next = tokio::select! {
            biased;
            () = token.cancelled() => return CallEnd::Cancelled,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        match next {
            Ok(Some(Ok(raw))) => {
                let response = EngineResponse::classify(&raw);
                if !handle.is_running() {
                    return CallEnd::DroppedLate;
                }
                if let Some(observer) = observer {
                    run_caller_code(&handle.id(), "observer", || observer(&handle.id(), &response));
                }
                if self.router.route(&response, handle) {
                    CallEnd::Routed
                } else {
                    CallEnd::DroppedLate
                }
            }
            Ok(Some(Err(err))) => self.fail(handle, classify_transport_error(&err)),
            Ok(None) => {
                warn!("Engine closed the stream without a result");
                if handle.settle(Outcome::Failed(RequestError::unrecognized_response())) {
                    CallEnd::EmptyStream
                } else {
                    CallEnd::DroppedLate
                }
            }
            Err(_) => self.fail(handle, RequestError::deadline_exceeded()),
        }
    }

    fn fail(&self, handle: &RequestHandle, error: RequestError) -> CallEnd {
        let end = match error.kind() {
            ErrorKind::DeadlineExceeded => {
                warn!(deadline_ms = u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX), "Engine did not answer in time");
                CallEnd::DeadlineExceeded
            }
            _ => {
                warn!(error = %error.message(), "Engine call failed");
                CallEnd::TransportFailed
            }
        };
        if handle.settle(Outcome::Failed(error)) {
            end
        } else {
            CallEnd::DroppedLate
        }
    }

    /// Drop queued requests and cancel running ones
    fn shutdown(&self) {
        let dropped = self.queue.drain();
        let running: Vec<RequestHandle> = self.running.lock().values().cloned().collect();
        info!(
            backend = %self.name,
            dropped = dropped.len(),
            running = running.len(),
            "Shutting down backend scheduler"
        );
        for request in dropped {
            request.handle.abandon();
        }
        for handle in running {
            handle.cancel();
        }
    }

    fn snapshot(&self) -> SchedulerStats {
        let mut stats = self.stats.snapshot(&self.name);
        stats.pool_size = self.pool.size();
        stats.idle_connections = self.pool.idle_count();
        stats.queue_depth = self.queue.len();
        stats.peak_queue_depth = self.queue.peak_depth();
        stats
    }
}

// ============================================================================
// Query Scheduler
// ============================================================================

struct SchedulerInner {
    backends: HashMap<String, Arc<BackendScheduler>>,
    pools: PoolManager,
    project: Arc<dyn ProjectGateway>,
    validator: Mutex<Option<Arc<QueryValidator>>>,
    accepting: Arc<AtomicBool>,
}

/// Entry point for callers: submit and cancel requests
///
/// Cheap to clone. `submit` and `cancel` never block and may be called from
/// any thread, including threads outside the tokio runtime.
#[derive(Clone)]
pub struct QueryScheduler {
    inner: Arc<SchedulerInner>,
}

impl QueryScheduler {
    /// Open every backend's connections and start scheduling
    ///
    /// Must be called inside a tokio runtime; that runtime executes all
    /// engine calls.
    ///
    /// # Errors
    ///
    /// Fails if no backend is configured, a pool size or deadline is invalid,
    /// or a connection cannot be opened.
    pub async fn start(
        config: &SchedulerConfig,
        connector: Arc<dyn EngineConnector>,
        project: Arc<dyn ProjectGateway>,
    ) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current()?;
        if config.backends.is_empty() {
            return Err(SchedulerError::Configuration(
                "no backends are configured".to_string(),
            ));
        }
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        let pools = PoolManager::open(config, connector.as_ref()).await?;
        let router = Arc::new(ResponseRouter::new(project.clone()));
        let accepting = Arc::new(AtomicBool::new(true));

        let mut backends = HashMap::new();
        for (name, settings) in &config.backends {
            let pool = pools
                .get(name)
                .ok_or_else(|| SchedulerError::Configuration(format!("backend '{name}' has no pool")))?;
            let deadline = config.deadline(settings);
            info!(
                backend = %name,
                pool_size = pool.size(),
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                supports_ignored_io = settings.supports_ignored_io,
                "Backend scheduler started"
            );
            backends.insert(
                name.clone(),
                Arc::new(BackendScheduler {
                    name: name.clone(),
                    settings: settings.clone(),
                    deadline,
                    pool,
                    queue: RequestQueue::new(),
                    running: Mutex::new(HashMap::new()),
                    stats: BackendStatsAtomic::default(),
                    router: router.clone(),
                    runtime: runtime.clone(),
                    accepting: accepting.clone(),
                }),
            );
        }

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                backends,
                pools,
                project,
                validator: Mutex::new(None),
                accepting,
            }),
        })
    }

    /// Load configuration from `path` (plus environment) and start
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be loaded, or as [`start`](Self::start).
    pub async fn start_from_config_file(
        path: Option<std::path::PathBuf>,
        connector: Arc<dyn EngineConnector>,
        project: Arc<dyn ProjectGateway>,
    ) -> Result<Self, SchedulerError> {
        let config = load_config_from_path(path)?;
        Self::start(&config, connector, project).await
    }

    /// Submit a request; returns immediately
    ///
    /// Requests that fail validation, target an unknown backend, or arrive
    /// after [`shutdown`](Self::shutdown) are failed before this returns,
    /// with their failure continuation invoked on the calling thread.
    pub fn submit(&self, request: Request) -> RequestHandle {
        let (backend_name, kind, continuations, observer) = request.into_parts();
        let handle = RequestHandle::new(backend_name, kind.call_kind(), continuations);
        let backend = self.inner.backends.get(handle.backend());

        if !self.inner.accepting.load(Ordering::SeqCst) {
            handle.reject(RequestError::configuration("scheduler is shut down"));
            return handle;
        }

        let payload = self.prepare(&kind, backend.map(|b| &b.settings));
        let (backend, payload) = match (backend, payload) {
            (_, Err(err)) => {
                debug!(backend = handle.backend(), request_id = %handle.id(), error = %err, "Request rejected");
                if let Some(backend) = backend {
                    backend.stats.record_rejected();
                }
                handle.reject(err);
                return handle;
            }
            (None, Ok(_)) => {
                warn!(backend = handle.backend(), "Request for unknown backend");
                handle.reject(no_connections(handle.backend()));
                return handle;
            }
            (Some(backend), Ok(payload)) => (backend, payload),
        };

        backend.enqueue(QueuedRequest {
            call: EngineCall {
                request_id: handle.id(),
                kind: kind.call_kind(),
                payload,
            },
            handle: handle.clone(),
            observer,
            enqueued_at: Instant::now(),
        });
        handle
    }

    /// Cancel a running request
    ///
    /// Idempotent. Only a `Running` request is affected: it resolves to
    /// `UNKNOWN`, its failure continuation receives a cancellation, and any
    /// later engine reply is discarded. Returns whether this call cancelled it.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let cancelled = handle.cancel();
        debug!(backend = handle.backend(), request_id = %handle.id(), cancelled, "Cancel requested");
        cancelled
    }

    /// Stop accepting requests, cancel running ones and drop queued ones
    ///
    /// Queued requests are left unresolved: none of their continuations run.
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        for backend in self.inner.backends.values() {
            backend.shutdown();
        }
    }

    /// Whether `submit` still accepts requests
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Names of all configured backends, sorted
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        self.inner.pools.backends()
    }

    /// Counters of one backend
    #[must_use]
    pub fn stats(&self, backend: &str) -> Option<SchedulerStats> {
        self.inner.backends.get(backend).map(|b| b.snapshot())
    }

    /// Pool counters of every backend
    #[must_use]
    pub fn pool_stats(&self) -> HashMap<String, PoolStats> {
        self.inner.pools.all_stats()
    }

    /// Health check of every backend's idle connections
    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.inner.pools.health_check_all().await
    }

    /// Validate a request and build its engine payload
    fn prepare(
        &self,
        kind: &RequestKind,
        settings: Option<&BackendSettings>,
    ) -> Result<String, RequestError> {
        match kind {
            RequestKind::Query(query) => {
                self.validator()?.clean(query.body())?;
                let supports_ignored_io = settings.is_some_and(|s| s.supports_ignored_io);
                query
                    .engine_text(supports_ignored_io)
                    .ok_or_else(|| RequestError::validation("Query type is not set"))
            }
            RequestKind::Decision(decision) => {
                self.validator()?.clean(&decision.composition)?;
                decision.validate_step()?;
                decision.payload().map_err(|e| {
                    RequestError::validation(format!("Decision cannot be encoded: {e}"))
                })
            }
        }
    }

    /// Allow-list for the project's current revision
    fn validator(&self) -> Result<Arc<QueryValidator>, RequestError> {
        let snapshot = self.inner.project.snapshot();
        let mut cached = self.inner.validator.lock();
        if let Some(validator) = cached.as_ref() {
            if validator.revision() == snapshot.revision {
                return Ok(validator.clone());
            }
        }
        let validator = Arc::new(QueryValidator::new(&snapshot).map_err(|e| {
            RequestError::validation(format!("The query allow-list cannot be built: {e}"))
        })?);
        *cached = Some(validator.clone());
        Ok(validator)
    }
}

impl std::fmt::Debug for QueryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryScheduler")
            .field("backends", &self.backends())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
