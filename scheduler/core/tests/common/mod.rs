//! Shared helpers for scheduler integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use scheduler_core::engine::mock::MockEngine;
use scheduler_core::{
    ComponentOutline, Decision, InMemoryProject, Query, QueryScheduler, QueryType, Request,
    RequestError, SchedulerConfig, SimulationState,
};

/// Backend name used throughout the tests
pub const BACKEND: &str = "reveaal";

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Route scheduler logs to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Project with a small vending-machine model
pub fn project() -> Arc<InMemoryProject> {
    Arc::new(InMemoryProject::with_components(vec![
        ComponentOutline::new("Machine", &["L0", "L1"]),
        ComponentOutline::new("Researcher", &["R0", "R1"]),
        ComponentOutline::new("Spec", &["S0"]),
        ComponentOutline::new("Administration", &["A0"]),
    ]))
}

/// Start a scheduler with one backend
pub async fn start(
    engine: &MockEngine,
    pool_size: usize,
    deadline: Duration,
) -> (QueryScheduler, Arc<InMemoryProject>) {
    init_tracing();
    let project = project();
    let config = SchedulerConfig::default()
        .with_backend(BACKEND, pool_size)
        .with_response_deadline(deadline);
    let scheduler = QueryScheduler::start(&config, Arc::new(engine.clone()), project.clone())
        .await
        .expect("scheduler starts");
    (scheduler, project)
}

/// What the continuations of one request observed
#[derive(Clone, Debug, PartialEq)]
pub enum Fired {
    Verdict(bool),
    State(SimulationState),
    Failure(RequestError),
}

/// Records continuation invocations of many requests
#[derive(Clone, Default)]
pub struct Recorder {
    fired: Arc<Mutex<Vec<(String, Fired)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query request whose continuations record under `label`
    pub fn query(&self, label: &str, query_type: QueryType, body: &str) -> Request {
        self.query_for(label, Query::new(query_type, body, BACKEND))
    }

    /// Request for an arbitrary query
    pub fn query_for(&self, label: &str, query: Query) -> Request {
        let (ok, err) = (self.clone(), self.clone());
        let (ok_label, err_label) = (label.to_string(), label.to_string());
        Request::query(
            query,
            move |holds| ok.push(ok_label, Fired::Verdict(holds)),
            move |e| err.push(err_label, Fired::Failure(e)),
        )
    }

    /// Decision request whose continuations record under `label`
    pub fn decision(&self, label: &str, decision: Decision) -> Request {
        let (ok, err) = (self.clone(), self.clone());
        let (ok_label, err_label) = (label.to_string(), label.to_string());
        Request::decision(
            BACKEND,
            decision,
            move |state| ok.push(ok_label, Fired::State(state)),
            move |e| err.push(err_label, Fired::Failure(e)),
        )
    }

    fn push(&self, label: String, fired: Fired) {
        self.fired.lock().push((label, fired));
    }

    /// Everything recorded for `label`, in order
    pub fn of(&self, label: &str) -> Vec<Fired> {
        self.fired
            .lock()
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Labels in completion order
    pub fn order(&self) -> Vec<String> {
        self.fired.lock().iter().map(|(l, _)| l.clone()).collect()
    }

    /// Total number of continuation invocations
    pub fn len(&self) -> usize {
        self.fired.lock().len()
    }
}

/// Poll `condition` until it holds or the test timeout expires
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition reached before timeout");
}
