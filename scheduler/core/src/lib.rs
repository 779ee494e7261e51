//! Scheduler Core - Backend Query Scheduling for Model-Checking Engines
//!
//! This crate accepts analysis requests (declarative queries and simulation
//! decisions) from many independent callers, multiplexes them onto a bounded
//! set of engine connections per backend, enforces per-request deadlines,
//! supports mid-flight cancellation, and routes each engine reply back to the
//! continuation of the request that caused it.
//!
//! # Architecture
//!
//! ```text
//!   caller (UI thread)            caller (background)
//!          │                              │
//!          └──────────────┬───────────────┘
//!                         │ submit / cancel (never blocks)
//!                         v
//! +---------------------------------------------------+
//! |                 QueryScheduler                    |
//! |   validation ─► per-backend scheduler             |
//! +------------------------+--------------------------+
//!                          │
//!            +-------------+-------------+
//!            v                           v
//!   +----------------+          +----------------+
//!   |  RequestQueue  |  FIFO    | ConnectionPool |  fixed size per backend
//!   +-------+--------+          +-------+--------+
//!           └────────► worker ◄─────────┘
//!                        │ call(payload, deadline)
//!                        v
//!               +------------------+
//!               | EngineTransport  |  external engine process
//!               +--------+---------+
//!                        │ stream of RawResponse
//!                        v
//!               +------------------+
//!               |  ResponseRouter  | ─► on_success / on_failure
//!               +------------------+
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use scheduler_core::{
//!     InMemoryProject, Query, QueryScheduler, QueryType, Request, SchedulerConfig,
//! };
//!
//! let config = SchedulerConfig::default().with_backend("reveaal", 4);
//! let project = Arc::new(InMemoryProject::default());
//! let scheduler = QueryScheduler::start(&config, connector, project).await?;
//!
//! let query = Query::new(QueryType::Refinement, "Spec <= Machine", "reveaal");
//! let handle = scheduler.submit(Request::query(
//!     query,
//!     |holds| println!("refinement holds: {holds}"),
//!     |err| eprintln!("query failed: {err}"),
//! ));
//!
//! // Later, from any thread:
//! scheduler.cancel(&handle);
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: TOML/environment configuration of backends and deadlines
//! - [`engine`]: the transport boundary to engine processes
//! - [`error`]: request error taxonomy and startup errors
//! - [`project`]: the project collaborator (validation snapshot, generated components)
//! - [`request`]: queries, decisions, request handles and their lifecycle
//! - [`routing`]: connection pools, queues, the scheduler and the response router
//! - [`validation`]: allow-list validation of query text
//!
//! # Threading
//!
//! Continuations run on the scheduler's tokio workers, or synchronously inside
//! `submit`/`cancel` for requests that are rejected or cancelled there. They
//! never run while a scheduler lock is held. A UI that owns its state on one
//! thread must forward the continuation's result to that thread itself.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod project;
pub mod request;
pub mod routing;
pub mod validation;

pub use config::{
    default_config_path, load_config, load_config_from_path, BackendSettings, ConfigError,
    ConfigOverrides, ConfigSource, SchedulerConfig, SchedulerToml,
};
pub use engine::{
    CallKind, EngineCall, EngineConnector, EngineTransport, RawResponse, ResponseStream,
    TransportError,
};
pub use error::{ErrorKind, RequestError, SchedulerError};
pub use project::{
    ComponentOutline, GeneratedComponent, GeneratedComponentSet, InMemoryProject, MergeOutcome,
    ProjectGateway, ProjectSnapshot,
};
pub use request::decision::{ActionDirection, Decision, LocationRef, SimulationState, Transition};
pub use request::query::{Query, QueryType, UnknownQueryType};
pub use request::{
    QueryStatus, Request, RequestHandle, RequestId, RequestKind, RequestState, ResponseObserver,
};
pub use routing::{
    classify_transport_error, ConnectionPool, EngineConnection, EngineResponse,
    PoolManager, PoolStats, QueryScheduler, RequestQueue, ResponseRouter, SchedulerStats,
};
pub use validation::QueryValidator;
