//! Request Routing and Scheduling
//!
//! Everything between `submit` and a request's continuation:
//!
//! - [`connection_pool`]: fixed per-backend pools of engine connections
//! - [`queue`]: per-backend FIFO of waiting requests
//! - [`scheduler`]: the [`QueryScheduler`] facade and its per-backend workers
//! - [`response_router`]: classification of engine replies and dispatch to
//!   continuations
//! - [`stats`]: per-backend counters
//!
//! # Guarantees
//!
//! - At most `pool_size` requests per backend are running at any time
//! - Requests of one backend are dispatched in submission order
//! - Each request's continuations fire at most once; a reply arriving after
//!   cancellation is dropped

#![allow(missing_docs)]

pub mod connection_pool;
pub mod queue;
pub mod response_router;
pub mod scheduler;
pub mod stats;

pub use connection_pool::{ConnectionPool, EngineConnection, PoolManager, PoolStats};
pub use queue::RequestQueue;
pub use response_router::{classify_transport_error, EngineResponse, ResponseRouter};
pub use scheduler::QueryScheduler;
pub use stats::SchedulerStats;
