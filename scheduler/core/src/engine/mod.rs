//! Engine Transport Boundary
//!
//! Abstraction over the RPC channel to one model-checking engine process.
//! The scheduler only relies on these semantics:
//!
//! - one initial request per call ([`EngineCall`])
//! - zero or more streamed responses, terminated by completion or an error
//! - a deadline the transport is expected to honor
//!
//! The concrete message schema and channel setup belong to the transport
//! implementation. [`RawResponse`] mirrors the shape of the engine's reply
//! message, where each result kind is an optional field.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::decision::SimulationState;
use crate::request::RequestId;

/// Status token transports put in front of a deadline error message
pub const DEADLINE_EXCEEDED_TOKEN: &str = "DEADLINE_EXCEEDED";

// ============================================================================
// Calls and Responses
// ============================================================================

/// Which engine RPC a call targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// Declarative query (refinement, consistency, ...)
    Query,
    /// Simulation step
    Decision,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Decision => write!(f, "decision"),
        }
    }
}

/// A single call issued to an engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineCall {
    /// Request this call belongs to
    pub request_id: RequestId,
    /// Target RPC
    pub kind: CallKind,
    /// Serialized request text
    pub payload: String,
}

/// One response message as received from the engine
///
/// A well-behaved engine populates exactly one field. Classification into
/// [`EngineResponse`](crate::EngineResponse) is done by the
/// [`ResponseRouter`](crate::ResponseRouter).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawResponse {
    /// Refinement result (`success` flag)
    pub refinement: Option<bool>,
    /// Consistency result (`success` flag)
    pub consistency: Option<bool>,
    /// Determinism result (`success` flag)
    pub determinism: Option<bool>,
    /// JSON of a component synthesized by the engine
    pub component: Option<String>,
    /// Simulation state produced by a decision
    pub simulation: Option<SimulationState>,
}

impl RawResponse {
    /// Response with only the refinement field set
    #[must_use]
    pub fn refinement(success: bool) -> Self {
        Self {
            refinement: Some(success),
            ..Self::default()
        }
    }

    /// Response with only the consistency field set
    #[must_use]
    pub fn consistency(success: bool) -> Self {
        Self {
            consistency: Some(success),
            ..Self::default()
        }
    }

    /// Response with only the determinism field set
    #[must_use]
    pub fn determinism(success: bool) -> Self {
        Self {
            determinism: Some(success),
            ..Self::default()
        }
    }

    /// Response carrying a synthesized component
    pub fn component(json: impl Into<String>) -> Self {
        Self {
            component: Some(json.into()),
            ..Self::default()
        }
    }

    /// Response carrying a simulation state
    #[must_use]
    pub fn simulation(state: SimulationState) -> Self {
        Self {
            simulation: Some(state),
            ..Self::default()
        }
    }

    /// Whether no field is populated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Failure reported by the RPC layer
///
/// Transports prefix the message with a capitalized status token followed by
/// a colon and whitespace, e.g. `"DEADLINE_EXCEEDED: deadline exceeded after 20s"`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Create an error from the transport's message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Deadline error in the transport's message format
    pub fn deadline_exceeded(detail: impl fmt::Display) -> Self {
        Self::new(format!("{DEADLINE_EXCEEDED_TOKEN}: {detail}"))
    }

    /// Full message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Leading status token: everything before the first `:` that is
    /// followed by whitespace, or the whole message if there is none
    #[must_use]
    pub fn status_token(&self) -> &str {
        let bytes = self.message.as_bytes();
        for (idx, _) in self.message.match_indices(':') {
            if bytes
                .get(idx + 1)
                .is_some_and(|b| b.is_ascii_whitespace())
            {
                return &self.message[..idx];
            }
        }
        &self.message
    }

    /// Whether the transport reports an expired deadline
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        self.status_token() == DEADLINE_EXCEEDED_TOKEN
    }
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Stream of responses for one call
pub type ResponseStream = BoxStream<'static, Result<RawResponse, TransportError>>;

/// RPC stub of one engine connection
///
/// Dropping the returned stream aborts the call; implementations must leave
/// the connection usable for the next call afterwards.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Issue a call and return the stream of its responses
    async fn call(
        &self,
        call: EngineCall,
        deadline: Duration,
    ) -> Result<ResponseStream, TransportError>;

    /// Check whether the engine behind this stub is reachable
    async fn health_check(&self) -> bool {
        true
    }
}

/// Opens engine connections at startup
#[async_trait]
pub trait EngineConnector: Send + Sync {
    /// Open connection number `index` to `backend`
    async fn connect(
        &self,
        backend: &str,
        index: usize,
    ) -> Result<Arc<dyn EngineTransport>, TransportError>;
}
