//! Response Router
//!
//! Turns raw engine replies into [`EngineResponse`] values and resolves the
//! request they belong to. Routing does no I/O of its own: synthesized
//! components are handed to the [`ProjectGateway`], which owns the merge.
//!
//! # Classification Order
//!
//! A well-behaved engine sets exactly one result per message. When more than
//! one is set, the first match wins in this order:
//!
//! 1. a successful verdict: refinement, then consistency, then determinism
//! 2. a synthesized component
//! 3. a simulation state
//! 4. a failed verdict, in the same order as (1)
//! 5. otherwise the response is [`EngineResponse::Unknown`]

use std::sync::Arc;

use crate::engine::{CallKind, RawResponse, TransportError};
use crate::error::RequestError;
use crate::project::{GeneratedComponent, ProjectGateway};
use crate::request::decision::SimulationState;
use crate::request::{run_caller_code, Outcome, RequestHandle};

/// A classified engine reply
#[derive(Clone, Debug, PartialEq)]
pub enum EngineResponse {
    /// Refinement check result
    Refinement {
        /// Whether the refinement holds
        success: bool,
    },
    /// Consistency check result
    Consistency {
        /// Whether the system is consistent
        success: bool,
    },
    /// Determinism check result
    Determinism {
        /// Whether the system is deterministic
        success: bool,
    },
    /// A component generated by the engine
    ComponentSynthesis {
        /// Component document
        json: String,
    },
    /// Next state of a simulation
    SimulationStep {
        /// The new state
        state: SimulationState,
    },
    /// None of the expected results was populated
    Unknown,
}

impl EngineResponse {
    /// Classify a raw reply
    #[must_use]
    pub fn classify(raw: &RawResponse) -> Self {
        let verdicts = [
            raw.refinement.map(|success| Self::Refinement { success }),
            raw.consistency.map(|success| Self::Consistency { success }),
            raw.determinism.map(|success| Self::Determinism { success }),
        ];

        if let Some(found) = verdicts
            .iter()
            .flatten()
            .find(|v| v.verdict() == Some(true))
        {
            return found.clone();
        }
        if let Some(json) = &raw.component {
            return Self::ComponentSynthesis { json: json.clone() };
        }
        if let Some(state) = &raw.simulation {
            return Self::SimulationStep {
                state: state.clone(),
            };
        }
        verdicts.into_iter().flatten().next().unwrap_or(Self::Unknown)
    }

    /// Success flag of a verdict response
    #[must_use]
    pub fn verdict(&self) -> Option<bool> {
        match self {
            Self::Refinement { success }
            | Self::Consistency { success }
            | Self::Determinism { success } => Some(*success),
            _ => None,
        }
    }
}

/// Map a transport failure to the request error it resolves to
///
/// Deadline errors are recognized by their leading status token.
#[must_use]
pub fn classify_transport_error(err: &TransportError) -> RequestError {
    if err.is_deadline_exceeded() {
        RequestError::deadline_exceeded()
    } else {
        RequestError::transport(err.message())
    }
}

/// Resolves requests from classified responses
pub struct ResponseRouter {
    project: Arc<dyn ProjectGateway>,
}

impl ResponseRouter {
    /// Router forwarding generated components to `project`
    pub fn new(project: Arc<dyn ProjectGateway>) -> Self {
        Self { project }
    }

    /// Resolve `handle` from `response`
    ///
    /// Returns `false` without side effects if the request is no longer
    /// running, e.g. because it was cancelled while the response was in
    /// transit.
    pub fn route(&self, response: &EngineResponse, handle: &RequestHandle) -> bool {
        if !handle.is_running() {
            return false;
        }

        let outcome = match (handle.call_kind(), response) {
            (CallKind::Query, EngineResponse::ComponentSynthesis { json }) => {
                return self.route_component(json, handle);
            }
            (CallKind::Query, verdict) if verdict.verdict().is_some() => {
                Outcome::Verdict(verdict.verdict().unwrap_or(false))
            }
            (CallKind::Decision, EngineResponse::SimulationStep { state }) => {
                Outcome::Simulation(state.clone())
            }
            (kind, other) => {
                tracing::warn!(
                    request_id = %handle.id(),
                    backend = handle.backend(),
                    %kind,
                    response = ?other,
                    "Unrecognized engine response"
                );
                Outcome::Failed(RequestError::unrecognized_response())
            }
        };

        let resolved = handle.settle(outcome);
        tracing::debug!(request_id = %handle.id(), resolved, "Routed engine response");
        resolved
    }

    fn route_component(&self, json: &str, handle: &RequestHandle) -> bool {
        let Some(component) = GeneratedComponent::from_json(json) else {
            tracing::warn!(
                request_id = %handle.id(),
                backend = handle.backend(),
                "Engine returned a component without a name"
            );
            return handle.settle(Outcome::Failed(RequestError::unrecognized_response()));
        };

        if !handle.settle(Outcome::Verdict(true)) {
            return false;
        }
        let name = component.name.clone();
        let project = &self.project;
        run_caller_code(&handle.id(), "project merge", || {
            let merge = project.add_or_replace(component);
            tracing::debug!(request_id = %handle.id(), component = %name, ?merge, "Merged generated component");
        });
        true
    }
}

impl std::fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRouter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::error::ErrorKind;
    use crate::project::{InMemoryProject, MergeOutcome};
    use crate::request::decision::Decision;
    use crate::request::query::{Query, QueryType};
    use crate::request::{QueryStatus, Request};

    type Seen = Arc<Mutex<Vec<String>>>;

    fn running(request: Request) -> RequestHandle {
        let (backend, kind, continuations, _) = request.into_parts();
        let handle = RequestHandle::new(backend, kind.call_kind(), continuations);
        assert!(handle.start());
        handle
    }

    fn query_handle(seen: &Seen) -> RequestHandle {
        let ok = seen.clone();
        let err = seen.clone();
        running(Request::query(
            Query::new(QueryType::GetComponent, "Get Machine", "reveaal"),
            move |holds| ok.lock().push(format!("success:{holds}")),
            move |e: RequestError| err.lock().push(format!("failure:{:?}", e.kind())),
        ))
    }

    fn decision_handle(seen: &Seen) -> RequestHandle {
        let ok = seen.clone();
        let err = seen.clone();
        running(Request::decision(
            "reveaal",
            Decision::initial("Machine"),
            move |state| ok.lock().push(format!("state:{}", state.enabled.len())),
            move |e: RequestError| err.lock().push(format!("failure:{:?}", e.kind())),
        ))
    }

    fn router() -> (ResponseRouter, Arc<InMemoryProject>) {
        let project = Arc::new(InMemoryProject::default());
        (ResponseRouter::new(project.clone()), project)
    }

    #[test]
    fn test_refinement_wins_over_consistency() {
        let raw = RawResponse {
            refinement: Some(true),
            consistency: Some(true),
            ..RawResponse::default()
        };
        assert_eq!(
            EngineResponse::classify(&raw),
            EngineResponse::Refinement { success: true }
        );
    }

    #[test]
    fn test_true_verdict_wins_over_earlier_false() {
        let raw = RawResponse {
            refinement: Some(false),
            determinism: Some(true),
            ..RawResponse::default()
        };
        assert_eq!(
            EngineResponse::classify(&raw),
            EngineResponse::Determinism { success: true }
        );
    }

    #[test]
    fn test_failed_verdict_and_empty_response() {
        assert_eq!(
            EngineResponse::classify(&RawResponse::consistency(false)),
            EngineResponse::Consistency { success: false }
        );
        assert_eq!(
            EngineResponse::classify(&RawResponse::default()),
            EngineResponse::Unknown
        );
    }

    #[test]
    fn test_component_and_simulation_classification() {
        assert_eq!(
            EngineResponse::classify(&RawResponse::component("{\"name\":\"Q\"}")),
            EngineResponse::ComponentSynthesis {
                json: "{\"name\":\"Q\"}".to_string()
            }
        );
        assert!(matches!(
            EngineResponse::classify(&RawResponse::simulation(SimulationState::default())),
            EngineResponse::SimulationStep { .. }
        ));
    }

    #[test]
    fn test_transport_error_classification() {
        let deadline = classify_transport_error(&TransportError::deadline_exceeded("after 20s"));
        assert_eq!(deadline.kind(), ErrorKind::DeadlineExceeded);

        let other = classify_transport_error(&TransportError::new("UNAVAILABLE: reset"));
        assert_eq!(other.kind(), ErrorKind::Transport);
        assert!(other.message().contains("UNAVAILABLE: reset"));
    }

    #[test]
    fn test_verdict_routes_to_success() {
        let seen = Seen::default();
        let (router, _) = router();
        let handle = query_handle(&seen);

        assert!(router.route(&EngineResponse::Refinement { success: false }, &handle));
        assert_eq!(*seen.lock(), vec!["success:false"]);
        assert_eq!(handle.status(), Some(QueryStatus::Error));
    }

    #[test]
    fn test_unknown_routes_to_failure() {
        let seen = Seen::default();
        let (router, _) = router();
        let handle = query_handle(&seen);

        assert!(router.route(&EngineResponse::Unknown, &handle));
        assert_eq!(*seen.lock(), vec!["failure:UnrecognizedResponse"]);
    }

    #[test]
    fn test_component_is_forwarded_once_resolved() {
        let seen = Seen::default();
        let (router, project) = router();
        let handle = query_handle(&seen);

        let response = EngineResponse::ComponentSynthesis {
            json: r#"{"name": "Quotient"}"#.to_string(),
        };
        assert!(router.route(&response, &handle));
        assert_eq!(*seen.lock(), vec!["success:true"]);
        assert!(project.generated().get("Quotient").is_some());

        // Same name again through another request replaces the component
        let second = query_handle(&seen);
        assert!(router.route(&response, &second));
        assert_eq!(project.generated().len(), 1);
        assert_eq!(
            project
                .generated()
                .add_or_replace(GeneratedComponent::from_json(r#"{"name": "Quotient"}"#).unwrap()),
            MergeOutcome::Replaced
        );
    }

    #[test]
    fn test_nameless_component_is_unrecognized() {
        let seen = Seen::default();
        let (router, project) = router();
        let handle = query_handle(&seen);

        let response = EngineResponse::ComponentSynthesis {
            json: "{}".to_string(),
        };
        assert!(router.route(&response, &handle));
        assert_eq!(*seen.lock(), vec!["failure:UnrecognizedResponse"]);
        assert!(project.generated().is_empty());
    }

    #[test]
    fn test_simulation_step_routes_state() {
        let seen = Seen::default();
        let (router, _) = router();
        let handle = decision_handle(&seen);

        let response = EngineResponse::SimulationStep {
            state: SimulationState::default(),
        };
        assert!(router.route(&response, &handle));
        assert_eq!(*seen.lock(), vec!["state:0"]);
    }

    #[test]
    fn test_verdict_for_decision_is_unrecognized() {
        let seen = Seen::default();
        let (router, _) = router();
        let handle = decision_handle(&seen);

        assert!(router.route(&EngineResponse::Consistency { success: true }, &handle));
        assert_eq!(*seen.lock(), vec!["failure:UnrecognizedResponse"]);
    }

    #[test]
    fn test_no_routing_after_cancel() {
        let seen = Seen::default();
        let (router, project) = router();
        let handle = query_handle(&seen);
        handle.cancel();
        seen.lock().clear();

        let response = EngineResponse::ComponentSynthesis {
            json: r#"{"name": "Late"}"#.to_string(),
        };
        assert!(!router.route(&response, &handle));
        assert!(seen.lock().is_empty());
        assert!(project.generated().is_empty());
        assert_eq!(handle.status(), Some(QueryStatus::Unknown));
    }
}
