//! Simulation Decisions
//!
//! A [`Decision`] asks an engine to take one step in a symbolic simulation of
//! a composition. The engine answers with the next [`SimulationState`].

use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Whether an action is received or emitted by a component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionDirection {
    /// `a?`
    Input,
    /// `a!`
    Output,
}

/// Current location of one component in the composition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationRef {
    /// Component name
    pub component: String,
    /// Location id within the component
    pub location: String,
}

/// A transition enabled in a simulation state
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    /// Synchronisation action
    pub action: String,
    /// Input or output
    pub direction: ActionDirection,
    /// Ids of the participating edges
    #[serde(default)]
    pub edges: Vec<String>,
}

impl Transition {
    /// Output transition on `action` over `edges`
    pub fn output(action: impl Into<String>, edges: &[&str]) -> Self {
        Self {
            action: action.into(),
            direction: ActionDirection::Output,
            edges: edges.iter().map(ToString::to_string).collect(),
        }
    }

    /// Input transition on `action` over `edges`
    pub fn input(action: impl Into<String>, edges: &[&str]) -> Self {
        Self {
            action: action.into(),
            direction: ActionDirection::Input,
            edges: edges.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Snapshot of a simulation: where every component is and what can fire
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationState {
    /// Current location per component
    pub locations: Vec<LocationRef>,
    /// Transitions enabled in this state
    pub enabled: Vec<Transition>,
}

impl SimulationState {
    /// Whether `transition` is offered in this state
    #[must_use]
    pub fn offers(&self, transition: &Transition) -> bool {
        self.enabled.contains(transition)
    }

    /// Deterministic for an output action iff at most one enabled output
    /// transition carries it
    #[must_use]
    pub fn is_deterministic_for(&self, action: &str) -> bool {
        self.enabled
            .iter()
            .filter(|t| t.direction == ActionDirection::Output && t.action == action)
            .count()
            <= 1
    }
}

/// One simulation step request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Composition being simulated, e.g. `A || B`
    pub composition: String,
    /// State the step starts from
    pub state: SimulationState,
    /// Chosen transition; `None` asks for the initial state
    pub transition: Option<Transition>,
}

impl Decision {
    /// Ask for the initial state of `composition`
    pub fn initial(composition: impl Into<String>) -> Self {
        Self {
            composition: composition.into(),
            state: SimulationState::default(),
            transition: None,
        }
    }

    /// Take `transition` from `state`
    pub fn step(
        composition: impl Into<String>,
        state: SimulationState,
        transition: Transition,
    ) -> Self {
        Self {
            composition: composition.into(),
            state,
            transition: Some(transition),
        }
    }

    /// Check the chosen transition against the current state
    ///
    /// The composition itself is checked by the
    /// [`QueryValidator`](crate::QueryValidator).
    pub fn validate_step(&self) -> Result<(), RequestError> {
        let Some(transition) = &self.transition else {
            return Ok(());
        };
        if !self.state.offers(transition) {
            return Err(RequestError::validation(format!(
                "Transition '{}' is not enabled in the current state",
                transition.action
            )));
        }
        if transition.direction == ActionDirection::Output
            && !self.state.is_deterministic_for(&transition.action)
        {
            return Err(RequestError::validation(format!(
                "Output '{}' is not deterministic in the current state",
                transition.action
            )));
        }
        Ok(())
    }

    /// JSON text sent to the engine
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
