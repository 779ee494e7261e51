//! Project Collaborator
//!
//! The scheduler never owns model state. It reads a [`ProjectSnapshot`] of
//! component and location names to validate request text, and it hands
//! components synthesized by an engine to [`ProjectGateway::add_or_replace`].
//! An editor implements the gateway on top of its own undoable transactions;
//! [`InMemoryProject`] is a self-contained implementation for headless use
//! and tests.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of one component as needed for validation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentOutline {
    /// Component name
    pub name: String,
    /// Ids of the component's locations
    pub locations: Vec<String>,
}

impl ComponentOutline {
    /// Outline of `name` with the given location ids
    pub fn new(name: impl Into<String>, locations: &[&str]) -> Self {
        Self {
            name: name.into(),
            locations: locations.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Read-only view of the open project
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    /// Increases whenever the set of names changes
    pub revision: u64,
    /// Components of the project
    pub components: Vec<ComponentOutline>,
}

/// A component synthesized by an engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedComponent {
    /// Merge key
    pub name: String,
    /// Location ids found in the component document
    pub locations: Vec<String>,
    /// Component document as sent by the engine
    pub json: String,
    /// Generated components are temporary until the user keeps them
    pub temporary: bool,
}

impl GeneratedComponent {
    /// Parse an engine component document
    ///
    /// Returns `None` if the text is not a JSON object with a non-empty
    /// string `name`.
    #[must_use]
    pub fn from_json(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        let name = value.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        let locations = value
            .get("locations")
            .and_then(Value::as_array)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|l| l.get("id").and_then(Value::as_str))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name: name.to_string(),
            locations,
            json: json.to_string(),
            temporary: true,
        })
    }

    /// Outline used for validation once the component is in the project
    #[must_use]
    pub fn outline(&self) -> ComponentOutline {
        ComponentOutline {
            name: self.name.clone(),
            locations: self.locations.clone(),
        }
    }
}

/// Result of merging a generated component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No component with that name existed
    Inserted,
    /// An existing component with that name was replaced
    Replaced,
}

/// What the scheduler needs from the open project
pub trait ProjectGateway: Send + Sync {
    /// Current component and location names
    fn snapshot(&self) -> ProjectSnapshot;

    /// Add `component`, replacing any component with the same name, as one
    /// undoable step
    fn add_or_replace(&self, component: GeneratedComponent) -> MergeOutcome;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Generated components keyed by name
#[derive(Debug, Default)]
pub struct GeneratedComponentSet {
    components: Mutex<BTreeMap<String, GeneratedComponent>>,
}

impl GeneratedComponentSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace by name if present, insert otherwise
    pub fn add_or_replace(&self, component: GeneratedComponent) -> MergeOutcome {
        match self
            .components
            .lock()
            .insert(component.name.clone(), component)
        {
            Some(_) => MergeOutcome::Replaced,
            None => MergeOutcome::Inserted,
        }
    }

    /// Component named `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<GeneratedComponent> {
        self.components.lock().get(name).cloned()
    }

    /// Names of all generated components, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.components.lock().keys().cloned().collect()
    }

    /// Number of generated components
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    /// Whether no component has been generated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }

    fn outlines(&self) -> Vec<ComponentOutline> {
        self.components
            .lock()
            .values()
            .map(GeneratedComponent::outline)
            .collect()
    }
}

#[derive(Debug, Default)]
struct ProjectState {
    revision: u64,
    components: Vec<ComponentOutline>,
}

/// Project held entirely in memory
///
/// Generated components become part of the snapshot, so they can be used in
/// later queries.
#[derive(Debug, Default)]
pub struct InMemoryProject {
    state: Mutex<ProjectState>,
    generated: GeneratedComponentSet,
}

impl InMemoryProject {
    /// Project containing `components`
    #[must_use]
    pub fn with_components(components: Vec<ComponentOutline>) -> Self {
        Self {
            state: Mutex::new(ProjectState {
                revision: 1,
                components,
            }),
            generated: GeneratedComponentSet::new(),
        }
    }

    /// Add or replace a user-defined component
    pub fn put_component(&self, outline: ComponentOutline) {
        let mut state = self.state.lock();
        state.components.retain(|c| c.name != outline.name);
        state.components.push(outline);
        state.revision += 1;
    }

    /// Components generated by engines so far
    #[must_use]
    pub fn generated(&self) -> &GeneratedComponentSet {
        &self.generated
    }
}

impl ProjectGateway for InMemoryProject {
    fn snapshot(&self) -> ProjectSnapshot {
        let state = self.state.lock();
        let mut components = state.components.clone();
        for outline in self.generated.outlines() {
            if !components.iter().any(|c| c.name == outline.name) {
                components.push(outline);
            }
        }
        ProjectSnapshot {
            revision: state.revision,
            components,
        }
    }

    fn add_or_replace(&self, component: GeneratedComponent) -> MergeOutcome {
        let mut state = self.state.lock();
        let outcome = self.generated.add_or_replace(component);
        state.revision += 1;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_json_requires_name() {
        assert!(GeneratedComponent::from_json("not json").is_none());
        assert!(GeneratedComponent::from_json(r#"{"locations": []}"#).is_none());
        assert!(GeneratedComponent::from_json(r#"{"name": "  "}"#).is_none());

        let component = GeneratedComponent::from_json(
            r#"{"name": "Quotient", "locations": [{"id": "L0"}, {"id": "L1"}]}"#,
        )
        .unwrap();
        assert_eq!(component.name, "Quotient");
        assert_eq!(component.locations, vec!["L0", "L1"]);
        assert!(component.temporary);
    }

    #[test]
    fn test_keyed_replace_or_insert() {
        let set = GeneratedComponentSet::new();
        let first = GeneratedComponent::from_json(r#"{"name": "Q", "version": 1}"#).unwrap();
        let second = GeneratedComponent::from_json(r#"{"name": "Q", "version": 2}"#).unwrap();
        let other = GeneratedComponent::from_json(r#"{"name": "A"}"#).unwrap();

        assert_eq!(set.add_or_replace(first), MergeOutcome::Inserted);
        assert_eq!(set.add_or_replace(other), MergeOutcome::Inserted);
        assert_eq!(set.add_or_replace(second.clone()), MergeOutcome::Replaced);

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("Q"), Some(second));
        assert_eq!(set.names(), vec!["A", "Q"]);
    }

    #[test]
    fn test_generated_components_join_snapshot() {
        let project =
            InMemoryProject::with_components(vec![ComponentOutline::new("Machine", &["L0"])]);
        let before = project.snapshot();

        let generated =
            GeneratedComponent::from_json(r#"{"name": "Spec", "locations": [{"id": "S0"}]}"#)
                .unwrap();
        project.add_or_replace(generated);

        let after = project.snapshot();
        assert!(after.revision > before.revision);
        assert_eq!(after.components.len(), 2);
        assert_eq!(after.components[1], ComponentOutline::new("Spec", &["S0"]));
    }

    #[test]
    fn test_put_component_replaces_by_name() {
        let project = InMemoryProject::default();
        project.put_component(ComponentOutline::new("A", &["L0"]));
        project.put_component(ComponentOutline::new("A", &["L0", "L1"]));
        let snapshot = project.snapshot();
        assert_eq!(snapshot.components.len(), 1);
        assert_eq!(snapshot.components[0].locations.len(), 2);
        assert_eq!(snapshot.revision, 2);
    }
}
