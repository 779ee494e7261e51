//! Declarative Queries
//!
//! A [`Query`] is a typed question about the model (`refinement: A <= B`,
//! `consistency: GCon: A`, ...) targeted at one backend. The scheduler only
//! needs its body for validation and its engine text for the call; the rest
//! is carried for persistence.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a query, with its wire name and the operator symbol that may
/// appear in a query body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// `E<>` reachability of a location
    Reachability,
    /// `<=` refinement between two systems
    Refinement,
    /// `\` quotient of two systems
    Quotient,
    /// `Spec` specification check
    Specification,
    /// `Imp` implementation check
    Implementation,
    /// `LCon` local consistency
    LocalConsistency,
    /// `GCon` global consistency
    Consistency,
    /// `Bisim` bisimulation minimisation
    Bisim,
    /// `Get` component synthesis
    GetComponent,
    /// `Det` determinism
    Determinism,
}

impl QueryType {
    /// All query types, in declaration order
    pub const ALL: [QueryType; 10] = [
        Self::Reachability,
        Self::Refinement,
        Self::Quotient,
        Self::Specification,
        Self::Implementation,
        Self::LocalConsistency,
        Self::Consistency,
        Self::Bisim,
        Self::GetComponent,
        Self::Determinism,
    ];

    /// Name the engine expects in front of the query body
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Reachability => "reachability",
            Self::Refinement => "refinement",
            Self::Quotient => "quotient",
            Self::Specification => "specification",
            Self::Implementation => "implementation",
            Self::LocalConsistency => "local-consistency",
            Self::Consistency => "consistency",
            Self::Bisim => "bisim",
            Self::GetComponent => "get-component",
            Self::Determinism => "determinism",
        }
    }

    /// Operator symbol accepted in query bodies
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Reachability => "E<>",
            Self::Refinement => "<=",
            Self::Quotient => "\\",
            Self::Specification => "Spec",
            Self::Implementation => "Imp",
            Self::LocalConsistency => "LCon",
            Self::Consistency => "GCon",
            Self::Bisim => "Bisim",
            Self::GetComponent => "Get",
            Self::Determinism => "Det",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A query type name that no engine understands
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Unknown query type '{0}'")]
pub struct UnknownQueryType(pub String);

impl FromStr for QueryType {
    type Err = UnknownQueryType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownQueryType(s.to_string()))
    }
}

// ============================================================================
// Query
// ============================================================================

/// A declarative query against one backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueryDocument", into = "QueryDocument")]
pub struct Query {
    query_type: Option<QueryType>,
    body: String,
    comment: String,
    periodic: bool,
    ignored_inputs: BTreeMap<String, bool>,
    ignored_outputs: BTreeMap<String, bool>,
    backend: String,
}

impl Query {
    /// Create a typed query for `backend`
    pub fn new(query_type: QueryType, body: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            query_type: Some(query_type),
            body: body.into(),
            comment: String::new(),
            periodic: false,
            ignored_inputs: BTreeMap::new(),
            ignored_outputs: BTreeMap::new(),
            backend: backend.into(),
        }
    }

    /// Create a query whose type has not been chosen yet
    ///
    /// Such a query is rejected at submission.
    pub fn untyped(body: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            query_type: None,
            ..Self::new(QueryType::Refinement, body, backend)
        }
    }

    /// Attach a comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Mark the query for periodic re-execution by the caller
    #[must_use]
    pub fn periodic(mut self, periodic: bool) -> Self {
        self.periodic = periodic;
        self
    }

    /// Set whether the input `action` is ignored
    #[must_use]
    pub fn ignore_input(mut self, action: impl Into<String>, ignored: bool) -> Self {
        self.ignored_inputs.insert(action.into(), ignored);
        self
    }

    /// Set whether the output `action` is ignored
    #[must_use]
    pub fn ignore_output(mut self, action: impl Into<String>, ignored: bool) -> Self {
        self.ignored_outputs.insert(action.into(), ignored);
        self
    }

    /// Query type, if chosen
    #[must_use]
    pub fn query_type(&self) -> Option<QueryType> {
        self.query_type
    }

    /// Query body as typed by the user
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Comment
    #[must_use]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Whether the caller re-runs this query periodically
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Target backend name
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Input ignore flags
    #[must_use]
    pub fn ignored_inputs(&self) -> &BTreeMap<String, bool> {
        &self.ignored_inputs
    }

    /// Output ignore flags
    #[must_use]
    pub fn ignored_outputs(&self) -> &BTreeMap<String, bool> {
        &self.ignored_outputs
    }

    /// Body with all whitespace removed
    #[must_use]
    pub fn clean_body(&self) -> String {
        self.body.chars().filter(|c| !c.is_whitespace()).collect()
    }

    /// Text sent to the engine: `"<type>: <clean body>"` plus the ignored
    /// inputs/outputs suffix when the backend supports it
    ///
    /// Returns `None` for an untyped query.
    #[must_use]
    pub fn engine_text(&self, supports_ignored_io: bool) -> Option<String> {
        let query_type = self.query_type?;
        let mut text = format!("{}: {}", query_type.name(), self.clean_body());
        if supports_ignored_io {
            if let Some(suffix) = self.ignored_io_suffix() {
                text.push(' ');
                text.push_str(&suffix);
            }
        }
        Some(text)
    }

    fn ignored_io_suffix(&self) -> Option<String> {
        let outputs = enabled_names(&self.ignored_outputs);
        let inputs = enabled_names(&self.ignored_inputs);
        if outputs.is_empty() && inputs.is_empty() {
            return None;
        }
        Some(format!(
            "--ignored_outputs=\"{outputs}\" --ignored_inputs=\"{inputs}\""
        ))
    }
}

fn enabled_names(flags: &BTreeMap<String, bool>) -> String {
    flags
        .iter()
        .filter(|(_, &on)| on)
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.query_type {
            Some(t) => write!(f, "{t}: {}", self.body),
            None => f.write_str(&self.body),
        }
    }
}

// ============================================================================
// Persistence Shape
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryDocument {
    query: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    is_periodic: bool,
    #[serde(default)]
    ignored_inputs: BTreeMap<String, bool>,
    #[serde(default)]
    ignored_outputs: BTreeMap<String, bool>,
    #[serde(default)]
    backend: String,
}

impl From<Query> for QueryDocument {
    fn from(query: Query) -> Self {
        Self {
            query: query.to_string(),
            comment: query.comment,
            is_periodic: query.periodic,
            ignored_inputs: query.ignored_inputs,
            ignored_outputs: query.ignored_outputs,
            backend: query.backend,
        }
    }
}

impl TryFrom<QueryDocument> for Query {
    type Error = UnknownQueryType;

    fn try_from(doc: QueryDocument) -> Result<Self, Self::Error> {
        let (query_type, body) = match doc.query.split_once(": ") {
            Some((prefix, body)) => (Some(prefix.parse()?), body.to_string()),
            None => (None, doc.query),
        };
        Ok(Self {
            query_type,
            body,
            comment: doc.comment,
            periodic: doc.is_periodic,
            ignored_inputs: doc.ignored_inputs,
            ignored_outputs: doc.ignored_outputs,
            backend: doc.backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_engine_text_strips_whitespace() {
        let query = Query::new(QueryType::Refinement, " Spec <= ( A || B ) ", "reveaal");
        assert_eq!(
            query.engine_text(false).as_deref(),
            Some("refinement: Spec<=(A||B)")
        );
    }

    #[test]
    fn test_ignored_io_suffix_only_when_supported() {
        let query = Query::new(QueryType::Refinement, "A <= B", "reveaal")
            .ignore_output("out2", true)
            .ignore_output("out1", true)
            .ignore_output("out3", false)
            .ignore_input("in1", true);

        assert_eq!(
            query.engine_text(true).as_deref(),
            Some("refinement: A<=B --ignored_outputs=\"out1,out2\" --ignored_inputs=\"in1\"")
        );
        assert_eq!(query.engine_text(false).as_deref(), Some("refinement: A<=B"));
    }

    #[test]
    fn test_no_suffix_when_nothing_ignored() {
        let query = Query::new(QueryType::Determinism, "Det: A", "reveaal")
            .ignore_input("in1", false);
        assert_eq!(query.engine_text(true).as_deref(), Some("determinism: Det:A"));
    }

    #[test]
    fn test_untyped_query_has_no_engine_text() {
        assert_eq!(Query::untyped("A <= B", "reveaal").engine_text(true), None);
    }

    #[test]
    fn test_query_type_parse() {
        assert_eq!("local-consistency".parse::<QueryType>(), Ok(QueryType::LocalConsistency));
        assert_eq!("Refinement".parse::<QueryType>(), Ok(QueryType::Refinement));
        assert!("liveness".parse::<QueryType>().is_err());
    }

    #[test]
    fn test_persistence_shape() {
        let query = Query::new(QueryType::Consistency, "GCon: A", "reveaal")
            .with_comment("is A consistent")
            .ignore_input("coin", true);

        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["query"], "consistency: GCon: A");
        assert_eq!(json["comment"], "is A consistent");
        assert_eq!(json["isPeriodic"], false);
        assert_eq!(json["ignoredInputs"]["coin"], true);
        assert_eq!(json["backend"], "reveaal");

        let back: Query = serde_json::from_value(json).unwrap();
        assert_eq!(back, query);
    }

    #[test]
    fn test_deserialize_without_type_prefix() {
        let query: Query =
            serde_json::from_str(r#"{"query": "A <= B", "comment": ""}"#).unwrap();
        assert_eq!(query.query_type(), None);
        assert_eq!(query.body(), "A <= B");
        assert_eq!(query.backend(), "");
    }

    #[test]
    fn test_deserialize_rejects_unknown_type() {
        let result = serde_json::from_str::<Query>(r#"{"query": "liveness: A"}"#);
        assert!(result.is_err());
    }
}
