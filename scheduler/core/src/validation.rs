//! Query Text Validation
//!
//! Request text is checked against an allow-list before it can reach a
//! backend: after removing all whitespace, the text must consist only of
//! component names, location ids, query-type symbols and a handful of
//! operators. Anything else fails fast with a syntax error.

use regex::Regex;

use crate::error::RequestError;
use crate::project::ProjectSnapshot;
use crate::request::query::QueryType;

/// Operators accepted between names
const OPERATORS: [&str; 6] = ["||", "&&", ".", "(", ")", ","];

/// Message for text that is empty after removing whitespace
pub const EMPTY_QUERY_MESSAGE: &str = "Query is empty";

/// Message for text containing tokens outside the allow-list
pub const REJECTED_QUERY_MESSAGE: &str =
    "The query is not accepted. Make sure to use accepted and present components and operators only";

/// Allow-list matcher built from one project snapshot
#[derive(Debug, Clone)]
pub struct QueryValidator {
    revision: u64,
    pattern: Regex,
}

impl QueryValidator {
    /// Build the allow-list for `snapshot`
    pub fn new(snapshot: &ProjectSnapshot) -> Result<Self, regex::Error> {
        let mut tokens: Vec<&str> = snapshot
            .components
            .iter()
            .flat_map(|c| {
                std::iter::once(c.name.as_str()).chain(c.locations.iter().map(String::as_str))
            })
            .chain(QueryType::ALL.iter().map(|t| t.symbol()))
            .chain(OPERATORS)
            .filter(|t| !t.is_empty())
            .collect();

        // Longest first so a name is never shadowed by one of its prefixes
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        tokens.dedup();

        let alternatives = tokens
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!("^(?:{alternatives})+$"))?;

        Ok(Self {
            revision: snapshot.revision,
            pattern,
        })
    }

    /// Revision of the snapshot this validator was built from
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Strip whitespace and check the result against the allow-list
    ///
    /// Returns the cleaned text on success.
    pub fn clean(&self, text: &str) -> Result<String, RequestError> {
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() {
            return Err(RequestError::validation(EMPTY_QUERY_MESSAGE));
        }
        if !self.pattern.is_match(&cleaned) {
            return Err(RequestError::validation(REJECTED_QUERY_MESSAGE));
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::project::ComponentOutline;

    fn validator() -> QueryValidator {
        QueryValidator::new(&ProjectSnapshot {
            revision: 7,
            components: vec![
                ComponentOutline::new("Machine", &["L0", "L1"]),
                ComponentOutline::new("Researcher", &["R0"]),
                ComponentOutline::new("Spec", &[]),
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_accepts_names_symbols_and_operators() {
        let v = validator();
        assert_eq!(
            v.clean("Spec <= (Machine || Researcher)").unwrap(),
            "Spec<=(Machine||Researcher)"
        );
        assert!(v.clean("E<> Machine.L1").is_ok());
        assert!(v.clean("Det Machine && Researcher").is_ok());
        assert!(v.clean("Get Machine \\ Researcher").is_ok());
    }

    #[test]
    fn test_rejects_unknown_names() {
        let err = validator().clean("Spec <= Unknown").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.message(), REJECTED_QUERY_MESSAGE);
        assert!(validator().clean("GCon: Machine").is_err());
    }

    #[test]
    fn test_rejects_empty_and_whitespace() {
        for text in ["", "   ", "\n\t"] {
            let err = validator().clean(text).unwrap_err();
            assert_eq!(err.message(), EMPTY_QUERY_MESSAGE);
        }
    }

    #[test]
    fn test_names_are_matched_literally() {
        let v = QueryValidator::new(&ProjectSnapshot {
            revision: 1,
            components: vec![ComponentOutline::new("A+B", &[])],
        })
        .unwrap();
        assert!(v.clean("A+B").is_ok());
        assert!(v.clean("AAB").is_err());
        assert_eq!(v.revision(), 1);
    }
}
