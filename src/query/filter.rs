//! Exact-match field filters.
//!
//! Simpler than [`Condition`](super::Condition): a filter only checks
//! fields (dotted paths allowed) for exact equality, with no numeric
//! promotion, and never faults.

use serde_json::Value;

use crate::domain::ports::{field_value, Document};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field (dotted path) equals the value exactly
    Field { name: String, value: Value },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn field(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Check a document. Null-valued fields never match.
    pub fn check(&self, document: &Document) -> bool {
        match self {
            Filter::Field { name, value } => match field_value(document, name) {
                Some(found) => found == value,
                None => false,
            },
            Filter::And(filters) => filters.iter().all(|f| f.check(document)),
            Filter::Or(filters) => filters.iter().any(|f| f.check(document)),
        }
    }
}
