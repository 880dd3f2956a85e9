//! Boolean condition trees over documents.
//!
//! Leaves compare one field (dotted path) against an operand fixed when the
//! condition is built. Composites combine child conditions with and/or/not.
//!
//! ```
//! use serde_json::json;
//! use tierstate::query::Condition;
//!
//! let cond = Condition::field("level").gte(10).and(Condition::field("team").eq("red"));
//! let doc = json!({"level": 12, "team": "red"}).as_object().cloned().unwrap();
//! assert!(cond.evaluate(&doc).unwrap());
//! ```

use std::cmp::Ordering;

use serde_json::Value;

use super::value::{compare_values, values_equal};
use crate::domain::ports::{field_value, Document, EntityId};
use crate::error::Result;

/// Path that resolves to the entity id when evaluating an (id, document) pair.
pub const ID_FIELD: &str = "_id";

/// Leaf comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::NotEq => "!=",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        }
    }
}

/// Condition tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Every child holds (true when empty)
    And(Vec<Condition>),
    /// At least one child holds (false when empty)
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Field {
        path: String,
        op: Comparison,
        operand: Value,
    },
}

/// Builder for a leaf condition on one field.
#[derive(Debug, Clone)]
pub struct FieldCondition {
    path: String,
}

impl FieldCondition {
    fn leaf(self, op: Comparison, operand: impl Into<Value>) -> Condition {
        Condition::Field {
            path: self.path,
            op,
            operand: operand.into(),
        }
    }

    pub fn eq(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::Eq, operand)
    }

    pub fn not_eq(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::NotEq, operand)
    }

    pub fn gt(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::Gt, operand)
    }

    pub fn gte(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::Gte, operand)
    }

    pub fn lt(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::Lt, operand)
    }

    pub fn lte(self, operand: impl Into<Value>) -> Condition {
        self.leaf(Comparison::Lte, operand)
    }
}

impl Condition {
    /// Start a leaf condition on a field path.
    pub fn field(path: impl Into<String>) -> FieldCondition {
        FieldCondition { path: path.into() }
    }

    /// Conjunction of several conditions.
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::And(conditions.into_iter().collect())
    }

    /// Disjunction of several conditions.
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Or(conditions.into_iter().collect())
    }

    /// Combine with another condition; nested conjunctions are flattened.
    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut children) => {
                children.push(other);
                Condition::And(children)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    /// Combine with another condition; nested disjunctions are flattened.
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut children) => {
                children.push(other);
                Condition::Or(children)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    /// Negate this condition.
    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Evaluate against a document.
    ///
    /// A missing (or null) field makes every comparison false except
    /// `not_eq`, which holds. Range comparisons between values of different
    /// kinds, or against arrays and objects, fail with `QueryEvaluation`.
    pub fn evaluate(&self, document: &Document) -> Result<bool> {
        self.evaluate_with(document, None)
    }

    /// Evaluate against an (id, document) pair; the path `_id` resolves to
    /// the entity id as a string.
    pub fn evaluate_entry(&self, id: EntityId, document: &Document) -> Result<bool> {
        self.evaluate_with(document, Some(id))
    }

    fn evaluate_with(&self, document: &Document, id: Option<EntityId>) -> Result<bool> {
        match self {
            Condition::And(children) => {
                for child in children {
                    if !child.evaluate_with(document, id)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(children) => {
                for child in children {
                    if child.evaluate_with(document, id)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate_with(document, id)?),
            Condition::Field { path, op, operand } => {
                let id_value;
                let value = match id {
                    Some(id) if path == ID_FIELD => {
                        id_value = Value::String(id.to_string());
                        Some(&id_value)
                    }
                    _ => field_value(document, path),
                };
                compare_leaf(value, *op, operand)
            }
        }
    }
}

impl std::ops::Not for Condition {
    type Output = Condition;

    fn not(self) -> Self::Output {
        self.negate()
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(
            f: &mut std::fmt::Formatter<'_>,
            children: &[Condition],
            sep: &str,
        ) -> std::fmt::Result {
            write!(f, "(")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, ")")
        }

        match self {
            Condition::And(children) => join(f, children, "&&"),
            Condition::Or(children) => join(f, children, "||"),
            Condition::Not(inner) => write!(f, "!{}", inner),
            Condition::Field { path, op, operand } => {
                write!(f, "{} {} {}", path, op.symbol(), operand)
            }
        }
    }
}

fn compare_leaf(value: Option<&Value>, op: Comparison, operand: &Value) -> Result<bool> {
    let value = match value {
        Some(v) => v,
        None => return Ok(op == Comparison::NotEq),
    };

    match op {
        Comparison::Eq => Ok(values_equal(value, operand)),
        Comparison::NotEq => Ok(!values_equal(value, operand)),
        Comparison::Gt => Ok(compare_values(value, operand)? == Ordering::Greater),
        Comparison::Gte => Ok(compare_values(value, operand)? != Ordering::Less),
        Comparison::Lt => Ok(compare_values(value, operand)? == Ordering::Less),
        Comparison::Lte => Ok(compare_values(value, operand)? != Ordering::Greater),
    }
}
