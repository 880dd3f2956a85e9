//! Multi-key document ordering.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::value::compare_values;
use crate::domain::ports::{field_value, Document};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Ordered list of (field path, direction) sort keys.
///
/// For each key a document missing the field sorts before one that has it,
/// then values are compared with the usual promotion rules. A descending key
/// reverses the whole comparison for that key, absence included. Ties fall
/// through to the next key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    keys: Vec<(String, SortOrder)>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new().then_ascending(field)
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::new().then_descending(field)
    }

    pub fn by(field: impl Into<String>, order: SortOrder) -> Self {
        Self::new().then(field, order)
    }

    pub fn then(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.keys.push((field.into(), order));
        self
    }

    pub fn then_ascending(self, field: impl Into<String>) -> Self {
        self.then(field, SortOrder::Ascending)
    }

    pub fn then_descending(self, field: impl Into<String>) -> Self {
        self.then(field, SortOrder::Descending)
    }

    pub fn keys(&self) -> &[(String, SortOrder)] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two documents.
    ///
    /// Fails with `QueryEvaluation` when a key resolves to an array or object,
    /// or when the two values are of different kinds.
    pub fn compare(&self, a: &Document, b: &Document) -> Result<Ordering> {
        for (path, order) in &self.keys {
            let result = compare_key(field_value(a, path), field_value(b, path), path)?;
            let result = match order {
                SortOrder::Ascending => result,
                SortOrder::Descending => result.reverse(),
            };
            if result != Ordering::Equal {
                return Ok(result);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Sort items in place by their documents.
    ///
    /// The sort is stable. If any comparison fails, the first error is
    /// returned and the order of `items` is unspecified.
    pub fn sort_by_document<T>(
        &self,
        items: &mut [T],
        document: impl Fn(&T) -> &Document,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut failure: Option<Error> = None;
        items.sort_by(|a, b| {
            if failure.is_some() {
                return Ordering::Equal;
            }
            match self.compare(document(a), document(b)) {
                Ok(ordering) => ordering,
                Err(e) => {
                    failure = Some(e);
                    Ordering::Equal
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sort documents in place.
    pub fn sort(&self, documents: &mut [Document]) -> Result<()> {
        self.sort_by_document(documents, |d| d)
    }
}

fn compare_key(a: Option<&Value>, b: Option<&Value>, path: &str) -> Result<Ordering> {
    match (a, b) {
        (None, None) => Ok(Ordering::Equal),
        (None, Some(_)) => Ok(Ordering::Less),
        (Some(_), None) => Ok(Ordering::Greater),
        (Some(x), Some(y)) => {
            if is_collection(x) || is_collection(y) {
                return Err(Error::QueryEvaluation(format!(
                    "cannot sort on an array or object field: {}",
                    path
                )));
            }
            compare_values(x, y)
        }
    }
}

fn is_collection(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn names(docs: &[Document]) -> Vec<&str> {
        docs.iter()
            .map(|d| d.get("n").and_then(Value::as_str).unwrap_or("?"))
            .collect()
    }

    #[test]
    fn test_two_key_sort() {
        let mut docs = vec![
            doc(json!({"n": "a", "level": 2, "name": "x"})),
            doc(json!({"n": "b", "level": 1, "name": "z"})),
            doc(json!({"n": "c", "level": 2, "name": "w"})),
        ];
        SortSpec::descending("level")
            .then_ascending("name")
            .sort(&mut docs)
            .unwrap();
        assert_eq!(names(&docs), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_absent_sorts_first_ascending() {
        let mut docs = vec![
            doc(json!({"n": "has", "score": 1})),
            doc(json!({"n": "missing"})),
        ];
        SortSpec::ascending("score").sort(&mut docs).unwrap();
        assert_eq!(names(&docs), vec!["missing", "has"]);

        SortSpec::descending("score").sort(&mut docs).unwrap();
        assert_eq!(names(&docs), vec!["has", "missing"]);
    }

    #[test]
    fn test_both_absent_is_a_tie() {
        let spec = SortSpec::ascending("score");
        let a = doc(json!({}));
        assert_eq!(spec.compare(&a, &a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_collection_fault() {
        let mut docs = vec![doc(json!({"tags": [1]})), doc(json!({"tags": 2}))];
        let err = SortSpec::ascending("tags").sort(&mut docs).unwrap_err();
        assert!(matches!(err, Error::QueryEvaluation(_)));
    }

    #[test]
    fn test_mixed_kinds_fault() {
        let mut docs = vec![doc(json!({"v": "1"})), doc(json!({"v": 2}))];
        assert!(SortSpec::ascending("v").sort(&mut docs).is_err());
    }

    #[test]
    fn test_empty_spec_keeps_order() {
        let mut docs = vec![doc(json!({"n": "b"})), doc(json!({"n": "a"}))];
        SortSpec::new().sort(&mut docs).unwrap();
        assert_eq!(names(&docs), vec!["b", "a"]);
    }

    proptest! {
        #[test]
        fn prop_sort_is_ordered_and_idempotent(
            values in proptest::collection::vec(proptest::option::of(-50i64..50), 0..40),
            descending in any::<bool>(),
        ) {
            let mut docs: Vec<Document> = values
                .iter()
                .map(|v| match v {
                    Some(v) => doc(json!({"score": v})),
                    None => doc(json!({})),
                })
                .collect();
            let order = if descending { SortOrder::Descending } else { SortOrder::Ascending };
            let spec = SortSpec::by("score", order);

            spec.sort(&mut docs).unwrap();
            for pair in docs.windows(2) {
                prop_assert_ne!(spec.compare(&pair[0], &pair[1]).unwrap(), Ordering::Greater);
            }

            let once = docs.clone();
            spec.sort(&mut docs).unwrap();
            prop_assert_eq!(once, docs);
        }
    }
}
