//! Find options: condition, ordering and pagination over (id, document) rows.

use crate::domain::ports::{Document, EntityId};
use crate::error::Result;

use super::condition::Condition;
use super::sort::SortSpec;

/// Options for a find over one entity type.
///
/// Applied in a fixed order: condition, sort, skip, limit.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub condition: Option<Condition>,
    pub sort: SortSpec,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Run these options over a set of rows.
    ///
    /// Rows are first ordered by id so results are deterministic when sort
    /// keys tie or no sort is given.
    pub fn apply(&self, rows: Vec<(EntityId, Document)>) -> Result<Vec<(EntityId, Document)>> {
        let mut matched = Vec::with_capacity(rows.len());
        for (id, document) in rows {
            let keep = match &self.condition {
                Some(condition) => condition.evaluate_entry(id, &document)?,
                None => true,
            };
            if keep {
                matched.push((id, document));
            }
        }

        matched.sort_by_key(|(id, _)| *id);
        self.sort.sort_by_document(&mut matched, |(_, d)| d)?;

        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(self.skip).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(level: i64) -> (EntityId, Document) {
        (
            EntityId::random(),
            json!({"level": level}).as_object().cloned().unwrap(),
        )
    }

    fn levels(rows: &[(EntityId, Document)]) -> Vec<i64> {
        rows.iter()
            .map(|(_, d)| d["level"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_condition_sort_skip_limit() {
        let rows = (1..=10).map(row).collect();
        let options = FindOptions::new()
            .condition(Condition::field("level").gt(2))
            .sort(SortSpec::descending("level"))
            .skip(1)
            .limit(3);
        let found = options.apply(rows).unwrap();
        assert_eq!(levels(&found), vec![9, 8, 7]);
    }

    #[test]
    fn test_defaults_return_everything() {
        let rows: Vec<_> = (1..=4).map(row).collect();
        assert_eq!(FindOptions::new().apply(rows).unwrap().len(), 4);
    }

    #[test]
    fn test_condition_fault_propagates() {
        let rows = vec![(
            EntityId::random(),
            json!({"level": "high"}).as_object().cloned().unwrap(),
        )];
        let options = FindOptions::new().condition(Condition::field("level").gt(1));
        assert!(options.apply(rows).is_err());
    }
}
