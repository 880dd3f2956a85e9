//! Local Cache - in-process map of live entities
//!
//! One table per type. Handles are `Arc<Entity>`, so every caller sees the
//! same live instance until it is evicted or removed.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::entity::Entity;
use crate::domain::ports::{EntityId, EntityType};

type Table = Arc<RwLock<HashMap<EntityId, Arc<Entity>>>>;

#[derive(Debug, Default)]
pub struct LocalCache {
    tables: DashMap<EntityType, Table>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, entity_type: &EntityType) -> Table {
        if let Some(table) = self.tables.get(entity_type) {
            return table.clone();
        }
        self.tables
            .entry(entity_type.clone())
            .or_default()
            .clone()
    }

    pub fn get(&self, entity_type: &EntityType, id: EntityId) -> Option<Arc<Entity>> {
        self.table(entity_type).read().get(&id).cloned()
    }

    pub fn contains(&self, entity_type: &EntityType, id: EntityId) -> bool {
        self.table(entity_type).read().contains_key(&id)
    }

    /// Insert or replace, returning the previous instance.
    pub fn insert(&self, entity: Arc<Entity>) -> Option<Arc<Entity>> {
        self.table(entity.entity_type())
            .write()
            .insert(entity.id(), entity)
    }

    /// Insert unless an instance is already resident; returns the resident
    /// instance either way.
    pub fn insert_if_absent(&self, entity: Arc<Entity>) -> Arc<Entity> {
        let table = self.table(entity.entity_type());
        let mut guard = table.write();
        guard.entry(entity.id()).or_insert(entity).clone()
    }

    pub fn remove(&self, entity_type: &EntityType, id: EntityId) -> Option<Arc<Entity>> {
        self.table(entity_type).write().remove(&id)
    }

    /// Remove only if the resident instance is `expected`.
    pub fn remove_if_same(&self, expected: &Arc<Entity>) -> bool {
        let table = self.table(expected.entity_type());
        let mut guard = table.write();
        match guard.get(&expected.id()) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                guard.remove(&expected.id());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of resident ids.
    pub fn ids(&self, entity_type: &EntityType) -> Vec<EntityId> {
        self.table(entity_type).read().keys().copied().collect()
    }

    /// Snapshot of resident entities.
    pub fn entities(&self, entity_type: &EntityType) -> Vec<Arc<Entity>> {
        self.table(entity_type).read().values().cloned().collect()
    }

    pub fn len(&self, entity_type: &EntityType) -> usize {
        self.table(entity_type).read().len()
    }

    pub fn total_len(&self) -> usize {
        self.tables.iter().map(|t| t.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: EntityId) -> Arc<Entity> {
        Arc::new(Entity::new("player".into(), id))
    }

    #[test]
    fn test_insert_get_remove() {
        let cache = LocalCache::new();
        let id = EntityId::random();
        let e = entity(id);

        assert!(cache.insert(e.clone()).is_none());
        assert!(Arc::ptr_eq(&cache.get(&"player".into(), id).unwrap(), &e));
        assert!(cache.contains(&"player".into(), id));
        assert_eq!(cache.len(&"player".into()), 1);
        assert_eq!(cache.total_len(), 1);

        assert!(cache.remove(&"player".into(), id).is_some());
        assert!(cache.get(&"player".into(), id).is_none());
    }

    #[test]
    fn test_insert_if_absent_keeps_resident() {
        let cache = LocalCache::new();
        let id = EntityId::random();
        let first = entity(id);
        let second = entity(id);

        assert!(Arc::ptr_eq(&cache.insert_if_absent(first.clone()), &first));
        assert!(Arc::ptr_eq(&cache.insert_if_absent(second), &first));
    }

    #[test]
    fn test_remove_if_same() {
        let cache = LocalCache::new();
        let id = EntityId::random();
        let stale = entity(id);
        let fresh = entity(id);

        cache.insert(fresh.clone());
        assert!(!cache.remove_if_same(&stale));
        assert!(cache.remove_if_same(&fresh));
        assert!(cache.ids(&"player".into()).is_empty());
    }
}
