//! Cache Hierarchy - Local / Distributed / Backing tiers
//!
//! Reads check the cheapest tier first and fill through on the way back;
//! writes fan out to every tier, innermost first, each one best-effort.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::entity::Entity;
use super::local::LocalCache;
use super::metrics::TierMetrics;
use super::registry::TypeRegistry;
use crate::domain::ports::{BackingStore, DistributedCache, Document, EntityId, EntityType, Tier};
use crate::error::{Error, Result};

/// A document read from one of the remote tiers
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub document: Document,
    /// Tier the document was found in
    pub tier: Tier,
}

/// The three storage tiers behind one process
pub struct CacheHierarchy {
    local: Arc<LocalCache>,
    distributed: Arc<dyn DistributedCache>,
    backing: Arc<dyn BackingStore>,
    registry: Arc<TypeRegistry>,
    metrics: Arc<TierMetrics>,
}

impl CacheHierarchy {
    pub fn new(
        local: Arc<LocalCache>,
        distributed: Arc<dyn DistributedCache>,
        backing: Arc<dyn BackingStore>,
        registry: Arc<TypeRegistry>,
        metrics: Arc<TierMetrics>,
    ) -> Self {
        Self {
            local,
            distributed,
            backing,
            registry,
            metrics,
        }
    }

    /// Get a document, filling through every tier that missed.
    ///
    /// Returns `Ok(None)` when the entity exists in no tier.
    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn get(&self, entity_type: &EntityType, id: EntityId) -> Result<Option<Document>> {
        if let Some(entity) = self.local_hit(entity_type, id) {
            return Ok(Some(entity.document()));
        }

        match self.fetch_remote(entity_type, id).await? {
            Some(fetched) => {
                let entity = self.materialize(entity_type, id, fetched.document)?;
                Ok(Some(entity.document()))
            }
            None => Ok(None),
        }
    }

    /// Look up the local tier, refreshing the entity's last use on a hit.
    pub fn local_hit(&self, entity_type: &EntityType, id: EntityId) -> Option<Arc<Entity>> {
        match self.local.get(entity_type, id) {
            Some(entity) => {
                self.metrics.record_hit(Tier::Local);
                entity.touch();
                Some(entity)
            }
            None => {
                self.metrics.record_miss(Tier::Local);
                None
            }
        }
    }

    /// Read the distributed cache, then the backing store.
    ///
    /// A distributed cache failure falls back to the backing store; a
    /// backing store failure is the caller's. A backing store hit is written
    /// through to the distributed cache.
    pub async fn fetch_remote(
        &self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> Result<Option<Fetched>> {
        match self.distributed.get(entity_type, id).await {
            Ok(Some(document)) => {
                self.metrics.record_hit(Tier::Distributed);
                if let Err(e) = self.distributed.refresh_expiry(entity_type, id).await {
                    debug!(entity_type = %entity_type, entity_id = %id, error = %e, "Failed to refresh expiry");
                }
                return Ok(Some(Fetched {
                    document,
                    tier: Tier::Distributed,
                }));
            }
            Ok(None) => self.metrics.record_miss(Tier::Distributed),
            Err(e) => {
                self.metrics.record_miss(Tier::Distributed);
                warn!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    error = %e,
                    "Distributed cache read failed, falling back to backing store"
                );
            }
        }

        match self.backing.get(entity_type, id).await? {
            Some(document) => {
                self.metrics.record_hit(Tier::Backing);
                if let Err(e) = self
                    .distributed
                    .put(entity_type, id, document.clone())
                    .await
                {
                    warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Fill-through to distributed cache failed");
                }
                Ok(Some(Fetched {
                    document,
                    tier: Tier::Backing,
                }))
            }
            None => {
                self.metrics.record_miss(Tier::Backing);
                Ok(None)
            }
        }
    }

    /// Insert a fetched document into the local tier unless an instance is
    /// already resident. Runs `on_load` for a newly inserted entity.
    fn materialize(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        document: Document,
    ) -> Result<Arc<Entity>> {
        let registration = self.registry.get(entity_type)?;
        let candidate = Arc::new(Entity::with_document(entity_type.clone(), id, document));
        let resident = self.local.insert_if_absent(candidate.clone());
        if Arc::ptr_eq(&resident, &candidate) {
            registration.hooks.on_load(&resident);
        }
        Ok(resident)
    }

    /// Write a document to every tier: local, distributed, then backing.
    ///
    /// A failing tier does not stop the outer ones and does not roll back the
    /// inner ones; the first failure is returned after all writes ran.
    #[instrument(skip(self, document), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn put(&self, entity_type: &EntityType, id: EntityId, document: Document) -> Result<()> {
        match self.local.get(entity_type, id) {
            Some(entity) => {
                entity.replace(document.clone());
                entity.touch();
            }
            None => {
                self.local.insert(Arc::new(Entity::with_document(
                    entity_type.clone(),
                    id,
                    document.clone(),
                )));
            }
        }

        let mut first_error: Option<Error> = None;
        if let Err(e) = self.distributed.put(entity_type, id, document.clone()).await {
            warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Distributed cache write failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.backing.put(entity_type, id, document).await {
            warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Backing store write failed");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Check whether any tier holds the entity, cheapest first.
    pub async fn contains(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        if self.local.contains(entity_type, id) {
            return Ok(true);
        }
        match self.distributed.contains(entity_type, id).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Distributed cache lookup failed");
            }
        }
        self.backing.contains(entity_type, id).await
    }

    /// Remove the entity from every tier, reporting whether any held it.
    pub async fn remove(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        let mut removed = self.local.remove(entity_type, id).is_some();
        let mut first_error: Option<Error> = None;

        match self.distributed.remove(entity_type, id).await {
            Ok(existed) => removed |= existed,
            Err(e) => {
                warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Distributed cache remove failed");
                first_error.get_or_insert(e);
            }
        }
        match self.backing.remove(entity_type, id).await {
            Ok(existed) => removed |= existed,
            Err(e) => {
                warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Backing store remove failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Write an entity's current document to one remote tier.
    pub async fn sync_to(&self, entity: &Entity, tier: Tier) -> Result<()> {
        let document = entity.document();
        match tier {
            Tier::Distributed => {
                self.distributed
                    .put(entity.entity_type(), entity.id(), document)
                    .await
            }
            Tier::Backing => {
                self.backing
                    .put(entity.entity_type(), entity.id(), document)
                    .await
            }
            Tier::Local => Ok(()),
        }
    }

    /// Every id stored for a type in the distributed cache or backing store.
    pub async fn remote_keys(&self, entity_type: &EntityType) -> Result<Vec<EntityId>> {
        let mut ids = match self.distributed.keys(entity_type).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(entity_type = %entity_type, error = %e, "Distributed cache key listing failed");
                Vec::new()
            }
        };
        ids.extend(self.backing.keys(entity_type).await?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn distributed(&self) -> &Arc<dyn DistributedCache> {
        &self.distributed
    }

    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryBackingStore, InMemoryDistributedCache};
    use crate::pipeline::registry::{TypeConfig, TypeRegistration};
    use serde_json::json;

    struct Fixture {
        hierarchy: CacheHierarchy,
        distributed: Arc<InMemoryDistributedCache>,
        backing: Arc<InMemoryBackingStore>,
    }

    fn player() -> EntityType {
        EntityType::new("player")
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn fixture() -> Fixture {
        let distributed = Arc::new(InMemoryDistributedCache::new());
        let backing = Arc::new(InMemoryBackingStore::new());
        let mut registry = TypeRegistry::new();
        registry.register(TypeRegistration::new(player(), TypeConfig::default()));
        let hierarchy = CacheHierarchy::new(
            Arc::new(LocalCache::new()),
            distributed.clone(),
            backing.clone(),
            Arc::new(registry),
            Arc::new(TierMetrics::new()),
        );
        Fixture {
            hierarchy,
            distributed,
            backing,
        }
    }

    #[tokio::test]
    async fn test_get_fills_through_from_backing_store() {
        let f = fixture();
        let id = EntityId::random();
        f.backing.put(&player(), id, doc(json!({"score": 7}))).await.unwrap();

        let found = f.hierarchy.get(&player(), id).await.unwrap();
        assert_eq!(found, Some(doc(json!({"score": 7}))));
        assert!(f.hierarchy.local().contains(&player(), id));
        assert_eq!(f.distributed.peek(&player(), id), Some(doc(json!({"score": 7}))));

        // Local hit: no further remote reads
        let reads = f.backing.stats().reads;
        f.hierarchy.get(&player(), id).await.unwrap();
        assert_eq!(f.backing.stats().reads, reads);
    }

    #[tokio::test]
    async fn test_get_distributed_hit_skips_backing_store() {
        let f = fixture();
        let id = EntityId::random();
        f.distributed.put(&player(), id, doc(json!({"a": 1}))).await.unwrap();

        let fetched = f.hierarchy.fetch_remote(&player(), id).await.unwrap().unwrap();
        assert_eq!(fetched.tier, Tier::Distributed);
        assert_eq!(f.backing.stats().reads, 0);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let f = fixture();
        assert!(f.hierarchy.get(&player(), EntityId::random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_distributed_failure_falls_back() {
        let f = fixture();
        let id = EntityId::random();
        f.backing.put(&player(), id, doc(json!({"a": 1}))).await.unwrap();
        f.distributed.set_fail_reads(true);

        let fetched = f.hierarchy.fetch_remote(&player(), id).await.unwrap().unwrap();
        assert_eq!(fetched.tier, Tier::Backing);
    }

    #[tokio::test]
    async fn test_backing_failure_propagates() {
        let f = fixture();
        f.backing.set_fail_reads(true);
        let err = f
            .hierarchy
            .get(&player(), EntityId::random())
            .await
            .unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_put_is_best_effort_per_tier() {
        let f = fixture();
        let id = EntityId::random();
        f.distributed.set_fail_writes(true);

        let result = f.hierarchy.put(&player(), id, doc(json!({"a": 2}))).await;
        assert!(result.is_err());
        // Inner tier kept, outer tier still written
        assert!(f.hierarchy.local().contains(&player(), id));
        assert_eq!(f.backing.peek(&player(), id), Some(doc(json!({"a": 2}))));
        assert!(f.distributed.peek(&player(), id).is_none());
    }

    #[tokio::test]
    async fn test_contains_and_remove() {
        let f = fixture();
        let id = EntityId::random();
        assert!(!f.hierarchy.contains(&player(), id).await.unwrap());

        f.backing.put(&player(), id, doc(json!({}))).await.unwrap();
        assert!(f.hierarchy.contains(&player(), id).await.unwrap());

        f.hierarchy.put(&player(), id, doc(json!({"a": 1}))).await.unwrap();
        assert!(f.hierarchy.remove(&player(), id).await.unwrap());
        assert!(!f.hierarchy.contains(&player(), id).await.unwrap());
        assert!(!f.hierarchy.remove(&player(), id).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_keys_merges_tiers() {
        let f = fixture();
        let a = EntityId::random();
        let b = EntityId::random();
        f.distributed.put(&player(), a, doc(json!({}))).await.unwrap();
        f.backing.put(&player(), a, doc(json!({}))).await.unwrap();
        f.backing.put(&player(), b, doc(json!({}))).await.unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(f.hierarchy.remote_keys(&player()).await.unwrap(), expected);
    }
}
