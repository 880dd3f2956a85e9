//! Entity type registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::entity::{EntityHooks, NoopHooks};
use crate::domain::ports::{Document, EntityId, EntityType};
use crate::error::{Error, Result};

/// Per-type behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeConfig {
    /// Idle time before the sweeper evicts a local entity; never swept when unset
    pub ttl: Option<Duration>,
    /// Saves write to the backing store as well as the distributed cache
    pub replicate_to_backing: bool,
    /// Evictions write the entity to the distributed cache
    pub sweep_to_distributed: bool,
    /// Shutdown flushes resident entities of this type
    pub auto_save: bool,
    /// Load every stored entity of this type at startup
    pub preload: bool,
    /// Expiry policy in the distributed cache (cache default when unset)
    pub distributed_expiry: Option<Duration>,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            replicate_to_backing: true,
            sweep_to_distributed: true,
            auto_save: true,
            preload: false,
            distributed_expiry: None,
        }
    }
}

/// Builds the initial document of a freshly created entity.
pub type EntityFactory = Arc<dyn Fn(&EntityType, EntityId) -> Document + Send + Sync>;

/// Everything the engine knows about one entity type.
#[derive(Clone)]
pub struct TypeRegistration {
    pub entity_type: EntityType,
    pub config: TypeConfig,
    pub hooks: Arc<dyn EntityHooks>,
    pub factory: EntityFactory,
}

impl TypeRegistration {
    /// Registration with no-op hooks and an empty-document factory.
    pub fn new(entity_type: impl Into<EntityType>, config: TypeConfig) -> Self {
        Self {
            entity_type: entity_type.into(),
            config,
            hooks: Arc::new(NoopHooks),
            factory: Arc::new(|_, _| Document::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn EntityHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_factory(
        mut self,
        factory: impl Fn(&EntityType, EntityId) -> Document + Send + Sync + 'static,
    ) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Build the default document for a new entity.
    pub fn create_default(&self, id: EntityId) -> Document {
        (self.factory)(&self.entity_type, id)
    }
}

impl std::fmt::Debug for TypeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistration")
            .field("entity_type", &self.entity_type)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Registered types, fixed once the pipeline is built.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<EntityType, Arc<TypeRegistration>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type; a later registration of the same type replaces it.
    pub fn register(&mut self, registration: TypeRegistration) {
        self.types.insert(
            registration.entity_type.clone(),
            Arc::new(registration),
        );
    }

    pub fn get(&self, entity_type: &EntityType) -> Result<&Arc<TypeRegistration>> {
        self.types
            .get(entity_type)
            .ok_or_else(|| Error::UnregisteredType(entity_type.clone()))
    }

    /// Register a type with hooks and the empty-document factory.
    pub fn register_with(
        &mut self,
        entity_type: impl Into<EntityType>,
        config: TypeConfig,
        hooks: Arc<dyn EntityHooks>,
    ) {
        self.register(TypeRegistration::new(entity_type, config).with_hooks(hooks));
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.types.contains_key(entity_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TypeRegistration>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_config_defaults() {
        let config = TypeConfig::default();
        assert!(config.ttl.is_none());
        assert!(config.replicate_to_backing);
        assert!(config.sweep_to_distributed);
        assert!(config.auto_save);
        assert!(!config.preload);
        assert!(config.distributed_expiry.is_none());
    }

    #[test]
    fn test_unregistered_type() {
        let registry = TypeRegistry::new();
        let err = registry.get(&"ghost".into()).unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(t) if t.as_str() == "ghost"));
    }

    #[test]
    fn test_factory() {
        let mut registry = TypeRegistry::new();
        registry.register(
            TypeRegistration::new("player", TypeConfig::default())
                .with_factory(|_, id| json!({"id": id.to_string(), "level": 1}).as_object().cloned().unwrap_or_default()),
        );

        let reg = registry.get(&"player".into()).unwrap();
        let id = EntityId::random();
        let doc = reg.create_default(id);
        assert_eq!(doc["level"], 1);
        assert_eq!(doc["id"], id.to_string());
        assert_eq!(registry.len(), 1);
    }
}
