//! Live entities and their lifecycle hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::domain::ports::{field_value, Document, EntityId, EntityType};

/// A live entity held in the local cache.
///
/// Shared as `Arc<Entity>`: every handle returned for the same id observes
/// the same document. Identity (equality, hashing) is the (type, id) pair.
#[derive(Debug)]
pub struct Entity {
    entity_type: EntityType,
    id: EntityId,
    document: RwLock<Document>,
    last_use: Mutex<Instant>,
    marked_for_removal: AtomicBool,
}

impl Entity {
    /// Create an entity with an empty document.
    pub fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self::with_document(entity_type, id, Document::new())
    }

    pub fn with_document(entity_type: EntityType, id: EntityId, document: Document) -> Self {
        Self {
            entity_type,
            id,
            document: RwLock::new(document),
            last_use: Mutex::new(Instant::now()),
            marked_for_removal: AtomicBool::new(false),
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Snapshot of the current document.
    ///
    /// Sync, replication and find read through here, so it does not count
    /// as a use.
    pub fn document(&self) -> Document {
        self.document.read().clone()
    }

    /// Get a field by dotted path. Counts as a use.
    pub fn get(&self, path: &str) -> Option<Value> {
        let value = field_value(&self.document.read(), path).cloned();
        self.touch();
        value
    }

    /// Set a top-level field.
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.document.write().insert(field.into(), value.into());
        self.touch();
    }

    /// Mutate the document in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let result = f(&mut self.document.write());
        self.touch();
        result
    }

    /// Replace the whole document, returning the previous one.
    pub fn replace(&self, document: Document) -> Document {
        std::mem::replace(&mut *self.document.write(), document)
    }

    /// Record a use of the entity (resets its idle time).
    pub fn touch(&self) {
        *self.last_use.lock() = Instant::now();
    }

    pub fn last_use(&self) -> Instant {
        *self.last_use.lock()
    }

    /// Mark as deleted; replication updates for it are rejected from now on.
    pub fn mark_for_removal(&self) {
        self.marked_for_removal.store(true, Ordering::SeqCst);
    }

    pub fn unmark_for_removal(&self) {
        self.marked_for_removal.store(false, Ordering::SeqCst);
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal.load(Ordering::SeqCst)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
        self.id.hash(state);
    }
}

/// Per-type lifecycle callbacks.
///
/// Hooks run synchronously on the thread that triggered them, some of them
/// while engine locks are held; they must not call back into the pipeline.
pub trait EntityHooks: Send + Sync {
    /// A fresh entity was created (before its first save).
    fn on_create(&self, _entity: &Entity) {}

    /// An entity was materialized from a remote tier.
    fn on_load(&self, _entity: &Entity) {}

    /// A replicated document replaced the local one.
    fn on_merge(&self, _entity: &Entity, _previous: &Document, _incoming: &Document) {}

    /// The entity is about to be evicted from the local cache.
    fn on_cleanup(&self, _entity: &Entity) {}

    /// The entity was deleted, locally or by a peer.
    fn on_delete(&self, _entity: &Entity) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl EntityHooks for NoopHooks {}
