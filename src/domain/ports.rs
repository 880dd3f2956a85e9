//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by every layer and the
//! collaborator traits (ports) the engine depends on. Storage and transport
//! adapters implement these traits; the engine never sees a concrete backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Engine (pipeline)                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ BackingStore │ DistributedCache │ ReplicationTransport│   │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters (Impls)                      │
//! │   InMemoryBackingStore │ InMemoryDistributedCache │ ...      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Document-shaped entity state: a bag of named JSON fields.
pub type Document = serde_json::Map<String, Value>;

/// Identifier of a registered entity type (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityType(pub String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the replication topic carrying this type's messages.
    pub fn topic(&self) -> String {
        format!("DataTopic:{}", self.0)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 128-bit entity identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Storage tier enumeration, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// In-process map of live entities
    Local,
    /// Cache shared by cooperating processes
    Distributed,
    /// Durable source of truth
    Backing,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Local => write!(f, "local cache"),
            Tier::Distributed => write!(f, "distributed cache"),
            Tier::Backing => write!(f, "backing store"),
        }
    }
}

/// Resolve a dotted field path (`"stats.score"`) inside a document.
///
/// JSON `null` is reported as absent.
pub fn field_value<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

// =============================================================================
// Storage Ports
// =============================================================================

/// Port for the durable source of truth.
///
/// Every write of the engine ends here; it is the fill-through source when
/// the distributed cache misses.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read the stored document for an entity.
    async fn get(&self, entity_type: &EntityType, id: EntityId) -> Result<Option<Document>>;

    /// Store (insert or replace) a document.
    async fn put(&self, entity_type: &EntityType, id: EntityId, document: Document) -> Result<()>;

    /// Remove a document, reporting whether it existed.
    async fn remove(&self, entity_type: &EntityType, id: EntityId) -> Result<bool>;

    /// Check whether a document exists.
    async fn contains(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        Ok(self.get(entity_type, id).await?.is_some())
    }

    /// All ids stored for a type.
    async fn keys(&self, entity_type: &EntityType) -> Result<Vec<EntityId>>;

    /// All (id, document) pairs stored for a type.
    async fn scan(&self, entity_type: &EntityType) -> Result<Vec<(EntityId, Document)>>;
}

/// Port for the cache shared by cooperating processes.
///
/// Same shape as [`BackingStore`] plus expiry management. Entries expire
/// after the type's expiry policy (or the default policy).
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, entity_type: &EntityType, id: EntityId) -> Result<Option<Document>>;

    async fn put(&self, entity_type: &EntityType, id: EntityId, document: Document) -> Result<()>;

    async fn remove(&self, entity_type: &EntityType, id: EntityId) -> Result<bool>;

    async fn contains(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        Ok(self.get(entity_type, id).await?.is_some())
    }

    async fn keys(&self, entity_type: &EntityType) -> Result<Vec<EntityId>>;

    async fn scan(&self, entity_type: &EntityType) -> Result<Vec<(EntityId, Document)>>;

    /// Restart the expiry window of an entry.
    async fn refresh_expiry(&self, entity_type: &EntityType, id: EntityId) -> Result<()>;

    /// Declare the expiry policy of a type. Caches without per-type
    /// policies keep their default.
    fn set_expiry(&self, _entity_type: &EntityType, _expiry: Duration) {}
}

// =============================================================================
// Replication Port
// =============================================================================

/// Callback invoked for every payload delivered on a subscribed topic.
pub type PayloadHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Port for the cross-process publish/subscribe transport.
///
/// Delivery is at-least-once and ordered per topic. Every subscriber of a
/// topic, including the publishing process itself, receives every payload.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Register a handler for a topic.
    async fn subscribe(&self, topic: &str, handler: PayloadHandler) -> Result<()>;
}
