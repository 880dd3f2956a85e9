//! Replication Channel - cross-process propagation for one entity type
//!
//! Every process publishes full-document updates and removals on the type's
//! topic and applies the ones its peers publish. Updates that arrive while a
//! load for the same entity is still in flight are parked in the
//! [`ReplicationBuffer`] and applied when the load finishes, so a slow
//! fetch never overwrites a newer peer update.
//!
//! Lock order: buffer, then local table. Both the receive path and the
//! load-finish path hold the buffer lock for their whole decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::entity::Entity;
use super::local::LocalCache;
use super::metrics::TierMetrics;
use super::registry::TypeRegistration;
use crate::domain::events::ReplicationMessage;
use crate::domain::ports::{Document, EntityId, EntityType, PayloadHandler, ReplicationTransport};
use crate::error::Result;

/// Default lifetime of a buffered load slot (30s)
pub const DEFAULT_REPLICATION_BUFFER_TTL: Duration = Duration::from_secs(30);

// =============================================================================
// Replication Buffer
// =============================================================================

#[derive(Debug)]
struct BufferSlot {
    document: Option<Document>,
    registered_at: Instant,
}

/// Newest peer document per entity whose load is in flight.
///
/// A slot exists only between `register` and `take`/`discard`; slots older
/// than the ttl are treated as gone.
#[derive(Debug)]
pub struct ReplicationBuffer {
    slots: Mutex<HashMap<EntityId, BufferSlot>>,
    ttl: Duration,
}

impl ReplicationBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, BufferSlot>> {
        self.slots.lock()
    }

    fn is_live(&self, slot: &BufferSlot, now: Instant) -> bool {
        now.saturating_duration_since(slot.registered_at) < self.ttl
    }

    /// Open a slot for a load that is starting.
    pub fn register(&self, id: EntityId) {
        let now = Instant::now();
        let mut slots = self.lock();
        slots.retain(|_, slot| now.saturating_duration_since(slot.registered_at) < self.ttl);
        slots.entry(id).or_insert(BufferSlot {
            document: None,
            registered_at: now,
        });
    }

    /// Record a document for a registered load. Returns false if no live
    /// slot exists.
    pub fn record(&self, id: EntityId, document: Document) -> bool {
        self.record_locked(&mut self.lock(), id, document)
    }

    fn record_locked(
        &self,
        slots: &mut HashMap<EntityId, BufferSlot>,
        id: EntityId,
        document: Document,
    ) -> bool {
        let now = Instant::now();
        match slots.get_mut(&id) {
            Some(slot) if self.is_live(slot, now) => {
                slot.document = Some(document);
                true
            }
            Some(_) => {
                slots.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Consume the slot, returning its document if one was recorded in time.
    pub fn take(&self, id: EntityId) -> Option<Document> {
        self.take_locked(&mut self.lock(), id)
    }

    fn take_locked(
        &self,
        slots: &mut HashMap<EntityId, BufferSlot>,
        id: EntityId,
    ) -> Option<Document> {
        let slot = slots.remove(&id)?;
        if self.is_live(&slot, Instant::now()) {
            slot.document
        } else {
            None
        }
    }

    /// Drop the slot without applying it.
    pub fn discard(&self, id: EntityId) {
        self.lock().remove(&id);
    }

    pub fn is_registered(&self, id: EntityId) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&id)
            .map(|slot| self.is_live(slot, now))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Replication Channel
// =============================================================================

/// What happened to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Our own echo
    Ignored,
    /// Applied to the resident entity
    Merged,
    /// Parked until the in-flight load finishes
    Buffered,
    /// Neither resident nor loading
    Dropped,
    /// Resident entity marked and removed locally
    Removed,
}

/// Result of publishing an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Published,
    /// The entity is marked for removal; nothing was published
    Rejected,
}

pub struct ReplicationChannel {
    registration: Arc<TypeRegistration>,
    sender_id: Uuid,
    topic: String,
    transport: Arc<dyn ReplicationTransport>,
    local: Arc<LocalCache>,
    buffer: ReplicationBuffer,
    metrics: Arc<TierMetrics>,
}

impl ReplicationChannel {
    pub fn new(
        registration: Arc<TypeRegistration>,
        sender_id: Uuid,
        transport: Arc<dyn ReplicationTransport>,
        local: Arc<LocalCache>,
        buffer_ttl: Duration,
        metrics: Arc<TierMetrics>,
    ) -> Self {
        let topic = registration.entity_type.topic();
        Self {
            registration,
            sender_id,
            topic,
            transport,
            local,
            buffer: ReplicationBuffer::new(buffer_ttl),
            metrics,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.registration.entity_type
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    pub fn buffer(&self) -> &ReplicationBuffer {
        &self.buffer
    }

    /// Subscribe this channel to its topic.
    ///
    /// The handler holds a weak reference; once the channel is dropped its
    /// deliveries are ignored.
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        let channel = Arc::downgrade(self);
        let topic = self.topic.clone();
        let handler: PayloadHandler = Arc::new(move |payload: Bytes| {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            match ReplicationMessage::decode(&payload) {
                Ok(message) => {
                    channel.receive(message);
                }
                Err(e) => {
                    channel.metrics.record_replication_dropped();
                    warn!(topic = %topic, error = %e, "Dropping undecodable replication payload");
                }
            }
        });
        self.transport.subscribe(&self.topic, handler).await
    }

    /// Apply a message delivered on the topic.
    pub fn receive(&self, message: ReplicationMessage) -> ReceiveOutcome {
        if message.sender_id() == self.sender_id {
            self.metrics.record_replication_ignored();
            return ReceiveOutcome::Ignored;
        }

        let outcome = match message {
            ReplicationMessage::Update {
                entity_id,
                document,
                ..
            } => self.receive_update(entity_id, document),
            ReplicationMessage::Removal { entity_id, .. } => self.receive_removal(entity_id),
        };
        debug!(entity_type = %self.entity_type(), ?outcome, "Replication message received");
        outcome
    }

    fn receive_update(&self, id: EntityId, document: Document) -> ReceiveOutcome {
        let mut slots = self.buffer.lock();

        if let Some(entity) = self.local.get(self.entity_type(), id) {
            self.merge(&entity, document);
            self.metrics.record_replication_merged();
            return ReceiveOutcome::Merged;
        }

        if self.buffer.record_locked(&mut slots, id, document) {
            self.metrics.record_replication_buffered();
            ReceiveOutcome::Buffered
        } else {
            self.metrics.record_replication_dropped();
            ReceiveOutcome::Dropped
        }
    }

    fn receive_removal(&self, id: EntityId) -> ReceiveOutcome {
        let mut slots = self.buffer.lock();

        // A parked update is superseded by the removal
        if let Some(slot) = slots.get_mut(&id) {
            slot.document = None;
        }

        match self.local.remove(self.entity_type(), id) {
            Some(entity) => {
                entity.mark_for_removal();
                self.registration.hooks.on_delete(&entity);
                self.metrics.record_replication_removal();
                ReceiveOutcome::Removed
            }
            None => {
                self.metrics.record_replication_dropped();
                ReceiveOutcome::Dropped
            }
        }
    }

    /// Replace the entity's document with a newer one, running `on_merge`
    /// with the pre-merge snapshot first.
    fn merge(&self, entity: &Entity, incoming: Document) {
        let previous = entity.document();
        self.registration
            .hooks
            .on_merge(entity, &previous, &incoming);
        entity.replace(incoming);
        entity.touch();
    }

    /// Publish the entity's current document.
    ///
    /// An entity marked for removal is rejected: a concurrent removal wins
    /// over a stale update.
    pub async fn push_update(&self, entity: &Entity) -> Result<PushOutcome> {
        if entity.is_marked_for_removal() {
            debug!(entity_type = %self.entity_type(), entity_id = %entity.id(), "Update rejected, entity marked for removal");
            return Ok(PushOutcome::Rejected);
        }

        let message = ReplicationMessage::Update {
            sender_id: self.sender_id,
            entity_id: entity.id(),
            document: entity.document(),
        };
        self.transport.publish(&self.topic, message.encode()?).await?;
        Ok(PushOutcome::Published)
    }

    /// Mark the entity and tell peers to drop it.
    pub async fn push_removal(&self, entity: &Entity) -> Result<()> {
        entity.mark_for_removal();
        self.publish_removal(entity.id()).await
    }

    /// Tell peers to drop an entity that is not resident here.
    pub async fn publish_removal(&self, id: EntityId) -> Result<()> {
        let message = ReplicationMessage::Removal {
            sender_id: self.sender_id,
            entity_id: id,
        };
        self.transport.publish(&self.topic, message.encode()?).await
    }

    /// Start buffering peer updates for an entity being loaded.
    pub fn begin_load(&self, id: EntityId) {
        self.buffer.register(id);
    }

    /// Stop buffering for a load that failed or was cancelled.
    pub fn abort_load(&self, id: EntityId) {
        self.buffer.discard(id);
    }

    /// Finish a load: populate the local tier, preferring a buffered peer
    /// update over the fetched document.
    ///
    /// If an instance became resident meanwhile it is kept (with any
    /// buffered update merged into it). Returns `None` only when neither a
    /// fetched nor a buffered document exists.
    pub fn finish_load(&self, id: EntityId, fetched: Option<Document>) -> Option<Arc<Entity>> {
        let mut slots = self.buffer.lock();
        let buffered = self.buffer.take_locked(&mut slots, id);
        let entity_type = self.entity_type();

        if let Some(existing) = self.local.get(entity_type, id) {
            if let Some(newer) = buffered {
                self.merge(&existing, newer);
                self.metrics.record_replication_merged();
            }
            existing.touch();
            return Some(existing);
        }

        let (document, newer) = match (fetched, buffered) {
            (Some(fetched), buffered) => (fetched, buffered),
            (None, Some(buffered)) => (buffered, None),
            (None, None) => return None,
        };

        let entity = Arc::new(Entity::with_document(entity_type.clone(), id, document));
        self.local.insert(entity.clone());
        self.registration.hooks.on_load(&entity);

        if let Some(newer) = newer {
            self.merge(&entity, newer);
            self.metrics.record_replication_merged();
        }
        Some(entity)
    }
}
