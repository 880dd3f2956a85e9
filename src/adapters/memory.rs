//! In-Memory Collaborators
//!
//! Process-local implementations of the storage and transport ports. A single
//! instance can be shared by several pipelines to simulate a fleet of
//! processes talking to one shared cache, one durable store and one
//! message bus.
//!
//! Each store counts its operations and supports fault injection, which is
//! what the tests use to observe fill-through, single-flight and
//! catch-and-continue behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::ports::{
    BackingStore, DistributedCache, Document, EntityId, EntityType, PayloadHandler,
    ReplicationTransport, Tier,
};
use crate::error::{Error, Result};

/// Default expiry applied by the distributed cache when a type declares none (12h)
pub const DEFAULT_DISTRIBUTED_EXPIRY: Duration = Duration::from_secs(12 * 60 * 60);

// =============================================================================
// Operation Counters / Fault Injection
// =============================================================================

/// Store operation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Documents currently stored
    pub object_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Remove operations
    pub removes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Counters {
    fn read(&self, tier: Tier) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::backend(tier, "injected read failure"));
        }
        Ok(())
    }

    fn write(&self, tier: Tier) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::backend(tier, "injected write failure"));
        }
        Ok(())
    }

    fn remove(&self, tier: Tier) -> Result<()> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::backend(tier, "injected write failure"));
        }
        Ok(())
    }

    fn stats(&self, object_count: u64) -> StoreStats {
        StoreStats {
            object_count,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}

/// Holds the next read of a store until released.
///
/// Lets a test keep a load "in flight" on the slow tier while it delivers
/// replication messages or starts competing loads.
#[derive(Debug, Default)]
pub struct FetchGate {
    entered: Notify,
    released: Notify,
}

impl FetchGate {
    /// Wait until a read has reached the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held read continue.
    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.released.notified().await;
    }
}

// =============================================================================
// Backing Store
// =============================================================================

/// In-memory durable store (type -> id -> document).
#[derive(Default)]
pub struct InMemoryBackingStore {
    storage: DashMap<EntityType, DashMap<EntityId, Document>>,
    counters: Counters,
    gate: Mutex<Option<Arc<FetchGate>>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reads fail with a backend fault.
    pub fn set_fail_reads(&self, fail: bool) {
        self.counters.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent writes and removes fail with a backend fault.
    pub fn set_fail_writes(&self, fail: bool) {
        self.counters.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Hold the next `get` at a gate.
    pub fn hold_next_get(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate::default());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn stats(&self) -> StoreStats {
        let count = self.storage.iter().map(|t| t.len() as u64).sum();
        self.counters.stats(count)
    }

    /// Peek at a stored document without touching the counters.
    pub fn peek(&self, entity_type: &EntityType, id: EntityId) -> Option<Document> {
        self.storage
            .get(entity_type)
            .and_then(|table| table.get(&id).map(|d| d.clone()))
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn get(&self, entity_type: &EntityType, id: EntityId) -> Result<Option<Document>> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.counters.read(Tier::Backing)?;
        Ok(self.peek(entity_type, id))
    }

    async fn put(&self, entity_type: &EntityType, id: EntityId, document: Document) -> Result<()> {
        self.counters.write(Tier::Backing)?;
        self.storage
            .entry(entity_type.clone())
            .or_default()
            .insert(id, document);
        Ok(())
    }

    async fn remove(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        self.counters.remove(Tier::Backing)?;
        Ok(self
            .storage
            .get(entity_type)
            .map(|table| table.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn contains(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        self.counters.read(Tier::Backing)?;
        Ok(self
            .storage
            .get(entity_type)
            .map(|table| table.contains_key(&id))
            .unwrap_or(false))
    }

    async fn keys(&self, entity_type: &EntityType) -> Result<Vec<EntityId>> {
        self.counters.read(Tier::Backing)?;
        Ok(self
            .storage
            .get(entity_type)
            .map(|table| table.iter().map(|e| *e.key()).collect())
            .unwrap_or_default())
    }

    async fn scan(&self, entity_type: &EntityType) -> Result<Vec<(EntityId, Document)>> {
        self.counters.read(Tier::Backing)?;
        Ok(self
            .storage
            .get(entity_type)
            .map(|table| {
                table
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Distributed Cache
// =============================================================================

struct CachedDocument {
    document: Document,
    expires_at: Instant,
}

/// In-memory shared cache with per-type expiry.
pub struct InMemoryDistributedCache {
    storage: DashMap<EntityType, DashMap<EntityId, CachedDocument>>,
    expiry: DashMap<EntityType, Duration>,
    default_expiry: Duration,
    counters: Counters,
    gate: Mutex<Option<Arc<FetchGate>>>,
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self::with_default_expiry(DEFAULT_DISTRIBUTED_EXPIRY)
    }
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_expiry(default_expiry: Duration) -> Self {
        Self {
            storage: DashMap::new(),
            expiry: DashMap::new(),
            default_expiry,
            counters: Counters::default(),
            gate: Mutex::new(None),
        }
    }

    /// Get the expiry that applies to a type.
    pub fn expiry_for(&self, entity_type: &EntityType) -> Duration {
        self.expiry
            .get(entity_type)
            .map(|e| *e)
            .unwrap_or(self.default_expiry)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.counters.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.counters.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Hold the next `get` at a gate.
    pub fn hold_next_get(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate::default());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn stats(&self) -> StoreStats {
        let count = self.storage.iter().map(|t| t.len() as u64).sum();
        self.counters.stats(count)
    }

    /// Peek at a live (non-expired) document without touching the counters.
    pub fn peek(&self, entity_type: &EntityType, id: EntityId) -> Option<Document> {
        let table = self.storage.get(entity_type)?;
        let expired = {
            let entry = table.get(&id)?;
            if entry.expires_at > Instant::now() {
                return Some(entry.document.clone());
            }
            true
        };
        if expired {
            table.remove(&id);
        }
        None
    }

    fn live_entries(&self, entity_type: &EntityType) -> HashMap<EntityId, Document> {
        let now = Instant::now();
        self.storage
            .get(entity_type)
            .map(|table| {
                table.retain(|_, cached| cached.expires_at > now);
                table
                    .iter()
                    .map(|e| (*e.key(), e.value().document.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, entity_type: &EntityType, id: EntityId) -> Result<Option<Document>> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.counters.read(Tier::Distributed)?;
        Ok(self.peek(entity_type, id))
    }

    async fn put(&self, entity_type: &EntityType, id: EntityId, document: Document) -> Result<()> {
        self.counters.write(Tier::Distributed)?;
        let expires_at = Instant::now() + self.expiry_for(entity_type);
        self.storage.entry(entity_type.clone()).or_default().insert(
            id,
            CachedDocument {
                document,
                expires_at,
            },
        );
        Ok(())
    }

    async fn remove(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        self.counters.remove(Tier::Distributed)?;
        Ok(self
            .storage
            .get(entity_type)
            .map(|table| table.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn contains(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        self.counters.read(Tier::Distributed)?;
        Ok(self.peek(entity_type, id).is_some())
    }

    async fn keys(&self, entity_type: &EntityType) -> Result<Vec<EntityId>> {
        self.counters.read(Tier::Distributed)?;
        Ok(self.live_entries(entity_type).into_keys().collect())
    }

    async fn scan(&self, entity_type: &EntityType) -> Result<Vec<(EntityId, Document)>> {
        self.counters.read(Tier::Distributed)?;
        Ok(self.live_entries(entity_type).into_iter().collect())
    }

    fn set_expiry(&self, entity_type: &EntityType, expiry: Duration) {
        self.expiry.insert(entity_type.clone(), expiry);
    }

    async fn refresh_expiry(&self, entity_type: &EntityType, id: EntityId) -> Result<()> {
        self.counters.write(Tier::Distributed)?;
        let expiry = self.expiry_for(entity_type);
        if let Some(table) = self.storage.get(entity_type) {
            if let Some(mut entry) = table.get_mut(&id) {
                entry.expires_at = Instant::now() + expiry;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// In-memory publish/subscribe bus.
///
/// Payloads are delivered synchronously to every subscriber of the topic,
/// in subscription order. Deliveries are serialized across publishers, so
/// every subscriber sees one total order per topic.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: DashMap<String, Vec<PayloadHandler>>,
    delivery: Mutex<()>,
    published: AtomicU64,
    fail_publish: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// Get the number of payloads published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Get the number of subscribers of a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    /// Deliver a raw payload as if it came from the network.
    pub fn inject(&self, topic: &str, payload: Bytes) {
        let handlers = self
            .topics
            .get(topic)
            .map(|h| h.clone())
            .unwrap_or_default();
        let _order = self.delivery.lock();
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

#[async_trait]
impl ReplicationTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.fail_publish.load(Ordering::Relaxed) {
            return Err(Error::Replication(format!(
                "injected publish failure on {}",
                topic
            )));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.inject(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: PayloadHandler) -> Result<()> {
        self.topics.entry(topic.to_string()).or_default().push(handler);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
