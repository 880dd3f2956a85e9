//! Pipeline - the per-process entry point
//!
//! Ties the tiers, the load scheduler, the replication channels and the
//! sweeper together behind load/save/delete/find.
//!
//! ```text
//!   load ──▶ LocalCache ──miss──▶ LoadScheduler ──owner──▶ fetch task
//!                                      │                  (Distributed ▶ Backing)
//!                                      └──joiner──▶ wait         │
//!                                                                ▼
//!                                               ReplicationChannel::finish_load
//!
//!   save ──▶ publish update ──▶ join(sync Distributed, sync Backing) ──▶ SaveHandle
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::entity::{Entity, EntityHooks};
use super::hierarchy::CacheHierarchy;
use super::local::LocalCache;
use super::metrics::{MetricsSnapshot, TierMetrics};
use super::registry::{TypeConfig, TypeRegistration, TypeRegistry};
use super::replication::{PushOutcome, ReplicationChannel};
use super::scheduler::{LoadCompleter, LoadScheduler, Scheduled, SchedulerShutdownReport};
use super::sweeper::EvictionSweeper;
use crate::adapters::memory::{InMemoryBackingStore, InMemoryDistributedCache, InMemoryTransport};
use crate::config::{PipelineConfig, ProcessSettings};
use crate::domain::ports::{
    BackingStore, DistributedCache, Document, EntityId, EntityType, ReplicationTransport, Tier,
};
use crate::error::{Error, Result};
use crate::query::{Filter, FindOptions};

/// Where a load may look for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Local tier only; remote tiers are never touched
    LocalOnly,
    /// Local tier; on a miss, load in the background and return nothing now
    LocalElseLoad,
    /// Local tier, then the remote tiers, waiting for the result
    #[default]
    Pipeline,
}

// =============================================================================
// Save handle
// =============================================================================

/// How a save ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Published and written to the remote tiers
    Synchronized,
    /// The entity is marked for removal; nothing was published or written
    Rejected,
}

/// Completion of a save. Resolves exactly once, after every tier write.
pub struct SaveHandle {
    entity_type: EntityType,
    entity_id: EntityId,
    inner: BoxFuture<'static, Result<SaveOutcome>>,
}

impl SaveHandle {
    fn ready(entity: &Entity, outcome: SaveOutcome) -> Self {
        Self {
            entity_type: entity.entity_type().clone(),
            entity_id: entity.id(),
            inner: future::ready(Ok(outcome)).boxed(),
        }
    }

    fn spawned(entity: &Entity, task: JoinHandle<Result<SaveOutcome>>) -> Self {
        Self {
            entity_type: entity.entity_type().clone(),
            entity_id: entity.id(),
            inner: async move {
                task.await
                    .map_err(|e| Error::Internal(format!("save task failed: {}", e)))?
            }
            .boxed(),
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub async fn wait(self) -> Result<SaveOutcome> {
        self.await
    }
}

impl Future for SaveHandle {
    type Output = Result<SaveOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for SaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveHandle")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of writing resident entities to the remote tiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

/// Result of a pipeline shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub loads: SchedulerShutdownReport,
    pub flush: FlushReport,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Pipeline`]. Collaborators left unset default to fresh
/// in-memory instances private to this pipeline.
#[derive(Default)]
pub struct PipelineBuilder {
    backing: Option<Arc<dyn BackingStore>>,
    distributed: Option<Arc<dyn DistributedCache>>,
    transport: Option<Arc<dyn ReplicationTransport>>,
    settings: ProcessSettings,
    registry: TypeRegistry,
    sender_id: Option<Uuid>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a configuration document: process settings plus every
    /// configured type with no-op hooks.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut builder = Self::new().settings(config.process_settings()?);
        for (entity_type, type_config) in config.type_configs()? {
            builder = builder.register_type(entity_type, type_config);
        }
        Ok(builder)
    }

    pub fn backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn distributed_cache(mut self, distributed: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ReplicationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn settings(mut self, settings: ProcessSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fix the process id used for echo suppression (random by default).
    pub fn sender_id(mut self, sender_id: Uuid) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn register(mut self, registration: TypeRegistration) -> Self {
        self.registry.register(registration);
        self
    }

    pub fn register_type(self, entity_type: impl Into<EntityType>, config: TypeConfig) -> Self {
        self.register(TypeRegistration::new(entity_type, config))
    }

    pub fn register_with(
        mut self,
        entity_type: impl Into<EntityType>,
        config: TypeConfig,
        hooks: Arc<dyn EntityHooks>,
    ) -> Self {
        self.registry.register_with(entity_type, config, hooks);
        self
    }

    /// Replace a registered type's hooks, keeping its configuration. Used to
    /// attach code to types that came from a configuration document.
    pub fn with_hooks(mut self, entity_type: &EntityType, hooks: Arc<dyn EntityHooks>) -> Result<Self> {
        let registration = self.registry.get(entity_type)?.as_ref().clone();
        self.registry.register(registration.with_hooks(hooks));
        Ok(self)
    }

    /// Wire everything together and subscribe to every type's topic.
    pub async fn build(self) -> Result<Pipeline> {
        let settings = self.settings;
        let sender_id = self.sender_id.unwrap_or_else(Uuid::new_v4);
        let backing = self
            .backing
            .unwrap_or_else(|| Arc::new(InMemoryBackingStore::new()));
        let distributed = self.distributed.unwrap_or_else(|| {
            Arc::new(InMemoryDistributedCache::with_default_expiry(
                settings.distributed_default_expiry,
            ))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));

        let registry = Arc::new(self.registry);
        for registration in registry.iter() {
            let expiry = registration
                .config
                .distributed_expiry
                .unwrap_or(settings.distributed_default_expiry);
            distributed.set_expiry(&registration.entity_type, expiry);
        }

        let local = Arc::new(LocalCache::new());
        let metrics = Arc::new(TierMetrics::new());
        let hierarchy = Arc::new(CacheHierarchy::new(
            local.clone(),
            distributed,
            backing,
            registry.clone(),
            metrics.clone(),
        ));

        let mut channels = HashMap::new();
        for registration in registry.iter() {
            let channel = Arc::new(ReplicationChannel::new(
                registration.clone(),
                sender_id,
                transport.clone(),
                local.clone(),
                settings.replication_buffer_ttl,
                metrics.clone(),
            ));
            channel.subscribe().await?;
            channels.insert(registration.entity_type.clone(), channel);
        }

        let sweeper = Arc::new(EvictionSweeper::new(
            hierarchy.clone(),
            registry.clone(),
            metrics.clone(),
            settings.sweep_interval,
            settings.sweep_concurrency,
        ));

        info!(
            sender_id = %sender_id,
            types = registry.len(),
            "Pipeline ready"
        );

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                sender_id,
                scheduler: LoadScheduler::new(settings.shutdown_task_timeout),
                settings,
                registry,
                local,
                hierarchy,
                channels,
                sweeper,
                sweeper_task: Mutex::new(None),
                metrics,
            }),
        })
    }
}

// =============================================================================
// Pipeline
// =============================================================================

struct PipelineInner {
    sender_id: Uuid,
    settings: ProcessSettings,
    registry: Arc<TypeRegistry>,
    local: Arc<LocalCache>,
    hierarchy: Arc<CacheHierarchy>,
    scheduler: LoadScheduler,
    channels: HashMap<EntityType, Arc<ReplicationChannel>>,
    sweeper: Arc<EvictionSweeper>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<TierMetrics>,
}

/// One process's view of the tiered entity state. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn sender_id(&self) -> Uuid {
        self.inner.sender_id
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn local(&self) -> &LocalCache {
        &self.inner.local
    }

    pub fn hierarchy(&self) -> &CacheHierarchy {
        &self.inner.hierarchy
    }

    pub fn scheduler(&self) -> &LoadScheduler {
        &self.inner.scheduler
    }

    pub fn sweeper(&self) -> &Arc<EvictionSweeper> {
        &self.inner.sweeper
    }

    pub fn channel(&self, entity_type: &EntityType) -> Result<&Arc<ReplicationChannel>> {
        self.inner
            .channels
            .get(entity_type)
            .ok_or_else(|| Error::UnregisteredType(entity_type.clone()))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    // -------------------------------------------------------------------------
    // Load / create
    // -------------------------------------------------------------------------

    /// Load an entity.
    ///
    /// With `create_if_missing`, an entity found in no tier is created from
    /// the type's factory (one instance per key, even under races).
    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn load(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        strategy: LoadStrategy,
        create_if_missing: bool,
    ) -> Result<Option<Arc<Entity>>> {
        let registration = self.inner.registry.get(entity_type)?;
        if let Some(entity) = self.inner.hierarchy.local_hit(entity_type, id) {
            return Ok(Some(entity));
        }

        match strategy {
            LoadStrategy::LocalOnly => {
                if create_if_missing {
                    Ok(Some(self.create_local(registration, id)))
                } else {
                    Ok(None)
                }
            }
            LoadStrategy::LocalElseLoad => {
                let pipeline = self.clone();
                let entity_type = entity_type.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline
                        .load_remote(&entity_type, id, create_if_missing)
                        .await
                    {
                        warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Background load failed");
                    }
                });
                Ok(None)
            }
            LoadStrategy::Pipeline => self.load_remote(entity_type, id, create_if_missing).await,
        }
    }

    /// Load through every tier, creating the entity if no tier has it.
    pub async fn get_or_create(&self, entity_type: &EntityType, id: EntityId) -> Result<Arc<Entity>> {
        match self
            .load(entity_type, id, LoadStrategy::Pipeline, true)
            .await?
        {
            Some(entity) => Ok(entity),
            None => Err(Error::Internal(format!(
                "{}/{} was neither found nor created",
                entity_type, id
            ))),
        }
    }

    /// Create a new entity with a random id in the local tier.
    ///
    /// Nothing is published or written until it is saved.
    pub fn create(&self, entity_type: &EntityType) -> Result<Arc<Entity>> {
        let registration = self.inner.registry.get(entity_type)?;
        Ok(self.create_local(registration, EntityId::random()))
    }

    fn create_local(&self, registration: &TypeRegistration, id: EntityId) -> Arc<Entity> {
        let candidate = Arc::new(Entity::with_document(
            registration.entity_type.clone(),
            id,
            registration.create_default(id),
        ));
        let resident = self.inner.local.insert_if_absent(candidate.clone());
        if Arc::ptr_eq(&resident, &candidate) {
            debug!(entity_type = %registration.entity_type, entity_id = %id, "Created entity");
            registration.hooks.on_create(&resident);
        }
        resident
    }

    async fn load_remote(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        create_if_missing: bool,
    ) -> Result<Option<Arc<Entity>>> {
        let registration = self.inner.registry.get(entity_type)?;
        let channel = self.channel(entity_type)?.clone();

        let pending = match self.inner.scheduler.schedule(entity_type, id) {
            Scheduled::Owner(pending, completer) => {
                self.inner.metrics.record_load_started();
                self.spawn_fetch(channel, pending.cancellation_token(), completer, entity_type.clone(), id);
                pending
            }
            Scheduled::Joined(pending) => {
                self.inner.metrics.record_load_joined();
                debug!(entity_type = %entity_type, entity_id = %id, task_id = pending.task_id(), "Joined in-flight load");
                pending
            }
        };

        match pending.wait().await? {
            Some(entity) => Ok(Some(entity)),
            None if create_if_missing => Ok(Some(self.create_local(registration, id))),
            None => Ok(None),
        }
    }

    /// Run the owner side of a load on its own task so joiners are not tied
    /// to the owner's caller.
    fn spawn_fetch(
        &self,
        channel: Arc<ReplicationChannel>,
        cancel: CancellationToken,
        completer: LoadCompleter,
        entity_type: EntityType,
        id: EntityId,
    ) {
        let hierarchy = self.inner.hierarchy.clone();
        let metrics = self.inner.metrics.clone();
        channel.begin_load(id);

        tokio::spawn(async move {
            let started = Instant::now();
            let fetched = tokio::select! {
                _ = cancel.cancelled() => Err(Error::LoadCancelled {
                    entity_type: entity_type.clone(),
                    entity_id: id,
                }),
                result = hierarchy.fetch_remote(&entity_type, id) => result,
            };
            // A delete may cancel after the fetch won the race
            let fetched = match fetched {
                Ok(_) if cancel.is_cancelled() => Err(Error::LoadCancelled {
                    entity_type: entity_type.clone(),
                    entity_id: id,
                }),
                other => other,
            };

            let outcome = match fetched {
                Ok(fetched) => Ok(channel.finish_load(id, fetched.map(|f| f.document))),
                Err(e) => {
                    channel.abort_load(id);
                    metrics.record_load_failed();
                    warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Load failed");
                    Err(Arc::new(e))
                }
            };
            metrics.record_load_latency(started.elapsed());
            completer.complete(outcome);
        });
    }

    // -------------------------------------------------------------------------
    // Save / delete
    // -------------------------------------------------------------------------

    /// Publish the entity's state to peers, then write it to the distributed
    /// cache and (per type policy) the backing store.
    ///
    /// A publish failure is logged and the tier writes still happen. The
    /// returned handle resolves once both writes have finished.
    #[instrument(skip(self, entity), fields(entity_type = %entity.entity_type(), entity_id = %entity.id()))]
    pub async fn save(&self, entity: &Arc<Entity>) -> Result<SaveHandle> {
        let registration = self.inner.registry.get(entity.entity_type())?;
        let channel = self.channel(entity.entity_type())?;
        entity.touch();

        match channel.push_update(entity).await {
            Ok(PushOutcome::Published) => {}
            Ok(PushOutcome::Rejected) => {
                self.inner.metrics.record_save_rejected();
                return Ok(SaveHandle::ready(entity, SaveOutcome::Rejected));
            }
            Err(e) => {
                warn!(error = %e, "Publishing update failed, synchronizing tiers anyway");
            }
        }
        self.inner.metrics.record_save();

        let hierarchy = self.inner.hierarchy.clone();
        let metrics = self.inner.metrics.clone();
        let replicate_to_backing = registration.config.replicate_to_backing;
        let target = entity.clone();
        let task = tokio::spawn(async move {
            let (distributed, backing) = tokio::join!(
                hierarchy.sync_to(&target, Tier::Distributed),
                async {
                    if replicate_to_backing {
                        hierarchy.sync_to(&target, Tier::Backing).await
                    } else {
                        Ok(())
                    }
                }
            );
            if let Err(e) = distributed.and(backing) {
                metrics.record_sync_failure();
                error!(entity_type = %target.entity_type(), entity_id = %target.id(), error = %e, "Save synchronization failed");
                return Err(e);
            }
            Ok(SaveOutcome::Synchronized)
        });

        Ok(SaveHandle::spawned(entity, task))
    }

    /// Save and wait for the tier writes.
    pub async fn save_and_wait(&self, entity: &Arc<Entity>) -> Result<SaveOutcome> {
        self.save(entity).await?.await
    }

    /// Delete an entity from every tier.
    ///
    /// Cancels an in-flight load of the same id and waits for it to settle,
    /// then runs `on_delete` for a resident instance and, with
    /// `notify_peers`, publishes a removal. Returns whether any tier held the
    /// entity.
    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn delete(
        &self,
        entity_type: &EntityType,
        id: EntityId,
        notify_peers: bool,
    ) -> Result<bool> {
        let registration = self.inner.registry.get(entity_type)?;
        let channel = self.channel(entity_type)?;

        // The owner may already be populating the local tier
        if let Some(pending) = self.inner.scheduler.lookup(entity_type, id) {
            pending.cancel();
            let _ = pending.wait().await;
        }

        let resident = self.inner.local.get(entity_type, id);
        if let Some(entity) = &resident {
            entity.mark_for_removal();
            registration.hooks.on_delete(entity);
        }

        let removed = self.inner.hierarchy.remove(entity_type, id).await;

        if notify_peers {
            if let Err(e) = channel.publish_removal(id).await {
                warn!(error = %e, "Publishing removal failed");
            }
        }

        Ok(removed? || resident.is_some())
    }

    /// Check whether any tier holds the entity.
    pub async fn exists(&self, entity_type: &EntityType, id: EntityId) -> Result<bool> {
        self.inner.registry.get(entity_type)?;
        self.inner.hierarchy.contains(entity_type, id).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Every known document of a type: the backing store's rows with resident
    /// entities' (newer) documents laid over them.
    async fn rows(&self, entity_type: &EntityType) -> Result<Vec<(EntityId, Document)>> {
        self.inner.registry.get(entity_type)?;
        let mut rows: HashMap<EntityId, Document> = self
            .inner
            .hierarchy
            .backing()
            .scan(entity_type)
            .await?
            .into_iter()
            .collect();
        for entity in self.inner.local.entities(entity_type) {
            rows.insert(entity.id(), entity.document());
        }
        Ok(rows.into_iter().collect())
    }

    /// Find documents matching the options.
    #[instrument(skip(self, options), fields(entity_type = %entity_type))]
    pub async fn find(
        &self,
        entity_type: &EntityType,
        options: &FindOptions,
    ) -> Result<Vec<(EntityId, Document)>> {
        let rows = self.rows(entity_type).await?;
        options.apply(rows)
    }

    /// Find documents matching an exact-match filter, ordered by id.
    pub async fn find_by_filter(
        &self,
        entity_type: &EntityType,
        filter: &Filter,
    ) -> Result<Vec<(EntityId, Document)>> {
        let mut rows: Vec<_> = self
            .rows(entity_type)
            .await?
            .into_iter()
            .filter(|(_, document)| filter.check(document))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Preload / flush
    // -------------------------------------------------------------------------

    /// Load every stored entity of a type into the local tier.
    ///
    /// Individual failures are logged and skipped. Returns how many entities
    /// are resident afterwards.
    #[instrument(skip(self), fields(entity_type = %entity_type))]
    pub async fn preload(&self, entity_type: &EntityType) -> Result<usize> {
        self.inner.registry.get(entity_type)?;
        let ids = self.inner.hierarchy.remote_keys(entity_type).await?;

        let loaded = stream::iter(ids)
            .map(|id| async move {
                match self.load(entity_type, id, LoadStrategy::Pipeline, false).await {
                    Ok(found) => found.is_some(),
                    Err(e) => {
                        warn!(entity_id = %id, error = %e, "Preload of entity failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.inner.settings.sweep_concurrency)
            .filter(|loaded| future::ready(*loaded))
            .count()
            .await;

        info!(loaded, "Preloaded entities");
        Ok(loaded)
    }

    /// Preload every type registered with `preload`.
    pub async fn preload_all(&self) -> Result<usize> {
        let types: Vec<EntityType> = self
            .inner
            .registry
            .iter()
            .filter(|r| r.config.preload)
            .map(|r| r.entity_type.clone())
            .collect();

        let mut total = 0;
        for entity_type in types {
            total += self.preload(&entity_type).await?;
        }
        Ok(total)
    }

    /// Write every resident entity of `auto_save` types to the remote tiers.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();

        for registration in self.inner.registry.iter() {
            if !registration.config.auto_save {
                continue;
            }
            for entity in self.inner.local.entities(&registration.entity_type) {
                if entity.is_marked_for_removal() {
                    continue;
                }
                let hierarchy = &self.inner.hierarchy;
                let (distributed, backing) = tokio::join!(
                    hierarchy.sync_to(&entity, Tier::Distributed),
                    async {
                        if registration.config.replicate_to_backing {
                            hierarchy.sync_to(&entity, Tier::Backing).await
                        } else {
                            Ok(())
                        }
                    }
                );
                match distributed.and(backing) {
                    Ok(()) => report.flushed += 1,
                    Err(e) => {
                        warn!(entity_type = %registration.entity_type, entity_id = %entity.id(), error = %e, "Flush failed");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the periodic sweeper (once).
    pub fn start_sweeper(&self) {
        let mut task = self.inner.sweeper_task.lock();
        if task.is_none() && !self.inner.sweeper.is_shut_down() {
            *task = Some(tokio::spawn(self.inner.sweeper.clone().run()));
        }
    }

    /// Drain in-flight loads (bounded per load), flush `auto_save` types and
    /// stop the sweeper.
    #[instrument(skip(self), fields(sender_id = %self.inner.sender_id))]
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down pipeline");

        let loads = self.inner.scheduler.shutdown().await;
        let flush = self.flush().await;

        self.inner.sweeper.shutdown();
        let task = self.inner.sweeper_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        let report = ShutdownReport { loads, flush };
        info!(
            loads_completed = report.loads.completed,
            loads_timed_out = report.loads.timed_out,
            flushed = report.flush.flushed,
            flush_failures = report.flush.failed,
            "Pipeline shut down"
        );
        report
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("sender_id", &self.inner.sender_id)
            .field("types", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, SortSpec};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn player() -> EntityType {
        EntityType::new("player")
    }

    #[derive(Default)]
    struct CountingHooks {
        created: AtomicUsize,
        loaded: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl EntityHooks for CountingHooks {
        fn on_create(&self, _entity: &Entity) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn on_load(&self, _entity: &Entity) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delete(&self, _entity: &Entity) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        backing: Arc<InMemoryBackingStore>,
        distributed: Arc<InMemoryDistributedCache>,
        hooks: Arc<CountingHooks>,
    }

    async fn fixture(config: TypeConfig) -> Fixture {
        let backing = Arc::new(InMemoryBackingStore::new());
        let distributed = Arc::new(InMemoryDistributedCache::new());
        let hooks = Arc::new(CountingHooks::default());
        let pipeline = Pipeline::builder()
            .backing_store(backing.clone())
            .distributed_cache(distributed.clone())
            .register(
                TypeRegistration::new(player(), config)
                    .with_hooks(hooks.clone())
                    .with_factory(|_, _| {
                        json!({"level": 1}).as_object().cloned().unwrap_or_default()
                    }),
            )
            .build()
            .await
            .unwrap();
        Fixture {
            pipeline,
            backing,
            distributed,
            hooks,
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_unregistered_type_is_rejected() {
        let f = fixture(TypeConfig::default()).await;
        let err = f
            .pipeline
            .load(&"ghost".into(), EntityId::random(), LoadStrategy::Pipeline, false)
            .await
            .unwrap_err();
        assert_matches!(err, Error::UnregisteredType(_));
    }

    #[tokio::test]
    async fn test_load_from_backing_store() {
        let f = fixture(TypeConfig::default()).await;
        let id = EntityId::random();
        f.backing.put(&player(), id, doc(json!({"level": 4}))).await.unwrap();

        let entity = f
            .pipeline
            .load(&player(), id, LoadStrategy::Pipeline, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.get("level"), Some(json!(4)));
        assert_eq!(f.hooks.loaded.load(Ordering::SeqCst), 1);

        // Same live instance on the next load
        let again = f
            .pipeline
            .load(&player(), id, LoadStrategy::LocalOnly, false)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&entity, &again));
    }

    #[tokio::test]
    async fn test_local_only_never_touches_remote_tiers() {
        let f = fixture(TypeConfig::default()).await;
        let id = EntityId::random();
        f.backing.put(&player(), id, doc(json!({}))).await.unwrap();

        let found = f
            .pipeline
            .load(&player(), id, LoadStrategy::LocalOnly, false)
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(f.backing.stats().reads, 0);
        assert_eq!(f.distributed.stats().reads, 0);
    }

    #[tokio::test]
    async fn test_local_else_load_fills_in_background() {
        let f = fixture(TypeConfig::default()).await;
        let id = EntityId::random();
        f.backing.put(&player(), id, doc(json!({"level": 2}))).await.unwrap();

        let first = f
            .pipeline
            .load(&player(), id, LoadStrategy::LocalElseLoad, false)
            .await
            .unwrap();
        assert!(first.is_none());

        for _ in 0..100 {
            if f.pipeline.local().contains(&player(), id) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.pipeline.local().contains(&player(), id));
    }

    #[tokio::test]
    async fn test_create_if_missing_uses_factory_once() {
        let f = fixture(TypeConfig::default()).await;
        let id = EntityId::random();

        let entity = f.pipeline.get_or_create(&player(), id).await.unwrap();
        assert_eq!(entity.get("level"), Some(json!(1)));
        let again = f.pipeline.get_or_create(&player(), id).await.unwrap();
        assert!(Arc::ptr_eq(&entity, &again));
        assert_eq!(f.hooks.created.load(Ordering::SeqCst), 1);

        // Nothing written until saved
        assert!(f.backing.peek(&player(), id).is_none());
    }

    #[tokio::test]
    async fn test_save_writes_both_tiers() {
        let f = fixture(TypeConfig::default()).await;
        let entity = f.pipeline.create(&player()).unwrap();
        entity.set("level", 9);

        let outcome = f.pipeline.save_and_wait(&entity).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Synchronized);
        assert_eq!(f.backing.peek(&player(), entity.id()), Some(entity.document()));
        assert_eq!(f.distributed.peek(&player(), entity.id()), Some(entity.document()));
    }

    #[tokio::test]
    async fn test_save_respects_replicate_to_backing() {
        let f = fixture(TypeConfig {
            replicate_to_backing: false,
            ..TypeConfig::default()
        })
        .await;
        let entity = f.pipeline.create(&player()).unwrap();

        f.pipeline.save_and_wait(&entity).await.unwrap();
        assert!(f.backing.peek(&player(), entity.id()).is_none());
        assert!(f.distributed.peek(&player(), entity.id()).is_some());
    }

    #[tokio::test]
    async fn test_flush_respects_replicate_to_backing() {
        let f = fixture(TypeConfig {
            replicate_to_backing: false,
            ..TypeConfig::default()
        })
        .await;
        let entity = f.pipeline.create(&player()).unwrap();
        entity.set("level", 4);

        let report = f.pipeline.flush().await;
        assert_eq!(report.flushed, 1);
        assert!(f.backing.peek(&player(), entity.id()).is_none());
        assert_eq!(f.distributed.peek(&player(), entity.id()), Some(entity.document()));
    }

    #[tokio::test]
    async fn test_save_of_marked_entity_is_rejected() {
        let f = fixture(TypeConfig::default()).await;
        let entity = f.pipeline.create(&player()).unwrap();
        entity.mark_for_removal();

        let handle = f.pipeline.save(&entity).await.unwrap();
        assert_eq!(handle.await.unwrap(), SaveOutcome::Rejected);
        assert!(f.distributed.peek(&player(), entity.id()).is_none());
        assert_eq!(f.pipeline.metrics().saves_rejected, 1);
    }

    #[tokio::test]
    async fn test_save_failure_surfaces_on_handle() {
        let f = fixture(TypeConfig::default()).await;
        let entity = f.pipeline.create(&player()).unwrap();
        f.backing.set_fail_writes(true);

        let err = f.pipeline.save_and_wait(&entity).await.unwrap_err();
        assert!(err.is_backend());
        // The other tier was still written
        assert!(f.distributed.peek(&player(), entity.id()).is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let f = fixture(TypeConfig::default()).await;
        let entity = f.pipeline.create(&player()).unwrap();
        f.pipeline.save_and_wait(&entity).await.unwrap();

        assert!(f.pipeline.delete(&player(), entity.id(), true).await.unwrap());
        assert!(entity.is_marked_for_removal());
        assert!(!f.pipeline.exists(&player(), entity.id()).await.unwrap());
        assert_eq!(f.hooks.deleted.load(Ordering::SeqCst), 1);

        assert!(!f.pipeline.delete(&player(), entity.id(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_overlays_resident_documents() {
        let f = fixture(TypeConfig::default()).await;
        for level in [3, 7, 5] {
            let entity = f.pipeline.create(&player()).unwrap();
            entity.set("level", level);
            f.pipeline.save_and_wait(&entity).await.unwrap();
        }
        // Resident change not yet saved
        let unsaved = f.pipeline.create(&player()).unwrap();
        unsaved.set("level", 10);

        let options = FindOptions::new()
            .condition(Condition::field("level").gte(5))
            .sort(SortSpec::descending("level"));
        let found = f.pipeline.find(&player(), &options).await.unwrap();
        let levels: Vec<_> = found.iter().map(|(_, d)| d["level"].clone()).collect();
        assert_eq!(levels, vec![json!(10), json!(7), json!(5)]);

        let filtered = f
            .pipeline
            .find_by_filter(&player(), &Filter::field("level", 3))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn test_preload_and_flush() {
        let f = fixture(TypeConfig {
            preload: true,
            ..TypeConfig::default()
        })
        .await;
        for _ in 0..3 {
            f.backing
                .put(&player(), EntityId::random(), doc(json!({"level": 1})))
                .await
                .unwrap();
        }

        assert_eq!(f.pipeline.preload_all().await.unwrap(), 3);
        assert_eq!(f.pipeline.local().len(&player()), 3);

        for entity in f.pipeline.local().entities(&player()) {
            entity.set("level", 2);
        }
        let report = f.pipeline.shutdown().await;
        assert_eq!(report.flush.flushed, 3);
        for (_, document) in f.backing.scan(&player()).await.unwrap() {
            assert_eq!(document["level"], 2);
        }
    }

    #[tokio::test]
    async fn test_failed_load_is_shared_and_not_cached() {
        let f = fixture(TypeConfig::default()).await;
        let id = EntityId::random();
        f.backing.set_fail_reads(true);

        let err = f
            .pipeline
            .load(&player(), id, LoadStrategy::Pipeline, true)
            .await
            .unwrap_err();
        assert_matches!(err, Error::LoadFailed { .. });
        assert!(!f.pipeline.local().contains(&player(), id));
        assert_eq!(f.pipeline.scheduler().pending_count(), 0);

        f.backing.set_fail_reads(false);
        assert!(f
            .pipeline
            .load(&player(), id, LoadStrategy::Pipeline, false)
            .await
            .unwrap()
            .is_none());
    }
}
