//! Eviction Sweeper
//!
//! Periodically evicts idle entities from the local tier after writing them
//! through to the remote tiers. Only types with a ttl are swept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::hierarchy::CacheHierarchy;
use super::metrics::TierMetrics;
use super::registry::{TypeRegistration, TypeRegistry};
use crate::domain::ports::{EntityId, Tier};

/// Default pause between sweeps (60s)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of entities written through concurrently per type
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 16;

/// Totals of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Resident entities looked at
    pub examined: usize,
    pub evicted: usize,
    /// Write-through failed; the entity stays resident
    pub failed: usize,
    /// Still fresh, or replaced/removed while being swept
    pub skipped: usize,
}

enum EntitySweep {
    Evicted,
    Failed,
    Skipped,
}

pub struct EvictionSweeper {
    hierarchy: Arc<CacheHierarchy>,
    registry: Arc<TypeRegistry>,
    metrics: Arc<TierMetrics>,
    interval: Duration,
    concurrency: usize,
    shutdown: CancellationToken,
}

impl EvictionSweeper {
    pub fn new(
        hierarchy: Arc<CacheHierarchy>,
        registry: Arc<TypeRegistry>,
        metrics: Arc<TierMetrics>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            hierarchy,
            registry,
            metrics,
            interval,
            concurrency: concurrency.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep every type once.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep every type once, measuring idle time against `now`.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for registration in self.registry.iter() {
            let Some(ttl) = registration.config.ttl else {
                continue;
            };

            // Snapshot: entities inserted during the pass wait for the next one
            let ids = self.hierarchy.local().ids(&registration.entity_type);
            report.examined += ids.len();

            let results: Vec<EntitySweep> = stream::iter(ids)
                .map(|id| self.sweep_entity(registration, id, ttl, now))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for result in results {
                match result {
                    EntitySweep::Evicted => report.evicted += 1,
                    EntitySweep::Failed => report.failed += 1,
                    EntitySweep::Skipped => report.skipped += 1,
                }
            }
        }

        if report.evicted > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                evicted = report.evicted,
                failed = report.failed,
                "Sweep completed"
            );
        } else {
            debug!(examined = report.examined, "Sweep completed");
        }
        report
    }

    async fn sweep_entity(
        &self,
        registration: &TypeRegistration,
        id: EntityId,
        ttl: Duration,
        now: Instant,
    ) -> EntitySweep {
        let entity_type = &registration.entity_type;
        let Some(entity) = self.hierarchy.local().get(entity_type, id) else {
            return EntitySweep::Skipped;
        };
        if now.saturating_duration_since(entity.last_use()) < ttl {
            return EntitySweep::Skipped;
        }

        registration.hooks.on_cleanup(&entity);

        let mut failed = false;
        if registration.config.sweep_to_distributed {
            if let Err(e) = self.hierarchy.sync_to(&entity, Tier::Distributed).await {
                warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Eviction write to distributed cache failed");
                failed = true;
            }
        }
        if let Err(e) = self.hierarchy.sync_to(&entity, Tier::Backing).await {
            warn!(entity_type = %entity_type, entity_id = %id, error = %e, "Eviction write to backing store failed");
            failed = true;
        }

        if failed {
            self.metrics.record_eviction_failure();
            return EntitySweep::Failed;
        }

        if self.hierarchy.local().remove_if_same(&entity) {
            self.metrics.record_eviction();
            EntitySweep::Evicted
        } else {
            EntitySweep::Skipped
        }
    }

    /// Sweep on a fixed interval until [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, "Starting eviction sweeper");

        let start = tokio::time::Instant::now() + self.interval;
        let mut tick = interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Eviction sweeper shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
