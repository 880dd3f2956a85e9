//! Load Scheduler - single-flight loads per (type, id)
//!
//! The first caller to schedule a key becomes the owner and receives a
//! [`LoadCompleter`]; every concurrent caller joins the same
//! [`PendingLoad`] and observes the owner's result, success or failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::entity::Entity;
use crate::domain::ports::{EntityId, EntityType};
use crate::error::{Error, Result};

/// Default bounded wait per outstanding load on shutdown (1s)
pub const DEFAULT_SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(1);

/// Result a load owner publishes to every joiner
pub type LoadOutcome = std::result::Result<Option<Arc<Entity>>, Arc<Error>>;

type LoadKey = (EntityType, EntityId);
type SharedLoad = Shared<BoxFuture<'static, std::result::Result<LoadOutcome, oneshot::error::RecvError>>>;
type PendingMap = Arc<Mutex<HashMap<LoadKey, PendingLoad>>>;

/// Handle to an in-flight load. Clones share the same result.
#[derive(Clone)]
pub struct PendingLoad {
    entity_type: EntityType,
    entity_id: EntityId,
    task_id: u64,
    created_at: DateTime<Utc>,
    result: SharedLoad,
    cancel: CancellationToken,
}

impl PendingLoad {
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Scheduler-unique id; two handles with the same id are the same load.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ask the owner to stop; joiners then observe `LoadCancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the load to settle.
    pub async fn wait(&self) -> Result<Option<Arc<Entity>>> {
        match self.result.clone().await {
            Ok(Ok(entity)) => Ok(entity),
            Ok(Err(source)) => match source.as_ref() {
                Error::LoadCancelled { .. } => Err(Error::LoadCancelled {
                    entity_type: self.entity_type.clone(),
                    entity_id: self.entity_id,
                }),
                _ => Err(Error::LoadFailed {
                    entity_type: self.entity_type.clone(),
                    entity_id: self.entity_id,
                    source,
                }),
            },
            Err(_) => Err(Error::LoadAbandoned {
                entity_type: self.entity_type.clone(),
                entity_id: self.entity_id,
            }),
        }
    }
}

impl std::fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("entity_type", &self.entity_type)
            .field("entity_id", &self.entity_id)
            .field("task_id", &self.task_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Owner side of a load.
///
/// Completing deregisters the load before waking joiners. Dropping it
/// without completing also deregisters, and joiners observe `LoadAbandoned`.
pub struct LoadCompleter {
    pending: PendingMap,
    key: LoadKey,
    task_id: u64,
    sender: Option<oneshot::Sender<LoadOutcome>>,
}

impl LoadCompleter {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn complete(mut self, outcome: LoadOutcome) {
        deregister(&self.pending, &self.key, self.task_id);
        if let Some(sender) = self.sender.take() {
            // Nobody waiting is fine
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for LoadCompleter {
    fn drop(&mut self) {
        if self.sender.is_some() {
            deregister(&self.pending, &self.key, self.task_id);
        }
    }
}

fn deregister(pending: &PendingMap, key: &LoadKey, task_id: u64) -> bool {
    let mut pending = pending.lock();
    match pending.get(key) {
        Some(load) if load.task_id == task_id => {
            pending.remove(key);
            true
        }
        _ => false,
    }
}

/// Result of [`LoadScheduler::schedule`]
pub enum Scheduled {
    /// The caller must run the load and complete it
    Owner(PendingLoad, LoadCompleter),
    /// A load was already in flight
    Joined(PendingLoad),
}

impl Scheduled {
    pub fn pending(&self) -> &PendingLoad {
        match self {
            Scheduled::Owner(load, _) => load,
            Scheduled::Joined(load) => load,
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Scheduled::Owner(..))
    }
}

/// Outcome of draining the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerShutdownReport {
    pub completed: usize,
    pub timed_out: usize,
}

pub struct LoadScheduler {
    pending: PendingMap,
    next_task_id: AtomicU64,
    task_timeout: Duration,
}

impl Default for LoadScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TASK_TIMEOUT)
    }
}

impl LoadScheduler {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(1),
            task_timeout,
        }
    }

    /// Join the in-flight load for a key, or register a new one.
    pub fn schedule(&self, entity_type: &EntityType, id: EntityId) -> Scheduled {
        let key = (entity_type.clone(), id);
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(&key) {
            return Scheduled::Joined(existing.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let load = PendingLoad {
            entity_type: entity_type.clone(),
            entity_id: id,
            task_id,
            created_at: Utc::now(),
            result: receiver.boxed().shared(),
            cancel: CancellationToken::new(),
        };
        pending.insert(key.clone(), load.clone());
        debug!(entity_type = %entity_type, entity_id = %id, task_id, "Scheduled load");

        Scheduled::Owner(
            load,
            LoadCompleter {
                pending: self.pending.clone(),
                key,
                task_id,
                sender: Some(sender),
            },
        )
    }

    pub fn lookup(&self, entity_type: &EntityType, id: EntityId) -> Option<PendingLoad> {
        self.pending.lock().get(&(entity_type.clone(), id)).cloned()
    }

    /// Deregister a load if `task_id` is still the registered one.
    pub fn complete(&self, entity_type: &EntityType, id: EntityId, task_id: u64) -> bool {
        deregister(&self.pending, &(entity_type.clone(), id), task_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for every outstanding load, each for at most the task timeout.
    ///
    /// Loads that overrun are abandoned: reported, neither cancelled nor
    /// retried. Their waiters still get the result if it arrives later.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> SchedulerShutdownReport {
        let loads: Vec<PendingLoad> = self.pending.lock().values().cloned().collect();
        let mut report = SchedulerShutdownReport::default();

        for load in loads {
            match tokio::time::timeout(self.task_timeout, load.result.clone()).await {
                Ok(_) => report.completed += 1,
                Err(_) => {
                    warn!(
                        entity_type = %load.entity_type,
                        entity_id = %load.entity_id,
                        task_id = load.task_id,
                        timeout = ?self.task_timeout,
                        "Load did not finish before shutdown, abandoning it"
                    );
                    report.timed_out += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn player() -> EntityType {
        EntityType::new("player")
    }

    fn owner(scheduled: Scheduled) -> (PendingLoad, LoadCompleter) {
        match scheduled {
            Scheduled::Owner(load, completer) => (load, completer),
            Scheduled::Joined(_) => panic!("expected to own the load"),
        }
    }

    #[tokio::test]
    async fn test_second_schedule_joins() {
        let scheduler = LoadScheduler::default();
        let id = EntityId::random();

        let (load, completer) = owner(scheduler.schedule(&player(), id));
        let joined = scheduler.schedule(&player(), id);
        assert!(!joined.is_owner());
        assert_eq!(joined.pending().task_id(), load.task_id());
        assert_eq!(scheduler.lookup(&player(), id).unwrap().task_id(), load.task_id());

        let entity = Arc::new(Entity::new(player(), id));
        completer.complete(Ok(Some(entity.clone())));

        let a = load.wait().await.unwrap().unwrap();
        let b = joined.pending().wait().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &entity));
        assert!(Arc::ptr_eq(&b, &entity));
    }

    #[tokio::test]
    async fn test_complete_deregisters_before_waking() {
        let scheduler = LoadScheduler::default();
        let id = EntityId::random();

        let (load, completer) = owner(scheduler.schedule(&player(), id));
        completer.complete(Ok(None));
        assert_eq!(scheduler.pending_count(), 0);
        assert!(load.wait().await.unwrap().is_none());

        // A late caller starts a fresh load
        let (fresh, _completer) = owner(scheduler.schedule(&player(), id));
        assert_ne!(fresh.task_id(), load.task_id());
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let scheduler = LoadScheduler::default();
        let id = EntityId::random();

        let (load, completer) = owner(scheduler.schedule(&player(), id));
        let joined = scheduler.schedule(&player(), id);
        completer.complete(Err(Arc::new(Error::backend(
            crate::domain::Tier::Backing,
            "boom",
        ))));

        assert_matches!(load.wait().await, Err(Error::LoadFailed { .. }));
        let err = joined.pending().wait().await.unwrap_err();
        assert_matches!(&err, Error::LoadFailed { source, .. } if source.is_backend());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_owner_abandons() {
        let scheduler = LoadScheduler::default();
        let id = EntityId::random();

        let (load, completer) = owner(scheduler.schedule(&player(), id));
        drop(completer);
        assert_eq!(scheduler.pending_count(), 0);
        assert_matches!(load.wait().await, Err(Error::LoadAbandoned { .. }));
    }

    #[tokio::test]
    async fn test_stale_completer_does_not_deregister_newer_load() {
        let scheduler = LoadScheduler::default();
        let id = EntityId::random();

        let (first, _first_completer) = owner(scheduler.schedule(&player(), id));
        assert!(scheduler.complete(&player(), id, first.task_id()));
        let (second, _second_completer) = owner(scheduler.schedule(&player(), id));

        assert!(!scheduler.complete(&player(), id, first.task_id()));
        assert_eq!(scheduler.lookup(&player(), id).unwrap().task_id(), second.task_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_stuck_loads() {
        let scheduler = LoadScheduler::new(Duration::from_millis(50));
        let stuck_id = EntityId::random();
        let done_id = EntityId::random();

        let (stuck, stuck_completer) = owner(scheduler.schedule(&player(), stuck_id));
        let (_, done_completer) = owner(scheduler.schedule(&player(), done_id));
        done_completer.complete(Ok(None));

        // Completed loads are already deregistered; only the stuck one remains
        let report = scheduler.shutdown().await;
        assert_eq!(report.completed, 0);
        assert_eq!(report.timed_out, 1);
        assert!(!stuck.is_cancelled());

        // A late answer still reaches the waiters
        let entity = Arc::new(Entity::new(player(), stuck_id));
        stuck_completer.complete(Ok(Some(entity.clone())));
        let found = stuck.wait().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &entity));
    }
}
