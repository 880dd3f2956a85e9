//! Tiered entity pipeline
//!
//! - [`LocalCache`] - live entity instances of this process
//! - [`CacheHierarchy`] - fill-through reads across the three tiers
//! - [`LoadScheduler`] - one in-flight load per entity
//! - [`ReplicationChannel`] - peer updates and removals per type
//! - [`EvictionSweeper`] - write-back and eviction of idle entities
//! - [`Pipeline`] - the entry point tying them together

pub mod entity;
pub mod hierarchy;
pub mod local;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod sweeper;

pub use entity::{Entity, EntityHooks, NoopHooks};
pub use hierarchy::{CacheHierarchy, Fetched};
pub use local::LocalCache;
pub use manager::{
    FlushReport, LoadStrategy, Pipeline, PipelineBuilder, SaveHandle, SaveOutcome, ShutdownReport,
};
pub use metrics::{MetricsSnapshot, TierMetrics};
pub use registry::{EntityFactory, TypeConfig, TypeRegistration, TypeRegistry};
pub use replication::{
    PushOutcome, ReceiveOutcome, ReplicationBuffer, ReplicationChannel,
    DEFAULT_REPLICATION_BUFFER_TTL,
};
pub use scheduler::{
    LoadCompleter, LoadOutcome, LoadScheduler, PendingLoad, Scheduled, SchedulerShutdownReport,
    DEFAULT_SHUTDOWN_TASK_TIMEOUT,
};
pub use sweeper::{EvictionSweeper, SweepReport, DEFAULT_SWEEP_CONCURRENCY, DEFAULT_SWEEP_INTERVAL};
