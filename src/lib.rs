//! tierstate - Tiered entity state for cooperating processes
//!
//! Keeps keyed, document-shaped entities consistent across three tiers:
//! a per-process local cache of live instances, a shared distributed cache
//! and a durable backing store. Processes exchange updates and removals on
//! a publish/subscribe transport so resident copies converge.
//!
//! # Architecture
//!
//! ```text
//!        process A                                  process B
//!   ┌──────────────────┐    replication topic    ┌──────────────────┐
//!   │  LocalCache      │◀──────────────────────▶│  LocalCache      │
//!   │  LoadScheduler   │                         │  LoadScheduler   │
//!   │  EvictionSweeper │                         │  EvictionSweeper │
//!   └────────┬─────────┘                         └────────┬─────────┘
//!            │                                            │
//!            ▼                                            ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │                    DistributedCache                          │
//!   ├─────────────────────────────────────────────────────────────┤
//!   │                      BackingStore                            │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory implementations of the collaborator ports
//! - [`config`] - YAML configuration and duration parsing
//! - [`domain`] - Identities, documents, ports and replication messages
//! - [`error`] - Error types
//! - [`pipeline`] - Caches, loads, replication, eviction and the [`Pipeline`] itself
//! - [`query`] - Conditions, filters and sorting over documents

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod pipeline;
pub mod query;

// Re-export commonly used types
pub use config::{PipelineConfig, ProcessSettings};
pub use domain::{BackingStore, DistributedCache, Document, EntityId, EntityType, ReplicationTransport, Tier};
pub use error::{Error, Result};
pub use pipeline::{
    Entity, EntityHooks, LoadStrategy, Pipeline, PipelineBuilder, SaveOutcome, TypeConfig,
    TypeRegistration,
};
pub use query::{Condition, Filter, FindOptions, SortOrder, SortSpec};
