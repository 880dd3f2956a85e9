//! Infrastructure Adapters
//!
//! Implementations of the domain ports. Only in-memory collaborators ship
//! with the crate; network and database backends implement the same traits
//! out of tree.

pub mod memory;

pub use memory::{
    FetchGate, InMemoryBackingStore, InMemoryDistributedCache, InMemoryTransport, StoreStats,
    DEFAULT_DISTRIBUTED_EXPIRY,
};
