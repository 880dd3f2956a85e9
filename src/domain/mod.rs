//! Domain Layer
//!
//! Value objects, replication messages and the collaborator ports the
//! engine is written against.
//!
//! - **Ports** (`ports.rs`) - identities, documents and the storage/transport traits
//! - **Events** (`events.rs`) - messages exchanged on replication topics

pub mod events;
pub mod ports;

pub use events::ReplicationMessage;
pub use ports::{
    field_value, BackingStore, DistributedCache, Document, EntityId, EntityType, PayloadHandler,
    ReplicationTransport, Tier,
};
