//! Replication Messages
//!
//! Immutable records published on a type's replication topic. Every message
//! carries the id of the process that sent it so the sender can ignore its
//! own echo.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ports::{Document, EntityId};
use crate::error::Result;

/// Message exchanged between cooperating processes for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReplicationMessage {
    /// The entity's full document changed.
    Update {
        sender_id: Uuid,
        entity_id: EntityId,
        document: Document,
    },

    /// The entity was deleted; peers drop their local copy.
    Removal { sender_id: Uuid, entity_id: EntityId },
}

impl ReplicationMessage {
    /// Get the id of the sending process.
    pub fn sender_id(&self) -> Uuid {
        match self {
            ReplicationMessage::Update { sender_id, .. } => *sender_id,
            ReplicationMessage::Removal { sender_id, .. } => *sender_id,
        }
    }

    /// Get the id of the entity the message is about.
    pub fn entity_id(&self) -> EntityId {
        match self {
            ReplicationMessage::Update { entity_id, .. } => *entity_id,
            ReplicationMessage::Removal { entity_id, .. } => *entity_id,
        }
    }

    /// Get the message kind as a string.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Update { .. } => "update",
            ReplicationMessage::Removal { .. } => "removal",
        }
    }

    /// Encode for the transport.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a transport payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
