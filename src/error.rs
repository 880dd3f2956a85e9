//! Error types for the tiered state runtime

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{EntityId, EntityType, Tier};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered state runtime
///
/// An entity that is absent from every tier is not an error: lookups report
/// it as `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Entity type used before registration
    #[error("Entity type is not registered: {0}")]
    UnregisteredType(EntityType),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// A storage tier failed its I/O
    #[error("{tier} backend failure: {reason}")]
    Backend { tier: Tier, reason: String },

    // =========================================================================
    // Load Errors
    // =========================================================================
    /// A scheduled load failed; every joiner of the load observes the same source
    #[error("Load of {entity_type}/{entity_id} failed: {source}")]
    LoadFailed {
        entity_type: EntityType,
        entity_id: EntityId,
        #[source]
        source: Arc<Error>,
    },

    /// A scheduled load was cancelled through its pending handle
    #[error("Load of {entity_type}/{entity_id} was cancelled")]
    LoadCancelled {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    /// The owner of a scheduled load went away without completing it
    #[error("Load of {entity_type}/{entity_id} was abandoned by its owner")]
    LoadAbandoned {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    // =========================================================================
    // Query Errors
    // =========================================================================
    /// A condition or sort met an incomparable or malformed value
    #[error("Query evaluation failed: {0}")]
    QueryEvaluation(String),

    // =========================================================================
    // Replication Errors
    // =========================================================================
    /// Publishing or receiving a replication message failed
    #[error("Replication error: {0}")]
    Replication(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a backend fault for the given tier
    pub fn backend(tier: Tier, reason: impl Into<String>) -> Self {
        Error::Backend {
            tier,
            reason: reason.into(),
        }
    }

    /// Check whether this error is (or wraps) a backend fault
    pub fn is_backend(&self) -> bool {
        match self {
            Error::Backend { .. } => true,
            Error::LoadFailed { source, .. } => source.is_backend(),
            _ => false,
        }
    }
}
