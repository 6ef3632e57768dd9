//! Error types for loregraph.
//!
//! One enum per concern, folded into [`EngineError`] at the API surface.
//! Ingestion itself never returns these: per-entity failures become
//! [`crate::report::Rejection`] entries instead.

use crate::id::{EntityId, WorldId};

/// Errors raised while building or querying the schema catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The entity type has no catalog entry.
    #[error("Unknown entity type: {0}")]
    UnknownType(String),

    /// A type, attribute or table name is not a safe SQL identifier.
    #[error("Invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// The same type was declared twice.
    #[error("Duplicate entity type: {0}")]
    DuplicateType(String),

    /// Two types claim the same table, or a table name is reserved.
    #[error("Table {table:?} for type {entity_type} is already in use")]
    TableConflict { entity_type: String, table: String },

    /// A constraint can never be satisfied or does not fit the attribute.
    #[error("Invalid constraint on {entity_type}.{attribute}: {reason}")]
    InvalidConstraint {
        entity_type: String,
        attribute: String,
        reason: String,
    },

    /// A relationship kind refers to an unregistered type.
    #[error("Relationship kind {kind} refers to unknown type {entity_type}")]
    UnknownRelationshipType { kind: String, entity_type: String },

    /// IO error while loading a catalog file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed catalog JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Missing or inconsistent tenant/world information.
///
/// These are never silently defaulted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("tenant id is missing or blank")]
    MissingTenant,

    #[error("world id is missing or nil")]
    MissingWorld,

    /// The world does not exist or belongs to another tenant.
    #[error("world {world} not found for tenant {tenant}")]
    UnknownWorld { tenant: String, world: WorldId },

    /// An entity carries a tenant/world field that disagrees with the scope.
    #[error("{field} mismatch: expected {expected}, found {found}")]
    ScopeMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    /// A relationship endpoint is absent or has the wrong type.
    #[error("relationship {kind}: endpoint {entity} is not a {expected_type} in this world")]
    RelationshipEndpoint {
        kind: String,
        entity: EntityId,
        expected_type: String,
    },
}

/// Errors from the SQLite persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("World {name:?} already exists for tenant {tenant}")]
    DuplicateWorld { tenant: String, name: String },

    /// A version-guarded write kept losing to concurrent writers.
    #[error("Stale write to entity {id}: version {expected} superseded after {attempts} attempts")]
    StaleWrite {
        id: EntityId,
        expected: i64,
        attempts: u32,
    },

    /// A row could not be decoded back into its model type.
    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Errors parsing an extraction batch document.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is valid JSON but not a batch.
    #[error("Invalid batch: {0}")]
    Invalid(String),
}

/// Errors loading or validating engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Main error type for engine operations outside the ingest boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A review-queue item does not exist or is already closed.
    #[error("Review item not found or already resolved: {0}")]
    ReviewNotOpen(crate::id::ReviewId),

    /// A reviewer-supplied value failed validation.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl EngineError {
    /// Whether this error is an integrity violation, wherever it surfaced.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            EngineError::Integrity(_) | EngineError::Store(StoreError::Integrity(_))
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
