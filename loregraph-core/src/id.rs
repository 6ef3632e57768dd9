//! Type-safe identifiers and the tenant/world scope.
//!
//! Uses the newtype pattern so entity, world and cross-reference ids can't be
//! mixed up, and stores every id as its canonical UUID text in SQLite.

use crate::error::IntegrityError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to define a newtype ID wrapper around UUID
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random ID
            #[inline]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an ID from an existing UUID
            #[inline]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[inline]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Create a nil (all zeros) ID - useful for testing
            #[inline]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Check if this is a nil ID
            #[inline]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Uuid::parse_str(text)
                    .map(Self)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

define_id!(
    /// Canonical identifier of a deduplicated entity
    EntityId
);

define_id!(
    /// Unique identifier for a world
    WorldId
);

define_id!(
    /// Unique identifier for a deferred cross-reference
    CrossRefId
);

define_id!(
    /// Unique identifier for a resolved relationship
    RelationshipId
);

define_id!(
    /// Unique identifier for a manual-review queue item
    ReviewId
);

/// Opaque tenant identifier supplied by the caller.
///
/// Always trimmed and never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parse a tenant id, rejecting blank input.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IntegrityError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(IntegrityError::MissingTenant);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = IntegrityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl ToSql for TenantId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for TenantId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Self::new(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// The (tenant, world) pair every read and write is scoped by.
///
/// A `Scope` only proves the pair is well-formed; whether the world belongs
/// to the tenant is checked by [`crate::Engine::scope`] and on every ingest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    tenant: TenantId,
    world: WorldId,
}

impl Scope {
    /// Build a scope, rejecting a blank tenant or a nil world.
    pub fn new(tenant: impl AsRef<str>, world: WorldId) -> Result<Self, IntegrityError> {
        let tenant = TenantId::new(tenant)?;
        if world.is_nil() {
            return Err(IntegrityError::MissingWorld);
        }
        Ok(Self { tenant, world })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn world(&self) -> WorldId {
        self.world
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.world)
    }
}
