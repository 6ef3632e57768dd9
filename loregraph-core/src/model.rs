//! Persisted records: worlds, entities and relationships.

use crate::id::{CrossRefId, EntityId, RelationshipId, TenantId, WorldId};
use crate::registry::normalize_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tenant-scoped container of one narrative project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub tenant_id: TenantId,
    pub name: String,
    pub genre: Option<String>,
    /// Overall power scale of the setting (1-10).
    pub power_level: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a world.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewWorld {
    pub name: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub power_level: Option<i64>,
}

impl NewWorld {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_power_level(mut self, power_level: i64) -> Self {
        self.power_level = Some(power_level);
        self
    }
}

/// A canonical entity: common envelope plus type-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub world_id: WorldId,
    pub entity_type: String,
    /// Display name of the first registration.
    pub name: String,
    pub description: Option<String>,
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Extraction time of the newest batch that wrote this entity.
    pub source_at: DateTime<Utc>,
    /// Starts at 1, bumped on every attribute change.
    pub version: i64,
}

impl Entity {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    /// Deserialize the attributes into a typed schema struct.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
    }
}

/// A resolved, typed link between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub tenant_id: TenantId,
    pub world_id: WorldId,
    pub kind: String,
    pub source_id: EntityId,
    pub target_id: EntityId,
    /// Cross-reference this relationship was resolved from.
    pub cross_reference_id: CrossRefId,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    /// Check if this relationship involves an entity.
    pub fn involves(&self, entity_id: EntityId) -> bool {
        self.source_id == entity_id || self.target_id == entity_id
    }
}

/// Filter for entity queries within one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    name: Option<String>,
    attributes: Vec<(String, Value)>,
    limit: Option<usize>,
}

impl EntityFilter {
    /// Match every entity of the type.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match the canonical name after normalization.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(normalize_name(name));
        self
    }

    /// Require an attribute to equal a value; list attributes match if
    /// they contain it.
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.push((name.into(), value));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Check an entity against the filter.
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(name) = &self.name {
            if normalize_name(&entity.name) != *name {
                return false;
            }
        }
        self.attributes.iter().all(|(field, expected)| {
            match entity.attribute(field) {
                Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
                Some(actual) => actual == expected,
                None => expected.is_null(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(attributes: Value) -> Entity {
        let now = Utc::now();
        Entity {
            id: EntityId::new(),
            tenant_id: TenantId::new("acme").unwrap(),
            world_id: WorldId::new(),
            entity_type: "character".to_string(),
            name: "Kira Vale".to_string(),
            description: None,
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            created_at: now,
            updated_at: now,
            source_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_filter_by_normalized_name() {
        let e = entity(json!({}));
        assert!(EntityFilter::all().named("  kira   VALE ").matches(&e));
        assert!(!EntityFilter::all().named("Kira").matches(&e));
    }

    #[test]
    fn test_filter_by_attribute() {
        let e = entity(json!({ "status": "active", "personality_traits": ["brave", "curious"] }));
        assert!(EntityFilter::all()
            .with_attribute("status", json!("active"))
            .matches(&e));
        assert!(EntityFilter::all()
            .with_attribute("personality_traits", json!("brave"))
            .matches(&e));
        assert!(!EntityFilter::all()
            .with_attribute("status", json!("deceased"))
            .matches(&e));
    }

    #[test]
    fn test_decode_typed() {
        let e = entity(json!({ "power_level": 7, "personality_traits": ["brave"] }));
        let character: crate::catalog::Character = e.decode().unwrap();
        assert_eq!(character.power_level, Some(7));
        assert_eq!(character.personality_traits, vec!["brave".to_string()]);
    }
}
