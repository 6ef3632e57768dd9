//! Extraction batch documents.
//!
//! One skill run produces one batch:
//!
//! ```json
//! {
//!   "character": [{ "id": "c1", "name": "Kira", "role": "smuggler" }],
//!   "cross_references": [{
//!     "source_type": "character", "source_id": "c1",
//!     "target_type": "location", "target_skill": "geography",
//!     "target_hint": "Eldoria Village"
//!   }],
//!   "_metadata": { "source": "chapter-1", "skill": "characters",
//!                  "extracted_at": "2024-05-01T12:00:00Z", "entity_count": 1 }
//! }
//! ```
//!
//! Parsing is lenient per entry: a malformed entity or reference is kept as
//! a [`BatchEntry::Malformed`] so ingestion can report it, and the rest of
//! the batch still goes through.

use crate::error::BatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

const CROSS_REFERENCES_KEY: &str = "cross_references";
const METADATA_KEY: &str = "_metadata";

/// Envelope keys that are read but not kept as attributes.
const DROPPED_ENVELOPE_KEYS: &[&str] = &[
    "entity_type",
    "created_at",
    "updated_at",
    "source_at",
    "version",
    "extra",
];

/// The `_metadata` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
    /// Defaults to the parse time when absent.
    #[serde(default = "Utc::now")]
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub entity_count: Option<u64>,
}

impl Default for BatchMetadata {
    fn default() -> Self {
        Self {
            source: None,
            skill: None,
            extracted_at: Utc::now(),
            entity_count: None,
        }
    }
}

/// One entity as supplied by a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntity {
    /// Batch-local id used by this batch's cross-references.
    pub local_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Scope fields, when the skill echoed them.
    pub tenant_id: Option<String>,
    pub world_id: Option<String>,
    /// Type-specific attributes.
    pub attributes: Map<String, Value>,
}

impl BatchEntity {
    fn from_object(mut object: Map<String, Value>) -> Result<Self, String> {
        let local_id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(local_id_string(&value)?),
        };
        let name = optional_string(&mut object, "name")?;
        let description = optional_string(&mut object, "description")?;
        let tenant_id = optional_string(&mut object, "tenant_id")?;
        let world_id = optional_string(&mut object, "world_id")?;
        for key in DROPPED_ENVELOPE_KEYS {
            object.remove(*key);
        }
        Ok(Self {
            local_id,
            name,
            description,
            tenant_id,
            world_id,
            attributes: object,
        })
    }

    /// Name for reports, even when blank.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// An entity entry, or the reason it could not be read.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntry {
    Entity(BatchEntity),
    Malformed {
        /// Position in the group; `None` when the whole group is unusable.
        index: Option<usize>,
        reason: String,
    },
}

/// All entries of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroup {
    pub entity_type: String,
    pub entries: Vec<BatchEntry>,
}

/// A cross-reference as supplied by a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCrossRef {
    pub source_type: String,
    /// Batch-local id, canonical id or name of the source entity.
    #[serde(deserialize_with = "deserialize_local_id")]
    pub source_id: String,
    pub target_type: String,
    #[serde(default)]
    pub target_skill: Option<String>,
    pub target_hint: String,
}

/// A cross-reference entry, or the reason it could not be read.
#[derive(Debug, Clone, PartialEq)]
pub enum CrossRefEntry {
    Ref(BatchCrossRef),
    Malformed { index: usize, reason: String },
}

/// A parsed extraction batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionBatch {
    pub groups: Vec<EntityGroup>,
    pub cross_references: Vec<CrossRefEntry>,
    pub metadata: BatchMetadata,
}

impl ExtractionBatch {
    pub fn from_json_str(json: &str) -> Result<Self, BatchError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse a batch document.
    ///
    /// Fails only when the document as a whole isn't a batch.
    pub fn from_value(value: Value) -> Result<Self, BatchError> {
        let Value::Object(document) = value else {
            return Err(BatchError::Invalid("top level must be an object".to_string()));
        };

        let mut groups = Vec::new();
        let mut cross_references = Vec::new();
        let mut metadata = BatchMetadata::default();

        for (key, value) in document {
            if key == METADATA_KEY {
                metadata = serde_json::from_value(value)?;
            } else if key == CROSS_REFERENCES_KEY {
                let Value::Array(entries) = value else {
                    return Err(BatchError::Invalid(format!("{CROSS_REFERENCES_KEY} must be an array")));
                };
                cross_references = entries
                    .into_iter()
                    .enumerate()
                    .map(|(index, entry)| match serde_json::from_value(entry) {
                        Ok(reference) => CrossRefEntry::Ref(reference),
                        Err(e) => CrossRefEntry::Malformed {
                            index,
                            reason: e.to_string(),
                        },
                    })
                    .collect();
            } else if key.starts_with('_') {
                continue;
            } else {
                groups.push(parse_group(key, value));
            }
        }

        let batch = Self {
            groups,
            cross_references,
            metadata,
        };
        if let Some(declared) = batch.metadata.entity_count {
            let parsed = batch.entity_count() as u64;
            if declared != parsed {
                warn!(
                    declared,
                    parsed,
                    skill = batch.metadata.skill.as_deref().unwrap_or("-"),
                    "entity_count does not match batch contents"
                );
            }
        }
        Ok(batch)
    }

    /// Entries across all groups, malformed ones included.
    pub fn entity_count(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    pub fn skill(&self) -> Option<&str> {
        self.metadata.skill.as_deref()
    }

    /// Entity types named by the batch.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.entity_type.as_str())
    }
}

fn parse_group(entity_type: String, value: Value) -> EntityGroup {
    let entries = match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(object) => match BatchEntity::from_object(object) {
                    Ok(entity) => BatchEntry::Entity(entity),
                    Err(reason) => BatchEntry::Malformed {
                        index: Some(index),
                        reason,
                    },
                },
                other => BatchEntry::Malformed {
                    index: Some(index),
                    reason: format!("expected an object, found {}", kind_of(&other)),
                },
            })
            .collect(),
        other => vec![BatchEntry::Malformed {
            index: None,
            reason: format!("expected an array of entities, found {}", kind_of(&other)),
        }],
    };
    EntityGroup {
        entity_type,
        entries,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn local_id_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("id must be a string or number, found {}", kind_of(other))),
    }
}

fn optional_string(object: &mut Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match object.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(format!("{key} must be a string, found {}", kind_of(&other))),
    }
}

fn deserialize_local_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    local_id_string(&value).map_err(serde::de::Error::custom)
}
