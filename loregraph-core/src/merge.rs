//! Merge conflict handling for entities that already have a stored row.
//!
//! Each field is reconciled by its declared [`MergePolicy`]:
//!
//! | policy            | rule                                              |
//! |-------------------|---------------------------------------------------|
//! | `union`           | set union, existing order first                   |
//! | `max`             | numeric maximum                                   |
//! | `last_write_wins` | newer `extracted_at` wins; older loses silently   |
//! | none              | differing values go to manual review              |
//!
//! Last-write-wins on text also goes to review when the newer value would
//! throw away materially different content. In every review case the
//! stored value stays until a reviewer decides.

use crate::catalog::{MergePolicy, TypeSchema};
use crate::model::Entity;
use crate::registry::normalize_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Attribute that always merges by union, even when undeclared.
const ALIASES_FIELD: &str = "aliases";

/// Why a field was sent to review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The field has no merge policy and the values differ.
    UndeclaredPolicy,
    /// The newer text would discard unrelated older text.
    DivergentText,
    /// The values don't have the shape the policy needs.
    IncompatibleValues,
}

impl ConflictReason {
    pub fn describe(&self) -> &'static str {
        match self {
            ConflictReason::UndeclaredPolicy => "no merge policy and values differ",
            ConflictReason::DivergentText => "newer text is materially different",
            ConflictReason::IncompatibleValues => "values do not fit the merge policy",
        }
    }
}

/// A field the handler refused to reconcile on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub current: Value,
    pub proposed: Value,
    pub reason: ConflictReason,
}

/// Incoming values for an existing entity.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    pub description: Option<&'a str>,
    pub attributes: &'a Map<String, Value>,
    /// Extraction time of the batch the values come from.
    pub extracted_at: DateTime<Utc>,
}

/// Result of merging one incoming entity into its stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The entity to write; equals the stored one when nothing changed.
    pub entity: Entity,
    pub changed_fields: Vec<String>,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.changed_fields.is_empty()
    }
}

/// Applies merge policies.
#[derive(Debug, Clone, Copy)]
pub struct MergeHandler {
    text_conflict_similarity: f64,
}

impl MergeHandler {
    pub fn new(text_conflict_similarity: f64) -> Self {
        Self {
            text_conflict_similarity,
        }
    }

    /// Merge `incoming` into `existing`.
    ///
    /// A changed entity gets its version bumped and `source_at` moved to the
    /// newer of the two timestamps.
    pub fn merge(&self, schema: &TypeSchema, existing: &Entity, incoming: Incoming<'_>) -> MergeOutcome {
        let newer = incoming.extracted_at >= existing.source_at;
        let mut entity = existing.clone();
        let mut changed_fields = Vec::new();
        let mut conflicts = Vec::new();

        if let Some(description) = incoming.description.map(str::trim).filter(|d| !d.is_empty()) {
            let proposed = Value::String(description.to_string());
            match existing.description.as_deref() {
                None => {
                    entity.description = Some(description.to_string());
                    changed_fields.push("description".to_string());
                }
                Some(current) if current == description || !newer => {}
                Some(current) => {
                    if self.is_divergent(current, description) {
                        conflicts.push(FieldConflict {
                            field: "description".to_string(),
                            current: Value::String(current.to_string()),
                            proposed,
                            reason: ConflictReason::DivergentText,
                        });
                    } else {
                        entity.description = Some(description.to_string());
                        changed_fields.push("description".to_string());
                    }
                }
            }
        }

        for (field, proposed) in incoming.attributes {
            if proposed.is_null() {
                continue;
            }
            let Some(current) = existing.attribute(field) else {
                entity.attributes.insert(field.clone(), proposed.clone());
                changed_fields.push(field.clone());
                continue;
            };
            if values_equal(current, proposed) {
                continue;
            }

            let policy = schema.merge_policy(field).or_else(|| {
                (field == ALIASES_FIELD && schema.attribute(field).is_none())
                    .then_some(MergePolicy::Union)
            });
            let conflict = |reason| FieldConflict {
                field: field.clone(),
                current: current.clone(),
                proposed: proposed.clone(),
                reason,
            };

            match policy {
                Some(MergePolicy::Union) => match (current, proposed) {
                    (Value::Array(a), Value::Array(b)) => {
                        let merged = union(a, b);
                        if merged.len() != a.len() {
                            entity.attributes.insert(field.clone(), Value::Array(merged));
                            changed_fields.push(field.clone());
                        }
                    }
                    _ => conflicts.push(conflict(ConflictReason::IncompatibleValues)),
                },
                Some(MergePolicy::Max) => match (current.as_f64(), proposed.as_f64()) {
                    (Some(a), Some(b)) => {
                        if b > a {
                            entity.attributes.insert(field.clone(), proposed.clone());
                            changed_fields.push(field.clone());
                        }
                    }
                    _ => conflicts.push(conflict(ConflictReason::IncompatibleValues)),
                },
                Some(MergePolicy::LastWriteWins) => {
                    if !newer {
                        continue;
                    }
                    let divergent = match (current, proposed) {
                        (Value::String(a), Value::String(b)) => self.is_divergent(a, b),
                        _ => false,
                    };
                    if divergent {
                        conflicts.push(conflict(ConflictReason::DivergentText));
                    } else {
                        entity.attributes.insert(field.clone(), proposed.clone());
                        changed_fields.push(field.clone());
                    }
                }
                None => conflicts.push(conflict(ConflictReason::UndeclaredPolicy)),
            }
        }

        if !changed_fields.is_empty() {
            entity.version = existing.version + 1;
            entity.updated_at = Utc::now();
            entity.source_at = existing.source_at.max(incoming.extracted_at);
        }

        MergeOutcome {
            entity,
            changed_fields,
            conflicts,
        }
    }

    /// Whether replacing `current` with `proposed` would lose unrelated text.
    pub fn is_divergent(&self, current: &str, proposed: &str) -> bool {
        let a = normalize_name(current);
        let b = normalize_name(proposed);
        if a.is_empty() || b.is_empty() || a.contains(&b) || b.contains(&a) {
            return false;
        }
        word_similarity(&a, &b) < self.text_conflict_similarity
    }
}

/// Jaccard similarity of the word sets of two texts.
pub fn word_similarity(a: &str, b: &str) -> f64 {
    let words = |text: &str| -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect()
    };
    let a = words(a);
    let b = words(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Structural equality that compares numbers by value, so `5` equals `5.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn same_item(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => normalize_name(x) == normalize_name(y),
        _ => values_equal(a, b),
    }
}

/// Existing items first, then incoming items not already present.
fn union(existing: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut merged = existing.to_vec();
    for item in incoming {
        if !merged.iter().any(|m| same_item(m, item)) {
            merged.push(item.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Character, EntitySchema};
    use crate::id::{EntityId, TenantId, WorldId};
    use chrono::Duration;
    use serde_json::json;

    fn stored(attributes: Value, source_at: DateTime<Utc>) -> Entity {
        Entity {
            id: EntityId::new(),
            tenant_id: TenantId::new("acme").unwrap(),
            world_id: WorldId::new(),
            entity_type: "character".to_string(),
            name: "Kira".to_string(),
            description: None,
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            created_at: source_at,
            updated_at: source_at,
            source_at,
            version: 1,
        }
    }

    fn merge(existing: &Entity, attributes: Value, extracted_at: DateTime<Utc>) -> MergeOutcome {
        let attributes = attributes.as_object().cloned().unwrap_or_default();
        MergeHandler::new(0.25).merge(
            &Character::type_schema(),
            existing,
            Incoming {
                description: None,
                attributes: &attributes,
                extracted_at,
            },
        )
    }

    #[test]
    fn test_union_and_max() {
        let t0 = Utc::now();
        let existing = stored(
            json!({ "personality_traits": ["brave", "Curious"], "strength": 12 }),
            t0,
        );
        let outcome = merge(
            &existing,
            json!({ "personality_traits": ["curious", "loyal"], "strength": 9 }),
            t0 + Duration::seconds(1),
        );
        assert_eq!(
            outcome.entity.attribute("personality_traits"),
            Some(&json!(["brave", "Curious", "loyal"]))
        );
        // Stats never regress.
        assert_eq!(outcome.entity.attribute("strength"), Some(&json!(12)));
        assert_eq!(outcome.changed_fields, vec!["personality_traits".to_string()]);
        assert_eq!(outcome.entity.version, 2);
    }

    #[test]
    fn test_last_write_wins_by_extraction_time() {
        let t0 = Utc::now();
        let existing = stored(json!({ "role": "smuggler" }), t0);

        let older = merge(&existing, json!({ "role": "smuggler captain" }), t0 - Duration::hours(1));
        assert!(!older.changed());
        assert!(older.conflicts.is_empty());

        let newer = merge(&existing, json!({ "role": "smuggler captain" }), t0 + Duration::hours(1));
        assert_eq!(newer.entity.attribute("role"), Some(&json!("smuggler captain")));
        assert_eq!(newer.entity.source_at, t0 + Duration::hours(1));
    }

    #[test]
    fn test_divergent_text_goes_to_review() {
        let t0 = Utc::now();
        let existing = stored(json!({ "role": "court healer" }), t0);
        let outcome = merge(
            &existing,
            json!({ "role": "pirate queen of the eastern isles" }),
            t0 + Duration::hours(1),
        );
        assert!(!outcome.changed());
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].reason, ConflictReason::DivergentText);
        assert_eq!(outcome.entity.attribute("role"), Some(&json!("court healer")));
    }

    #[test]
    fn test_undeclared_field_goes_to_review() {
        let t0 = Utc::now();
        let existing = stored(json!({ "favourite_food": "plums" }), t0);
        let outcome = merge(&existing, json!({ "favourite_food": "figs" }), t0);
        assert_eq!(outcome.conflicts[0].reason, ConflictReason::UndeclaredPolicy);

        // Missing fields are simply filled in.
        let filled = merge(&existing, json!({ "hometown": "Eldoria" }), t0);
        assert_eq!(filled.changed_fields, vec!["hometown".to_string()]);
    }

    #[test]
    fn test_identical_values_change_nothing() {
        let t0 = Utc::now();
        let existing = stored(json!({ "strength": 5, "personality_traits": ["brave"] }), t0);
        let outcome = merge(
            &existing,
            json!({ "strength": 5.0, "personality_traits": ["Brave"] }),
            t0 + Duration::hours(1),
        );
        assert!(!outcome.changed());
        assert_eq!(outcome.entity, existing);
    }

    #[test]
    fn test_word_similarity() {
        assert_eq!(word_similarity("the old mill", "the old mill"), 1.0);
        assert_eq!(word_similarity("red fox", "blue whale"), 0.0);
        let handler = MergeHandler::new(0.25);
        assert!(!handler.is_divergent("A healer", "A healer of great renown"));
        assert!(handler.is_divergent("court healer", "pirate queen"));
    }
}
