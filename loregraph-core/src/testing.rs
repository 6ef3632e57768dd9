//! Testing utilities.
//!
//! This module provides tools for integration testing:
//! - `TestHarness`, an in-memory engine with one world ready to ingest into
//! - batch builders so tests don't hand-write `_metadata` blocks
//! - assertion helpers for checking world state

use crate::batch::ExtractionBatch;
use crate::engine::Engine;
use crate::id::{EntityId, Scope};
use crate::model::{Entity, EntityFilter, NewWorld};
use crate::report::MergeReport;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Tenant every harness world belongs to.
pub const TEST_TENANT: &str = "tenant-test";

/// An in-memory engine with a single world.
pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub scope: Scope,
}

impl TestHarness {
    /// Create a harness with the default configuration.
    ///
    /// Panics if the in-memory store cannot be opened.
    pub fn new() -> Self {
        Self::with_engine(Engine::in_memory().expect("in-memory engine"))
    }

    /// Create a harness around an existing engine, adding a fresh world.
    pub fn with_engine(engine: Engine) -> Self {
        let world = engine
            .create_world(TEST_TENANT, NewWorld::new("Test World"))
            .expect("test world");
        let scope = engine.scope(TEST_TENANT, world.id).expect("test scope");
        Self {
            engine: Arc::new(engine),
            scope,
        }
    }

    /// Ingest a batch document given as JSON.
    pub fn ingest(&self, document: Value) -> MergeReport {
        let batch = ExtractionBatch::from_value(document).expect("valid batch document");
        self.engine.ingest(&self.scope, &batch)
    }

    /// All entities of a type.
    pub fn entities(&self, entity_type: &str) -> Vec<Entity> {
        self.engine
            .query(&self.scope, entity_type, &EntityFilter::all())
            .expect("query")
    }

    /// Number of entities of a type.
    pub fn entity_count(&self, entity_type: &str) -> usize {
        self.entities(entity_type).len()
    }

    pub fn find(&self, entity_type: &str, name: &str) -> Option<Entity> {
        self.engine
            .find_by_name(&self.scope, entity_type, name)
            .expect("find_by_name")
    }

    /// Number of relationships in the world.
    pub fn relationship_count(&self) -> usize {
        self.engine.relationships(&self.scope).expect("relationships").len()
    }

    /// Relationships touching an entity, as (kind, other end) pairs.
    pub fn links_of(&self, id: EntityId) -> Vec<(String, EntityId)> {
        self.engine
            .relationships_of(&self.scope, id)
            .expect("relationships_of")
            .into_iter()
            .map(|r| {
                let other = if r.source_id == id { r.target_id } else { r.source_id };
                (r.kind, other)
            })
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a batch document for one entity type.
pub fn batch_of(skill: &str, entity_type: &str, entities: Vec<Value>) -> Value {
    let mut document = Map::new();
    document.insert(
        "_metadata".to_string(),
        json!({ "skill": skill, "entity_count": entities.len() }),
    );
    document.insert(entity_type.to_string(), Value::Array(entities));
    Value::Object(document)
}

/// Add cross-references to a batch document built by [`batch_of`].
pub fn with_refs(mut document: Value, refs: Vec<Value>) -> Value {
    if let Value::Object(map) = &mut document {
        map.insert("cross_references".to_string(), Value::Array(refs));
    }
    document
}

/// Set `_metadata.extracted_at` on a batch document.
pub fn extracted_at(mut document: Value, timestamp: &str) -> Value {
    if let Some(metadata) = document.get_mut("_metadata").and_then(Value::as_object_mut) {
        metadata.insert("extracted_at".to_string(), json!(timestamp));
    }
    document
}

/// A cross-reference entry.
pub fn reference(source_type: &str, source_id: &str, target_type: &str, target_hint: &str) -> Value {
    json!({
        "source_type": source_type,
        "source_id": source_id,
        "target_type": target_type,
        "target_hint": target_hint,
    })
}

/// Assert that an entity exists.
pub fn assert_has_entity(harness: &TestHarness, entity_type: &str, name: &str) {
    assert!(
        harness.find(entity_type, name).is_some(),
        "Expected {entity_type} '{name}' to exist"
    );
}

/// Assert that an entity doesn't exist.
pub fn assert_no_entity(harness: &TestHarness, entity_type: &str, name: &str) {
    assert!(
        harness.find(entity_type, name).is_none(),
        "Expected {entity_type} '{name}' to NOT exist"
    );
}

/// Assert that a batch wrote without rejections or failure.
pub fn assert_clean(report: &MergeReport) {
    assert!(!report.is_failed(), "batch failed: {report}");
    assert!(
        report.rejected.is_empty() && report.rejected_refs.is_empty(),
        "unexpected rejections: {report}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_ingest_and_find() {
        let harness = TestHarness::new();
        let report = harness.ingest(batch_of(
            "characters",
            "character",
            vec![json!({ "id": "c1", "name": "Kira" })],
        ));
        assert_clean(&report);
        assert_has_entity(&harness, "character", "kira");
        assert_no_entity(&harness, "character", "Mara");
        assert_eq!(harness.entity_count("character"), 1);
    }

    #[test]
    fn test_batch_builders() {
        let document = extracted_at(
            with_refs(
                batch_of("geo", "location", vec![json!({ "name": "Eldoria" })]),
                vec![reference("location", "Eldoria", "faction", "Council")],
            ),
            "2024-05-01T12:00:00Z",
        );
        let batch = ExtractionBatch::from_value(document).unwrap();
        assert_eq!(batch.skill(), Some("geo"));
        assert_eq!(batch.cross_references.len(), 1);
        assert_eq!(
            batch.metadata.extracted_at.to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }
}
