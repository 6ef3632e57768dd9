//! The ingestion engine.
//!
//! [`Engine`] wires the catalog, registry, validator, merge handler, resolver
//! and store together. It is `Send + Sync`; share it behind an [`Arc`] to
//! ingest batches from several workers at once.
//!
//! # Example
//!
//! ```
//! use loregraph_core::{Engine, EntityFilter, ExtractionBatch, NewWorld};
//! use serde_json::json;
//!
//! let engine = Engine::in_memory()?;
//! let world = engine.create_world("acme", NewWorld::new("Aerth"))?;
//! let scope = engine.scope("acme", world.id)?;
//!
//! let batch = ExtractionBatch::from_value(json!({
//!     "character": [{ "id": "c1", "name": "Kira", "role": "smuggler" }],
//!     "_metadata": { "skill": "characters" }
//! }))?;
//! let report = engine.ingest(&scope, &batch);
//! assert_eq!(report.created.len(), 1);
//!
//! let kira = engine.query(&scope, "character", &EntityFilter::all().named("kira"))?;
//! assert_eq!(kira.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod ingest;

use crate::catalog::{Catalog, EntitySchema};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StoreError};
use crate::id::{EntityId, ReviewId, Scope, TenantId, WorldId};
use crate::merge::{values_equal, MergeHandler};
use crate::model::{Entity, EntityFilter, NewWorld, Relationship, World};
use crate::registry::{Registration, Registry};
use crate::resolver::{CrossReference, RefStatus, ResolutionSummary, Resolver};
use crate::review::{ReviewDecision, ReviewItem};
use crate::store::{schema, Store};
use crate::validate::{ValidationResult, Validator};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, info_span};

/// Builds and queries the tenant-scoped entity graph.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    store: Arc<Store>,
    registry: Registry,
    validator: Validator,
    merger: MergeHandler,
    resolver: Resolver,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("types", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine with the built-in catalog.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::with_catalog(config, Catalog::builtin()?)
    }

    /// Open an engine with a custom catalog.
    pub fn with_catalog(config: EngineConfig, catalog: Catalog) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(catalog);
        let store = Arc::new(Store::open(&config.database, Arc::clone(&catalog))?);
        info!(
            types = catalog.len(),
            database = ?config.database.path,
            "engine ready"
        );
        Ok(Self {
            registry: Registry::new(Arc::clone(&store), config.alias_distance),
            validator: Validator::new(Arc::clone(&catalog)),
            merger: MergeHandler::new(config.text_conflict_similarity),
            resolver: Resolver::new(config.max_resolution_passes),
            catalog,
            store,
            config,
        })
    }

    /// A private in-memory engine with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// DDL of the store, one entry per table group.
    pub fn ddl(&self) -> Vec<String> {
        schema::ddl(&self.catalog)
    }

    // ---- worlds and scopes ----

    /// Create a world owned by `tenant`.
    pub fn create_world(&self, tenant: &str, new: NewWorld) -> Result<World> {
        let tenant = TenantId::new(tenant)?;
        if new.name.trim().is_empty() {
            return Err(EngineError::InvalidValue {
                field: "name".to_string(),
                reason: "world name is blank".to_string(),
            });
        }
        if let Some(level) = new.power_level {
            if !(1..=10).contains(&level) {
                return Err(EngineError::InvalidValue {
                    field: "power_level".to_string(),
                    reason: format!("{level} is outside 1..=10"),
                });
            }
        }
        let world = self.store.write(|db| db.insert_world(&tenant, &new))?;
        info!(tenant = %tenant, world = %world.id, name = %world.name, "created world");
        Ok(world)
    }

    /// Validate that `tenant` owns `world` and build the scope for it.
    pub fn scope(&self, tenant: &str, world: WorldId) -> Result<Scope> {
        let scope = Scope::new(tenant, world)?;
        self.store.read(|db| db.check_scope(&scope))?;
        Ok(scope)
    }

    pub fn world(&self, scope: &Scope) -> Result<Option<World>> {
        Ok(self.store.read(|db| db.world(scope))?)
    }

    pub fn worlds(&self, tenant: &str) -> Result<Vec<World>> {
        let tenant = TenantId::new(tenant)?;
        Ok(self.store.read(|db| db.worlds(&tenant))?)
    }

    /// Delete a world and everything it owns.
    pub fn delete_world(&self, scope: &Scope) -> Result<bool> {
        let deleted = self.store.write(|db| db.delete_world(scope))?;
        if deleted {
            self.registry.forget_world(scope.world());
            info!(scope = %scope, "deleted world");
        }
        Ok(deleted)
    }

    // ---- registry and validation ----

    /// Canonical id for a name, allocated if needed.
    pub fn register_or_get(
        &self,
        scope: &Scope,
        entity_type: &str,
        name: &str,
        attrs: &Map<String, Value>,
    ) -> Result<Registration> {
        self.registry.register_or_get(scope, entity_type, name, attrs)
    }

    /// Check attributes against the catalog without writing anything.
    pub fn validate(&self, entity_type: &str, attrs: &Map<String, Value>) -> Result<ValidationResult> {
        Ok(self.validator.validate(entity_type, attrs)?)
    }

    // ---- queries ----

    /// Entities of one type matching a filter, ordered by name.
    pub fn query(&self, scope: &Scope, entity_type: &str, filter: &EntityFilter) -> Result<Vec<Entity>> {
        self.catalog.schema(entity_type)?;
        let entities = self.store.read(|db| {
            db.check_scope(scope)?;
            db.entities(scope, entity_type)
        })?;
        let matching = entities.into_iter().filter(|e| filter.matches(e));
        Ok(match filter.max_results() {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    /// Like [`Engine::query`], decoding each entity into its schema struct.
    pub fn query_typed<T>(&self, scope: &Scope, filter: &EntityFilter) -> Result<Vec<(Entity, T)>>
    where
        T: EntitySchema + DeserializeOwned,
    {
        self.query(scope, T::ENTITY_TYPE, filter)?
            .into_iter()
            .map(|entity| -> Result<(Entity, T)> {
                let typed = entity.decode().map_err(|e| StoreError::Corrupt {
                    table: T::ENTITY_TYPE.to_string(),
                    reason: e.to_string(),
                })?;
                Ok((entity, typed))
            })
            .collect()
    }

    /// Entity whose canonical name or alias matches `name`.
    pub fn find_by_name(&self, scope: &Scope, entity_type: &str, name: &str) -> Result<Option<Entity>> {
        self.catalog.schema(entity_type)?;
        self.store.read(|db| db.check_scope(scope))?;
        match self.registry.lookup(scope, entity_type, name)? {
            Some((id, _)) => Ok(self.store.read(|db| db.load_entity(scope, entity_type, id))?),
            None => Ok(None),
        }
    }

    pub fn get(&self, scope: &Scope, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.get_entity(scope, id)
        })?)
    }

    /// Normalized aliases of an entity.
    pub fn aliases(&self, scope: &Scope, id: EntityId) -> Result<Vec<String>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.aliases(scope, id)
        })?)
    }

    pub fn cross_references(&self, scope: &Scope, status: Option<RefStatus>) -> Result<Vec<CrossReference>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.cross_refs(scope, status)
        })?)
    }

    pub fn relationships(&self, scope: &Scope) -> Result<Vec<Relationship>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.relationships(scope)
        })?)
    }

    /// Relationships with `id` at either end.
    pub fn relationships_of(&self, scope: &Scope, id: EntityId) -> Result<Vec<Relationship>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.relationships_of(scope, id)
        })?)
    }

    // ---- resolution ----

    /// Barrier pass: attempt every pending cross-reference of the world once.
    pub fn finalize_resolution(&self, scope: &Scope) -> Result<ResolutionSummary> {
        let span = info_span!("finalize_resolution", scope = %scope);
        let _enter = span.enter();
        let summary = self.store.write(|db| {
            db.check_scope(scope)?;
            self.resolver.resolve_all(db, scope)
        })?;
        info!(
            attempted = summary.attempted,
            resolved = summary.resolved.len(),
            unresolvable = summary.unresolvable.len(),
            "final resolution pass"
        );
        Ok(summary)
    }

    // ---- review ----

    pub fn reviews(&self, scope: &Scope, open_only: bool) -> Result<Vec<ReviewItem>> {
        Ok(self.store.read(|db| {
            db.check_scope(scope)?;
            db.reviews(scope, open_only)
        })?)
    }

    /// Apply a reviewer's decision and close the item.
    ///
    /// Returns the entity as stored afterwards.
    pub fn resolve_review(&self, scope: &Scope, id: ReviewId, decision: ReviewDecision) -> Result<Entity> {
        let item = self
            .store
            .read(|db| {
                db.check_scope(scope)?;
                db.review(scope, id)
            })?
            .filter(ReviewItem::is_open)
            .ok_or(EngineError::ReviewNotOpen(id))?;

        let value = item.value_for(&decision);
        if !matches!(decision, ReviewDecision::KeepCurrent) {
            self.check_review_value(&item, &value)?;
        }

        let entity = self.store.write(|db| {
            if !db.close_review(scope, id, &decision)? {
                return Ok(None);
            }
            let mut entity = db
                .load_entity(scope, &item.entity_type, item.entity_id)?
                .ok_or_else(|| StoreError::Corrupt {
                    table: item.entity_type.clone(),
                    reason: format!("review {id} points at missing entity {}", item.entity_id),
                })?;

            let current = if item.field == "description" {
                entity.description.clone().map(Value::String).unwrap_or(Value::Null)
            } else {
                entity.attributes.get(&item.field).cloned().unwrap_or(Value::Null)
            };
            if values_equal(&current, &value) {
                return Ok(Some(entity));
            }

            if item.field == "description" {
                entity.description = value.as_str().map(str::to_string);
            } else if value.is_null() {
                entity.attributes.remove(&item.field);
            } else {
                entity.attributes.insert(item.field.clone(), value.clone());
            }
            let expected = entity.version;
            entity.version += 1;
            entity.updated_at = Utc::now();
            if !db.update_entity(&entity, expected)? {
                return Err(StoreError::StaleWrite {
                    id: entity.id,
                    expected,
                    attempts: 1,
                });
            }
            Ok(Some(entity))
        })?;

        let entity = entity.ok_or(EngineError::ReviewNotOpen(id))?;
        info!(scope = %scope, review = %id, field = %item.field, version = entity.version, "resolved review");
        Ok(entity)
    }

    fn check_review_value(&self, item: &ReviewItem, value: &Value) -> Result<()> {
        if item.field == "description" {
            return match value {
                Value::String(_) | Value::Null => Ok(()),
                _ => Err(EngineError::InvalidValue {
                    field: item.field.clone(),
                    reason: "description must be text".to_string(),
                }),
            };
        }
        let result = self
            .validator
            .validate_field(&item.entity_type, &item.field, value)?;
        if result.ok {
            return Ok(());
        }
        let reasons: Vec<String> = result.field_errors.iter().map(|e| e.violation.to_string()).collect();
        Err(EngineError::InvalidValue {
            field: item.field.clone(),
            reason: reasons.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_world_validation() {
        let engine = Engine::in_memory().unwrap();
        assert!(matches!(
            engine.create_world("acme", NewWorld::new("  ")),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(matches!(
            engine.create_world("acme", NewWorld::new("Aerth").with_power_level(11)),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(engine.create_world(" ", NewWorld::new("Aerth")).unwrap_err().is_integrity());

        engine.create_world("acme", NewWorld::new("Aerth")).unwrap();
        assert!(matches!(
            engine.create_world("acme", NewWorld::new("Aerth")),
            Err(EngineError::Store(StoreError::DuplicateWorld { .. }))
        ));
        // Names are only unique per tenant.
        engine.create_world("globex", NewWorld::new("Aerth")).unwrap();
    }

    #[test]
    fn test_scope_checks_ownership() {
        let engine = Engine::in_memory().unwrap();
        let world = engine.create_world("acme", NewWorld::new("Aerth")).unwrap();
        assert!(engine.scope("acme", world.id).is_ok());
        assert!(engine.scope("globex", world.id).unwrap_err().is_integrity());
        assert!(engine.scope("acme", WorldId::nil()).unwrap_err().is_integrity());
        assert!(engine.scope("", world.id).unwrap_err().is_integrity());
    }

    #[test]
    fn test_ddl_is_exposed() {
        let engine = Engine::in_memory().unwrap();
        let ddl = engine.ddl().join("\n");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS cross_references"));
        assert!(ddl.contains("\"factions\""));
    }
}
