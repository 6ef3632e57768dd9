//! Entity registry: canonical ids per (tenant, world, type, name).
//!
//! The registry is the only place canonical ids are allocated. Names are
//! normalized before lookup; a name matches either a canonical name
//! ([`MatchKind::Exact`]) or an alias of one ([`MatchKind::Alias`]). Anything
//! else allocates a new id ([`MatchKind::Unmatched`]).
//!
//! Similar-looking names are never merged automatically. They are reported
//! as [`AliasCandidate`]s for a human to decide on.
//!
//! ## Concurrency
//!
//! Registration for one key runs under that key's lock, and the store's
//! unique index on the key backs the lock up: the first `INSERT` wins and
//! every other registration reads the winner's id back.

mod keylock;
mod name;

pub use name::{display_name, near_match, normalize_name};

use crate::catalog::Catalog;
use crate::error::{EngineError, Result};
use crate::id::{EntityId, Scope, TenantId, WorldId};
use crate::store::{Db, Store};
use keylock::KeyLocks;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How a name was matched to its canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Same normalized canonical name.
    Exact,
    /// A registered alias of the entity.
    Alias,
    /// No match; a new canonical entity was allocated.
    Unmatched,
}

impl MatchKind {
    pub fn name(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Alias => "alias",
            MatchKind::Unmatched => "unmatched",
        }
    }
}

/// Why a name was flagged as a possible alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateReason {
    /// The names are within the configured edit distance.
    SimilarName,
    /// A declared alias already belongs to another entity.
    AliasTaken,
}

/// A possible duplicate reported for review, never merged automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasCandidate {
    pub entity_type: String,
    /// The entity the name was registered to.
    pub entity_id: EntityId,
    /// The incoming name or alias, normalized.
    pub name: String,
    /// The entity it may really belong to.
    pub candidate_id: EntityId,
    pub candidate_name: String,
    pub reason: CandidateReason,
    /// Edit distance for [`CandidateReason::SimilarName`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<usize>,
}

/// Result of [`Registry::register_or_get`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: EntityId,
    /// Whether this call allocated the id.
    pub created: bool,
    pub match_kind: MatchKind,
    pub alias_candidates: Vec<AliasCandidate>,
    /// Aliases this call added to the entity.
    pub new_aliases: Vec<String>,
}

/// Lock and cache key: one canonical name or alias within a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    tenant: TenantId,
    world: WorldId,
    entity_type: String,
    name: String,
}

impl RegistryKey {
    pub fn new(scope: &Scope, entity_type: &str, normalized: &str) -> Self {
        Self {
            tenant: scope.tenant().clone(),
            world: scope.world(),
            entity_type: entity_type.to_string(),
            name: normalized.to_string(),
        }
    }
}

/// Allocates and looks up canonical entity ids.
pub struct Registry {
    store: Arc<Store>,
    locks: KeyLocks<RegistryKey>,
    /// Positive lookups only; keys never change owner until their world is
    /// deleted.
    cache: RwLock<HashMap<RegistryKey, (EntityId, MatchKind)>>,
    alias_distance: usize,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("cached", &self.cache.read().len())
            .field("alias_distance", &self.alias_distance)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<Store>, alias_distance: usize) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
            cache: RwLock::new(HashMap::new()),
            alias_distance,
        }
    }

    fn catalog(&self) -> &Catalog {
        self.store.catalog()
    }

    /// Return the canonical id for a name, allocating one if needed.
    ///
    /// An `aliases` list in `attrs` is added to the entity's alias set.
    /// The scope's world must exist.
    pub fn register_or_get(
        &self,
        scope: &Scope,
        entity_type: &str,
        name: &str,
        attrs: &Map<String, Value>,
    ) -> Result<Registration> {
        if !self.catalog().contains(entity_type) {
            return Err(crate::error::CatalogError::UnknownType(entity_type.to_string()).into());
        }
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(EngineError::InvalidValue {
                field: "name".to_string(),
                reason: "name is blank".to_string(),
            });
        }

        let key = RegistryKey::new(scope, entity_type, &normalized);
        let (id, match_kind, created) = match self.cached(&key) {
            Some((id, kind)) => (id, kind, false),
            None => self.locks.with_lock(&key, || {
                self.register_locked(scope, &key, &display_name(name))
            })?,
        };

        let mut registration = Registration {
            id,
            created,
            match_kind,
            alias_candidates: Vec::new(),
            new_aliases: Vec::new(),
        };

        if created {
            registration.alias_candidates = self.similar_names(scope, entity_type, &normalized, id)?;
        }
        if let Some(Value::Array(aliases)) = attrs.get("aliases") {
            for alias in aliases.iter().filter_map(Value::as_str) {
                self.add_alias(scope, entity_type, &normalized, alias, &mut registration)?;
            }
        }

        debug!(
            scope = %scope,
            entity_type,
            name = %normalized,
            id = %registration.id,
            match_kind = registration.match_kind.name(),
            created = registration.created,
            "registered entity"
        );
        Ok(registration)
    }

    fn cached(&self, key: &RegistryKey) -> Option<(EntityId, MatchKind)> {
        self.cache.read().get(key).copied()
    }

    fn remember(&self, key: RegistryKey, id: EntityId, kind: MatchKind) {
        let kind = match kind {
            // A later lookup of a freshly allocated name is an exact hit.
            MatchKind::Unmatched => MatchKind::Exact,
            other => other,
        };
        self.cache.write().insert(key, (id, kind));
    }

    fn register_locked(
        &self,
        scope: &Scope,
        key: &RegistryKey,
        display: &str,
    ) -> Result<(EntityId, MatchKind, bool)> {
        let candidate = EntityId::new();
        let (id, kind) = self.store.write(|db| {
            db.check_scope(scope)?;
            if let Some(found) = Self::lookup_in(db, scope, &key.entity_type, &key.name)? {
                return Ok(found);
            }
            let id = db.reserve(scope, &key.entity_type, &key.name, display, candidate)?;
            // Another process may have inserted the key since the lookup.
            let kind = if id == candidate {
                MatchKind::Unmatched
            } else {
                MatchKind::Exact
            };
            Ok((id, kind))
        })?;
        self.remember(key.clone(), id, kind);
        Ok((id, kind, id == candidate))
    }

    /// Match a normalized name within a type: canonical name first, then
    /// aliases. Does not allocate.
    pub fn lookup_in(
        db: &Db<'_>,
        scope: &Scope,
        entity_type: &str,
        normalized: &str,
    ) -> std::result::Result<Option<(EntityId, MatchKind)>, crate::error::StoreError> {
        if let Some(id) = db.find_canonical(scope, entity_type, normalized)? {
            return Ok(Some((id, MatchKind::Exact)));
        }
        Ok(db
            .find_alias(scope, entity_type, normalized)?
            .map(|id| (id, MatchKind::Alias)))
    }

    /// Match a name without allocating, using the cache when possible.
    pub fn lookup(
        &self,
        scope: &Scope,
        entity_type: &str,
        name: &str,
    ) -> Result<Option<(EntityId, MatchKind)>> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Ok(None);
        }
        let key = RegistryKey::new(scope, entity_type, &normalized);
        if let Some(hit) = self.cached(&key) {
            return Ok(Some(hit));
        }
        let found = self
            .store
            .read(|db| Self::lookup_in(db, scope, entity_type, &normalized))?;
        if let Some((id, kind)) = found {
            self.remember(key, id, kind);
        }
        Ok(found)
    }

    fn similar_names(
        &self,
        scope: &Scope,
        entity_type: &str,
        normalized: &str,
        id: EntityId,
    ) -> Result<Vec<AliasCandidate>> {
        let entries = self.store.read(|db| db.index_entries(scope, entity_type))?;
        let mut candidates = Vec::new();
        for entry in entries.into_iter().filter(|e| e.id != id) {
            if let Some(distance) = near_match(normalized, &entry.normalized_name, self.alias_distance)
            {
                info!(
                    scope = %scope,
                    entity_type,
                    name = normalized,
                    similar_to = %entry.display_name,
                    distance,
                    "possible alias, not merged"
                );
                candidates.push(AliasCandidate {
                    entity_type: entity_type.to_string(),
                    entity_id: id,
                    name: normalized.to_string(),
                    candidate_id: entry.id,
                    candidate_name: entry.display_name,
                    reason: CandidateReason::SimilarName,
                    distance: Some(distance),
                });
            }
        }
        Ok(candidates)
    }

    fn add_alias(
        &self,
        scope: &Scope,
        entity_type: &str,
        canonical: &str,
        alias: &str,
        registration: &mut Registration,
    ) -> Result<()> {
        let normalized = normalize_name(alias);
        if normalized.is_empty() || normalized == canonical {
            return Ok(());
        }
        let id = registration.id;
        let key = RegistryKey::new(scope, entity_type, &normalized);
        if let Some((owner, _)) = self.cached(&key) {
            if owner != id {
                registration
                    .alias_candidates
                    .push(self.alias_taken(scope, entity_type, id, &normalized, owner)?);
            }
            return Ok(());
        }

        let outcome = self.locks.with_lock(&key, || {
            self.store.write(|db| {
                if let Some(owner) = db.find_canonical(scope, entity_type, &normalized)? {
                    return Ok((owner, MatchKind::Exact, false));
                }
                if let Some(owner) = db.find_alias(scope, entity_type, &normalized)? {
                    return Ok((owner, MatchKind::Alias, false));
                }
                let owner = db.insert_alias(scope, entity_type, &normalized, id)?;
                Ok((owner, MatchKind::Alias, owner == id))
            })
        })?;

        let (owner, kind, inserted) = outcome;
        self.remember(key, owner, kind);
        if inserted {
            registration.new_aliases.push(normalized);
        } else if owner != id {
            registration
                .alias_candidates
                .push(self.alias_taken(scope, entity_type, id, &normalized, owner)?);
        }
        Ok(())
    }

    fn alias_taken(
        &self,
        scope: &Scope,
        entity_type: &str,
        id: EntityId,
        alias: &str,
        owner: EntityId,
    ) -> Result<AliasCandidate> {
        let owner_name = self
            .store
            .read(|db| db.index_entry(scope, owner))?
            .map(|e| e.display_name)
            .unwrap_or_default();
        info!(
            scope = %scope,
            entity_type,
            alias,
            owner = %owner_name,
            "alias already belongs to another entity"
        );
        Ok(AliasCandidate {
            entity_type: entity_type.to_string(),
            entity_id: id,
            name: alias.to_string(),
            candidate_id: owner,
            candidate_name: owner_name,
            reason: CandidateReason::AliasTaken,
            distance: None,
        })
    }

    /// Drop cached keys of a deleted world.
    pub fn forget_world(&self, world: WorldId) {
        self.cache.write().retain(|key, _| key.world != world);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::model::NewWorld;
    use serde_json::json;

    fn setup() -> (Registry, Scope) {
        let store = Arc::new(
            Store::open(
                &DatabaseConfig::default(),
                Arc::new(Catalog::builtin().unwrap()),
            )
            .unwrap(),
        );
        let tenant = TenantId::new("acme").unwrap();
        let world = store
            .write(|db| db.insert_world(&tenant, &NewWorld::new("Aerth")))
            .unwrap();
        let scope = Scope::new("acme", world.id).unwrap();
        (Registry::new(store, 2), scope)
    }

    fn no_attrs() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn test_variants_share_an_id() {
        let (registry, scope) = setup();
        let first = registry
            .register_or_get(&scope, "character", "Kira", &no_attrs())
            .unwrap();
        let second = registry
            .register_or_get(&scope, "character", "  kira", &no_attrs())
            .unwrap();
        assert!(first.created);
        assert_eq!(first.match_kind, MatchKind::Unmatched);
        assert!(!second.created);
        assert_eq!(second.match_kind, MatchKind::Exact);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_aliases_match() {
        let (registry, scope) = setup();
        let attrs = json!({ "aliases": ["The Blade", "kira"] });
        let kira = registry
            .register_or_get(&scope, "character", "Kira", attrs.as_object().unwrap())
            .unwrap();
        assert_eq!(kira.new_aliases, vec!["the blade".to_string()]);

        let blade = registry
            .register_or_get(&scope, "character", "the   BLADE", &no_attrs())
            .unwrap();
        assert_eq!(blade.id, kira.id);
        assert_eq!(blade.match_kind, MatchKind::Alias);
    }

    #[test]
    fn test_near_match_is_reported_not_merged() {
        let (registry, scope) = setup();
        let council = registry
            .register_or_get(&scope, "faction", "Eldorian Council", &no_attrs())
            .unwrap();
        let typo = registry
            .register_or_get(&scope, "faction", "Eldorian Councel", &no_attrs())
            .unwrap();
        assert_ne!(council.id, typo.id);
        assert!(typo.created);
        assert_eq!(typo.alias_candidates.len(), 1);
        assert_eq!(typo.alias_candidates[0].candidate_id, council.id);
        assert_eq!(typo.alias_candidates[0].reason, CandidateReason::SimilarName);
    }

    #[test]
    fn test_alias_owned_by_another_entity() {
        let (registry, scope) = setup();
        let mara = registry
            .register_or_get(&scope, "character", "Mara", &no_attrs())
            .unwrap();
        let attrs = json!({ "aliases": ["Mara"] });
        let kira = registry
            .register_or_get(&scope, "character", "Kira", attrs.as_object().unwrap())
            .unwrap();
        assert!(kira.new_aliases.is_empty());
        assert_eq!(kira.alias_candidates.len(), 1);
        assert_eq!(kira.alias_candidates[0].candidate_id, mara.id);
        assert_eq!(kira.alias_candidates[0].reason, CandidateReason::AliasTaken);
    }

    #[test]
    fn test_types_are_separate_namespaces() {
        let (registry, scope) = setup();
        let a = registry
            .register_or_get(&scope, "location", "Eldoria", &no_attrs())
            .unwrap();
        let b = registry
            .register_or_get(&scope, "faction", "Eldoria", &no_attrs())
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_blank_name_and_unknown_type() {
        let (registry, scope) = setup();
        assert!(matches!(
            registry.register_or_get(&scope, "character", "   ", &no_attrs()),
            Err(EngineError::InvalidValue { .. })
        ));
        assert!(matches!(
            registry.register_or_get(&scope, "starship", "Kira", &no_attrs()),
            Err(EngineError::Catalog(_))
        ));
    }

    #[test]
    fn test_unknown_world_is_rejected() {
        let (registry, _) = setup();
        let stray = Scope::new("acme", WorldId::new()).unwrap();
        let err = registry
            .register_or_get(&stray, "character", "Kira", &no_attrs())
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_concurrent_registration_converges() {
        let (registry, scope) = setup();
        let barrier = std::sync::Barrier::new(8);
        let results: Vec<Registration> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry
                            .register_or_get(&scope, "faction", "Eldorian Council", &Map::new())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let id = results[0].id;
        assert!(results.iter().all(|r| r.id == id));
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);
    }
}
