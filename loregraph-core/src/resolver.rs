//! Deferred cross-reference resolution.
//!
//! A [`CrossReference`] names its target by type and free-text hint, so it
//! can be stored before the target exists. Each resolution pass looks the
//! hint up through the registry; a hit on a stored entity produces exactly
//! one [`Relationship`], anything else counts as a miss towards the pass
//! limit.
//!
//! ```text
//!            miss (attempts < limit)
//!              ┌──────┐
//!              ▼      │
//!          ┌─────────┐│   hit    ┌──────────┐
//!  insert ─▶ Pending ├┴─────────▶ Resolved │
//!          └────┬────┘           └──────────┘
//!               │ miss (attempts == limit)
//!               ▼
//!         ┌──────────────┐
//!         │ Unresolvable │
//!         └──────────────┘
//! ```
//!
//! Both transitions are guarded by `status = 'pending'` in storage, so a
//! reference never leaves a terminal state.

use crate::error::{IntegrityError, StoreError};
use crate::id::{CrossRefId, EntityId, RelationshipId, Scope, TenantId, WorldId};
use crate::model::Relationship;
use crate::registry::{normalize_name, MatchKind, Registry};
use crate::store::Db;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info_span};

/// Lifecycle state of a cross-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefStatus {
    Pending,
    Resolved,
    Unresolvable,
}

impl RefStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefStatus::Pending => "pending",
            RefStatus::Resolved => "resolved",
            RefStatus::Unresolvable => "unresolvable",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefStatus::Pending)
    }
}

impl fmt::Display for RefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefStatus::Pending),
            "resolved" => Ok(RefStatus::Resolved),
            "unresolvable" => Ok(RefStatus::Unresolvable),
            other => Err(format!("unknown cross-reference status {other:?}")),
        }
    }
}

impl ToSql for RefStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RefStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A deferred link from a known source entity to a hinted target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReference {
    pub id: CrossRefId,
    pub tenant_id: TenantId,
    pub world_id: WorldId,
    pub source_type: String,
    pub source_id: EntityId,
    pub target_type: String,
    /// Skill expected to produce the target.
    pub target_skill: Option<String>,
    pub target_hint: String,
    pub status: RefStatus,
    pub resolved_target_id: Option<EntityId>,
    /// Resolution passes that found no target.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrossReference {
    /// A fresh pending reference.
    pub fn pending(
        scope: &Scope,
        source_type: impl Into<String>,
        source_id: EntityId,
        target_type: impl Into<String>,
        target_hint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CrossRefId::new(),
            tenant_id: scope.tenant().clone(),
            world_id: scope.world(),
            source_type: source_type.into(),
            source_id,
            target_type: target_type.into(),
            target_skill: None,
            target_hint: target_hint.into(),
            status: RefStatus::Pending,
            resolved_target_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_target_skill(mut self, skill: Option<String>) -> Self {
        self.target_skill = skill;
        self
    }
}

/// A reference resolved during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub cross_reference_id: CrossRefId,
    pub relationship_id: RelationshipId,
    pub kind: String,
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub match_kind: MatchKind,
}

/// What one resolution pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    /// References looked at.
    pub attempted: usize,
    pub resolved: Vec<ResolvedRef>,
    /// References that hit the pass limit in this pass.
    pub unresolvable: Vec<CrossRefId>,
    /// References still waiting for their target.
    pub pending: Vec<CrossRefId>,
}

impl ResolutionSummary {
    pub fn absorb(&mut self, other: ResolutionSummary) {
        self.attempted += other.attempted;
        self.resolved.extend(other.resolved);
        self.unresolvable.extend(other.unresolvable);
        self.pending.extend(other.pending);
    }
}

/// Runs resolution passes inside a store transaction.
#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    max_passes: u32,
}

impl Resolver {
    pub fn new(max_passes: u32) -> Self {
        Self {
            max_passes: max_passes.max(1),
        }
    }

    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    /// Incremental pass after a batch write.
    ///
    /// Attempts every pending reference waiting on one of `target_types`,
    /// plus the references in `fresh` that are still pending.
    pub fn resolve_incremental(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        target_types: &BTreeSet<String>,
        fresh: &[CrossReference],
    ) -> Result<ResolutionSummary, StoreError> {
        let mut queue = Vec::new();
        let mut seen = HashSet::new();
        for target_type in target_types {
            for reference in db.pending_refs_for(scope, target_type)? {
                if seen.insert(reference.id) {
                    queue.push(reference);
                }
            }
        }
        for reference in fresh {
            if reference.status == RefStatus::Pending && seen.insert(reference.id) {
                queue.push(reference.clone());
            }
        }
        self.run_pass(db, scope, queue)
    }

    /// Attempt every pending reference of the world once.
    pub fn resolve_all(&self, db: &Db<'_>, scope: &Scope) -> Result<ResolutionSummary, StoreError> {
        let queue = db.cross_refs(scope, Some(RefStatus::Pending))?;
        self.run_pass(db, scope, queue)
    }

    fn run_pass(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        queue: Vec<CrossReference>,
    ) -> Result<ResolutionSummary, StoreError> {
        let span = info_span!("resolution_pass", scope = %scope, refs = queue.len());
        let _enter = span.enter();

        let mut summary = ResolutionSummary {
            attempted: queue.len(),
            ..ResolutionSummary::default()
        };
        for reference in queue {
            match self.attempt(db, scope, &reference)? {
                Attempt::Resolved(resolved) => summary.resolved.push(resolved),
                Attempt::Missed(RefStatus::Unresolvable) => summary.unresolvable.push(reference.id),
                Attempt::Missed(_) => summary.pending.push(reference.id),
                Attempt::Skipped => {}
            }
        }
        debug!(
            resolved = summary.resolved.len(),
            unresolvable = summary.unresolvable.len(),
            pending = summary.pending.len(),
            "resolution pass done"
        );
        Ok(summary)
    }

    fn attempt(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        reference: &CrossReference,
    ) -> Result<Attempt, StoreError> {
        let hint = normalize_name(&reference.target_hint);
        let hit = Registry::lookup_in(db, scope, &reference.target_type, &hint)?;
        // A registered name whose row was never written is still a miss.
        let hit = match hit {
            Some((id, _)) if !db.entity_exists(scope, &reference.target_type, id)? => {
                debug!(hint = %reference.target_hint, target = %id, "target registered but not stored");
                None
            }
            hit => hit,
        };
        let Some((target_id, match_kind)) = hit else {
            return Ok(match db.record_miss(scope, reference.id, self.max_passes)? {
                Some(status) => Attempt::Missed(status),
                None => Attempt::Skipped,
            });
        };

        let kind = db
            .catalog()
            .relationship_kind(&reference.source_type, &reference.target_type)
            .to_string();
        check_endpoint(db, scope, &kind, reference.source_id, &reference.source_type)?;
        check_endpoint(db, scope, &kind, target_id, &reference.target_type)?;

        if !db.mark_resolved(scope, reference.id, target_id)? {
            return Ok(Attempt::Skipped);
        }
        let relationship = Relationship {
            id: RelationshipId::new(),
            tenant_id: scope.tenant().clone(),
            world_id: scope.world(),
            kind: kind.clone(),
            source_id: reference.source_id,
            target_id,
            cross_reference_id: reference.id,
            created_at: Utc::now(),
        };
        db.insert_relationship(&relationship)?;
        debug!(
            hint = %reference.target_hint,
            target = %target_id,
            kind = %kind,
            "resolved cross-reference"
        );
        Ok(Attempt::Resolved(ResolvedRef {
            cross_reference_id: reference.id,
            relationship_id: relationship.id,
            kind,
            source_id: reference.source_id,
            target_id,
            match_kind,
        }))
    }
}

enum Attempt {
    Resolved(ResolvedRef),
    Missed(RefStatus),
    /// Another pass already moved the reference on.
    Skipped,
}

fn check_endpoint(
    db: &Db<'_>,
    scope: &Scope,
    kind: &str,
    entity: EntityId,
    expected_type: &str,
) -> Result<(), StoreError> {
    if db.entity_exists(scope, expected_type, entity)? {
        return Ok(());
    }
    Err(IntegrityError::RelationshipEndpoint {
        kind: kind.to_string(),
        entity,
        expected_type: expected_type.to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::DatabaseConfig;
    use crate::model::{Entity, NewWorld};
    use crate::store::Store;
    use std::sync::Arc;

    fn setup() -> (Store, Scope) {
        let store = Store::open(
            &DatabaseConfig::default(),
            Arc::new(Catalog::builtin().unwrap()),
        )
        .unwrap();
        let tenant = TenantId::new("acme").unwrap();
        let world = store
            .write(|db| db.insert_world(&tenant, &NewWorld::new("Aerth")))
            .unwrap();
        (store, Scope::new("acme", world.id).unwrap())
    }

    fn reserve(store: &Store, scope: &Scope, entity_type: &str, name: &str) -> EntityId {
        store
            .write(|db| {
                db.reserve(
                    scope,
                    entity_type,
                    &normalize_name(name),
                    name,
                    EntityId::new(),
                )
            })
            .unwrap()
    }

    fn write_row(store: &Store, scope: &Scope, entity_type: &str, name: &str, id: EntityId) {
        let now = Utc::now();
        let entity = Entity {
            id,
            tenant_id: scope.tenant().clone(),
            world_id: scope.world(),
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            description: None,
            attributes: Default::default(),
            created_at: now,
            updated_at: now,
            source_at: now,
            version: 1,
        };
        store.write(|db| db.insert_entity(&entity)).unwrap();
    }

    /// Reserve a name and write its row.
    fn register(store: &Store, scope: &Scope, entity_type: &str, name: &str) -> EntityId {
        let id = reserve(store, scope, entity_type, name);
        write_row(store, scope, entity_type, name, id);
        id
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("pending".parse::<RefStatus>().unwrap(), RefStatus::Pending);
        assert!("done".parse::<RefStatus>().is_err());
        assert!(RefStatus::Unresolvable.is_terminal());
    }

    #[test]
    fn test_forward_reference_resolves_once() {
        let (store, scope) = setup();
        let resolver = Resolver::new(5);
        let kira = register(&store, &scope, "character", "Kira");
        let reference = CrossReference::pending(&scope, "character", kira, "location", "Eldoria Village");

        let (stored, _) = store.write(|db| db.insert_cross_ref(&reference)).unwrap();
        let first = store
            .write(|db| resolver.resolve_incremental(db, &scope, &BTreeSet::new(), &[stored.clone()]))
            .unwrap();
        assert_eq!(first.pending, vec![stored.id]);

        let village = register(&store, &scope, "location", "Eldoria Village");
        let types = BTreeSet::from(["location".to_string()]);
        let second = store
            .write(|db| resolver.resolve_incremental(db, &scope, &types, &[]))
            .unwrap();
        assert_eq!(second.resolved.len(), 1);
        assert_eq!(second.resolved[0].target_id, village);
        assert_eq!(second.resolved[0].kind, "character_location");

        // Nothing left to do.
        let third = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
        assert_eq!(third.attempted, 0);
        assert_eq!(store.read(|db| db.relationships(&scope)).unwrap().len(), 1);
    }

    #[test]
    fn test_unresolvable_after_limit() {
        let (store, scope) = setup();
        let resolver = Resolver::new(3);
        let kira = register(&store, &scope, "character", "Kira");
        let reference = CrossReference::pending(&scope, "character", kira, "location", "Nowhere");
        let (stored, _) = store.write(|db| db.insert_cross_ref(&reference)).unwrap();

        for _ in 0..2 {
            let summary = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
            assert_eq!(summary.pending.len(), 1);
        }
        let last = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
        assert_eq!(last.unresolvable, vec![stored.id]);

        // A late target doesn't revive it.
        register(&store, &scope, "location", "Nowhere");
        let after = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
        assert_eq!(after.attempted, 0);
        let row = store.read(|db| db.cross_ref(&scope, stored.id)).unwrap().unwrap();
        assert_eq!(row.status, RefStatus::Unresolvable);
        assert_eq!(row.attempts, 3);
    }

    #[test]
    fn test_reserved_target_without_row_is_a_miss() {
        let (store, scope) = setup();
        let resolver = Resolver::new(5);
        let kira = register(&store, &scope, "character", "Kira");
        let village = reserve(&store, &scope, "location", "Eldoria Village");
        let reference = CrossReference::pending(&scope, "character", kira, "location", "Eldoria Village");
        let (stored, _) = store.write(|db| db.insert_cross_ref(&reference)).unwrap();

        let summary = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
        assert!(summary.resolved.is_empty());
        assert_eq!(summary.pending, vec![stored.id]);
        assert!(store.read(|db| db.relationships(&scope)).unwrap().is_empty());

        // Once the row is written the same id resolves.
        write_row(&store, &scope, "location", "Eldoria Village", village);
        let summary = store.write(|db| resolver.resolve_all(db, &scope)).unwrap();
        assert_eq!(summary.resolved.len(), 1);
        assert_eq!(summary.resolved[0].target_id, village);
    }

    #[test]
    fn test_reinsert_keeps_status() {
        let (store, scope) = setup();
        let kira = register(&store, &scope, "character", "Kira");
        register(&store, &scope, "location", "Eldoria Village");
        let reference = CrossReference::pending(&scope, "character", kira, "location", "Eldoria Village");
        let (stored, created) = store.write(|db| db.insert_cross_ref(&reference)).unwrap();
        assert!(created);
        store
            .write(|db| Resolver::new(5).resolve_all(db, &scope))
            .unwrap();

        let again = CrossReference::pending(&scope, "character", kira, "location", "  eldoria village");
        let (existing, created) = store.write(|db| db.insert_cross_ref(&again)).unwrap();
        assert!(!created);
        assert_eq!(existing.id, stored.id);
        assert_eq!(existing.status, RefStatus::Resolved);
    }
}
