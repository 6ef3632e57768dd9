//! Batch ingestion.
//!
//! Ingestion runs in two phases:
//!
//! 1. Outside any transaction, every entry is checked (type, envelope,
//!    attributes) and registered, so canonical ids are settled under the
//!    registry's per-key locks.
//! 2. One transaction then writes the rows (insert or version-guarded
//!    merge), queues review items, stores the batch's cross-references and
//!    runs the incremental resolution pass. A failure rolls all of it back.

use super::Engine;
use crate::batch::{BatchCrossRef, BatchEntity, BatchEntry, CrossRefEntry, ExtractionBatch};
use crate::catalog::{TypeSchema, Violation};
use crate::error::{EngineError, IntegrityError, StoreError};
use crate::id::{CrossRefId, EntityId, ReviewId, Scope, TenantId, WorldId};
use crate::merge::{FieldConflict, Incoming};
use crate::model::Entity;
use crate::registry::{normalize_name, Registration, Registry};
use crate::report::{EntityOutcome, MergeReport, RejectedRef, Rejection, RejectionReason};
use crate::resolver::{CrossReference, RefStatus, ResolvedRef};
use crate::review::{ReviewItem, ReviewStatus};
use crate::store::Db;
use crate::validate::FieldError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, info_span, warn};

/// An entity that passed phase 1.
struct Prepared<'b> {
    entity_type: &'b str,
    source: &'b BatchEntity,
    registration: Registration,
}

impl Prepared<'_> {
    fn outcome(&self, name: &str) -> EntityOutcome {
        EntityOutcome {
            entity_type: self.entity_type.to_string(),
            local_id: self.source.local_id.clone(),
            id: self.registration.id,
            name: name.to_string(),
            match_kind: self.registration.match_kind,
        }
    }
}

enum Written {
    Created(EntityOutcome),
    Merged(EntityOutcome),
    Unchanged(EntityOutcome),
}

/// Everything phase 2 produced; only reported once the transaction commits.
#[derive(Default)]
struct Committed {
    written: Vec<Written>,
    review_items: Vec<ReviewId>,
    pending_refs: Vec<CrossRefId>,
    resolved_refs: Vec<ResolvedRef>,
    unresolvable_refs: Vec<CrossRefId>,
    rejected_refs: Vec<RejectedRef>,
}

impl Engine {
    /// Ingest one extraction batch into a world.
    ///
    /// Never fails as a whole: rejected entities, unresolved references and
    /// storage failures are all reported in the returned [`MergeReport`].
    pub fn ingest(&self, scope: &Scope, batch: &ExtractionBatch) -> MergeReport {
        let span = info_span!(
            "ingest",
            tenant = %scope.tenant(),
            world = %scope.world(),
            skill = batch.skill().unwrap_or("-")
        );
        let _enter = span.enter();
        let mut report = MergeReport::default();

        match self.store.read(|db| db.check_scope(scope)) {
            Ok(()) => {}
            Err(StoreError::Integrity(err)) => {
                warn!(error = %err, "rejecting batch for unknown scope");
                reject_batch(&mut report, batch, RejectionReason::from(err));
                return report;
            }
            Err(err) => {
                let failure = err.to_string();
                reject_batch(&mut report, batch, RejectionReason::Storage(failure.clone()));
                report.failure = Some(failure);
                return report;
            }
        }

        let prepared = self.prepare(scope, batch, &mut report);

        match self.store.write(|db| self.commit(db, scope, batch, &prepared)) {
            Ok(committed) => {
                for written in committed.written {
                    match written {
                        Written::Created(o) => report.created.push(o),
                        Written::Merged(o) => report.merged.push(o),
                        Written::Unchanged(o) => report.unchanged.push(o),
                    }
                }
                report.review_items = committed.review_items;
                report.pending_refs = committed.pending_refs;
                report.resolved_refs = committed.resolved_refs;
                report.unresolvable_refs = committed.unresolvable_refs;
                report.rejected_refs.extend(committed.rejected_refs);
            }
            Err(err) => {
                let failure = err.to_string();
                warn!(error = %failure, "batch rolled back");
                for p in &prepared {
                    report.rejected.push(Rejection::new(
                        p.entity_type,
                        p.source.local_id.clone(),
                        p.source.display_name(),
                        RejectionReason::Storage(failure.clone()),
                    ));
                }
                report.failure = Some(failure);
            }
        }

        info!(
            created = report.created.len(),
            merged = report.merged.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            pending_refs = report.pending_refs.len(),
            resolved_refs = report.resolved_refs.len(),
            review_items = report.review_items.len(),
            "batch ingested"
        );
        report
    }

    /// Phase 1: check and register every entry.
    fn prepare<'b>(
        &self,
        scope: &Scope,
        batch: &'b ExtractionBatch,
        report: &mut MergeReport,
    ) -> Vec<Prepared<'b>> {
        let mut prepared = Vec::new();
        for group in &batch.groups {
            let entity_type = group.entity_type.as_str();
            for entry in &group.entries {
                let source = match entry {
                    BatchEntry::Entity(source) => source,
                    BatchEntry::Malformed { index, reason } => {
                        let reason = match index {
                            Some(i) => format!("entry {i}: {reason}"),
                            None => reason.clone(),
                        };
                        report.rejected.push(Rejection::new(
                            entity_type,
                            None,
                            "",
                            RejectionReason::Malformed(reason),
                        ));
                        continue;
                    }
                };
                match self.prepare_entity(scope, entity_type, source) {
                    Ok(registration) => {
                        report
                            .alias_candidates
                            .extend(registration.alias_candidates.iter().cloned());
                        prepared.push(Prepared {
                            entity_type,
                            source,
                            registration,
                        });
                    }
                    Err(reason) => {
                        debug!(entity_type, name = source.display_name(), %reason, "rejected entity");
                        report.rejected.push(Rejection::new(
                            entity_type,
                            source.local_id.clone(),
                            source.display_name(),
                            reason,
                        ));
                    }
                }
            }
        }
        prepared
    }

    fn prepare_entity(
        &self,
        scope: &Scope,
        entity_type: &str,
        source: &BatchEntity,
    ) -> Result<Registration, RejectionReason> {
        if !self.catalog.contains(entity_type) {
            return Err(RejectionReason::UnknownType);
        }
        check_envelope_scope(scope, source)?;

        let name = source.name.as_deref().unwrap_or("");
        let mut field_errors = Vec::new();
        if name.trim().is_empty() {
            field_errors.push(FieldError::new("name", Violation::Missing));
        }
        let validation = self
            .validator
            .validate(entity_type, &source.attributes)
            .map_err(|_| RejectionReason::UnknownType)?;
        field_errors.extend(validation.field_errors);
        if !field_errors.is_empty() {
            return Err(RejectionReason::Validation(field_errors));
        }

        self.registry
            .register_or_get(scope, entity_type, name, &source.attributes)
            .map_err(|err| match err {
                e if e.is_integrity() => RejectionReason::Integrity(e.to_string()),
                EngineError::Catalog(_) => RejectionReason::UnknownType,
                e => RejectionReason::Storage(e.to_string()),
            })
    }

    /// Phase 2: write rows, queue reviews, store and resolve references.
    fn commit(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        batch: &ExtractionBatch,
        prepared: &[Prepared<'_>],
    ) -> Result<Committed, StoreError> {
        let mut committed = Committed::default();
        let extracted_at = batch.metadata.extracted_at;
        let skill = batch.skill();

        for p in prepared {
            let schema = db.catalog().schema(p.entity_type)?;
            let written = self.write_entity(db, scope, schema, p, extracted_at, skill, &mut committed)?;
            committed.written.push(written);
        }

        // Rows written for the first time and newly bound aliases can
        // satisfy references that were waiting on them.
        let trigger_types: BTreeSet<String> = prepared
            .iter()
            .zip(&committed.written)
            .filter(|(p, written)| {
                matches!(written, Written::Created(_)) || !p.registration.new_aliases.is_empty()
            })
            .map(|(p, _)| p.entity_type.to_string())
            .collect();

        let local_ids: HashMap<(&str, &str), EntityId> = prepared
            .iter()
            .filter_map(|p| {
                p.source
                    .local_id
                    .as_deref()
                    .map(|local| ((p.entity_type, local), p.registration.id))
            })
            .collect();

        let mut fresh = Vec::new();
        let mut batch_refs = Vec::new();
        for (index, entry) in batch.cross_references.iter().enumerate() {
            let reference = match entry {
                CrossRefEntry::Ref(reference) => reference,
                CrossRefEntry::Malformed { index, reason } => {
                    committed.rejected_refs.push(RejectedRef {
                        index: *index,
                        source_type: None,
                        source_id: None,
                        target_hint: None,
                        reason: reason.clone(),
                    });
                    continue;
                }
            };
            match self.bind_reference(db, scope, reference, &local_ids)? {
                Ok(pending) => {
                    let (stored, created) = db.insert_cross_ref(&pending)?;
                    if stored.status == RefStatus::Pending {
                        batch_refs.push(stored.id);
                        if created {
                            fresh.push(stored);
                        }
                    }
                }
                Err(reason) => committed.rejected_refs.push(RejectedRef {
                    index,
                    source_type: Some(reference.source_type.clone()),
                    source_id: Some(reference.source_id.clone()),
                    target_hint: Some(reference.target_hint.clone()),
                    reason,
                }),
            }
        }

        let summary = self
            .resolver
            .resolve_incremental(db, scope, &trigger_types, &fresh)?;
        let settled: HashSet<CrossRefId> = summary
            .resolved
            .iter()
            .map(|r| r.cross_reference_id)
            .chain(summary.unresolvable.iter().copied())
            .collect();
        committed.pending_refs = batch_refs
            .into_iter()
            .filter(|id| !settled.contains(id))
            .collect();
        committed.resolved_refs = summary.resolved;
        committed.unresolvable_refs = summary.unresolvable;
        Ok(committed)
    }

    /// Insert or merge one entity, retrying stale writes.
    #[allow(clippy::too_many_arguments)]
    fn write_entity(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        schema: &TypeSchema,
        p: &Prepared<'_>,
        extracted_at: DateTime<Utc>,
        skill: Option<&str>,
        committed: &mut Committed,
    ) -> Result<Written, StoreError> {
        let id = p.registration.id;
        let max_retries = self.config.max_stale_retries;
        let mut attempts = 0u32;

        loop {
            match db.load_entity(scope, p.entity_type, id)? {
                None => {
                    let name = db
                        .index_entry(scope, id)?
                        .map(|e| e.display_name)
                        .unwrap_or_else(|| p.source.display_name().trim().to_string());
                    let entity = new_entity(scope, p, &name, extracted_at);
                    if db.insert_entity(&entity)? {
                        return Ok(Written::Created(p.outcome(&entity.name)));
                    }
                }
                Some(existing) => {
                    let outcome = self.merger.merge(
                        schema,
                        &existing,
                        Incoming {
                            description: p.source.description.as_deref(),
                            attributes: &p.source.attributes,
                            extracted_at,
                        },
                    );
                    let settled = !outcome.changed()
                        || db.update_entity(&outcome.entity, existing.version)?;
                    if settled {
                        for conflict in &outcome.conflicts {
                            if let Some(review) = queue_review(db, scope, &existing, conflict, skill)? {
                                committed.review_items.push(review);
                            }
                        }
                        let reported = p.outcome(&existing.name);
                        return Ok(if outcome.changed() {
                            debug!(id = %id, fields = ?outcome.changed_fields, "merged entity");
                            Written::Merged(reported)
                        } else {
                            Written::Unchanged(reported)
                        });
                    }
                }
            }

            attempts += 1;
            if attempts > max_retries {
                return Err(StoreError::StaleWrite {
                    id,
                    expected: db
                        .load_entity(scope, p.entity_type, id)?
                        .map_or(0, |e| e.version),
                    attempts,
                });
            }
            warn!(id = %id, attempts, "stale write, re-reading entity");
        }
    }

    /// Bind a batch reference to its source entity.
    ///
    /// The outer error aborts the batch; the inner one rejects the reference.
    fn bind_reference(
        &self,
        db: &Db<'_>,
        scope: &Scope,
        reference: &BatchCrossRef,
        local_ids: &HashMap<(&str, &str), EntityId>,
    ) -> Result<Result<CrossReference, String>, StoreError> {
        for entity_type in [&reference.source_type, &reference.target_type] {
            if !self.catalog.contains(entity_type) {
                return Ok(Err(format!("unknown entity type {entity_type:?}")));
            }
        }
        if normalize_name(&reference.target_hint).is_empty() {
            return Ok(Err("target_hint is blank".to_string()));
        }

        let source_type = reference.source_type.as_str();
        let raw = reference.source_id.trim();
        let mut source = local_ids.get(&(source_type, raw)).copied();
        if source.is_none() {
            if let Ok(id) = raw.parse::<EntityId>() {
                source = db
                    .index_entry(scope, id)?
                    .filter(|e| e.entity_type == source_type)
                    .map(|e| e.id);
            }
        }
        if source.is_none() {
            source = Registry::lookup_in(db, scope, source_type, &normalize_name(raw))?.map(|(id, _)| id);
        }
        // Only batch-local ids are certain to have a row by now.
        if let Some(id) = source {
            if !db.entity_exists(scope, source_type, id)? {
                source = None;
            }
        }
        let Some(source_id) = source else {
            return Ok(Err(format!("no {source_type} matches source_id {raw:?}")));
        };

        Ok(Ok(CrossReference::pending(
            scope,
            source_type,
            source_id,
            reference.target_type.clone(),
            reference.target_hint.trim(),
        )
        .with_target_skill(reference.target_skill.clone())))
    }
}

fn new_entity(scope: &Scope, p: &Prepared<'_>, name: &str, extracted_at: DateTime<Utc>) -> Entity {
    let now = Utc::now();
    Entity {
        id: p.registration.id,
        tenant_id: scope.tenant().clone(),
        world_id: scope.world(),
        entity_type: p.entity_type.to_string(),
        name: name.to_string(),
        description: p
            .source
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        attributes: p
            .source
            .attributes
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        created_at: now,
        updated_at: now,
        source_at: extracted_at,
        version: 1,
    }
}

fn queue_review(
    db: &Db<'_>,
    scope: &Scope,
    entity: &Entity,
    conflict: &FieldConflict,
    skill: Option<&str>,
) -> Result<Option<ReviewId>, StoreError> {
    let item = ReviewItem {
        id: ReviewId::new(),
        tenant_id: scope.tenant().clone(),
        world_id: scope.world(),
        entity_id: entity.id,
        entity_type: entity.entity_type.clone(),
        field: conflict.field.clone(),
        current: conflict.current.clone(),
        proposed: conflict.proposed.clone(),
        reason: conflict.reason.describe().to_string(),
        skill: skill.map(str::to_string),
        status: ReviewStatus::Open,
        decision: None,
        created_at: Utc::now(),
        resolved_at: None,
    };
    if db.insert_review(scope, &item)? {
        info!(entity = %entity.id, field = %item.field, reason = %item.reason, "queued for review");
        Ok(Some(item.id))
    } else {
        Ok(None)
    }
}

/// Entity-level tenant/world fields must agree with the ingest scope.
fn check_envelope_scope(scope: &Scope, source: &BatchEntity) -> Result<(), IntegrityError> {
    if let Some(raw) = &source.tenant_id {
        let matches = TenantId::new(raw).is_ok_and(|t| &t == scope.tenant());
        if !matches {
            return Err(IntegrityError::ScopeMismatch {
                field: "tenant_id",
                expected: scope.tenant().to_string(),
                found: raw.clone(),
            });
        }
    }
    if let Some(raw) = &source.world_id {
        let matches = raw.trim().parse::<WorldId>().is_ok_and(|w| w == scope.world());
        if !matches {
            return Err(IntegrityError::ScopeMismatch {
                field: "world_id",
                expected: scope.world().to_string(),
                found: raw.clone(),
            });
        }
    }
    Ok(())
}

fn reject_batch(report: &mut MergeReport, batch: &ExtractionBatch, reason: RejectionReason) {
    for group in &batch.groups {
        for entry in &group.entries {
            let (local_id, name) = match entry {
                BatchEntry::Entity(e) => (e.local_id.clone(), e.display_name().to_string()),
                BatchEntry::Malformed { .. } => (None, String::new()),
            };
            report.rejected.push(Rejection::new(
                group.entity_type.as_str(),
                local_id,
                name,
                reason.clone(),
            ));
        }
    }
    for (index, entry) in batch.cross_references.iter().enumerate() {
        let (source_type, source_id, target_hint) = match entry {
            CrossRefEntry::Ref(r) => (
                Some(r.source_type.clone()),
                Some(r.source_id.clone()),
                Some(r.target_hint.clone()),
            ),
            CrossRefEntry::Malformed { .. } => (None, None, None),
        };
        report.rejected_refs.push(RejectedRef {
            index,
            source_type,
            source_id,
            target_hint,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorld;
    use serde_json::json;

    fn setup() -> (Engine, Scope) {
        let engine = Engine::in_memory().unwrap();
        let world = engine.create_world("acme", NewWorld::new("Aerth")).unwrap();
        let scope = engine.scope("acme", world.id).unwrap();
        (engine, scope)
    }

    fn batch(value: serde_json::Value) -> ExtractionBatch {
        ExtractionBatch::from_value(value).unwrap()
    }

    #[test]
    fn test_envelope_scope_mismatch() {
        let (engine, scope) = setup();
        let report = engine.ingest(
            &scope,
            &batch(json!({
                "character": [
                    { "name": "Kira", "tenant_id": "globex" },
                    { "name": "Mara", "world_id": "not-a-uuid" },
                    { "name": "Tova", "tenant_id": "acme", "world_id": scope.world().to_string() }
                ]
            })),
        );
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(report
            .rejected
            .iter()
            .all(|r| matches!(r.reason, RejectionReason::Integrity(_))));
    }

    #[test]
    fn test_unknown_type_and_blank_name() {
        let (engine, scope) = setup();
        let report = engine.ingest(
            &scope,
            &batch(json!({
                "starship": [{ "name": "Dawn" }],
                "character": [{ "name": "  " }, { "name": "Kira" }]
            })),
        );
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(report
            .rejected
            .iter()
            .any(|r| r.reason == RejectionReason::UnknownType));
        assert!(report.rejected.iter().any(|r| matches!(
            &r.reason,
            RejectionReason::Validation(errors) if errors[0].field == "name"
        )));
    }

    #[test]
    fn test_reference_source_binding() {
        let (engine, scope) = setup();
        let first = engine.ingest(&scope, &batch(json!({ "character": [{ "name": "Kira" }] })));
        let kira = first.created[0].id;

        let report = engine.ingest(
            &scope,
            &batch(json!({
                "location": [{ "id": "l1", "name": "Eldoria Village" }],
                "cross_references": [
                    { "source_type": "location", "source_id": "l1",
                      "target_type": "character", "target_hint": "Kira" },
                    { "source_type": "character", "source_id": kira.to_string(),
                      "target_type": "location", "target_hint": "Eldoria Village" },
                    { "source_type": "character", "source_id": "kira",
                      "target_type": "faction", "target_hint": "Eldorian Council" },
                    { "source_type": "character", "source_id": "nobody",
                      "target_type": "location", "target_hint": "Eldoria Village" },
                    { "source_type": "character", "source_id": "kira",
                      "target_type": "starship", "target_hint": "Dawn" },
                    { "source_type": "character", "source_id": "kira",
                      "target_type": "location", "target_hint": "   " }
                ]
            })),
        );
        assert_eq!(report.resolved_refs.len(), 2);
        assert_eq!(report.pending_refs.len(), 1);
        assert_eq!(report.rejected_refs.len(), 3);
        let indexes: Vec<usize> = report.rejected_refs.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![3, 4, 5]);
    }
}
