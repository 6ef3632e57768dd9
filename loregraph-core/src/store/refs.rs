//! Cross-reference and relationship rows.

use super::Db;
use crate::error::StoreError;
use crate::id::{CrossRefId, EntityId, Scope};
use crate::model::Relationship;
use crate::registry::normalize_name;
use crate::resolver::{CrossReference, RefStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const REF_COLUMNS: &str = "id, tenant_id, world_id, source_type, source_id, target_type, \
     target_skill, target_hint, status, resolved_target_id, attempts, created_at, updated_at";

const RELATIONSHIP_COLUMNS: &str =
    "id, tenant_id, world_id, kind, source_id, target_id, cross_reference_id, created_at";

fn cross_ref_from_row(row: &Row<'_>) -> rusqlite::Result<CrossReference> {
    Ok(CrossReference {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        world_id: row.get(2)?,
        source_type: row.get(3)?,
        source_id: row.get(4)?,
        target_type: row.get(5)?,
        target_skill: row.get(6)?,
        target_hint: row.get(7)?,
        status: row.get(8)?,
        resolved_target_id: row.get(9)?,
        attempts: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        world_id: row.get(2)?,
        kind: row.get(3)?,
        source_id: row.get(4)?,
        target_id: row.get(5)?,
        cross_reference_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Db<'_> {
    /// Insert a cross-reference unless its natural key is already stored.
    ///
    /// Returns the stored row and whether this call created it. An existing
    /// row keeps its status, so re-ingesting never resets a resolved link.
    pub fn insert_cross_ref(
        &self,
        reference: &CrossReference,
    ) -> Result<(CrossReference, bool), StoreError> {
        let hint_key = normalize_name(&reference.target_hint);
        let inserted = self
            .conn
            .prepare_cached(&format!(
                "INSERT OR IGNORE INTO cross_references ({REF_COLUMNS}, hint_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ))?
            .execute(params![
                reference.id,
                reference.tenant_id,
                reference.world_id,
                reference.source_type,
                reference.source_id,
                reference.target_type,
                reference.target_skill,
                reference.target_hint,
                reference.status,
                reference.resolved_target_id,
                reference.attempts,
                reference.created_at,
                reference.updated_at,
                hint_key
            ])?;
        let stored = self
            .conn
            .prepare_cached(&format!(
                "SELECT {REF_COLUMNS} FROM cross_references
                 WHERE tenant_id = ?1 AND world_id = ?2 AND source_type = ?3 AND source_id = ?4
                   AND target_type = ?5 AND hint_key = ?6"
            ))?
            .query_row(
                params![
                    reference.tenant_id,
                    reference.world_id,
                    reference.source_type,
                    reference.source_id,
                    reference.target_type,
                    hint_key
                ],
                cross_ref_from_row,
            )?;
        Ok((stored, inserted == 1))
    }

    pub fn cross_ref(
        &self,
        scope: &Scope,
        id: CrossRefId,
    ) -> Result<Option<CrossReference>, StoreError> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "SELECT {REF_COLUMNS} FROM cross_references
                 WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3"
            ))?
            .query_row(params![scope.tenant(), scope.world(), id], cross_ref_from_row)
            .optional()?)
    }

    /// Cross-references of the scope, optionally limited to one status.
    pub fn cross_refs(
        &self,
        scope: &Scope,
        status: Option<RefStatus>,
    ) -> Result<Vec<CrossReference>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {REF_COLUMNS} FROM cross_references
             WHERE tenant_id = ?1 AND world_id = ?2 AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(
            params![scope.tenant(), scope.world(), status],
            cross_ref_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Pending cross-references waiting on one target type.
    pub fn pending_refs_for(
        &self,
        scope: &Scope,
        target_type: &str,
    ) -> Result<Vec<CrossReference>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {REF_COLUMNS} FROM cross_references
             WHERE tenant_id = ?1 AND world_id = ?2 AND target_type = ?3 AND status = 'pending'
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(
            params![scope.tenant(), scope.world(), target_type],
            cross_ref_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Move a pending reference to resolved.
    ///
    /// Returns `false` if the reference had already left `pending`.
    pub fn mark_resolved(
        &self,
        scope: &Scope,
        id: CrossRefId,
        target: EntityId,
    ) -> Result<bool, StoreError> {
        let updated = self.conn.prepare_cached(
            "UPDATE cross_references
             SET status = 'resolved', resolved_target_id = ?4, updated_at = ?5
             WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3 AND status = 'pending'",
        )?
        .execute(params![scope.tenant(), scope.world(), id, target, Utc::now()])?;
        Ok(updated == 1)
    }

    /// Count a pass that found no target.
    ///
    /// The reference turns unresolvable once `max_passes` passes have
    /// missed. Returns the new status, or `None` if it was not pending.
    pub fn record_miss(
        &self,
        scope: &Scope,
        id: CrossRefId,
        max_passes: u32,
    ) -> Result<Option<RefStatus>, StoreError> {
        let updated = self.conn.prepare_cached(
            "UPDATE cross_references
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= ?4 THEN 'unresolvable' ELSE 'pending' END,
                 updated_at = ?5
             WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3 AND status = 'pending'",
        )?
        .execute(params![scope.tenant(), scope.world(), id, max_passes, Utc::now()])?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(self.cross_ref(scope, id)?.map(|r| r.status))
    }

    /// Insert a relationship unless its cross-reference already produced one.
    pub fn insert_relationship(&self, relationship: &Relationship) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .prepare_cached(&format!(
                "INSERT OR IGNORE INTO relationships ({RELATIONSHIP_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))?
            .execute(params![
                relationship.id,
                relationship.tenant_id,
                relationship.world_id,
                relationship.kind,
                relationship.source_id,
                relationship.target_id,
                relationship.cross_reference_id,
                relationship.created_at
            ])?;
        Ok(inserted == 1)
    }

    pub fn relationships(&self, scope: &Scope) -> Result<Vec<Relationship>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
             WHERE tenant_id = ?1 AND world_id = ?2 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![scope.tenant(), scope.world()], relationship_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Relationships with the entity at either end.
    pub fn relationships_of(
        &self,
        scope: &Scope,
        entity_id: EntityId,
    ) -> Result<Vec<Relationship>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
             WHERE tenant_id = ?1 AND world_id = ?2 AND (source_id = ?3 OR target_id = ?3)
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(
            params![scope.tenant(), scope.world(), entity_id],
            relationship_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
