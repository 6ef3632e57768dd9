//! Manual-review queue rows.

use super::{corrupt, Db};
use crate::error::StoreError;
use crate::id::{EntityId, ReviewId, Scope};
use crate::review::{ReviewDecision, ReviewItem};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

const REVIEW_COLUMNS: &str = "id, tenant_id, world_id, entity_id, entity_type, field, \
     current_value, proposed_value, reason, skill, status, decision, created_at, resolved_at";

fn review_from_row(row: &Row<'_>) -> Result<ReviewItem, StoreError> {
    let current: String = row.get(6)?;
    let proposed: String = row.get(7)?;
    let decision: Option<String> = row.get(11)?;
    Ok(ReviewItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        world_id: row.get(2)?,
        entity_id: row.get(3)?,
        entity_type: row.get(4)?,
        field: row.get(5)?,
        current: serde_json::from_str(&current)?,
        proposed: serde_json::from_str(&proposed)?,
        reason: row.get(8)?,
        skill: row.get(9)?,
        status: row.get(10)?,
        decision: decision
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .map_err(|e| corrupt("review_queue", e))?,
        created_at: row.get(12)?,
        resolved_at: row.get(13)?,
    })
}

impl Db<'_> {
    /// Whether an identical conflict is already waiting for a reviewer.
    pub fn open_review_exists(
        &self,
        scope: &Scope,
        entity_id: EntityId,
        field: &str,
        proposed: &Value,
    ) -> Result<bool, StoreError> {
        let exists = self
            .conn
            .prepare_cached(
                "SELECT 1 FROM review_queue
                 WHERE tenant_id = ?1 AND world_id = ?2 AND entity_id = ?3 AND field = ?4
                   AND proposed_value = ?5 AND status = 'open'",
            )?
            .query_row(
                params![
                    scope.tenant(),
                    scope.world(),
                    entity_id,
                    field,
                    serde_json::to_string(proposed)?
                ],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Queue a conflict; returns `false` if the same one is already open.
    pub fn insert_review(&self, scope: &Scope, item: &ReviewItem) -> Result<bool, StoreError> {
        if self.open_review_exists(scope, item.entity_id, &item.field, &item.proposed)? {
            return Ok(false);
        }
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO review_queue ({REVIEW_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ))?
            .execute(params![
                item.id,
                scope.tenant(),
                scope.world(),
                item.entity_id,
                item.entity_type,
                item.field,
                serde_json::to_string(&item.current)?,
                serde_json::to_string(&item.proposed)?,
                item.reason,
                item.skill,
                item.status,
                item.decision
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                item.created_at,
                item.resolved_at
            ])?;
        Ok(true)
    }

    /// Review items of the scope, oldest first.
    pub fn reviews(&self, scope: &Scope, open_only: bool) -> Result<Vec<ReviewItem>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue
             WHERE tenant_id = ?1 AND world_id = ?2 AND (?3 = 0 OR status = 'open')
             ORDER BY created_at, id"
        ))?;
        let mut rows = stmt.query(params![scope.tenant(), scope.world(), open_only])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(review_from_row(row)?);
        }
        Ok(items)
    }

    pub fn review(&self, scope: &Scope, id: ReviewId) -> Result<Option<ReviewItem>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue
             WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3"
        ))?;
        let mut rows = stmt.query(params![scope.tenant(), scope.world(), id])?;
        match rows.next()? {
            Some(row) => Ok(Some(review_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Close an open item with the reviewer's decision.
    pub fn close_review(
        &self,
        scope: &Scope,
        id: ReviewId,
        decision: &ReviewDecision,
    ) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .prepare_cached(
                "UPDATE review_queue SET status = 'resolved', decision = ?4, resolved_at = ?5
                 WHERE tenant_id = ?1 AND world_id = ?2 AND id = ?3 AND status = 'open'",
            )?
            .execute(params![
                scope.tenant(),
                scope.world(),
                id,
                serde_json::to_string(decision)?,
                Utc::now()
            ])?;
        Ok(updated == 1)
    }
}
