//! Manual-review queue items and reviewer decisions.

use crate::id::{EntityId, ReviewId, TenantId, WorldId};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a review item still needs a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Open,
    Resolved,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Open => "open",
            ReviewStatus::Resolved => "resolved",
        }
    }
}

impl ToSql for ReviewStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ReviewStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "open" => Ok(ReviewStatus::Open),
            "resolved" => Ok(ReviewStatus::Resolved),
            other => Err(FromSqlError::Other(
                format!("unknown review status {other:?}").into(),
            )),
        }
    }
}

/// A reviewer's ruling on a queued conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Leave the stored value as it is.
    KeepCurrent,
    /// Take the value the batch proposed.
    AcceptProposed,
    /// Store a value supplied by the reviewer.
    Replace(Value),
}

/// A merge conflict waiting for (or decided by) a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: ReviewId,
    pub tenant_id: TenantId,
    pub world_id: WorldId,
    pub entity_id: EntityId,
    pub entity_type: String,
    pub field: String,
    /// Value kept on the entity while the item is open.
    pub current: Value,
    pub proposed: Value,
    pub reason: String,
    /// Skill of the batch that proposed the value.
    pub skill: Option<String>,
    pub status: ReviewStatus,
    pub decision: Option<ReviewDecision>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn is_open(&self) -> bool {
        self.status == ReviewStatus::Open
    }

    /// The value the entity should hold after `decision`.
    pub fn value_for(&self, decision: &ReviewDecision) -> Value {
        match decision {
            ReviewDecision::KeepCurrent => self.current.clone(),
            ReviewDecision::AcceptProposed => self.proposed.clone(),
            ReviewDecision::Replace(value) => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_serialization() {
        let keep = serde_json::to_value(ReviewDecision::KeepCurrent).unwrap();
        assert_eq!(keep, json!({ "decision": "keep_current" }));

        let replace = serde_json::to_value(ReviewDecision::Replace(json!("merged text"))).unwrap();
        assert_eq!(replace, json!({ "decision": "replace", "value": "merged text" }));
    }
}
