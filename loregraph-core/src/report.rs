//! Per-batch ingestion report.

use crate::error::IntegrityError;
use crate::id::{CrossRefId, EntityId, ReviewId};
use crate::registry::{AliasCandidate, MatchKind};
use crate::resolver::ResolvedRef;
use crate::validate::FieldError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An entity the batch created, merged or left unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_type: String,
    pub local_id: Option<String>,
    pub id: EntityId,
    pub name: String,
    pub match_kind: MatchKind,
}

/// Why an entity was not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Field-level schema violations.
    Validation(Vec<FieldError>),
    /// The type has no catalog entry.
    UnknownType,
    /// Missing or inconsistent tenant/world information.
    Integrity(String),
    /// The entry could not be read at all.
    Malformed(String),
    /// The batch transaction failed; nothing was written.
    Storage(String),
}

impl From<IntegrityError> for RejectionReason {
    fn from(err: IntegrityError) -> Self {
        RejectionReason::Integrity(err.to_string())
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Validation(errors) => {
                let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
                write!(f, "validation failed: {}", errors.join("; "))
            }
            RejectionReason::UnknownType => write!(f, "unknown entity type"),
            RejectionReason::Integrity(reason) => write!(f, "integrity error: {reason}"),
            RejectionReason::Malformed(reason) => write!(f, "malformed entry: {reason}"),
            RejectionReason::Storage(reason) => write!(f, "storage failure: {reason}"),
        }
    }
}

/// An entity that was not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub entity_type: String,
    pub local_id: Option<String>,
    pub name: String,
    pub reason: RejectionReason,
}

impl Rejection {
    pub fn new(
        entity_type: impl Into<String>,
        local_id: Option<String>,
        name: impl Into<String>,
        reason: RejectionReason,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            local_id,
            name: name.into(),
            reason,
        }
    }
}

/// A cross-reference that was not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRef {
    /// Position in the batch's `cross_references` list.
    pub index: usize,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub target_hint: Option<String>,
    pub reason: String,
}

/// Everything that happened to one batch.
///
/// Ingestion never fails as a whole; problems end up in here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub created: Vec<EntityOutcome>,
    pub merged: Vec<EntityOutcome>,
    pub unchanged: Vec<EntityOutcome>,
    pub rejected: Vec<Rejection>,
    /// References of this batch still waiting for a target.
    pub pending_refs: Vec<CrossRefId>,
    /// References resolved while ingesting this batch, from any batch.
    pub resolved_refs: Vec<ResolvedRef>,
    pub unresolvable_refs: Vec<CrossRefId>,
    pub rejected_refs: Vec<RejectedRef>,
    /// Review items opened by this batch.
    pub review_items: Vec<ReviewId>,
    pub alias_candidates: Vec<AliasCandidate>,
    /// Set when the batch transaction failed and was rolled back.
    pub failure: Option<String>,
}

impl MergeReport {
    /// Entities written or confirmed by the batch.
    pub fn accepted(&self) -> usize {
        self.created.len() + self.merged.len() + self.unchanged.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Canonical id assigned to a batch-local id, if it was accepted.
    pub fn id_for(&self, local_id: &str) -> Option<EntityId> {
        self.created
            .iter()
            .chain(&self.merged)
            .chain(&self.unchanged)
            .find(|o| o.local_id.as_deref() == Some(local_id))
            .map(|o| o.id)
    }

    /// Canonical id of an accepted entity by (type, exact display name).
    pub fn id_named(&self, entity_type: &str, name: &str) -> Option<EntityId> {
        self.created
            .iter()
            .chain(&self.merged)
            .chain(&self.unchanged)
            .find(|o| o.entity_type == entity_type && o.name == name)
            .map(|o| o.id)
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} merged, {} unchanged, {} rejected; refs: {} pending, {} resolved, {} unresolvable, {} rejected; {} review items",
            self.created.len(),
            self.merged.len(),
            self.unchanged.len(),
            self.rejected.len(),
            self.pending_refs.len(),
            self.resolved_refs.len(),
            self.unresolvable_refs.len(),
            self.rejected_refs.len(),
            self.review_items.len()
        )?;
        if let Some(failure) = &self.failure {
            write!(f, " (failed: {failure})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(local_id: &str) -> EntityOutcome {
        EntityOutcome {
            entity_type: "character".to_string(),
            local_id: Some(local_id.to_string()),
            id: EntityId::new(),
            name: "Kira".to_string(),
            match_kind: MatchKind::Unmatched,
        }
    }

    #[test]
    fn test_display_counts() {
        let mut report = MergeReport::default();
        report.created.push(outcome("c1"));
        report.rejected.push(Rejection::new(
            "character",
            None,
            "",
            RejectionReason::UnknownType,
        ));
        report.failure = Some("disk full".to_string());
        let text = report.to_string();
        assert!(text.starts_with("1 created, 0 merged, 0 unchanged, 1 rejected"));
        assert!(text.ends_with("(failed: disk full)"));
        assert!(report.is_failed());
    }

    #[test]
    fn test_id_for_local_id() {
        let mut report = MergeReport::default();
        let kira = outcome("c1");
        let id = kira.id;
        report.unchanged.push(kira);
        assert_eq!(report.id_for("c1"), Some(id));
        assert_eq!(report.id_for("c9"), None);
    }
}
