//! Schema catalog for entity types.
//!
//! The catalog is a read-only table built once at startup. It maps each
//! entity type name to its attribute definitions, validation constraints and
//! per-field merge policies, and lists the relationship kinds that resolved
//! cross-references may produce.
//!
//! ## Sources
//!
//! ```text
//! #[derive(EntitySchema)] structs ──┐
//! thin type names ──────────────────┼──▶ CatalogBuilder ──build()──▶ Catalog
//! catalog JSON files ───────────────┘        (validates identifiers,
//!                                             tables, constraints)
//! ```

mod builtin;
mod constraint;

pub use builtin::{
    Ability, Character, Creature, Event, Faction, Item, Location, Quest, BUILTIN_RELATIONSHIP_KINDS,
    THIN_TYPES,
};
pub use constraint::{AttrKind, Constraint, Violation};

use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Relationship kind used when no declared kind matches a type pair.
pub const GENERIC_RELATIONSHIP_KIND: &str = "references";

/// Tables owned by the persistence layer itself.
pub const RESERVED_TABLES: &[&str] = &[
    "worlds",
    "entities",
    "entity_index",
    "entity_aliases",
    "relationships",
    "cross_references",
    "review_queue",
];

/// Envelope fields every entity carries; attributes may not reuse them.
pub const ENVELOPE_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "world_id",
    "entity_type",
    "name",
    "description",
    "created_at",
    "updated_at",
    "source_at",
    "version",
    "extra",
];

/// Rule for reconciling two values of the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Set union of list values, de-duplicated.
    Union,
    /// Numeric maximum; recorded stats never regress.
    Max,
    /// Newest batch wins, unless that would discard materially different text.
    LastWriteWins,
}

/// Definition of one type-specific attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttrKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergePolicy>,
}

impl AttributeDef {
    /// Create an optional attribute with no constraints or merge policy.
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: None,
            constraints: Vec::new(),
            merge: None,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_merge(mut self, policy: MergePolicy) -> Self {
        self.merge = Some(policy);
        self
    }
}

/// Attribute shape of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bespoke table; `None` stores the type in the generic `entities` table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Reject attributes that aren't declared.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

impl TypeSchema {
    /// Create a thin type with no declared attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            table: None,
            strict: false,
            attributes: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Look up a declared attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Merge policy of a field; `None` for undeclared fields too.
    pub fn merge_policy(&self, field: &str) -> Option<MergePolicy> {
        self.attribute(field).and_then(|a| a.merge)
    }

    /// Whether the type lives in its own table.
    pub fn is_bespoke(&self) -> bool {
        self.table.is_some()
    }

    /// Table holding rows of this type.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or("entities")
    }
}

/// Per-type validation rules, as handed to the validator.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintSet {
    pub entity_type: String,
    pub strict: bool,
    pub rules: Vec<FieldRule>,
}

/// Validation rules for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub field: String,
    pub kind: AttrKind,
    pub required: bool,
    pub constraints: Vec<Constraint>,
}

impl ConstraintSet {
    fn from_schema(schema: &TypeSchema) -> Self {
        Self {
            entity_type: schema.name.clone(),
            strict: schema.strict,
            rules: schema
                .attributes
                .iter()
                .map(|a| FieldRule {
                    field: a.name.clone(),
                    kind: a.kind,
                    required: a.required,
                    constraints: a.constraints.clone(),
                })
                .collect(),
        }
    }

    pub fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.field == field)
    }
}

/// A declared relationship kind between two entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipKindDef {
    pub name: String,
    pub source_type: String,
    pub target_type: String,
}

impl RelationshipKindDef {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            target_type: target_type.into(),
        }
    }
}

/// Implemented by structs that declare an entity type.
///
/// Usually derived with `#[derive(EntitySchema)]`.
pub trait EntitySchema {
    /// Catalog name of the type.
    const ENTITY_TYPE: &'static str;

    /// Full attribute schema of the type.
    fn type_schema() -> TypeSchema;
}

/// On-disk catalog document.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    types: Vec<TypeSchema>,
    #[serde(default)]
    thin_types: Vec<String>,
    #[serde(default)]
    relationship_kinds: Vec<RelationshipKindDef>,
}

/// The read-only schema catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    types: BTreeMap<String, TypeSchema>,
    relationship_kinds: Vec<RelationshipKindDef>,
}

impl Catalog {
    /// Start an empty catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Builder pre-loaded with the built-in types and relationship kinds.
    pub fn builtin_builder() -> CatalogBuilder {
        builtin::builder()
    }

    /// The built-in catalog.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::builtin_builder().build()
    }

    /// Load a catalog from a JSON file (without the built-in types).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::builder().with_json(&content)?.build()
    }

    /// Schema of a type.
    pub fn schema(&self, entity_type: &str) -> Result<&TypeSchema, CatalogError> {
        self.types
            .get(entity_type)
            .ok_or_else(|| CatalogError::UnknownType(entity_type.to_string()))
    }

    /// Validation rules of a type.
    pub fn constraints_for(&self, entity_type: &str) -> Result<ConstraintSet, CatalogError> {
        self.schema(entity_type).map(ConstraintSet::from_schema)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.types.contains_key(entity_type)
    }

    /// All schemas, ordered by type name.
    pub fn types(&self) -> impl Iterator<Item = &TypeSchema> {
        self.types.values()
    }

    /// Types stored in their own tables.
    pub fn bespoke_types(&self) -> impl Iterator<Item = &TypeSchema> {
        self.types.values().filter(|s| s.is_bespoke())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn relationship_kinds(&self) -> &[RelationshipKindDef] {
        &self.relationship_kinds
    }

    /// Relationship kind for a resolved link between two types.
    pub fn relationship_kind(&self, source_type: &str, target_type: &str) -> &str {
        self.relationship_kinds
            .iter()
            .find(|k| k.source_type == source_type && k.target_type == target_type)
            .map(|k| k.name.as_str())
            .unwrap_or(GENERIC_RELATIONSHIP_KIND)
    }
}

/// Collects type schemas and relationship kinds, then validates them.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    types: Vec<TypeSchema>,
    relationship_kinds: Vec<RelationshipKindDef>,
}

impl CatalogBuilder {
    /// Register a derived schema.
    pub fn register<T: EntitySchema>(self) -> Self {
        self.with_type(T::type_schema())
    }

    pub fn with_type(mut self, schema: TypeSchema) -> Self {
        self.types.push(schema);
        self
    }

    /// Register thin types (no declared attributes, generic table).
    pub fn with_thin_types<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types
            .extend(names.into_iter().map(|name| TypeSchema::new(name)));
        self
    }

    pub fn with_relationship_kind(mut self, kind: RelationshipKindDef) -> Self {
        self.relationship_kinds.push(kind);
        self
    }

    /// Add everything declared in a catalog JSON document.
    ///
    /// A type in the document replaces an earlier type of the same name, so
    /// a file can refine the built-in schemas.
    pub fn with_json(mut self, json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        for schema in file
            .types
            .into_iter()
            .chain(file.thin_types.into_iter().map(TypeSchema::new))
        {
            self.types.retain(|t| t.name != schema.name);
            self.types.push(schema);
        }
        self.relationship_kinds.extend(file.relationship_kinds);
        Ok(self)
    }

    /// Validate and freeze the catalog.
    pub fn build(self) -> Result<Catalog, CatalogError> {
        let mut types = BTreeMap::new();
        let mut tables: HashSet<String> = RESERVED_TABLES.iter().map(|t| t.to_string()).collect();

        for schema in self.types {
            check_identifier(&schema.name)?;
            if let Some(table) = &schema.table {
                check_identifier(table)?;
                if !tables.insert(table.clone()) {
                    return Err(CatalogError::TableConflict {
                        entity_type: schema.name.clone(),
                        table: table.clone(),
                    });
                }
            }
            check_attributes(&schema)?;
            if types.contains_key(&schema.name) {
                return Err(CatalogError::DuplicateType(schema.name));
            }
            types.insert(schema.name.clone(), schema);
        }

        let mut relationship_kinds: Vec<RelationshipKindDef> = Vec::new();
        for kind in self.relationship_kinds {
            check_identifier(&kind.name)?;
            for entity_type in [&kind.source_type, &kind.target_type] {
                if !types.contains_key(entity_type) {
                    return Err(CatalogError::UnknownRelationshipType {
                        kind: kind.name.clone(),
                        entity_type: entity_type.clone(),
                    });
                }
            }
            if !relationship_kinds.contains(&kind) {
                relationship_kinds.push(kind);
            }
        }

        Ok(Catalog {
            types,
            relationship_kinds,
        })
    }
}

fn check_attributes(schema: &TypeSchema) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for attribute in &schema.attributes {
        check_identifier(&attribute.name)?;
        let invalid = |reason: String| CatalogError::InvalidConstraint {
            entity_type: schema.name.clone(),
            attribute: attribute.name.clone(),
            reason,
        };
        if ENVELOPE_FIELDS.contains(&attribute.name.as_str()) {
            return Err(invalid("shadows an envelope field".to_string()));
        }
        if !seen.insert(attribute.name.as_str()) {
            return Err(invalid("declared twice".to_string()));
        }
        for constraint in &attribute.constraints {
            if !constraint.applies_to(attribute.kind) {
                return Err(invalid(format!(
                    "{constraint:?} does not apply to {} values",
                    attribute.kind
                )));
            }
            if let Constraint::Range { min, max } = constraint {
                if min > max {
                    return Err(invalid(format!("empty range {min}..={max}")));
                }
            }
        }
        match (attribute.merge, attribute.kind) {
            (Some(MergePolicy::Union), kind) if kind != AttrKind::List => {
                return Err(invalid("union merge needs a list attribute".to_string()));
            }
            (Some(MergePolicy::Max), kind) if !kind.is_numeric() => {
                return Err(invalid("max merge needs a numeric attribute".to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Accept `[a-z_][a-z0-9_]*` so names can be spliced into DDL.
pub(crate) fn check_identifier(name: &str) -> Result<(), CatalogError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if !valid || name.starts_with("sqlite_") {
        return Err(CatalogError::InvalidIdentifier {
            name: name.to_string(),
            reason: "expected lowercase letters, digits and underscores".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_builds() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.contains("character"));
        assert!(catalog.contains("trade_route"));
        assert!(catalog.schema("character").unwrap().is_bespoke());
        assert!(!catalog.schema("trade_route").unwrap().is_bespoke());
        assert_eq!(
            catalog.relationship_kind("faction", "location"),
            "faction_territory"
        );
        assert_eq!(
            catalog.relationship_kind("trade_route", "location"),
            GENERIC_RELATIONSHIP_KIND
        );
    }

    #[test]
    fn test_constraints_for_unknown_type() {
        let catalog = Catalog::builtin().unwrap();
        assert!(matches!(
            catalog.constraints_for("starship"),
            Err(CatalogError::UnknownType(t)) if t == "starship"
        ));
    }

    #[test]
    fn test_constraints_for_character() {
        let catalog = Catalog::builtin().unwrap();
        let set = catalog.constraints_for("character").unwrap();
        let backstory = set.rule("backstory").unwrap();
        assert_eq!(backstory.kind, AttrKind::Text);
        assert!(backstory.constraints.contains(&Constraint::MinLength(100)));
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let result = Catalog::builder()
            .with_type(TypeSchema::new("Drop Table"))
            .build();
        assert!(matches!(result, Err(CatalogError::InvalidIdentifier { .. })));
    }

    #[test]
    fn test_rejects_reserved_table() {
        let result = Catalog::builder()
            .with_type(TypeSchema::new("shadow").with_table("worlds"))
            .build();
        assert!(matches!(result, Err(CatalogError::TableConflict { .. })));
    }

    #[test]
    fn test_rejects_mismatched_merge_policy() {
        let result = Catalog::builder()
            .with_type(
                TypeSchema::new("spell").with_attribute(
                    AttributeDef::new("school", AttrKind::Text).with_merge(MergePolicy::Max),
                ),
            )
            .build();
        assert!(matches!(result, Err(CatalogError::InvalidConstraint { .. })));
    }

    #[test]
    fn test_relationship_kind_needs_known_types() {
        let result = Catalog::builder()
            .with_thin_types(["spell"])
            .with_relationship_kind(RelationshipKindDef::new("taught_by", "spell", "mentor"))
            .build();
        assert!(matches!(
            result,
            Err(CatalogError::UnknownRelationshipType { .. })
        ));
    }

    #[test]
    fn test_json_refines_builtin_type() {
        let json = r#"{
            "types": [{
                "name": "spell",
                "attributes": [
                    {"name": "mana_cost", "kind": "integer", "required": true,
                     "constraints": ["non_negative"], "merge": "max"}
                ]
            }],
            "thin_types": ["rune"],
            "relationship_kinds": [
                {"name": "spell_caster", "source_type": "spell", "target_type": "character"}
            ]
        }"#;
        let catalog = Catalog::builtin_builder()
            .with_json(json)
            .unwrap()
            .build()
            .unwrap();
        let spell = catalog.schema("spell").unwrap();
        assert_eq!(spell.merge_policy("mana_cost"), Some(MergePolicy::Max));
        assert!(catalog.contains("rune"));
        assert_eq!(catalog.relationship_kind("spell", "character"), "spell_caster");
    }
}
