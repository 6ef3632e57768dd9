//! Schema validation of incoming entities.
//!
//! Validation runs before anything is written. A failing entity is rejected
//! on its own; the rest of its batch carries on.

use crate::catalog::{AttrKind, Catalog, Constraint, ConstraintSet, Violation};
use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// One field that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub violation: Violation,
}

impl FieldError {
    pub fn new(field: impl Into<String>, violation: Violation) -> Self {
        Self {
            field: field.into(),
            violation,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.violation)
    }
}

/// Outcome of validating one entity's attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub field_errors: Vec<FieldError>,
}

impl ValidationResult {
    fn from_errors(field_errors: Vec<FieldError>) -> Self {
        Self {
            ok: field_errors.is_empty(),
            field_errors,
        }
    }

    /// Errors for one field.
    pub fn errors_for(&self, field: &str) -> impl Iterator<Item = &FieldError> {
        let field = field.to_string();
        self.field_errors.iter().filter(move |e| e.field == field)
    }
}

/// Checks attribute maps against the catalog.
#[derive(Debug, Clone)]
pub struct Validator {
    catalog: Arc<Catalog>,
}

impl Validator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Validate the type-specific attributes of one entity.
    ///
    /// Fails only when the type is unknown; field problems are reported in
    /// the result.
    pub fn validate(
        &self,
        entity_type: &str,
        attrs: &Map<String, Value>,
    ) -> Result<ValidationResult, CatalogError> {
        let constraints = self.catalog.constraints_for(entity_type)?;
        Ok(check_attributes(&constraints, attrs))
    }

    /// Validate a single field value, as supplied by a reviewer.
    pub fn validate_field(
        &self,
        entity_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<ValidationResult, CatalogError> {
        let constraints = self.catalog.constraints_for(entity_type)?;
        let mut errors = Vec::new();
        match constraints.rule(field) {
            Some(rule) if value.is_null() => {
                if rule.required {
                    errors.push(FieldError::new(field, Violation::Missing));
                }
            }
            Some(rule) => check_value(field, rule.kind, &rule.constraints, value, &mut errors),
            None if constraints.strict => {
                errors.push(FieldError::new(field, Violation::UnknownField));
            }
            None => {}
        }
        Ok(ValidationResult::from_errors(errors))
    }
}

fn check_attributes(constraints: &ConstraintSet, attrs: &Map<String, Value>) -> ValidationResult {
    let mut errors = Vec::new();

    for rule in &constraints.rules {
        match attrs.get(&rule.field) {
            None | Some(Value::Null) => {
                if rule.required {
                    errors.push(FieldError::new(&rule.field, Violation::Missing));
                }
            }
            Some(value) => check_value(&rule.field, rule.kind, &rule.constraints, value, &mut errors),
        }
    }

    if constraints.strict {
        for field in attrs.keys() {
            if constraints.rule(field).is_none() {
                errors.push(FieldError::new(field, Violation::UnknownField));
            }
        }
    }

    ValidationResult::from_errors(errors)
}

fn check_value(
    field: &str,
    kind: AttrKind,
    constraints: &[Constraint],
    value: &Value,
    errors: &mut Vec<FieldError>,
) {
    if !kind.matches(value) {
        errors.push(FieldError::new(field, Violation::WrongKind { expected: kind }));
        return;
    }
    for constraint in constraints {
        if let Err(violation) = constraint.check(value) {
            errors.push(FieldError::new(field, violation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> Validator {
        Validator::new(Arc::new(Catalog::builtin().unwrap()))
    }

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_backstory_length_boundary() {
        let v = validator();
        let short = attrs(json!({ "backstory": "a".repeat(99) }));
        let result = v.validate("character", &short).unwrap();
        assert!(!result.ok);
        assert_eq!(
            result.errors_for("backstory").next().unwrap().violation,
            Violation::TooShort { min: 100, actual: 99 }
        );

        let exact = attrs(json!({ "backstory": "a".repeat(100) }));
        assert!(v.validate("character", &exact).unwrap().ok);
    }

    #[test]
    fn test_power_level_boundary() {
        let v = validator();
        let too_strong = attrs(json!({ "power_level": 11 }));
        assert!(!v.validate("ability", &too_strong).unwrap().ok);
        let max = attrs(json!({ "power_level": 10 }));
        assert!(v.validate("ability", &max).unwrap().ok);
    }

    #[test]
    fn test_wrong_kind_skips_constraints() {
        let result = validator()
            .validate("character", &attrs(json!({ "strength": "very" })))
            .unwrap();
        assert_eq!(result.field_errors.len(), 1);
        assert!(matches!(
            result.field_errors[0].violation,
            Violation::WrongKind { .. }
        ));
    }

    #[test]
    fn test_negative_stat_and_enum() {
        let result = validator()
            .validate(
                "character",
                &attrs(json!({ "agility": -1, "status": "retired" })),
            )
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.field_errors.len(), 2);
    }

    #[test]
    fn test_null_counts_as_absent() {
        let result = validator()
            .validate("character", &attrs(json!({ "backstory": null })))
            .unwrap();
        assert!(result.ok);
    }

    #[test]
    fn test_thin_types_accept_anything() {
        let result = validator()
            .validate("trade_route", &attrs(json!({ "length_km": 420, "hazards": ["bandits"] })))
            .unwrap();
        assert!(result.ok);
    }

    #[test]
    fn test_strict_type_rejects_unknown_fields() {
        use crate::catalog::{AttributeDef, TypeSchema};
        let catalog = Catalog::builder()
            .with_type(
                TypeSchema::new("coin")
                    .strict(true)
                    .with_attribute(AttributeDef::new("metal", AttrKind::Text).required(true)),
            )
            .build()
            .unwrap();
        let v = Validator::new(Arc::new(catalog));
        let result = v
            .validate("coin", &attrs(json!({ "weight": 3 })))
            .unwrap();
        assert_eq!(result.field_errors.len(), 2);
        assert_eq!(result.errors_for("metal").next().unwrap().violation, Violation::Missing);
        assert_eq!(
            result.errors_for("weight").next().unwrap().violation,
            Violation::UnknownField
        );
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(matches!(
            validator().validate("starship", &Map::new()),
            Err(CatalogError::UnknownType(_))
        ));
    }

    #[test]
    fn test_validate_single_field() {
        let v = validator();
        assert!(v.validate_field("character", "power_level", &json!(7)).unwrap().ok);
        assert!(!v.validate_field("character", "power_level", &json!(70)).unwrap().ok);
    }
}
