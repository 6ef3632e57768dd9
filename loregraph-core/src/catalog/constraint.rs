//! Attribute kinds and value constraints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The JSON shape an attribute value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    Text,
    Integer,
    Number,
    Boolean,
    List,
    Object,
}

impl AttrKind {
    /// Get the display name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            AttrKind::Text => "text",
            AttrKind::Integer => "integer",
            AttrKind::Number => "number",
            AttrKind::Boolean => "boolean",
            AttrKind::List => "list",
            AttrKind::Object => "object",
        }
    }

    /// SQLite column affinity used for bespoke tables.
    pub fn column_type(&self) -> &'static str {
        match self {
            AttrKind::Text | AttrKind::List | AttrKind::Object => "TEXT",
            AttrKind::Integer | AttrKind::Boolean => "INTEGER",
            AttrKind::Number => "REAL",
        }
    }

    /// Check that a (non-null) value has this kind.
    ///
    /// Integral floats such as `5.0` count as integers.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            AttrKind::Text => value.is_string(),
            AttrKind::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            AttrKind::Number => value.is_number(),
            AttrKind::Boolean => value.is_boolean(),
            AttrKind::List => value.is_array(),
            AttrKind::Object => value.is_object(),
        }
    }

    /// Whether numeric constraints make sense for this kind.
    pub fn is_numeric(&self) -> bool {
        matches!(self, AttrKind::Integer | AttrKind::Number)
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A declared restriction on attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
    /// Numeric value must be >= 0.
    NonNegative,
    /// Text value (or every list element) must be one of these.
    OneOf(Vec<String>),
    /// Minimum length in characters.
    MinLength(usize),
    /// Maximum length in characters.
    MaxLength(usize),
}

/// How a value broke a constraint or kind check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    Missing,
    WrongKind { expected: AttrKind },
    OutOfRange { min: f64, max: f64, actual: f64 },
    Negative { actual: f64 },
    NotAllowed { allowed: Vec<String>, actual: String },
    TooShort { min: usize, actual: usize },
    TooLong { max: usize, actual: usize },
    UnknownField,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing => write!(f, "required field is missing"),
            Violation::WrongKind { expected } => write!(f, "expected a {expected} value"),
            Violation::OutOfRange { min, max, actual } => {
                write!(f, "{actual} is outside {min}..={max}")
            }
            Violation::Negative { actual } => write!(f, "{actual} must not be negative"),
            Violation::NotAllowed { allowed, actual } => {
                write!(f, "{actual:?} is not one of {}", allowed.join(", "))
            }
            Violation::TooShort { min, actual } => {
                write!(f, "length {actual} is shorter than {min}")
            }
            Violation::TooLong { max, actual } => {
                write!(f, "length {actual} is longer than {max}")
            }
            Violation::UnknownField => write!(f, "field is not declared for this type"),
        }
    }
}

impl Constraint {
    /// Check a value that already passed the kind check.
    ///
    /// Constraints that don't apply to the value's shape pass; the catalog
    /// rejects such combinations when it is built.
    pub fn check(&self, value: &Value) -> Result<(), Violation> {
        match self {
            Constraint::Range { min, max } => match value.as_f64() {
                Some(actual) if actual < *min || actual > *max => Err(Violation::OutOfRange {
                    min: *min,
                    max: *max,
                    actual,
                }),
                _ => Ok(()),
            },
            Constraint::NonNegative => match value.as_f64() {
                Some(actual) if actual < 0.0 => Err(Violation::Negative { actual }),
                _ => Ok(()),
            },
            Constraint::OneOf(allowed) => match value {
                Value::String(s) => check_one_of(allowed, s),
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .try_for_each(|s| check_one_of(allowed, s)),
                _ => Ok(()),
            },
            Constraint::MinLength(min) => match length_of(value) {
                Some(actual) if actual < *min => Err(Violation::TooShort { min: *min, actual }),
                _ => Ok(()),
            },
            Constraint::MaxLength(max) => match length_of(value) {
                Some(actual) if actual > *max => Err(Violation::TooLong { max: *max, actual }),
                _ => Ok(()),
            },
        }
    }

    /// Whether this constraint is meaningful for an attribute kind.
    pub fn applies_to(&self, kind: AttrKind) -> bool {
        match self {
            Constraint::Range { .. } | Constraint::NonNegative => kind.is_numeric(),
            Constraint::OneOf(_) => matches!(kind, AttrKind::Text | AttrKind::List),
            Constraint::MinLength(_) | Constraint::MaxLength(_) => {
                matches!(kind, AttrKind::Text | AttrKind::List)
            }
        }
    }
}

fn check_one_of(allowed: &[String], actual: &str) -> Result<(), Violation> {
    if allowed.iter().any(|a| a == actual) {
        Ok(())
    } else {
        Err(Violation::NotAllowed {
            allowed: allowed.to_vec(),
            actual: actual.to_string(),
        })
    }
}

/// Characters for strings, elements for lists.
fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_range_is_inclusive() {
        let range = Constraint::Range { min: 1.0, max: 10.0 };
        assert!(range.check(&json!(1)).is_ok());
        assert!(range.check(&json!(10)).is_ok());
        assert!(matches!(
            range.check(&json!(11)),
            Err(Violation::OutOfRange { .. })
        ));
        assert!(range.check(&json!(0)).is_err());
    }

    #[test]
    fn test_min_length_counts_chars() {
        let min = Constraint::MinLength(3);
        assert!(min.check(&json!("äöü")).is_ok());
        assert_eq!(
            min.check(&json!("ab")),
            Err(Violation::TooShort { min: 3, actual: 2 })
        );
    }

    #[test]
    fn test_one_of_checks_list_elements() {
        let one_of = Constraint::OneOf(vec!["active".into(), "inactive".into()]);
        assert!(one_of.check(&json!("active")).is_ok());
        assert!(one_of.check(&json!(["active", "inactive"])).is_ok());
        assert!(one_of.check(&json!(["active", "dormant"])).is_err());
    }

    #[test]
    fn test_integer_kind_accepts_integral_floats() {
        assert!(AttrKind::Integer.matches(&json!(5)));
        assert!(AttrKind::Integer.matches(&json!(5.0)));
        assert!(!AttrKind::Integer.matches(&json!(5.5)));
        assert!(!AttrKind::Integer.matches(&json!("5")));
    }

    #[test]
    fn test_constraint_serde_shape() {
        let parsed: Vec<Constraint> =
            serde_json::from_str(r#"[{"range": {"min": 1, "max": 10}}, "non_negative", {"min_length": 100}]"#)
                .unwrap();
        assert_eq!(parsed[0], Constraint::Range { min: 1.0, max: 10.0 });
        assert_eq!(parsed[1], Constraint::NonNegative);
        assert_eq!(parsed[2], Constraint::MinLength(100));
    }
}
