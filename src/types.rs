//! Value model and the types registry.
//!
//! The engine is host-independent: the SQL layer's full type system stays
//! outside, and the projection compiler consumes only what this module
//! exposes — a scalar [`Value`], its [`TypeClass`], a cast resolver, a
//! zero-argument scalar-function resolver, and per-type literal parsing
//! for column defaults.
//!
//! Cast resolution happens once at projection-compile time; failing to
//! resolve is a fatal schema-incompatibility. Cast *application* happens
//! per row and may fail on domain (e.g. `'abc'` → INT), which surfaces as
//! a constraint error carrying the row's identity.

use chrono::{DateTime, NaiveDate, Utc};

/// Scalar type classes the engine can project between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TypeClass {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Date,
    Timestamp,
}

impl TypeClass {
    /// Stable uppercase name, used in error messages and fingerprints.
    pub fn name(self) -> &'static str {
        match self {
            TypeClass::Bool => "BOOLEAN",
            TypeClass::Int => "INT",
            TypeClass::BigInt => "BIGINT",
            TypeClass::Double => "DOUBLE",
            TypeClass::Text => "TEXT",
            TypeClass::Date => "DATE",
            TypeClass::Timestamp => "TIMESTAMP",
        }
    }

    /// Parse a default-value literal string into a typed [`Value`].
    ///
    /// This is the from-string routine used when a new column carries a
    /// literal default. Timestamps accept RFC 3339; dates accept
    /// `YYYY-MM-DD`.
    pub fn parse_literal(self, s: &str) -> Result<Value, String> {
        match self {
            TypeClass::Bool => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("not a boolean: {s:?}")),
            },
            TypeClass::Int => s
                .trim()
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|e| e.to_string()),
            TypeClass::BigInt => s
                .trim()
                .parse::<i64>()
                .map(Value::BigInt)
                .map_err(|e| e.to_string()),
            TypeClass::Double => s
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| e.to_string()),
            TypeClass::Text => Ok(Value::Text(s.to_string())),
            TypeClass::Date => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| e.to_string()),
            TypeClass::Timestamp => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| Value::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| e.to_string()),
        }
    }
}

/// A scalar value flowing through rows and projections.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type class of a non-null value.
    pub fn type_class(&self) -> Option<TypeClass> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(TypeClass::Bool),
            Value::Int(_) => Some(TypeClass::Int),
            Value::BigInt(_) => Some(TypeClass::BigInt),
            Value::Double(_) => Some(TypeClass::Double),
            Value::Text(_) => Some(TypeClass::Text),
            Value::Date(_) => Some(TypeClass::Date),
            Value::Timestamp(_) => Some(TypeClass::Timestamp),
        }
    }
}

// ── Casts ──────────────────────────────────────────────────────────────────

/// A resolved cast. Nulls pass through every cast unchanged.
pub type CastFn = fn(&Value) -> Result<Value, String>;

fn cast_int_to_bigint(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(Value::BigInt(i64::from(*i))),
        other => Err(format!("expected INT, got {other:?}")),
    }
}

fn cast_int_to_double(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(Value::Double(f64::from(*i))),
        other => Err(format!("expected INT, got {other:?}")),
    }
}

fn cast_bigint_to_double(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::BigInt(i) => Ok(Value::Double(*i as f64)),
        other => Err(format!("expected BIGINT, got {other:?}")),
    }
}

fn cast_bigint_to_int(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::BigInt(i) => i32::try_from(*i)
            .map(Value::Int)
            .map_err(|_| format!("BIGINT {i} out of INT range")),
        other => Err(format!("expected BIGINT, got {other:?}")),
    }
}

fn cast_to_text(v: &Value) -> Result<Value, String> {
    Ok(match v {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Text(b.to_string()),
        Value::Int(i) => Value::Text(i.to_string()),
        Value::BigInt(i) => Value::Text(i.to_string()),
        Value::Double(d) => Value::Text(d.to_string()),
        Value::Text(s) => Value::Text(s.clone()),
        Value::Date(d) => Value::Text(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => Value::Text(ts.to_rfc3339()),
    })
}

fn cast_text_to_int(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => TypeClass::Int.parse_literal(s),
        other => Err(format!("expected TEXT, got {other:?}")),
    }
}

fn cast_text_to_bigint(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => TypeClass::BigInt.parse_literal(s),
        other => Err(format!("expected TEXT, got {other:?}")),
    }
}

fn cast_text_to_double(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => TypeClass::Double.parse_literal(s),
        other => Err(format!("expected TEXT, got {other:?}")),
    }
}

fn cast_date_to_timestamp(v: &Value) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Date(d) => Ok(Value::Timestamp(DateTime::from_naive_utc_and_offset(
            d.and_hms_opt(0, 0, 0).expect("midnight is always valid"),
            Utc,
        ))),
        other => Err(format!("expected DATE, got {other:?}")),
    }
}

// ── Zero-argument scalar functions ─────────────────────────────────────────

/// A zero-argument scalar resolved for default-value synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    CurrentTimestamp,
    CurrentDate,
    CurrentUser,
}

impl ScalarOp {
    /// Declared result type, before any cast to the column type.
    pub fn result_type(self) -> TypeClass {
        match self {
            ScalarOp::CurrentTimestamp => TypeClass::Timestamp,
            ScalarOp::CurrentDate => TypeClass::Date,
            ScalarOp::CurrentUser => TypeClass::Text,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Cast and scalar-overload resolution, keyed by type class.
///
/// The production server plugs its own registry in; this default covers
/// the casts and functions the engine's own tests exercise.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypesRegistry;

impl TypesRegistry {
    /// Resolve a cast between two type classes.
    ///
    /// The identity cast resolves for every class (nullability changes
    /// compile to identity).
    pub fn resolve_cast(&self, from: TypeClass, to: TypeClass) -> Option<CastFn> {
        use TypeClass::*;
        if from == to {
            return Some(|v| Ok(v.clone()));
        }
        match (from, to) {
            (Int, BigInt) => Some(cast_int_to_bigint),
            (Int, Double) => Some(cast_int_to_double),
            (BigInt, Double) => Some(cast_bigint_to_double),
            (BigInt, Int) => Some(cast_bigint_to_int),
            (Bool, Text)
            | (Int, Text)
            | (BigInt, Text)
            | (Double, Text)
            | (Date, Text)
            | (Timestamp, Text) => Some(cast_to_text),
            (Text, Int) => Some(cast_text_to_int),
            (Text, BigInt) => Some(cast_text_to_bigint),
            (Text, Double) => Some(cast_text_to_double),
            (Date, Timestamp) => Some(cast_date_to_timestamp),
            _ => None,
        }
    }

    /// Resolve a zero-argument scalar function by name (case-insensitive).
    pub fn resolve_scalar(&self, name: &str) -> Option<ScalarOp> {
        match name.to_ascii_uppercase().as_str() {
            "CURRENT_TIMESTAMP" | "NOW" => Some(ScalarOp::CurrentTimestamp),
            "CURRENT_DATE" => Some(ScalarOp::CurrentDate),
            "CURRENT_USER" => Some(ScalarOp::CurrentUser),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_literal ───────────────────────────────────────────────

    #[test]
    fn test_parse_literal_int() {
        assert_eq!(TypeClass::Int.parse_literal("42").unwrap(), Value::Int(42));
        assert!(TypeClass::Int.parse_literal("x").is_err());
    }

    #[test]
    fn test_parse_literal_bigint_at_int_boundary() {
        assert_eq!(
            TypeClass::BigInt.parse_literal("2147483648").unwrap(),
            Value::BigInt(2_147_483_648)
        );
    }

    #[test]
    fn test_parse_literal_bool_spellings() {
        assert_eq!(TypeClass::Bool.parse_literal("T").unwrap(), Value::Bool(true));
        assert_eq!(TypeClass::Bool.parse_literal("0").unwrap(), Value::Bool(false));
        assert!(TypeClass::Bool.parse_literal("yes").is_err());
    }

    #[test]
    fn test_parse_literal_date() {
        let v = TypeClass::Date.parse_literal("2024-02-29").unwrap();
        assert_eq!(v.type_class(), Some(TypeClass::Date));
        assert!(TypeClass::Date.parse_literal("2023-02-29").is_err());
    }

    #[test]
    fn test_parse_literal_text_is_verbatim() {
        assert_eq!(
            TypeClass::Text.parse_literal(" x ").unwrap(),
            Value::Text(" x ".into())
        );
    }

    // ── cast resolution ─────────────────────────────────────────────

    #[test]
    fn test_identity_cast_always_resolves() {
        let reg = TypesRegistry;
        for tc in [
            TypeClass::Bool,
            TypeClass::Int,
            TypeClass::BigInt,
            TypeClass::Double,
            TypeClass::Text,
            TypeClass::Date,
            TypeClass::Timestamp,
        ] {
            assert!(reg.resolve_cast(tc, tc).is_some(), "identity for {tc:?}");
        }
    }

    #[test]
    fn test_widening_int_to_bigint() {
        let reg = TypesRegistry;
        let cast = reg.resolve_cast(TypeClass::Int, TypeClass::BigInt).unwrap();
        assert_eq!(
            cast(&Value::Int(i32::MAX)).unwrap(),
            Value::BigInt(2_147_483_647)
        );
    }

    #[test]
    fn test_narrowing_bigint_to_int_checks_range() {
        let reg = TypesRegistry;
        let cast = reg.resolve_cast(TypeClass::BigInt, TypeClass::Int).unwrap();
        assert_eq!(cast(&Value::BigInt(7)).unwrap(), Value::Int(7));
        assert!(cast(&Value::BigInt(i64::MAX)).is_err());
    }

    #[test]
    fn test_null_passes_through_casts() {
        let reg = TypesRegistry;
        let cast = reg.resolve_cast(TypeClass::Text, TypeClass::Int).unwrap();
        assert_eq!(cast(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_unresolvable_cast() {
        let reg = TypesRegistry;
        assert!(reg.resolve_cast(TypeClass::Bool, TypeClass::Date).is_none());
    }

    #[test]
    fn test_text_to_int_domain_failure() {
        let reg = TypesRegistry;
        let cast = reg.resolve_cast(TypeClass::Text, TypeClass::Int).unwrap();
        assert!(cast(&Value::Text("not a number".into())).is_err());
    }

    // ── scalar resolution ───────────────────────────────────────────

    #[test]
    fn test_scalar_resolution_case_insensitive() {
        let reg = TypesRegistry;
        assert_eq!(
            reg.resolve_scalar("current_timestamp"),
            Some(ScalarOp::CurrentTimestamp)
        );
        assert_eq!(reg.resolve_scalar("NOW"), Some(ScalarOp::CurrentTimestamp));
        assert_eq!(reg.resolve_scalar("CURRENT_DATE"), Some(ScalarOp::CurrentDate));
        assert_eq!(reg.resolve_scalar("random"), None);
    }

    #[test]
    fn test_scalar_result_types() {
        assert_eq!(ScalarOp::CurrentTimestamp.result_type(), TypeClass::Timestamp);
        assert_eq!(ScalarOp::CurrentUser.result_type(), TypeClass::Text);
    }
}
