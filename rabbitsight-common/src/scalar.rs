//! Numeric coercion of loosely typed JSON values.
//!
//! Upstream APIs report numbers as integers, floats or numeric strings
//! depending on field and version. Values are classified once into the
//! closed [`Scalar`] type at the JSON boundary and converted to `f64` from
//! there.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Failure to turn a scalar into a number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    /// A string that does not parse as a floating point literal.
    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    /// A value with no numeric interpretation (e.g. a multi-field object).
    #[error("cannot convert {0} to a number")]
    Unsupported(&'static str),
}

/// A decoded JSON value, classified by representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
    /// Objects and arrays.
    Other(Value),
}

impl Scalar {
    /// Convert to a normalized `f64`.
    ///
    /// `null` and IEEE marker strings such as `"NaN"` yield NaN rather than an
    /// error: they mean "no data", not "malformed data".
    pub fn to_f64(&self) -> Result<f64, CoercionError> {
        match self {
            Scalar::Unsigned(v) => Ok(*v as f64),
            Scalar::Signed(v) => Ok(*v as f64),
            Scalar::Float(v) => Ok(*v),
            Scalar::Text(s) => s
                .parse::<f64>()
                .map_err(|_| CoercionError::InvalidNumber(s.clone())),
            Scalar::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Scalar::Null => Ok(f64::NAN),
            Scalar::Other(value) => coerce_wrapped(value),
        }
    }
}

/// Unwrap single-member objects and single-element arrays.
fn coerce_wrapped(value: &Value) -> Result<f64, CoercionError> {
    match value {
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(inner) => Scalar::from(inner).to_f64(),
            None => Err(CoercionError::Unsupported("object")),
        },
        Value::Object(_) => Err(CoercionError::Unsupported("object")),
        Value::Array(items) if items.len() == 1 => Scalar::from(&items[0]).to_f64(),
        Value::Array(_) => Err(CoercionError::Unsupported("array")),
        other => Scalar::from(other).to_f64(),
    }
}

impl From<&Value> for Scalar {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Scalar::Unsigned(u)
                } else if let Some(i) = n.as_i64() {
                    Scalar::Signed(i)
                } else {
                    Scalar::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Other(other.clone()),
        }
    }
}

impl From<Value> for Scalar {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Scalar::Text(s),
            Value::Array(_) | Value::Object(_) => Scalar::Other(value),
            other => Scalar::from(&other),
        }
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Scalar::from)
    }
}

/// Coerce a raw JSON value to `f64`.
pub fn to_f64(value: &Value) -> Result<f64, CoercionError> {
    Scalar::from(value).to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_string() {
        assert_eq!(to_f64(&json!("3.14")).unwrap(), 3.14);
        assert_eq!(to_f64(&json!("-17")).unwrap(), -17.0);
        assert_eq!(to_f64(&json!("1e3")).unwrap(), 1000.0);
    }

    #[test]
    fn test_integers() {
        assert_eq!(to_f64(&json!(42i64)).unwrap(), 42.0);
        assert_eq!(to_f64(&json!(-42i32)).unwrap(), -42.0);
        assert_eq!(to_f64(&json!(7u8)).unwrap(), 7.0);
        assert_eq!(to_f64(&json!(u64::MAX)).unwrap(), u64::MAX as f64);
        assert_eq!(to_f64(&json!(i64::MIN)).unwrap(), i64::MIN as f64);
    }

    #[test]
    fn test_floats() {
        assert_eq!(to_f64(&json!(0.25f32)).unwrap(), 0.25);
        assert_eq!(to_f64(&json!(1.5e-3)).unwrap(), 1.5e-3);
    }

    #[test]
    fn test_invalid_string_is_an_error() {
        assert_eq!(
            to_f64(&json!("not-a-number")),
            Err(CoercionError::InvalidNumber("not-a-number".to_string()))
        );
        assert!(to_f64(&json!("")).is_err());
        assert!(to_f64(&json!("12 ")).is_err());
    }

    #[test]
    fn test_nan_marker_passes_through() {
        assert!(to_f64(&json!("NaN")).unwrap().is_nan());
        assert!(to_f64(&Value::Null).unwrap().is_nan());
        assert_eq!(to_f64(&json!("+Inf")).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_bool() {
        assert_eq!(to_f64(&json!(true)).unwrap(), 1.0);
        assert_eq!(to_f64(&json!(false)).unwrap(), 0.0);
    }

    #[test]
    fn test_wrapped_values() {
        assert_eq!(to_f64(&json!({"value": "7"})).unwrap(), 7.0);
        assert_eq!(to_f64(&json!([2.5])).unwrap(), 2.5);
        assert_eq!(
            to_f64(&json!({"a": 1, "b": 2})),
            Err(CoercionError::Unsupported("object"))
        );
        assert_eq!(
            to_f64(&json!([1, 2])),
            Err(CoercionError::Unsupported("array"))
        );
    }

    #[test]
    fn test_classification() {
        assert_eq!(Scalar::from(&json!(5)), Scalar::Unsigned(5));
        assert_eq!(Scalar::from(&json!(-5)), Scalar::Signed(-5));
        assert_eq!(Scalar::from(&json!(0.5)), Scalar::Float(0.5));
        assert_eq!(Scalar::from(&json!("x")), Scalar::Text("x".to_string()));
        assert_eq!(Scalar::from(&Value::Null), Scalar::Null);
    }

    #[test]
    fn test_deserialize_from_prometheus_pair() {
        let pair: (Scalar, Scalar) = serde_json::from_str(r#"[1700000000.123, "0.42"]"#).unwrap();
        assert_eq!(pair.0, Scalar::Float(1700000000.123));
        assert_eq!(pair.1.to_f64().unwrap(), 0.42);
    }
}
