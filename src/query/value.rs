//! Value comparison rules shared by conditions and sorting.
//!
//! Numbers compare numerically across integer and float representations
//! (`1 == 1.0`). Strings and booleans use their natural order. Anything else,
//! and any mix of kinds, is not comparable.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::{Error, Result};

/// Compare two numbers with standard promotion.
pub fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Check whether a value has a natural order usable for ranges and sorting.
pub fn is_orderable(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_))
}

/// Order two values, failing if they are not mutually comparable.
pub fn compare_values(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(compare_numbers(x, y)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(Error::QueryEvaluation(format!(
            "value not comparable: {} against {}",
            a, b
        ))),
    }
}

/// Equality with numeric promotion; other kinds compare structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Ordering::Equal,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_integer_and_float_are_equal() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare_values(&json!(1), &json!(1.0)).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_numbers_compare_numerically_not_lexically() {
        assert_eq!(compare_values(&json!(9), &json!(10)).unwrap(), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(10)).unwrap(), Ordering::Less);
        assert_eq!(compare_values(&json!(-1), &json!(u64::MAX)).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_strings_use_natural_order() {
        assert_eq!(compare_values(&json!("a"), &json!("b")).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_mixed_kinds_are_not_comparable() {
        let err = compare_values(&json!("1"), &json!(1)).unwrap_err();
        assert!(matches!(err, Error::QueryEvaluation(_)));
        assert!(compare_values(&json!([1]), &json!([1])).is_err());
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    proptest! {
        #[test]
        fn prop_int_float_promotion(x in -1_000_000i64..1_000_000) {
            prop_assert!(values_equal(&json!(x), &json!(x as f64)));
            prop_assert_eq!(
                compare_values(&json!(x), &json!(x as f64 + 0.5)).unwrap(),
                Ordering::Less
            );
        }

        #[test]
        fn prop_compare_is_antisymmetric(x in any::<i32>(), y in any::<f32>()) {
            let a = json!(x);
            let b = json!(y as f64);
            let ab = compare_values(&a, &b).unwrap();
            let ba = compare_values(&b, &a).unwrap();
            prop_assert_eq!(ab, ba.reverse());
        }
    }
}
