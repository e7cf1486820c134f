// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Structural equality and deep copies of document values.
//!
//! Every other module compares values with [`eq`] rather than `==`: `serde_json`'s own equality
//! treats `-0.0` and `0.0` as the same number and distinguishes `1` from `1.0`, whereas documents
//! follow the numeric rules of the data they replicate (one number type, signed zeros kept apart,
//! NaN equal to itself).
use serde_json::{Number, Value};

/// Returns true if `a` and `b` are structurally equal.
///
/// * scalars compare by value; numbers compare numerically regardless of their integer or float
///   representation, NaN equals NaN, and `-0.0` does not equal `0.0`.
/// * objects compare key-wise in both directions, ignoring key order.
/// * arrays compare by length and then element-wise.
/// * values of different kinds are never equal.
pub fn eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_eq(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| eq(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            // same length + every key of `a` present and equal in `b` covers both directions
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| eq(a, b)))
        }
        _ => false,
    }
}

fn numbers_eq(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => floats_eq(a, b),
        _ => false,
    }
}

fn floats_eq(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    a == b && (a != 0.0 || a.is_sign_negative() == b.is_sign_negative())
}

/// Produces a fully independent copy of `value`.
///
/// [`Value`] owns all of its children, so the copy never shares mutable structure with the
/// input. Documents store values by ownership and build inverse operations from copies made
/// here, which keeps caller-held values and document state from affecting each other.
pub fn clone(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(clone).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), clone(value)))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}
