// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Patch generation between two values.
//!
//! [`diffs`] produces a sequence of [`Operation`]s that, applied in order to a document holding
//! `a` at [`DiffOptions::base_path`], leaves `b` there instead.
//!
//! # Array alignment
//!
//! Arrays are aligned greedily from left to right rather than by minimum edit distance. When
//! the elements under the two cursors differ, the remainder of `b` is scanned for the current
//! element of `a`: if it shows up later, the elements of `b` before it are treated as
//! insertions, otherwise the element of `a` is treated as a deletion. Reordering an array
//! therefore tends to produce more operations than strictly necessary, and elements that merely
//! changed are removed and re-added rather than patched in place.
//!
//! Emitted indices address the array as it looks after the preceding operations of the same
//! patch have been applied, so the patch can be replayed verbatim.
use crate::{Operation, Path, value};
use ahash::RandomState;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Controls how [`diffs`] walks the two values.
#[derive(Clone, Debug, Default)]
pub struct DiffOptions {
    /// Prefix of every emitted path.
    pub base_path: Path,
    /// Top-level object keys that are neither compared nor emitted.
    pub ignore: HashSet<String, RandomState>,
    /// Keeps object members that only `a` holds instead of removing them, at every depth.
    ///
    /// The resulting patch merges `b` into `a` rather than turning `a` into `b`.
    pub retain_unmatched: bool,
}

impl DiffOptions {
    pub fn new(base_path: impl Into<Path>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn ignore<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn retain_unmatched(mut self) -> Self {
        self.retain_unmatched = true;
        self
    }
}

/// Computes the operations that turn `a` into `b`.
///
/// Returns `None` if the two values are deeply equal. Values of different kinds, and unequal
/// scalars, produce a single `replace` at the base path.
pub fn diffs(a: &Value, b: &Value, options: &DiffOptions) -> Option<Vec<Operation>> {
    if value::eq(a, b) {
        return None;
    }
    let mut ops = Vec::new();
    diff_into(a, b, &options.base_path, Some(&options.ignore), options.retain_unmatched, &mut ops);
    if ops.is_empty() { None } else { Some(ops) }
}

fn diff_into(
    a: &Value,
    b: &Value,
    base: &Path,
    ignore: Option<&HashSet<String, RandomState>>,
    retain_unmatched: bool,
    ops: &mut Vec<Operation>,
) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            diff_objects(a, b, base, ignore, retain_unmatched, ops)
        }
        (Value::Array(a), Value::Array(b)) => diff_arrays(a, b, base, ops),
        _ => ops.push(Operation::replace(base.clone(), value::clone(b))),
    }
}

fn diff_objects(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    base: &Path,
    ignore: Option<&HashSet<String, RandomState>>,
    retain_unmatched: bool,
    ops: &mut Vec<Operation>,
) {
    let ignored = |key: &String| ignore.is_some_and(|ignore| ignore.contains(key));
    for (key, b_value) in b.iter().filter(|(key, _)| !ignored(key)) {
        match a.get(key) {
            None => ops.push(Operation::add(base.child(key), value::clone(b_value))),
            Some(a_value) if !value::eq(a_value, b_value) => {
                // the ignore set only applies at the top level
                diff_into(a_value, b_value, &base.child(key), None, retain_unmatched, ops)
            }
            Some(_) => {}
        }
    }
    if retain_unmatched {
        return;
    }
    for key in a.keys().filter(|key| !ignored(key)) {
        if !b.contains_key(key) {
            ops.push(Operation::remove(base.child(key)));
        }
    }
}

fn diff_arrays(a: &[Value], b: &[Value], base: &Path, ops: &mut Vec<Operation>) {
    // The partially patched array is always b[..bi] followed by a[ai..], so `bi` is the index of
    // the element under the `a` cursor.
    let (mut ai, mut bi) = (0, 0);
    while ai < a.len() || bi < b.len() {
        if ai >= a.len() {
            ops.push(Operation::add(base.child(bi.to_string()), value::clone(&b[bi])));
            bi += 1;
        } else if bi >= b.len() {
            ops.push(Operation::remove(base.child(bi.to_string())));
            ai += 1;
        } else if value::eq(&a[ai], &b[bi]) {
            ai += 1;
            bi += 1;
        } else if b[bi + 1..].iter().any(|later| value::eq(&a[ai], later)) {
            ops.push(Operation::add(base.child(bi.to_string()), value::clone(&b[bi])));
            bi += 1;
        } else {
            ops.push(Operation::remove(base.child(bi.to_string())));
            ai += 1;
        }
    }
}
