// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! An addressable tree of values mutated through invertible patch operations.
//!
//! Every mutating method optionally returns the operations that undo it. Applying those inverse
//! operations, in the returned order, right after the mutation restores the document to a state
//! that is [deeply equal](crate::value::eq) to the one before it:
//!
//! ```rust
//! # use patchsync::{Document, Path};
//! # use serde_json::json;
//! let mut doc = Document::with_data(json!({"a": {}}));
//! let inverse = doc.add(&Path::parse("/a/b"), json!(1), true).unwrap().unwrap();
//! assert_eq!(doc.root(), &json!({"a": {"b": 1}}));
//!
//! for op in &inverse {
//!     doc.transform(op, false).unwrap();
//! }
//! assert_eq!(doc.root(), &json!({"a": {}}));
//! ```
//!
//! All segments of a path but the last must resolve to existing containers, otherwise the
//! operation fails with [`DocumentError::PathNotFound`] and the document is left untouched.
use crate::{
    Operation, Path,
    path::APPEND,
    value::{self, eq},
};
use serde_json::{Map, Value};
use std::{fmt, mem};

/// Errors raised by [`Document`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// A path segment, or the addressed location itself, does not exist.
    PathNotFound(Path),
    /// A `test` operation found a different value.
    TestFailed(Path),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::PathNotFound(path) => write!(f, "path not found: {path}"),
            DocumentError::TestFailed(path) => write!(f, "test failed at {path}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// A mutable root value addressed by [`Path`]s.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    data: Value,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates a document whose root is an empty object.
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    pub fn with_data(data: Value) -> Self {
        Self { data }
    }

    /// Replaces the whole tree, for example with data loaded from storage.
    pub fn reset(&mut self, data: Value) {
        self.data = data;
    }

    pub fn root(&self) -> &Value {
        &self.data
    }

    pub fn into_inner(self) -> Value {
        self.data
    }

    /// Returns the value at `path`.
    ///
    /// On arrays, [`APPEND`] addresses the last element.
    pub fn retrieve(&self, path: &Path) -> Result<&Value, DocumentError> {
        self.resolve(path.segments())
            .ok_or_else(|| DocumentError::PathNotFound(path.clone()))
    }

    /// Returns true if `path` currently holds a value.
    pub fn contains(&self, path: &Path) -> bool {
        self.resolve(path.segments()).is_some()
    }

    /// Adds `value` at `path`.
    ///
    /// Inside an array the value is inserted before the addressed index, or appended for
    /// [`APPEND`]; inside an object the member is set, overwriting any previous value. The empty
    /// path replaces the root.
    pub fn add(
        &mut self,
        path: &Path,
        value: Value,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        let inverse = self.add_inner(path, value)?;
        Ok(invert.then(|| vec![inverse]))
    }

    /// Removes the value at `path`. Removing the root leaves an empty object.
    pub fn remove(
        &mut self,
        path: &Path,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        let old = self.remove_inner(path)?;
        Ok(invert.then(|| vec![Operation::add(path.clone(), old)]))
    }

    /// Overwrites the existing value at `path`.
    pub fn replace(
        &mut self,
        path: &Path,
        value: Value,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        let not_found = || DocumentError::PathNotFound(path.clone());
        let slot = match path.split_last() {
            None => &mut self.data,
            Some((parent, key)) => match self.resolve_mut(parent).ok_or_else(not_found)? {
                Value::Array(items) => {
                    let len = items.len();
                    read_index(key, len)
                        .and_then(|index| items.get_mut(index))
                        .ok_or_else(not_found)?
                }
                Value::Object(map) => map.get_mut(key).ok_or_else(not_found)?,
                _ => return Err(not_found()),
            },
        };
        let old = mem::replace(slot, value);
        Ok(invert.then(|| vec![Operation::replace(path.clone(), old)]))
    }

    /// Removes the value at `from` and adds it at `to`.
    ///
    /// Nothing happens if the two paths are equal. If the value cannot be added at `to`, it is
    /// put back at `from` and the error is returned.
    pub fn move_value(
        &mut self,
        from: &Path,
        to: &Path,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        if from == to {
            return Ok(invert.then(Vec::new));
        }
        let value = self.remove_inner(from)?;
        match self.add_inner(to, value::clone(&value)) {
            Ok(undo_add) => Ok(invert.then(|| vec![undo_add, Operation::add(from.clone(), value)])),
            Err(err) => {
                // re-inserting where the value was just taken from cannot fail
                let _ = self.add_inner(from, value);
                Err(err)
            }
        }
    }

    /// Adds a copy of the value at `from` at `to`. Nothing happens if the two paths are equal.
    pub fn copy_value(
        &mut self,
        from: &Path,
        to: &Path,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        if from == to {
            return Ok(invert.then(Vec::new));
        }
        let value = value::clone(self.retrieve(from)?);
        self.add(to, value, invert)
    }

    /// Returns true if the value at `path` deeply equals `value`.
    pub fn test(&self, path: &Path, value: &Value) -> Result<bool, DocumentError> {
        Ok(eq(self.retrieve(path)?, value))
    }

    /// Applies `operation`.
    ///
    /// A `test` operation that does not hold fails with [`DocumentError::TestFailed`]; one that
    /// holds has an empty inverse.
    pub fn transform(
        &mut self,
        operation: &Operation,
        invert: bool,
    ) -> Result<Option<Vec<Operation>>, DocumentError> {
        match operation {
            Operation::Add { path, value } => self.add(path, value::clone(value), invert),
            Operation::Remove { path } => self.remove(path, invert),
            Operation::Replace { path, value } => self.replace(path, value::clone(value), invert),
            Operation::Move { from, path } => self.move_value(from, path, invert),
            Operation::Copy { from, path } => self.copy_value(from, path, invert),
            Operation::Test { path, value } => {
                if self.test(path, value)? {
                    Ok(invert.then(Vec::new))
                } else {
                    Err(DocumentError::TestFailed(path.clone()))
                }
            }
        }
    }

    fn resolve(&self, segments: &[String]) -> Option<&Value> {
        segments.iter().try_fold(&self.data, |node, segment| match node {
            Value::Array(items) => items.get(read_index(segment, items.len())?),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
    }

    fn resolve_mut(&mut self, segments: &[String]) -> Option<&mut Value> {
        segments
            .iter()
            .try_fold(&mut self.data, |node, segment| match node {
                Value::Array(items) => {
                    let index = read_index(segment, items.len())?;
                    items.get_mut(index)
                }
                Value::Object(map) => map.get_mut(segment),
                _ => None,
            })
    }

    /// Adds `value` at `path` and returns the operation undoing it.
    fn add_inner(&mut self, path: &Path, value: Value) -> Result<Operation, DocumentError> {
        let Some((parent, key)) = path.split_last() else {
            let old = mem::replace(&mut self.data, value);
            return Ok(Operation::replace(Path::root(), old));
        };
        let not_found = || DocumentError::PathNotFound(path.clone());
        match self.resolve_mut(parent).ok_or_else(not_found)? {
            Value::Array(items) => {
                let index = if key == APPEND {
                    items.len()
                } else {
                    parse_index(key)
                        .filter(|index| *index <= items.len())
                        .ok_or_else(not_found)?
                };
                items.insert(index, value);
                Ok(Operation::remove(path.clone()))
            }
            Value::Object(map) => match map.insert(key.to_owned(), value) {
                Some(old) => Ok(Operation::replace(path.clone(), old)),
                None => Ok(Operation::remove(path.clone())),
            },
            _ => Err(not_found()),
        }
    }

    /// Removes and returns the value at `path`.
    fn remove_inner(&mut self, path: &Path) -> Result<Value, DocumentError> {
        let Some((parent, key)) = path.split_last() else {
            return Ok(mem::replace(&mut self.data, Value::Object(Map::new())));
        };
        let not_found = || DocumentError::PathNotFound(path.clone());
        match self.resolve_mut(parent).ok_or_else(not_found)? {
            Value::Array(items) => {
                let index = read_index(key, items.len())
                    .filter(|index| *index < items.len())
                    .ok_or_else(not_found)?;
                Ok(items.remove(index))
            }
            Value::Object(map) => map.shift_remove(key).ok_or_else(not_found),
            _ => Err(not_found()),
        }
    }
}

/// Resolves an array segment addressing an existing element.
fn read_index(segment: &str, len: usize) -> Option<usize> {
    if segment == APPEND {
        len.checked_sub(1)
    } else {
        parse_index(segment)
    }
}

/// Array indices are plain decimal digits; `usize::from_str` would also take a leading `+`.
fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ArbitraryValue;
    use insta::assert_snapshot;
    use serde_json::json;

    fn p(path: &str) -> Path {
        Path::parse(path)
    }

    fn inverse_of(doc: &mut Document, op: Operation) -> String {
        let inverse = doc.transform(&op, true).unwrap().unwrap();
        serde_json::to_string(&inverse).unwrap()
    }

    #[test]
    fn retrieve() {
        let doc = Document::with_data(json!({"planet": {"moons": ["io", "europa"]}, "n": 1}));
        assert_eq!(doc.retrieve(&p("/planet/moons/1")).unwrap(), &json!("europa"));
        assert_eq!(doc.retrieve(&p("/planet/moons/-")).unwrap(), &json!("europa"));
        assert_eq!(doc.retrieve(&Path::root()).unwrap(), doc.root());
        assert_eq!(
            doc.retrieve(&p("/planet/moons/2")),
            Err(DocumentError::PathNotFound(p("/planet/moons/2")))
        );
        assert!(doc.retrieve(&p("/planet/rings")).is_err());
        assert!(doc.retrieve(&p("/n/x")).is_err());
        assert!(doc.retrieve(&p("/planet/moons/x")).is_err());
    }

    #[test]
    fn add_requires_parent() {
        let mut doc = Document::new();
        assert_eq!(
            doc.add(&p("/a/b"), json!(1), false),
            Err(DocumentError::PathNotFound(p("/a/b")))
        );
        assert_eq!(doc.root(), &json!({}));
    }

    #[test]
    fn add_into_object() {
        let mut doc = Document::with_data(json!({"a": {}}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::add("/a/b", json!(1))),
            @r#"[{"op":"remove","path":"/a/b"}]"#
        );
        assert_snapshot!(
            inverse_of(&mut doc, Operation::add("/a/b", json!(2))),
            @r#"[{"op":"replace","path":"/a/b","value":1}]"#
        );
        assert_eq!(doc.root(), &json!({"a": {"b": 2}}));
    }

    #[test]
    fn add_into_array_inserts() {
        let mut doc = Document::with_data(json!({"a": [1, 3]}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::add("/a/1", json!(2))),
            @r#"[{"op":"remove","path":"/a/1"}]"#
        );
        assert_snapshot!(
            inverse_of(&mut doc, Operation::add("/a/-", json!(4))),
            @r#"[{"op":"remove","path":"/a/-"}]"#
        );
        doc.add(&p("/a/4"), json!(5), false).unwrap();
        assert_eq!(doc.root(), &json!({"a": [1, 2, 3, 4, 5]}));
        assert!(doc.add(&p("/a/9"), json!(0), false).is_err());
        assert!(doc.add(&p("/a/x"), json!(0), false).is_err());
    }

    #[test]
    fn signed_indices_are_not_found() {
        let mut doc = Document::with_data(json!({"a": [1, 2]}));
        assert_eq!(
            doc.retrieve(&p("/a/+1")),
            Err(DocumentError::PathNotFound(p("/a/+1")))
        );
        assert_eq!(
            doc.add(&p("/a/+1"), json!(0), false),
            Err(DocumentError::PathNotFound(p("/a/+1")))
        );
        assert_eq!(
            doc.remove(&p("/a/+0"), false),
            Err(DocumentError::PathNotFound(p("/a/+0")))
        );
        assert!(doc.replace(&p("/a/+1"), json!(0), false).is_err());
        assert!(doc.add(&p("/a/"), json!(0), false).is_err());
        assert_eq!(doc.root(), &json!({"a": [1, 2]}));
    }

    #[test]
    fn add_at_root_replaces_it() {
        let mut doc = Document::with_data(json!({"a": 1}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::add("/", json!([1]))),
            @r#"[{"op":"replace","path":"/","value":{"a":1}}]"#
        );
        assert_eq!(doc.root(), &json!([1]));
    }

    #[test]
    fn remove() {
        let mut doc = Document::with_data(json!({"a": [1, 2, 3], "b": {"c": null}}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::remove("/a/-")),
            @r#"[{"op":"add","path":"/a/-","value":3}]"#
        );
        assert_snapshot!(
            inverse_of(&mut doc, Operation::remove("/a/0")),
            @r#"[{"op":"add","path":"/a/0","value":1}]"#
        );
        assert_snapshot!(
            inverse_of(&mut doc, Operation::remove("/b/c")),
            @r#"[{"op":"add","path":"/b/c","value":null}]"#
        );
        assert_eq!(doc.root(), &json!({"a": [2], "b": {}}));
        assert!(doc.remove(&p("/b/c"), false).is_err());
        assert!(doc.remove(&p("/a/1"), false).is_err());
        doc.remove(&p("/a/-"), false).unwrap();
        assert!(doc.remove(&p("/a/-"), false).is_err());
    }

    #[test]
    fn remove_root() {
        let mut doc = Document::with_data(json!({"a": 1}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::remove("")),
            @r#"[{"op":"add","path":"/","value":{"a":1}}]"#
        );
        assert_eq!(doc.root(), &json!({}));
    }

    #[test]
    fn replace_requires_target() {
        let mut doc = Document::with_data(json!({"a": [1, 2], "b": {"c": 1}}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::replace("/a/-", json!(3))),
            @r#"[{"op":"replace","path":"/a/-","value":2}]"#
        );
        assert_snapshot!(
            inverse_of(&mut doc, Operation::replace("/b/c", json!({"d": 1}))),
            @r#"[{"op":"replace","path":"/b/c","value":1}]"#
        );
        assert_eq!(doc.root(), &json!({"a": [1, 3], "b": {"c": {"d": 1}}}));
        assert!(doc.replace(&p("/b/x"), json!(1), false).is_err());
        assert!(doc.replace(&p("/a/2"), json!(1), false).is_err());
    }

    #[test]
    fn move_value() {
        let mut doc = Document::with_data(json!({"a": [1, 2, 3], "b": {}}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::move_to("/a/0", "/b/first")),
            @r#"[{"op":"remove","path":"/b/first"},{"op":"add","path":"/a/0","value":1}]"#
        );
        assert_eq!(doc.root(), &json!({"a": [2, 3], "b": {"first": 1}}));
        assert_eq!(doc.move_value(&p("/a"), &p("/a"), true), Ok(Some(vec![])));
    }

    #[test]
    fn failed_move_restores_source() {
        let mut doc = Document::with_data(json!({"a": [1, 2, 3]}));
        assert_eq!(
            doc.move_value(&p("/a/1"), &p("/missing/x"), true),
            Err(DocumentError::PathNotFound(p("/missing/x")))
        );
        assert_eq!(doc.root(), &json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn copy_value() {
        let mut doc = Document::with_data(json!({"a": {"b": [1]}}));
        assert_snapshot!(
            inverse_of(&mut doc, Operation::copy_to("/a/b", "/c")),
            @r#"[{"op":"remove","path":"/c"}]"#
        );
        assert_eq!(doc.root(), &json!({"a": {"b": [1]}, "c": [1]}));
        assert_eq!(doc.copy_value(&p("/c"), &p("/c"), false), Ok(None));
    }

    #[test]
    fn test_operation() {
        let mut doc = Document::with_data(json!({"a": {"b": 1.0}}));
        assert_eq!(doc.test(&p("/a/b"), &json!(1)), Ok(true));
        assert_eq!(doc.test(&p("/a"), &json!({})), Ok(false));
        assert!(doc.test(&p("/x"), &json!(null)).is_err());
        assert_eq!(doc.transform(&Operation::test("/a/b", json!(1)), true), Ok(Some(vec![])));
        assert_eq!(
            doc.transform(&Operation::test("/a/b", json!(2)), true),
            Err(DocumentError::TestFailed(p("/a/b")))
        );
    }

    #[test]
    fn stored_values_are_independent() {
        let mut value = json!({"name": "Mercury"});
        let mut doc = Document::new();
        doc.transform(&Operation::add("/p", value.clone()), false).unwrap();
        value["name"] = json!("Venus");
        assert_eq!(doc.retrieve(&p("/p/name")).unwrap(), &json!("Mercury"));
    }

    #[test]
    fn reset_round_trips_through_text() {
        let mut doc = Document::with_data(json!({"planet": {"1": {"name": "Mercury", "moons": []}}}));
        let text = serde_json::to_string(doc.retrieve(&Path::root()).unwrap()).unwrap();
        let snapshot = doc.root().clone();
        doc.reset(json!({}));
        doc.reset(serde_json::from_str(&text).unwrap());
        assert!(eq(doc.root(), &snapshot));
    }

    #[quickcheck]
    fn inverse_restores_document(data: ArbitraryValue, op: Operation) -> bool {
        let mut doc = Document::with_data(data.0.clone());
        match doc.transform(&op, true) {
            // failed operations leave the document untouched
            Err(_) => eq(doc.root(), &data.0),
            Ok(inverse) => {
                for op in inverse.unwrap_or_default() {
                    doc.transform(&op, false).unwrap();
                }
                eq(doc.root(), &data.0)
            }
        }
    }
}
