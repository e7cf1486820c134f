// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Patch operations and the inverse pairs announced after they are applied.
//!
//! The wire shape is the familiar JSON-patch one:
//!
//! ```rust
//! # use patchsync::{Operation, Path};
//! # use serde_json::json;
//! let op: Operation = serde_json::from_value(json!({
//!     "op": "add",
//!     "path": ["planet", "1", "name"],
//!     "value": "Mercury",
//! }))
//! .unwrap();
//! assert_eq!(op, Operation::add("/planet/1/name", json!("Mercury")));
//! assert_eq!(
//!     serde_json::to_value(&op).unwrap(),
//!     json!({"op": "add", "path": "/planet/1/name", "value": "Mercury"})
//! );
//! ```
use crate::Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A single patch instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Inserts into an array or sets an object member, overwriting it.
    Add { path: Path, value: Value },
    /// Removes an object member or an array element.
    Remove { path: Path },
    /// Overwrites an existing location.
    Replace { path: Path, value: Value },
    /// Removes the value at `from` and adds it at `path`.
    Move { from: Path, path: Path },
    /// Adds a copy of the value at `from` at `path`.
    Copy { from: Path, path: Path },
    /// Checks that `path` holds `value`.
    Test { path: Path, value: Value },
}

/// The discriminant of an [`Operation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Add => "add",
            OperationKind::Remove => "remove",
            OperationKind::Replace => "replace",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Test => "test",
        })
    }
}

impl Operation {
    pub fn add(path: impl Into<Path>, value: Value) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<Path>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<Path>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn move_to(from: impl Into<Path>, path: impl Into<Path>) -> Self {
        Self::Move {
            from: from.into(),
            path: path.into(),
        }
    }

    pub fn copy_to(from: impl Into<Path>, path: impl Into<Path>) -> Self {
        Self::Copy {
            from: from.into(),
            path: path.into(),
        }
    }

    pub fn test(path: impl Into<Path>, value: Value) -> Self {
        Self::Test {
            path: path.into(),
            value,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add { .. } => OperationKind::Add,
            Operation::Remove { .. } => OperationKind::Remove,
            Operation::Replace { .. } => OperationKind::Replace,
            Operation::Move { .. } => OperationKind::Move,
            Operation::Copy { .. } => OperationKind::Copy,
            Operation::Test { .. } => OperationKind::Test,
        }
    }

    /// The target path of the operation.
    pub fn path(&self) -> &Path {
        match self {
            Operation::Add { path, .. }
            | Operation::Remove { path }
            | Operation::Replace { path, .. }
            | Operation::Move { path, .. }
            | Operation::Copy { path, .. }
            | Operation::Test { path, .. } => path,
        }
    }

    /// The source path of `move` and `copy`.
    pub fn from(&self) -> Option<&Path> {
        match self {
            Operation::Move { from, .. } | Operation::Copy { from, .. } => Some(from),
            _ => None,
        }
    }

    /// The payload of `add`, `replace` and `test`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Operation::Add { value, .. }
            | Operation::Replace { value, .. }
            | Operation::Test { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Move { from, path } | Operation::Copy { from, path } => {
                write!(f, "{} {from} -> {path}", self.kind())
            }
            Operation::Remove { path } => write!(f, "remove {path}"),
            Operation::Add { path, value }
            | Operation::Replace { path, value }
            | Operation::Test { path, value } => write!(f, "{} {path} = {value}", self.kind()),
        }
    }
}

/// An applied operation together with the operations that undo it.
///
/// This is the payload of every did-transform notification. Applying `inverse` in order right
/// after `operation` restores the prior state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transformed {
    pub operation: Operation,
    pub inverse: Vec<Operation>,
}
