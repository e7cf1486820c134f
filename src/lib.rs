// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # patchsync: Invertible JSON Patches and Replica Synchronization
//!
//! This crate keeps several in-memory copies of schema-described records in step by exchanging
//! [JSON Patch][rfc6902]-style [`Operation`]s between them.
//!
//! ## Core Concepts
//!
//! - [`Document`]: a JSON tree that applies operations and, on request, returns the operations
//!   that undo them. Every change is therefore invertible.
//! - [`Cache`]: a record store on top of a document. Records live at `/<model>/<id>`, and the
//!   cache keeps a reverse index of the links between them so that removing a record clears
//!   every link still pointing at it.
//! - [`Transformable`](transformable::Transformable): serializes operations through an
//!   [`ActionQueue`](queue::ActionQueue) and announces every applied change to its listeners.
//! - [`MemorySource`](source::MemorySource): an in-memory replica combining the three, which
//!   also answers record-level [requests](request::Request) such as `find` or `add_link`.
//! - [Connectors](connectors): a [`TransformConnector`](connectors::TransformConnector) replays
//!   the changes of one replica onto another, a
//!   [`RequestConnector`](connectors::RequestConnector) lets one replica help another answer
//!   requests.
//!
//! [rfc6902]: https://www.rfc-editor.org/rfc/rfc6902
//!
//! ## Conflict Resolution
//!
//! Replicas are mutated independently. When a connector replays a change onto a replica that
//! has diverged at the changed path, it does not overwrite the replica's value. Instead it
//! computes the [difference](diffs) between the two values and applies that, so a record that
//! gained a field on the target keeps it while the fields the source changed are updated:
//!
//! ```rust
//! # use patchsync::{CacheOptions, Operation, path, schema::{ModelDef, Schema}};
//! # use patchsync::{connectors::{ConnectorOptions, TransformConnector}, source::MemorySource};
//! # use serde_json::json;
//! # use std::sync::Arc;
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let schema = Schema::new().with_model("planet", ModelDef::default());
//! let here = Arc::new(MemorySource::new(schema.clone(), CacheOptions::default()));
//! let there = Arc::new(MemorySource::new(schema, CacheOptions::default()));
//! here.reset(json!({"planet": {"p1": {"name": "Mercury"}}}));
//! there.reset(json!({"planet": {"p1": {"name": "Mercury", "notes": "hot"}}}));
//!
//! let _connector = TransformConnector::new(here.clone(), there.clone(), ConnectorOptions::default());
//! here.transform([Operation::replace(path!("planet", "p1"), json!({"name": "Mercury2"}))])
//!     .await
//!     .unwrap();
//!
//! assert_eq!(
//!     there.retrieve(&path!("planet", "p1")),
//!     Some(json!({"name": "Mercury2", "notes": "hot"}))
//! );
//! # });
//! ```
//!
//! Two replicas connected both ways do not echo changes back and forth: a connector skips a
//! change whose value the target already holds.
//!
//! ## Undo
//!
//! Every transform returns the inverse operations of the changes it made, in the order the
//! changes were applied. Applying them in reverse order undoes the transform. A document `move`
//! is the exception: it is undone by two operations that must be applied in the order given, so
//! undo works on per-change groups. A [`Transaction`](transaction::Transaction) does exactly that
//! for everything a replica announced while it was active.
//!
//! ## Features
//!
//! - `arbitrary`: implements `quickcheck::Arbitrary` for [`Path`] and [`Operation`], and provides
//!   [`test_util::ArbitraryValue`].
//! - `ulid`: adds [`IdGenerator::Ulid`](schema::IdGenerator) for record ids.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod value;
pub use value::{clone, eq};
pub mod path;
pub use path::Path;
pub mod operation;
pub use operation::{Operation, OperationKind, Transformed};
pub mod diff;
pub use diff::{DiffOptions, diffs};
pub mod document;
pub use document::{Document, DocumentError};
pub mod schema;
pub use schema::Schema;
pub mod cache;
pub use cache::{Cache, CacheError, CacheOptions};
pub mod queue;
pub mod notifier;
pub mod transformable;
pub use transformable::TransformError;
pub mod request;
pub use request::RequestError;
pub mod source;
pub use source::{MemorySource, Source};
pub mod connectors;
pub mod transaction;
/// Macros usable for tests and initialization
pub mod macros;

#[cfg(any(test, feature = "arbitrary"))]
pub mod test_util;

pub use serde_json::{Map, Value};

// re-export for the `op!` macro
#[doc(hidden)]
pub use serde_json;
