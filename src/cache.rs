// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! A record store over a [`Document`].
//!
//! The cache keeps records at `/<model>/<id>` and understands their links through the
//! [`Schema`]:
//!
//! * forward links live under the record's `__rel` member: a `hasOne` link holds the related id
//!   (or null), a `hasMany` link an object mapping related ids to `true`.
//! * the reverse index lives under the related record's `__rev` member, keyed by the path of the
//!   link pointing at it (`/moon/m1/__rel/planet`, `/planet/p1/__rel/moons/m1`).
//!
//! Removing a record clears every link still pointing at it: `hasOne` links are replaced with
//! null and `hasMany` entries are removed. This cleanup, like reverse index maintenance, is best
//! effort and never fails the operation that triggered it.
//!
//! [`Cache::transform`] returns every change that should be announced to observers, each with
//! its inverse. Reverse index maintenance is only included when
//! [`CacheOptions::track_rev_link_changes`] is set.
use crate::{
    Document, DocumentError, Operation, Path, Transformed,
    operation::OperationKind,
    schema::{LINKS_FIELD, LinkDef, LinkKind, ModelDef, REV_LINKS_FIELD, Schema, UnknownModel},
};
use ahash::RandomState;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    fmt,
};
use tracing::{debug, warn};

/// Errors raised by [`Cache::transform`] and record initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The operation kind or path shape cannot be applied to a cache.
    OperationNotAllowed(&'static str),
    UnknownModel(String),
    Document(DocumentError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::OperationNotAllowed(reason) => write!(f, "operation not allowed: {reason}"),
            CacheError::UnknownModel(model) => write!(f, "unknown model {model}"),
            CacheError::Document(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Document(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DocumentError> for CacheError {
    fn from(value: DocumentError) -> Self {
        Self::Document(value)
    }
}

impl From<UnknownModel> for CacheError {
    fn from(value: UnknownModel) -> Self {
        Self::UnknownModel(value.0)
    }
}

/// Controls which changes a [`Cache`] reports and which bookkeeping it maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// Report the primary operation and cascading link cleanup.
    pub track_changes: bool,
    /// Maintain the `__rev` index of every record.
    pub track_rev_links: bool,
    /// Also report changes made to the `__rev` index.
    pub track_rev_link_changes: bool,
    /// Remember removed records, see [`Cache::is_deleted`].
    pub track_deleted: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            track_changes: true,
            track_rev_links: true,
            track_rev_link_changes: false,
            track_deleted: false,
        }
    }
}

#[derive(Clone)]
pub struct Cache {
    doc: Document,
    schema: Schema,
    options: CacheOptions,
    deleted: HashMap<String, HashSet<String, RandomState>, RandomState>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("data", self.doc.root())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Creates a cache with an empty container for every model of `schema`.
    pub fn new(schema: Schema, options: CacheOptions) -> Self {
        let mut cache = Self {
            doc: Document::new(),
            schema,
            options,
            deleted: HashMap::default(),
        };
        cache.ensure_containers();
        cache
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Declares a model and creates its container if it does not exist yet.
    pub fn register_model(&mut self, name: impl Into<String>, model: ModelDef) {
        let name = name.into();
        self.schema.register_model(name.clone(), model);
        self.ensure_container(&name);
    }

    /// Replaces all data, for example with data loaded from storage, and forgets removals.
    pub fn reset(&mut self, data: Value) {
        self.doc.reset(data);
        self.deleted.clear();
        self.ensure_containers();
    }

    /// Returns the value at `path`, or `None` if nothing is there.
    pub fn retrieve(&self, path: &Path) -> Option<&Value> {
        self.doc.retrieve(path).ok()
    }

    /// Returns the number of members or elements at `path`.
    ///
    /// `None` if nothing is there or the value is not a container.
    pub fn length(&self, path: &Path) -> Option<usize> {
        match self.retrieve(path)? {
            Value::Array(items) => Some(items.len()),
            Value::Object(map) => Some(map.len()),
            _ => None,
        }
    }

    /// Returns true if `path` lies within a record that was removed.
    ///
    /// Always false unless [`CacheOptions::track_deleted`] is set.
    pub fn is_deleted(&self, path: &Path) -> bool {
        match (path.get(0), path.get(1)) {
            (Some(model), Some(id)) => self.deleted.get(model).is_some_and(|ids| ids.contains(id)),
            _ => false,
        }
    }

    /// Initializes a new record of `model` in place, see [`Schema::normalize`].
    pub fn init_record(&self, model: &str, record: &mut Map<String, Value>) -> Result<(), CacheError> {
        Ok(self.schema.normalize(model, record)?)
    }

    /// Applies an `add`, `remove` or `replace` operation addressing a record or a location
    /// within one.
    ///
    /// Returns the changes to announce, in the order they were applied.
    pub fn transform(&mut self, operation: &Operation) -> Result<Vec<Transformed>, CacheError> {
        let kind = operation.kind();
        if !matches!(
            kind,
            OperationKind::Add | OperationKind::Remove | OperationKind::Replace
        ) {
            return Err(CacheError::OperationNotAllowed(
                "only add, remove and replace operations can be applied to a cache",
            ));
        }
        let path = operation.path();
        if path.len() < 2 {
            return Err(CacheError::OperationNotAllowed(
                "cache operations must address a record or a location within one",
            ));
        }

        let kept;
        let operation = match self.keep_rev_links(operation) {
            Some(replacement) => {
                kept = replacement;
                &kept
            }
            None => operation,
        };

        let mut changes = Vec::new();
        if self.options.track_rev_links && kind != OperationKind::Add {
            self.remove_rev_links(path, kind == OperationKind::Remove, &mut changes);
        }

        self.apply(operation, self.options.track_changes, &mut changes)?;

        if self.options.track_rev_links && kind != OperationKind::Remove {
            if let Some(value) = operation.value() {
                self.add_rev_links(path, value, &mut changes);
            }
        }

        if self.options.track_deleted && path.len() == 2 {
            self.track_deleted(path, kind == OperationKind::Remove);
        }
        Ok(changes)
    }

    fn ensure_containers(&mut self) {
        let models: Vec<String> = self.schema.models.keys().cloned().collect();
        for model in models {
            self.ensure_container(&model);
        }
    }

    fn ensure_container(&mut self, model: &str) {
        let path = Path::root().child(model);
        if self.retrieve(&path).is_none() {
            if let Err(err) = self.doc.add(&path, Value::Object(Map::new()), false) {
                warn!(%model, %err, "failed to create model container");
            }
        }
    }

    fn track_deleted(&mut self, path: &Path, removed: bool) {
        let (Some(model), Some(id)) = (path.get(0), path.get(1)) else {
            return;
        };
        if removed {
            self.deleted
                .entry(model.to_string())
                .or_default()
                .insert(id.to_string());
        } else if let Some(ids) = self.deleted.get_mut(model) {
            ids.remove(id);
        }
    }

    fn apply(
        &mut self,
        operation: &Operation,
        track: bool,
        changes: &mut Vec<Transformed>,
    ) -> Result<(), DocumentError> {
        let inverse = self.doc.transform(operation, track)?;
        if let Some(inverse) = inverse {
            changes.push(Transformed {
                operation: operation.clone(),
                inverse,
            });
        }
        Ok(())
    }

    /// Applies reverse index maintenance, which may fail when a related record is absent.
    fn apply_ref(&mut self, operation: Operation, changes: &mut Vec<Transformed>) {
        if let Err(err) = self.apply(&operation, self.options.track_rev_link_changes, changes) {
            debug!(%operation, %err, "skipped reverse link update");
        }
    }

    /// Resolves the links held at `path` (a whole record, a link, or a `hasMany` entry) given
    /// the value found there.
    fn links_at(&self, path: &Path, value: &Value) -> Vec<RevLink> {
        let (Some(model), Some(id)) = (path.get(0), path.get(1)) else {
            return Vec::new();
        };
        let mut links = Vec::new();
        if path.len() == 2 {
            let Some(Value::Object(rels)) = value.get(LINKS_FIELD) else {
                return links;
            };
            for (link, related) in rels {
                let Some(def) = self.schema.link(model, link) else {
                    debug!(%model, %link, "ignoring undeclared link");
                    continue;
                };
                links.extend(
                    related_ids(def.kind, related)
                        .into_iter()
                        .map(|related| RevLink::new(model, id, link, def, related)),
                );
            }
        } else if path.get(2) == Some(LINKS_FIELD) {
            let Some(link) = path.get(3) else {
                return links;
            };
            let Some(def) = self.schema.link(model, link) else {
                debug!(%model, %link, "ignoring undeclared link");
                return links;
            };
            let related = match (path.len(), def.kind) {
                (4, kind) => related_ids(kind, value),
                (5, LinkKind::HasMany) => path.get(4).map(str::to_string).into_iter().collect(),
                _ => Vec::new(),
            };
            links.extend(
                related
                    .into_iter()
                    .map(|related| RevLink::new(model, id, link, def, related)),
            );
        }
        links
    }

    fn add_rev_links(&mut self, path: &Path, value: &Value, changes: &mut Vec<Transformed>) {
        for RevLink { model, related, key } in self.links_at(path, value) {
            let refs_path = Path::from_iter([model, related, REV_LINKS_FIELD.to_string()]);
            match self.retrieve(&refs_path) {
                Some(Value::Object(refs)) if refs.contains_key(&key) => {}
                Some(Value::Object(_)) => {
                    self.apply_ref(Operation::add(refs_path.child(key), Value::Bool(true)), changes)
                }
                _ => {
                    let mut refs = Map::new();
                    refs.insert(key, Value::Bool(true));
                    self.apply_ref(Operation::add(refs_path, Value::Object(refs)), changes)
                }
            }
        }
    }

    /// Rewrites the replacement of a whole record so that the record keeps the reverse index the
    /// cache maintains for it. Returns `None` if `operation` needs no rewrite.
    fn keep_rev_links(&self, operation: &Operation) -> Option<Operation> {
        let path = operation.path();
        if !self.options.track_rev_links
            || operation.kind() != OperationKind::Replace
            || path.len() != 2
        {
            return None;
        }
        let refs = self.retrieve(path)?.get(REV_LINKS_FIELD)?;
        let Some(Value::Object(record)) = operation.value() else {
            return None;
        };
        if record.get(REV_LINKS_FIELD) == Some(refs) {
            return None;
        }
        let mut record = record.clone();
        record.insert(REV_LINKS_FIELD.to_string(), refs.clone());
        Some(Operation::replace(path.clone(), Value::Object(record)))
    }

    /// Drops the reverse index entries of the links held at `path`. If a whole record is
    /// `removed`, every link still pointing at it is cleared as well.
    fn remove_rev_links(&mut self, path: &Path, removed: bool, changes: &mut Vec<Transformed>) {
        let Some(value) = self.retrieve(path).filter(|value| !value.is_null()).cloned() else {
            return;
        };

        if removed && path.len() == 2 {
            if let Some(Value::Object(refs)) = value.get(REV_LINKS_FIELD) {
                for key in refs.keys() {
                    let link_path = Path::parse(key);
                    let cleanup = if link_path.len() == 4 {
                        Operation::replace(link_path, Value::Null)
                    } else {
                        Operation::remove(link_path)
                    };
                    if let Err(err) = self.apply(&cleanup, self.options.track_changes, changes) {
                        warn!(operation = %cleanup, %err, "failed to clear link to removed record");
                    }
                }
            }
        }

        for RevLink { model, related, key } in self.links_at(path, &value) {
            let rev_path = Path::from_iter([model, related, REV_LINKS_FIELD.to_string(), key]);
            self.apply_ref(Operation::remove(rev_path), changes);
        }
    }
}

/// A link pointing at record `related` of `model`, keyed as in the related record's `__rev`.
struct RevLink {
    model: String,
    related: String,
    key: String,
}

impl RevLink {
    fn new(model: &str, id: &str, link: &str, def: &LinkDef, related: String) -> Self {
        let link_path = format!("/{model}/{id}/{LINKS_FIELD}/{link}");
        let key = match def.kind {
            LinkKind::HasOne => link_path,
            LinkKind::HasMany => format!("{link_path}/{related}"),
        };
        Self {
            model: def.model.clone(),
            related,
            key,
        }
    }
}

/// The ids a link value refers to.
fn related_ids(kind: LinkKind, value: &Value) -> Vec<String> {
    match (kind, value) {
        (LinkKind::HasMany, Value::Object(ids)) => ids.keys().cloned().collect(),
        (LinkKind::HasOne, Value::String(id)) if !id.is_empty() => vec![id.clone()],
        _ => Vec::new(),
    }
}
