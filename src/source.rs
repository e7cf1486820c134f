// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Replicas that can be connected to each other.
//!
//! A [`Source`] is anything a [connector](crate::connectors) can observe or replicate into: it
//! applies operations through its own queue, announces every applied change, and optionally
//! lets others read its current state.
//!
//! [`MemorySource`] is the in-memory replica: a [`Cache`] behind a transform queue, which also
//! answers record-level [`Request`]s.
use crate::{
    Cache, CacheError, CacheOptions, Operation, Path, TransformError, Transformed,
    notifier::Notifier,
    request::{Request, RequestError, RequestHandlers, Requestable, Selector},
    schema::{LINKS_FIELD, LinkDef, LinkKind, ModelDef, Schema},
    transformable::{Transform, Transformable},
    value,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// An endpoint of a [`TransformConnector`](crate::connectors::TransformConnector).
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Applies `operations` in order and returns the inverses of the resulting changes, in the
    /// order they were applied.
    async fn transform(&self, operations: Vec<Operation>) -> Result<Vec<Operation>, TransformError>;

    /// Listeners invoked with every change once it has been applied.
    fn did_transform(&self) -> &Notifier<Transformed>;

    /// Returns a copy of the value at `path`, or `None` if nothing is there.
    ///
    /// Only meaningful if [`supports_retrieve`](Self::supports_retrieve) returns true.
    fn retrieve(&self, path: &Path) -> Option<Value>;

    fn supports_retrieve(&self) -> bool {
        true
    }

    /// Returns true if `path` lies within a record this source removed.
    fn is_deleted(&self, _path: &Path) -> bool {
        false
    }

    /// Returns true while the source is applying operations.
    fn is_processing(&self) -> bool;

    /// Waits until the source is not applying operations.
    async fn until_idle(&self);
}

/// Applies operations to a [`Cache`].
pub struct CacheTransform(Mutex<Cache>);

impl CacheTransform {
    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transform for CacheTransform {
    async fn apply(&self, operation: Operation) -> Result<Vec<Transformed>, TransformError> {
        Ok(self.lock().transform(&operation)?)
    }
}

/// An in-memory replica of schema-described records.
pub struct MemorySource {
    transformable: Transformable<CacheTransform>,
    handlers: RequestHandlers,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("cache", &*self.cache())
            .field("transformable", &self.transformable)
            .finish_non_exhaustive()
    }
}

impl MemorySource {
    pub fn new(schema: Schema, options: CacheOptions) -> Self {
        let cache = Cache::new(schema, options);
        Self {
            transformable: Transformable::new(CacheTransform(Mutex::new(cache))),
            handlers: RequestHandlers::new(),
        }
    }

    pub fn transformable(&self) -> &Transformable<CacheTransform> {
        &self.transformable
    }

    pub fn did_transform(&self) -> &Notifier<Transformed> {
        self.transformable.did_transform()
    }

    /// Applies `operations` in order, see [`Transformable::transform`].
    pub async fn transform(
        &self,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Result<Vec<Operation>, TransformError> {
        self.transformable.transform(operations).await
    }

    pub fn retrieve(&self, path: &Path) -> Option<Value> {
        self.cache().retrieve(path).cloned()
    }

    pub fn length(&self, path: &Path) -> Option<usize> {
        self.cache().length(path)
    }

    pub fn is_deleted(&self, path: &Path) -> bool {
        self.cache().is_deleted(path)
    }

    /// Replaces all data without announcing any change.
    pub fn reset(&self, data: Value) {
        self.cache().reset(data);
    }

    pub fn register_model(&self, name: impl Into<String>, model: ModelDef) {
        self.cache().register_model(name, model);
    }

    pub fn schema(&self) -> Schema {
        self.cache().schema().clone()
    }

    /// Locks the underlying cache.
    ///
    /// Holding the guard blocks every transform of this source.
    pub fn cache(&self) -> MutexGuard<'_, Cache> {
        self.transformable.target().lock()
    }

    pub async fn find(&self, model: &str, selector: Selector) -> Result<Value, RequestError> {
        self.request(Request::Find {
            model: model.to_string(),
            selector,
        })
        .await
    }

    /// Adds a record and returns it as stored.
    pub async fn add(&self, model: &str, data: Map<String, Value>) -> Result<Value, RequestError> {
        self.request(Request::Add {
            model: model.to_string(),
            data,
        })
        .await
    }

    pub async fn update(&self, model: &str, data: Map<String, Value>) -> Result<Value, RequestError> {
        self.request(Request::Update {
            model: model.to_string(),
            data,
        })
        .await
    }

    pub async fn patch(
        &self,
        model: &str,
        id: &str,
        field: impl Into<Path>,
        value: Value,
    ) -> Result<Value, RequestError> {
        self.request(Request::Patch {
            model: model.to_string(),
            id: id.to_string(),
            field: field.into(),
            value,
        })
        .await
    }

    pub async fn remove(&self, model: &str, id: &str) -> Result<Value, RequestError> {
        self.request(Request::Remove {
            model: model.to_string(),
            id: id.to_string(),
        })
        .await
    }

    /// Links record `id` to `related`, and `related` back to `id` if the link has an inverse.
    pub async fn add_link(
        &self,
        model: &str,
        id: &str,
        link: &str,
        related: &str,
    ) -> Result<Value, RequestError> {
        self.request(Request::AddLink {
            model: model.to_string(),
            id: id.to_string(),
            link: link.to_string(),
            related: related.to_string(),
        })
        .await
    }

    pub async fn remove_link(
        &self,
        model: &str,
        id: &str,
        link: &str,
        related: Option<&str>,
    ) -> Result<Value, RequestError> {
        self.request(Request::RemoveLink {
            model: model.to_string(),
            id: id.to_string(),
            link: link.to_string(),
            related: related.map(str::to_string),
        })
        .await
    }

    /// Returns the related record of a `hasOne` link, or all related records of a `hasMany`
    /// link.
    pub async fn find_link(&self, model: &str, id: &str, link: &str) -> Result<Value, RequestError> {
        self.request(Request::FindLink {
            model: model.to_string(),
            id: id.to_string(),
            link: link.to_string(),
        })
        .await
    }

    /// Applies `operations` and returns the record at `model/id` afterwards.
    async fn transform_record(
        &self,
        operations: Vec<Operation>,
        model: &str,
        id: &str,
    ) -> Result<Value, RequestError> {
        self.transform(operations).await?;
        self.retrieve(&record_path(model, id))
            .ok_or_else(|| RequestError::record_not_found(model, id))
    }

    fn find_records(&self, model: &str, selector: &Selector) -> Result<Value, RequestError> {
        let cache = self.cache();
        require_model(&cache, model)?;
        let records = match cache.retrieve(&Path::root().child(model)) {
            Some(Value::Object(records)) => records,
            _ => return Ok(Value::Array(Vec::new())),
        };
        match selector {
            Selector::All => Ok(Value::Array(records.values().cloned().collect())),
            Selector::Id(id) => records
                .get(id)
                .cloned()
                .ok_or_else(|| RequestError::record_not_found(model, id)),
            Selector::Ids(ids) => {
                let missing: Vec<String> = ids
                    .iter()
                    .filter(|id| !records.contains_key(id.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(RequestError::RecordNotFound {
                        model: model.to_string(),
                        ids: missing,
                    });
                }
                Ok(Value::Array(
                    ids.iter().filter_map(|id| records.get(id).cloned()).collect(),
                ))
            }
            Selector::Matching(query) => Ok(Value::Array(
                records
                    .values()
                    .filter(|record| {
                        query.iter().all(|(member, expected)| {
                            record.get(member).is_some_and(|actual| value::eq(actual, expected))
                        })
                    })
                    .cloned()
                    .collect(),
            )),
        }
    }

    fn find_related(&self, model: &str, id: &str, link: &str) -> Result<Value, RequestError> {
        let cache = self.cache();
        let def = require_link(&cache, model, link)?;
        let record = cache
            .retrieve(&record_path(model, id))
            .ok_or_else(|| RequestError::record_not_found(model, id))?;
        let not_found = || RequestError::LinkNotFound {
            model: model.to_string(),
            id: id.to_string(),
            link: link.to_string(),
        };
        let related = record
            .get(LINKS_FIELD)
            .and_then(|links| links.get(link))
            .ok_or_else(not_found)?;
        let lookup = |related: &str| cache.retrieve(&record_path(&def.model, related)).cloned();
        match (def.kind, related) {
            (LinkKind::HasOne, Value::String(related)) => lookup(related).ok_or_else(not_found),
            (LinkKind::HasMany, Value::Object(related)) => related
                .keys()
                .map(|related| lookup(related).ok_or_else(not_found))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Err(not_found()),
        }
    }

    /// Normalizes a new record and returns it with its id.
    fn prepare_record(
        &self,
        model: &str,
        mut data: Map<String, Value>,
    ) -> Result<(String, Value), RequestError> {
        let cache = self.cache();
        cache.init_record(model, &mut data)?;
        let id = data
            .get(&cache.schema().id_field)
            .map(record_id)
            .unwrap_or_default();
        Ok((id, Value::Object(data)))
    }

    fn link_operations(
        &self,
        model: &str,
        id: &str,
        link: &str,
        related: &str,
    ) -> Result<Vec<Operation>, RequestError> {
        let cache = self.cache();
        let def = require_link(&cache, model, link)?;
        require_record(&cache, model, id)?;
        let mut operations = link_containers(&cache, def, model, id, link);
        let mut links = vec![link_operation(&cache, def, model, id, link, related)];
        if let Some(inverse) = &def.inverse {
            let inverse_def = require_link(&cache, &def.model, inverse)?;
            require_record(&cache, &def.model, related)?;
            for container in link_containers(&cache, inverse_def, &def.model, related, inverse) {
                // a record linked to itself shares its `__rel` container
                if !operations.iter().any(|op| op.path() == container.path()) {
                    operations.push(container);
                }
            }
            links.push(link_operation(
                &cache,
                inverse_def,
                &def.model,
                related,
                inverse,
                id,
            ));
        }
        operations.extend(links);
        Ok(operations)
    }

    fn unlink_operations(
        &self,
        model: &str,
        id: &str,
        link: &str,
        related: Option<&str>,
    ) -> Result<Vec<Operation>, RequestError> {
        let cache = self.cache();
        let def = require_link(&cache, model, link)?;
        require_record(&cache, model, id)?;
        let not_found = || RequestError::LinkNotFound {
            model: model.to_string(),
            id: id.to_string(),
            link: link.to_string(),
        };
        let link_path = record_path(model, id).join([LINKS_FIELD, link]);
        let related = match (def.kind, related) {
            (LinkKind::HasOne, None) => match cache.retrieve(&link_path) {
                Some(Value::String(current)) => current.clone(),
                _ => return Err(not_found()),
            },
            (_, Some(related)) => related.to_string(),
            (LinkKind::HasMany, None) => return Err(not_found()),
        };
        let operation = unlink_operation(&cache, def, model, id, link, &related).ok_or_else(not_found)?;
        let mut operations = vec![operation];

        if let Some(inverse) = &def.inverse {
            let inverse_def = require_link(&cache, &def.model, inverse)?;
            match unlink_operation(&cache, inverse_def, &def.model, &related, inverse, id) {
                Some(operation) => operations.push(operation),
                None => debug!(model = %def.model, id = %related, link = %inverse, "inverse link already absent"),
            }
        }
        Ok(operations)
    }
}

fn record_path(model: &str, id: &str) -> Path {
    Path::from_iter([model.to_string(), id.to_string()])
}

/// The id member of a record as a path segment.
fn record_id(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

fn require_model(cache: &Cache, model: &str) -> Result<(), RequestError> {
    match cache.schema().model(model) {
        Some(_) => Ok(()),
        None => Err(CacheError::UnknownModel(model.to_string()).into()),
    }
}

fn require_link<'a>(cache: &'a Cache, model: &str, link: &str) -> Result<&'a LinkDef, RequestError> {
    require_model(cache, model)?;
    cache
        .schema()
        .link(model, link)
        .ok_or_else(|| RequestError::UnknownLink {
            model: model.to_string(),
            link: link.to_string(),
        })
}

fn require_record(cache: &Cache, model: &str, id: &str) -> Result<(), RequestError> {
    match cache.retrieve(&record_path(model, id)) {
        Some(_) => Ok(()),
        None => Err(RequestError::record_not_found(model, id)),
    }
}

/// Creates whatever is missing of the containers that link `link` of record `model/id` is
/// stored in: the record's `__rel` member and, for a `hasMany` link, the link's own object.
fn link_containers(
    cache: &Cache,
    def: &LinkDef,
    model: &str,
    id: &str,
    link: &str,
) -> Vec<Operation> {
    let links_path = record_path(model, id).child(LINKS_FIELD);
    let link_path = links_path.child(link);
    let mut operations = Vec::new();
    match cache.retrieve(&links_path) {
        Some(Value::Object(_)) => {}
        Some(_) => operations.push(Operation::replace(links_path, Value::Object(Map::new()))),
        None => operations.push(Operation::add(links_path, Value::Object(Map::new()))),
    }
    if def.kind == LinkKind::HasMany {
        match cache.retrieve(&link_path) {
            Some(Value::Object(_)) => {}
            Some(_) => operations.push(Operation::replace(link_path, def.empty())),
            None => operations.push(Operation::add(link_path, def.empty())),
        }
    }
    operations
}

/// Points link `link` of record `model/id` at `related`.
///
/// A `hasOne` link that is already set is replaced, so that the reverse index of the record it
/// pointed at is cleared.
fn link_operation(
    cache: &Cache,
    def: &LinkDef,
    model: &str,
    id: &str,
    link: &str,
    related: &str,
) -> Operation {
    let path = record_path(model, id).join([LINKS_FIELD, link]);
    match def.kind {
        LinkKind::HasMany => Operation::add(path.child(related), Value::Bool(true)),
        LinkKind::HasOne if cache.retrieve(&path).is_some() => {
            Operation::replace(path, Value::String(related.to_string()))
        }
        LinkKind::HasOne => Operation::add(path, Value::String(related.to_string())),
    }
}

/// Clears link `link` of record `model/id` if it points at `related`.
fn unlink_operation(
    cache: &Cache,
    def: &LinkDef,
    model: &str,
    id: &str,
    link: &str,
    related: &str,
) -> Option<Operation> {
    let path = record_path(model, id).join([LINKS_FIELD, link]);
    match def.kind {
        LinkKind::HasMany => {
            let path = path.child(related);
            cache.retrieve(&path).is_some().then(|| Operation::remove(path))
        }
        LinkKind::HasOne => match cache.retrieve(&path) {
            Some(Value::String(current)) if current == related => {
                Some(Operation::replace(path, Value::Null))
            }
            _ => None,
        },
    }
}

#[async_trait]
impl Requestable for MemorySource {
    fn handlers(&self) -> &RequestHandlers {
        &self.handlers
    }

    async fn handle(&self, request: Request) -> Result<Value, RequestError> {
        debug!(kind = %request.kind(), model = %request.model(), "handling request");
        match request {
            Request::Find { model, selector } => self.find_records(&model, &selector),
            Request::Add { model, data } => {
                let (id, record) = self.prepare_record(&model, data)?;
                let path = record_path(&model, &id);
                if self.retrieve(&path).is_some() {
                    return Err(RequestError::RecordAlreadyExists { model, id });
                }
                self.transform_record(vec![Operation::add(path, record)], &model, &id)
                    .await
            }
            Request::Update { model, data } => {
                let (id, record) = self.prepare_record(&model, data)?;
                let path = record_path(&model, &id);
                if self.retrieve(&path).is_none() {
                    return Err(RequestError::record_not_found(&model, &id));
                }
                self.transform_record(vec![Operation::replace(path, record)], &model, &id)
                    .await
            }
            Request::Patch {
                model,
                id,
                field,
                value,
            } => {
                let path = record_path(&model, &id);
                if self.retrieve(&path).is_none() {
                    return Err(RequestError::record_not_found(&model, &id));
                }
                let operation = Operation::replace(path.join(field.segments()), value);
                self.transform_record(vec![operation], &model, &id).await
            }
            Request::Remove { model, id } => {
                let path = record_path(&model, &id);
                let Some(record) = self.retrieve(&path) else {
                    return Err(RequestError::record_not_found(&model, &id));
                };
                self.transform([Operation::remove(path)]).await?;
                Ok(record)
            }
            Request::AddLink {
                model,
                id,
                link,
                related,
            } => {
                let operations = self.link_operations(&model, &id, &link, &related)?;
                self.transform_record(operations, &model, &id).await
            }
            Request::RemoveLink {
                model,
                id,
                link,
                related,
            } => {
                let operations = self.unlink_operations(&model, &id, &link, related.as_deref())?;
                self.transform_record(operations, &model, &id).await
            }
            Request::FindLink { model, id, link } => self.find_related(&model, &id, &link),
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn transform(&self, operations: Vec<Operation>) -> Result<Vec<Operation>, TransformError> {
        self.transformable.transform(operations).await
    }

    fn did_transform(&self) -> &Notifier<Transformed> {
        self.transformable.did_transform()
    }

    fn retrieve(&self, path: &Path) -> Option<Value> {
        MemorySource::retrieve(self, path)
    }

    fn is_deleted(&self, path: &Path) -> bool {
        MemorySource::is_deleted(self, path)
    }

    fn is_processing(&self) -> bool {
        self.transformable.is_processing()
    }

    async fn until_idle(&self) {
        self.transformable.until_idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{path, test_util::planets};
    use serde_json::json;

    fn source() -> MemorySource {
        MemorySource::new(planets(), CacheOptions::default())
    }

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn planet(source: &MemorySource, id: &str, name: &str) -> Value {
        source
            .add("planet", record(json!({"__id": id, "name": name})))
            .await
            .unwrap()
    }

    async fn moon(source: &MemorySource, id: &str, name: &str) -> Value {
        source
            .add("moon", record(json!({"__id": id, "name": name})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_initializes_new_records() {
        let source = source();
        let added = source
            .add("planet", record(json!({"name": "Jupiter"})))
            .await
            .unwrap();
        let id = added["__id"].as_str().unwrap();
        assert_eq!(added["classification"], json!("terrestrial"));
        assert_eq!(added["__rel"], json!({"moons": {}}));
        assert_eq!(source.retrieve(&path!("planet", id)), Some(added.clone()));
        assert_eq!(source.length(&path!("planet")), Some(1));
    }

    #[tokio::test]
    async fn add_refuses_existing_records() {
        let source = source();
        planet(&source, "p1", "Mercury").await;
        let again = source
            .add("planet", record(json!({"__id": "p1", "name": "Venus"})))
            .await;
        assert!(matches!(again, Err(RequestError::RecordAlreadyExists { id, .. }) if id == "p1"));
        assert_eq!(source.retrieve(&path!("planet", "p1", "name")), Some(json!("Mercury")));
    }

    #[tokio::test]
    async fn unknown_models_fail() {
        let source = source();
        let result = source.add("star", Map::new()).await;
        assert!(matches!(
            result,
            Err(RequestError::Transform(TransformError::Cache(CacheError::UnknownModel(model)))) if model == "star"
        ));
        assert!(source.find("star", Selector::All).await.is_err());
    }

    #[tokio::test]
    async fn find_by_selector() {
        let source = source();
        planet(&source, "p1", "Mercury").await;
        planet(&source, "p2", "Venus").await;

        let all = source.find("planet", Selector::All).await.unwrap();
        assert_eq!(all.as_array().map(Vec::len), Some(2));

        let venus = source
            .find("planet", Selector::Id("p2".to_string()))
            .await
            .unwrap();
        assert_eq!(venus["name"], json!("Venus"));

        let both = source
            .find("planet", Selector::Ids(vec!["p2".to_string(), "p1".to_string()]))
            .await
            .unwrap();
        assert_eq!(both[0]["name"], json!("Venus"));
        assert_eq!(both[1]["name"], json!("Mercury"));

        let matching = source
            .find("planet", Selector::Matching(record(json!({"name": "Mercury"}))))
            .await
            .unwrap();
        assert_eq!(matching.as_array().map(Vec::len), Some(1));
        assert_eq!(matching[0]["__id"], json!("p1"));

        let none = source
            .find("planet", Selector::Matching(record(json!({"name": "Pluto"}))))
            .await
            .unwrap();
        assert_eq!(none, json!([]));
    }

    #[tokio::test]
    async fn find_reports_missing_ids() {
        let source = source();
        planet(&source, "p1", "Mercury").await;
        let missing = source
            .find(
                "planet",
                Selector::Ids(vec!["p1".to_string(), "p8".to_string(), "p9".to_string()]),
            )
            .await;
        match missing {
            Err(RequestError::RecordNotFound { model, ids }) => {
                assert_eq!(model, "planet");
                assert_eq!(ids, ["p8", "p9"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            source.find("planet", Selector::Id("p8".to_string())).await,
            Err(RequestError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_patch_and_remove() {
        let source = source();
        planet(&source, "p1", "Mercury").await;

        let updated = source
            .update(
                "planet",
                record(json!({"__id": "p1", "name": "Venus", "__rel": {"moons": {}}})),
            )
            .await
            .unwrap();
        assert_eq!(
            updated,
            json!({
                "__id": "p1",
                "name": "Venus",
                "__rel": {"moons": {}},
                "__rev": {},
                "classification": "terrestrial",
            })
        );

        let patched = source
            .patch("planet", "p1", "name", json!("Earth"))
            .await
            .unwrap();
        assert_eq!(patched["name"], json!("Earth"));

        assert!(matches!(
            source.patch("planet", "p2", "name", json!("Mars")).await,
            Err(RequestError::RecordNotFound { .. })
        ));
        assert!(matches!(
            source
                .update("planet", record(json!({"__id": "p2", "name": "Mars"})))
                .await,
            Err(RequestError::RecordNotFound { .. })
        ));

        let removed = source.remove("planet", "p1").await.unwrap();
        assert_eq!(removed["name"], json!("Earth"));
        assert_eq!(source.retrieve(&path!("planet", "p1")), None);
        assert!(matches!(
            source.remove("planet", "p1").await,
            Err(RequestError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn links_maintain_their_inverse() {
        let source = source();
        planet(&source, "p1", "Jupiter").await;
        moon(&source, "m1", "Io").await;
        moon(&source, "m2", "Europa").await;

        let jupiter = source.add_link("planet", "p1", "moons", "m1").await.unwrap();
        assert_eq!(jupiter["__rel"]["moons"], json!({"m1": true}));
        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel", "planet")), Some(json!("p1")));

        source.add_link("moon", "m2", "planet", "p1").await.unwrap();
        assert_eq!(
            source.retrieve(&path!("planet", "p1", "__rel", "moons")),
            Some(json!({"m1": true, "m2": true}))
        );

        let moons = source.find_link("planet", "p1", "moons").await.unwrap();
        assert_eq!(moons[0]["name"], json!("Io"));
        assert_eq!(moons[1]["name"], json!("Europa"));
        let jupiter = source.find_link("moon", "m1", "planet").await.unwrap();
        assert_eq!(jupiter["name"], json!("Jupiter"));

        source
            .remove_link("planet", "p1", "moons", Some("m1"))
            .await
            .unwrap();
        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel", "planet")), Some(Value::Null));
        source.remove_link("moon", "m2", "planet", None).await.unwrap();
        assert_eq!(source.retrieve(&path!("planet", "p1", "__rel", "moons")), Some(json!({})));
    }

    #[tokio::test]
    async fn records_with_given_ids_can_be_linked() {
        let source = source();
        let jupiter = planet(&source, "p1", "Jupiter").await;
        assert_eq!(jupiter["__rel"], json!({"moons": {}}));
        assert_eq!(jupiter["__rev"], json!({}));
        assert_eq!(jupiter["classification"], json!("terrestrial"));
        moon(&source, "m1", "Io").await;
        moon(&source, "m2", "Europa").await;

        source.add_link("planet", "p1", "moons", "m1").await.unwrap();
        source.add_link("moon", "m2", "planet", "p1").await.unwrap();
        assert_eq!(
            source.retrieve(&path!("planet", "p1", "__rel", "moons")),
            Some(json!({"m1": true, "m2": true}))
        );
        for id in ["m1", "m2"] {
            assert_eq!(source.retrieve(&path!("moon", id, "__rel", "planet")), Some(json!("p1")));
        }
    }

    #[tokio::test]
    async fn links_create_missing_containers() {
        let source = source();
        source
            .transform([
                Operation::add(path!("planet", "p1"), json!({"name": "Saturn"})),
                Operation::add(path!("moon", "m1"), json!({"name": "Titan"})),
                Operation::add(path!("moon", "m2"), json!({"name": "Rhea"})),
            ])
            .await
            .unwrap();

        source.add_link("planet", "p1", "moons", "m1").await.unwrap();
        assert_eq!(
            source.retrieve(&path!("planet", "p1", "__rel")),
            Some(json!({"moons": {"m1": true}}))
        );
        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel")), Some(json!({"planet": "p1"})));

        source.add_link("moon", "m2", "planet", "p1").await.unwrap();
        assert_eq!(source.retrieve(&path!("moon", "m2", "__rel")), Some(json!({"planet": "p1"})));
        assert_eq!(
            source.retrieve(&path!("planet", "p1", "__rel", "moons")),
            Some(json!({"m1": true, "m2": true}))
        );

        source.remove("planet", "p1").await.unwrap();
        for id in ["m1", "m2"] {
            assert_eq!(source.retrieve(&path!("moon", id, "__rel", "planet")), Some(Value::Null));
        }
    }

    #[tokio::test]
    async fn updating_a_record_keeps_links_to_it() {
        let source = source();
        planet(&source, "p1", "Jupiter").await;
        moon(&source, "m1", "Io").await;
        source.add_link("moon", "m1", "planet", "p1").await.unwrap();

        let jupiter = source.find("planet", Selector::Id("p1".to_string())).await.unwrap();
        let mut jove = record(jupiter);
        jove.insert("name".to_string(), json!("Jove"));
        source.update("planet", jove).await.unwrap();

        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel", "planet")), Some(json!("p1")));
        assert_eq!(
            source.retrieve(&path!("planet", "p1", "__rel", "moons")),
            Some(json!({"m1": true}))
        );
        let jove = source.find_link("moon", "m1", "planet").await.unwrap();
        assert_eq!(jove["name"], json!("Jove"));

        source.remove("planet", "p1").await.unwrap();
        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel", "planet")), Some(Value::Null));
    }

    #[tokio::test]
    async fn link_errors() {
        let source = source();
        planet(&source, "p1", "Jupiter").await;
        moon(&source, "m1", "Io").await;

        assert!(matches!(
            source.add_link("planet", "p1", "rings", "r1").await,
            Err(RequestError::UnknownLink { .. })
        ));
        assert!(matches!(
            source.add_link("planet", "p2", "moons", "m1").await,
            Err(RequestError::RecordNotFound { .. })
        ));
        assert!(matches!(
            source.add_link("planet", "p1", "moons", "m9").await,
            Err(RequestError::RecordNotFound { model, .. }) if model == "moon"
        ));
        assert!(matches!(
            source.find_link("moon", "m1", "planet").await,
            Err(RequestError::LinkNotFound { .. })
        ));
        assert!(matches!(
            source.remove_link("planet", "p1", "moons", Some("m1")).await,
            Err(RequestError::LinkNotFound { .. })
        ));
        assert!(matches!(
            source.remove_link("planet", "p1", "moons", None).await,
            Err(RequestError::LinkNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn removing_a_record_clears_links_to_it() {
        let source = source();
        planet(&source, "p1", "Jupiter").await;
        moon(&source, "m1", "Io").await;
        source.add_link("planet", "p1", "moons", "m1").await.unwrap();

        source.remove("planet", "p1").await.unwrap();
        assert_eq!(source.retrieve(&path!("moon", "m1", "__rel", "planet")), Some(Value::Null));
        assert!(source.find_link("moon", "m1", "planet").await.is_err());
    }

    #[tokio::test]
    async fn announces_changes() {
        let source = source();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        source.did_transform().add_listener(move |change: Transformed| {
            let log = log.clone();
            async move { log.lock().unwrap().push(change.operation.path().to_string()) }
        });
        planet(&source, "p1", "Jupiter").await;
        moon(&source, "m1", "Io").await;
        source.add_link("planet", "p1", "moons", "m1").await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            [
                "/planet/p1",
                "/moon/m1",
                "/planet/p1/__rel/moons/m1",
                "/moon/m1/__rel/planet",
            ]
        );
    }
}
