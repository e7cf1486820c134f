// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Record shapes: models, their attributes and links, and record identities.
//!
//! A schema is usually loaded from JSON:
//!
//! ```rust
//! # use patchsync::schema::{LinkKind, Schema};
//! let schema: Schema = serde_json::from_str(r#"{
//!     "models": {
//!         "planet": {
//!             "attributes": {"name": {"type": "string"}, "classification": {"defaultValue": "terrestrial"}},
//!             "links": {"moons": {"type": "hasMany", "model": "moon", "inverse": "planet"}}
//!         },
//!         "moon": {
//!             "attributes": {"name": {"type": "string"}},
//!             "links": {"planet": {"type": "hasOne", "model": "planet", "inverse": "moons"}}
//!         }
//!     }
//! }"#).unwrap();
//! assert_eq!(schema.id_field, "__id");
//! assert_eq!(schema.link("moon", "planet").unwrap().kind, LinkKind::HasOne);
//! ```
//!
//! Attribute defaults computed from the record and custom id generators cannot be expressed in
//! JSON; attach them with [`AttributeDef::with_generator`] and [`Schema::with_id_generator`].
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// Record member holding forward links.
pub const LINKS_FIELD: &str = "__rel";
/// Record member holding the reverse link index.
pub const REV_LINKS_FIELD: &str = "__rev";

/// Returned when a model is not declared in the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModel(pub String);

impl fmt::Display for UnknownModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown model {}", self.0)
    }
}

impl std::error::Error for UnknownModel {}

/// The models, attributes and links records are expected to follow.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Schema {
    /// Record member holding the record identity.
    pub id_field: String,
    pub models: BTreeMap<String, ModelDef>,
    #[serde(skip)]
    id_generator: IdGenerator,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            id_field: "__id".to_string(),
            models: BTreeMap::new(),
            id_generator: IdGenerator::default(),
        }
    }
}

/// Declares the members of one record type.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ModelDef {
    pub attributes: BTreeMap<String, AttributeDef>,
    pub links: BTreeMap<String, LinkDef>,
}

impl ModelDef {
    pub fn with_attribute(mut self, name: impl Into<String>, attribute: AttributeDef) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn with_link(mut self, name: impl Into<String>, link: LinkDef) -> Self {
        self.links.insert(name.into(), link);
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttributeDef {
    /// Informational type name; values are not validated against it.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Value given to the attribute when a record is initialized without it.
    pub default_value: Option<DefaultValue>,
}

impl AttributeDef {
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(DefaultValue::Static(value));
        self
    }

    /// Computes the default from the record being initialized, which already carries its id.
    pub fn with_generator(
        mut self,
        generator: impl Fn(&Map<String, Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.default_value = Some(DefaultValue::Generator(Arc::new(generator)));
        self
    }
}

/// The default of an attribute.
#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    Generator(Arc<dyn Fn(&Map<String, Value>) -> Value + Send + Sync>),
}

impl DefaultValue {
    pub fn evaluate(&self, record: &Map<String, Value>) -> Value {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Generator(generate) => generate(record),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            DefaultValue::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

impl<'de> Deserialize<'de> for DefaultValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(DefaultValue::Static)
    }
}

/// Cardinality of a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkKind {
    /// Holds a single related id, or null.
    HasOne,
    /// Holds a set of related ids, stored as an object mapping each id to `true`.
    HasMany,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LinkDef {
    #[serde(rename = "type")]
    pub kind: LinkKind,
    /// The model of related records.
    pub model: String,
    /// The link on the related model pointing back, kept in sync by link requests.
    #[serde(default)]
    pub inverse: Option<String>,
}

impl LinkDef {
    pub fn has_one(model: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::HasOne,
            model: model.into(),
            inverse: None,
        }
    }

    pub fn has_many(model: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::HasMany,
            model: model.into(),
            inverse: None,
        }
    }

    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    /// The empty value of this link on a new record.
    pub fn empty(&self) -> Value {
        match self.kind {
            LinkKind::HasOne => Value::Null,
            LinkKind::HasMany => Value::Object(Map::new()),
        }
    }
}

/// Produces record ids.
///
/// The default combines the current time in milliseconds with a counter, as `TIMESTAMP.COUNTER`.
/// Those ids are unique within one schema instance but not across processes, so replicas that
/// create records concurrently should use a custom generator (or ULIDs, with the `ulid`
/// feature).
#[derive(Clone)]
pub enum IdGenerator {
    TimestampCounter(Arc<AtomicU64>),
    #[cfg(feature = "ulid")]
    Ulid,
    Custom(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::TimestampCounter(Arc::new(AtomicU64::new(0)))
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdGenerator::TimestampCounter(counter) => f
                .debug_tuple("TimestampCounter")
                .field(&counter.load(Ordering::Relaxed))
                .finish(),
            #[cfg(feature = "ulid")]
            IdGenerator::Ulid => f.write_str("Ulid"),
            IdGenerator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl IdGenerator {
    pub fn generate(&self) -> String {
        match self {
            IdGenerator::TimestampCounter(counter) => format!(
                "{}.{}",
                chrono::Utc::now().timestamp_millis(),
                counter.fetch_add(1, Ordering::Relaxed)
            ),
            #[cfg(feature = "ulid")]
            IdGenerator::Ulid => ulid::Ulid::new().to_string(),
            IdGenerator::Custom(generate) => generate(),
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_model(mut self, name: impl Into<String>, model: ModelDef) -> Self {
        self.register_model(name, model);
        self
    }

    pub fn with_id_generator(mut self, generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.id_generator = IdGenerator::Custom(Arc::new(generate));
        self
    }

    /// Generates ids as ULIDs.
    #[cfg(feature = "ulid")]
    pub fn with_ulid_ids(mut self) -> Self {
        self.id_generator = IdGenerator::Ulid;
        self
    }

    /// Declares (or redeclares) a model.
    pub fn register_model(&mut self, name: impl Into<String>, model: ModelDef) {
        self.models.insert(name.into(), model);
    }

    pub fn model(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn link(&self, model: &str, link: &str) -> Option<&LinkDef> {
        self.models.get(model)?.links.get(link)
    }

    pub fn generate_id(&self) -> String {
        self.id_generator.generate()
    }

    /// Initializes a new record of `model` in place.
    ///
    /// A record without an id receives a generated one; an id that is already set is kept.
    /// Every record then receives whatever it lacks of: empty link containers (`__rel`,
    /// `__rev`), an empty value for every declared link, and the default of every declared
    /// attribute (null if the attribute has no default). Members that are present are never
    /// touched, so normalizing twice changes nothing.
    pub fn normalize(
        &self,
        model: &str,
        record: &mut Map<String, Value>,
    ) -> Result<(), UnknownModel> {
        let def = self
            .model(model)
            .ok_or_else(|| UnknownModel(model.to_string()))?;
        if !record.get(&self.id_field).is_some_and(|id| !id.is_null()) {
            record.insert(self.id_field.clone(), Value::String(self.generate_id()));
        }
        init_defaults(def, record);
        Ok(())
    }
}

fn init_defaults(def: &ModelDef, record: &mut Map<String, Value>) {
    for field in [REV_LINKS_FIELD, LINKS_FIELD] {
        if !record.get(field).is_some_and(Value::is_object) {
            record.insert(field.to_string(), Value::Object(Map::new()));
        }
    }

    for (name, attribute) in &def.attributes {
        if !record.contains_key(name) {
            let value = attribute
                .default_value
                .as_ref()
                .map_or(Value::Null, |default| default.evaluate(record));
            record.insert(name.clone(), value);
        }
    }

    if let Some(Value::Object(links)) = record.get_mut(LINKS_FIELD) {
        for (name, link) in &def.links {
            links.entry(name.clone()).or_insert_with(|| link.empty());
        }
    }
}
