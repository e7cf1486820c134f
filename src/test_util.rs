// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Implementation of the quickcheck::Arbitrary trait for document values and paths.

use crate::{Operation, Path};
#[cfg(test)]
use crate::schema::{AttributeDef, LinkDef, ModelDef, Schema};
use quickcheck::{Arbitrary, Gen};
use serde_json::{Map, Number, Value};
#[cfg(test)]
use serde_json::json;

/// Nesting beyond this depth only produces scalars.
const MAX_DEPTH: usize = 3;

/// A [`Value`] usable as a quickcheck input.
///
/// Generated values nest up to a bounded depth and draw keys from a small alphabet so that
/// independently generated values share structure often enough to exercise diffing.
#[derive(Clone, Debug)]
pub struct ArbitraryValue(pub Value);

impl Arbitrary for ArbitraryValue {
    fn arbitrary(g: &mut Gen) -> Self {
        Self(arbitrary_value(g, 0))
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        match &self.0 {
            Value::Array(items) => {
                let items = items.clone();
                Box::new((0..items.len()).map(move |i| {
                    let mut fewer = items.clone();
                    fewer.remove(i);
                    Self(Value::Array(fewer))
                }))
            }
            Value::Object(map) => {
                let map = map.clone();
                let keys: Vec<String> = map.keys().cloned().collect();
                Box::new(keys.into_iter().map(move |key| {
                    let mut fewer = map.clone();
                    fewer.remove(&key);
                    Self(Value::Object(fewer))
                }))
            }
            Value::Null => quickcheck::empty_shrinker(),
            _ => quickcheck::single_shrinker(Self(Value::Null)),
        }
    }
}

fn arbitrary_key(g: &mut Gen) -> String {
    // Skew towards a handful of keys so that objects generated independently overlap.
    let keys = ["a", "b", "c", "name", "moons", "__rel"];
    (*g.choose(&keys).unwrap()).to_string()
}

fn arbitrary_scalar(g: &mut Gen) -> Value {
    match *g.choose(&["null", "bool", "int", "float", "string"]).unwrap() {
        "null" => Value::Null,
        "bool" => Value::Bool(bool::arbitrary(g)),
        "int" => Value::from(i64::arbitrary(g) % 100),
        "float" => {
            let float = f64::arbitrary(g);
            Number::from_f64(if float.is_finite() { float } else { 0.5 })
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        "string" => Value::String(g.choose(&["", "io", "earth", "jupiter"]).unwrap().to_string()),
        _ => unreachable!(),
    }
}

fn arbitrary_value(g: &mut Gen, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return arbitrary_scalar(g);
    }
    match *g.choose(&["scalar", "scalar", "array", "object"]).unwrap() {
        "array" => {
            let len = usize::arbitrary(g) % 4;
            Value::Array((0..len).map(|_| arbitrary_value(g, depth + 1)).collect())
        }
        "object" => {
            let len = usize::arbitrary(g) % 4;
            let mut map = Map::new();
            for _ in 0..len {
                map.insert(arbitrary_key(g), arbitrary_value(g, depth + 1));
            }
            Value::Object(map)
        }
        _ => arbitrary_scalar(g),
    }
}

impl Arbitrary for Path {
    fn arbitrary(g: &mut Gen) -> Self {
        // Mix object keys with array indices so that paths resolve into generated values.
        let segments = ["a", "b", "name", "moons", "0", "1", "-"];
        let len = usize::arbitrary(g) % 4;
        (0..len)
            .map(|_| (*g.choose(&segments).unwrap()).to_string())
            .collect()
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        match self.split_last() {
            Some((parent, _)) => quickcheck::single_shrinker(Path::from(parent)),
            None => quickcheck::empty_shrinker(),
        }
    }
}

impl Arbitrary for Operation {
    fn arbitrary(g: &mut Gen) -> Self {
        let path = Path::arbitrary(g);
        match *g
            .choose(&["add", "add", "remove", "replace", "move", "copy", "test"])
            .unwrap()
        {
            "add" => Operation::add(path, ArbitraryValue::arbitrary(g).0),
            "remove" => Operation::remove(path),
            "replace" => Operation::replace(path, ArbitraryValue::arbitrary(g).0),
            "move" => Operation::move_to(Path::arbitrary(g), path),
            "copy" => Operation::copy_to(Path::arbitrary(g), path),
            "test" => Operation::test(path, ArbitraryValue::arbitrary(g).0),
            _ => unreachable!(),
        }
    }
}

/// Planets with many moons, moons with one planet.
#[cfg(test)]
pub(crate) fn planets() -> Schema {
    Schema::new()
        .with_model(
            "planet",
            ModelDef::default()
                .with_attribute("name", AttributeDef::default())
                .with_attribute(
                    "classification",
                    AttributeDef::default().with_default(json!("terrestrial")),
                )
                .with_link("moons", LinkDef::has_many("moon").with_inverse("planet")),
        )
        .with_model(
            "moon",
            ModelDef::default()
                .with_attribute("name", AttributeDef::default())
                .with_link("planet", LinkDef::has_one("planet").with_inverse("moons")),
        )
}
