//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use patchsync::{
    CacheOptions, Map, MemorySource, Value,
    schema::{AttributeDef, LinkDef, ModelDef, Schema},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Planets with many moons, moons with one planet.
pub fn solar_system() -> Schema {
    Schema::new()
        .with_model(
            "planet",
            ModelDef::default()
                .with_attribute("name", AttributeDef::default())
                .with_attribute(
                    "classification",
                    AttributeDef::default().with_default(Value::from("terrestrial")),
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

pub fn replica() -> Arc<MemorySource> {
    Arc::new(MemorySource::new(solar_system(), CacheOptions::default()))
}

pub fn replica_with(options: CacheOptions) -> Arc<MemorySource> {
    Arc::new(MemorySource::new(solar_system(), options))
}

/// Counts the changes a replica announces.
pub fn count_changes(source: &MemorySource) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    source.did_transform().add_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {}
    });
    count
}

pub fn record(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not a record: {other}"),
    }
}
