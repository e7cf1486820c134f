// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Two replicas of a tiny solar system, kept in step in both directions.
//!
//! Run with `RUST_LOG=patchsync=debug cargo run --example solar_system` to watch the
//! connectors at work.
use patchsync::{
    CacheOptions, MemorySource, Value,
    connectors::{ConnectorOptions, TransformConnector},
    path,
    request::Selector,
    schema::{AttributeDef, LinkDef, ModelDef, Schema},
};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn schema() -> Schema {
    Schema::new()
        .with_model(
            "planet",
            ModelDef::default()
                .with_attribute("classification", AttributeDef::default().with_default(json!("terrestrial")))
                .with_link("moons", LinkDef::has_many("moon").with_inverse("planet")),
        )
        .with_model(
            "moon",
            ModelDef::default().with_link("planet", LinkDef::has_one("planet").with_inverse("moons")),
        )
}

fn names(records: &Value) -> Vec<&str> {
    records
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|record| record["name"].as_str())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ground = Arc::new(MemorySource::new(schema(), CacheOptions::default()));
    let orbiter = Arc::new(MemorySource::new(schema(), CacheOptions::default()));
    let _up = TransformConnector::new(ground.clone(), orbiter.clone(), ConnectorOptions::default());
    let _down = TransformConnector::new(orbiter.clone(), ground.clone(), ConnectorOptions::default());

    let mut earth = serde_json::Map::new();
    earth.insert("name".into(), json!("Earth"));
    let earth = ground.add("planet", earth).await?;
    let earth_id = earth["__id"].as_str().unwrap_or_default().to_string();
    println!("ground added {earth}");

    let mut moon = serde_json::Map::new();
    moon.insert("name".into(), json!("Moon"));
    let moon = orbiter.add("moon", moon).await?;
    let moon_id = moon["__id"].as_str().unwrap_or_default().to_string();
    orbiter.add_link("moon", &moon_id, "planet", &earth_id).await?;

    let moons = ground.find_link("planet", &earth_id, "moons").await?;
    println!("ground sees the moons of Earth: {:?}", names(&moons));

    ground
        .patch("planet", &earth_id, "classification", json!("home"))
        .await?;
    println!(
        "orbiter sees Earth classified as {}",
        orbiter
            .retrieve(&path!("planet", &earth_id, "classification"))
            .unwrap_or(Value::Null)
    );

    orbiter.remove("planet", &earth_id).await?;
    let planets = ground.find("planet", Selector::All).await?;
    println!(
        "after the orbiter removed Earth the ground has {} planets, the moon orbits {}",
        names(&planets).len(),
        ground
            .retrieve(&path!("moon", &moon_id, "__rel", "planet"))
            .unwrap_or(Value::Null)
    );
    Ok(())
}
