//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use serde_json::{Value, json};

use drover_interface::fake::FakeInterfaceBuilder;
use drover_interface::registry_config::RegistryRow;
use drover_interface::{DriverInterface, InterfaceBuilder, InterfaceRegistry};

fn rows() -> Vec<RegistryRow> {
    [
        json!({
            "Volttron Point Name": "SampleWritableFloat1",
            "Writable": true,
            "Starting Value": "10",
            "Type": "float"
        }),
        json!({
            "Volttron Point Name": "OutsideAirTemperature1",
            "Writable": "FALSE",
            "Starting Value": "50",
            "Type": "float"
        }),
    ]
    .iter()
    .map(|row| RegistryRow::from_value(row).unwrap())
    .collect()
}

async fn fake_interface() -> Arc<dyn DriverInterface> {
    let (cov_tx, _cov_rx) = tokio::sync::mpsc::unbounded_channel();
    let builder = FakeInterfaceBuilder {};
    let interface =
        builder.build("devices/fake", &Value::Null, cov_tx).unwrap();
    interface.configure("devices/fake", &rows()).await.unwrap();
    interface
}

#[test]
fn test_registry_row_parsing() {
    let rows = rows();
    assert_eq!(rows[0].point_name, "SampleWritableFloat1");
    assert!(rows[0].writable);
    // CSV-style string booleans are accepted.
    assert!(!rows[1].writable);
}

#[test]
fn test_unique_remote_id_is_stable_per_config() {
    let builder = FakeInterfaceBuilder {};
    let config1 = json!({ "host": "a", "port": 1 });
    let config2 = json!({ "port": 1, "host": "a" });
    // Key order does not matter.
    assert_eq!(
        builder.unique_remote_id("devices/d1", &config1),
        builder.unique_remote_id("devices/d2", &config2)
    );
    let other = json!({ "host": "b", "port": 1 });
    assert_ne!(
        builder.unique_remote_id("devices/d1", &config1),
        builder.unique_remote_id("devices/d1", &other)
    );
}

#[tokio::test]
async fn test_get_returns_seed_values() {
    let interface = fake_interface().await;
    let (values, errors) = interface
        .get_multiple_points(&[
            "devices/fake/SampleWritableFloat1".to_owned(),
            "devices/fake/Missing".to_owned(),
        ])
        .await
        .unwrap();
    assert_eq!(values["devices/fake/SampleWritableFloat1"], json!(10.0));
    assert!(errors.contains_key("devices/fake/Missing"));
}

#[tokio::test]
async fn test_set_respects_writability() {
    let interface = fake_interface().await;
    let errors = interface
        .set_multiple_points(&[
            ("devices/fake/SampleWritableFloat1".to_owned(), json!(15.0)),
            ("devices/fake/OutsideAirTemperature1".to_owned(), json!(100.0)),
        ])
        .await
        .unwrap();
    assert!(errors.contains_key("devices/fake/OutsideAirTemperature1"));

    let values = interface.scrape_all().await.unwrap();
    assert_eq!(values["devices/fake/SampleWritableFloat1"], json!(15.0));
    // The non-writable point keeps its seed.
    assert_eq!(values["devices/fake/OutsideAirTemperature1"], json!(50.0));
}

#[tokio::test]
async fn test_revert_restores_starting_values() {
    let interface = fake_interface().await;
    interface
        .set_multiple_points(&[(
            "devices/fake/SampleWritableFloat1".to_owned(),
            json!(99.0),
        )])
        .await
        .unwrap();
    interface.revert_point("devices/fake/SampleWritableFloat1").await.unwrap();
    let values = interface.scrape_all().await.unwrap();
    assert_eq!(values["devices/fake/SampleWritableFloat1"], json!(10.0));
}

#[test]
fn test_registry_lists_builtin_drivers() {
    let registry = InterfaceRegistry::new();
    assert_eq!(registry.driver_types(), vec!["fake"]);
    assert!(registry.get("fake").is_ok());
    assert!(registry.get("bacnet").is_err());
}
