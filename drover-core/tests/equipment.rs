//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use serde_json::{Map, Value, json};

use drover_core::config::{AgentConfig, EquipmentConfig};
use drover_core::equipment::{
    EquipmentTree, NodeIndex, SegmentKind, TreeDefaults,
};

fn tree() -> EquipmentTree {
    EquipmentTree::new(TreeDefaults::from(&AgentConfig::default()))
}

fn registry_rows() -> Vec<Map<String, Value>> {
    let rows = json!([
        {
            "Volttron Point Name": "SampleWritableFloat1",
            "Units": "PPM",
            "Writable": true,
            "Starting Value": "10",
            "Type": "float"
        },
        {
            "Volttron Point Name": "OutsideAirTemperature1",
            "Units": "F",
            "Writable": false,
            "Starting Value": "50",
            "Type": "float"
        }
    ]);
    rows.as_array()
        .unwrap()
        .iter()
        .map(|row| row.as_object().unwrap().clone())
        .collect()
}

fn add_fake_device(tree: &mut EquipmentTree, topic: &str) -> NodeIndex {
    let config = EquipmentConfig::load(&json!({ "driver_type": "fake" }))
        .unwrap();
    tree.add_device(topic, config, registry_rows(), "remote1").unwrap()
}

// Every node's identifier is its parent's identifier plus its own tag.
#[test]
fn test_tree_invariant() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/campus/building/fake");
    tree.add_segment("devices/campus/annex", None);

    for index in tree.subtree(tree.root()) {
        let node = tree.node(index).unwrap();
        match node.parent {
            Some(parent) => {
                let parent = tree.node(parent).unwrap();
                assert_eq!(
                    node.topic,
                    format!("{}/{}", parent.topic, node.tag)
                );
            }
            None => assert_eq!(node.topic, "devices"),
        }
    }
}

#[test]
fn test_equipment_id_normalization() {
    let tree = tree();
    assert_eq!(tree.equipment_id("/a/b/", None), tree.equipment_id("a/b", None));
    assert_eq!(tree.equipment_id("a//b", None), "devices/a/b");
    // Already-prefixed topics are not double-prefixed.
    assert_eq!(tree.equipment_id("devices/a", None), "devices/a");
    assert_eq!(
        tree.equipment_id("campus/building", Some("point")),
        "devices/campus/building/point"
    );
}

#[test]
fn test_add_segment_is_idempotent() {
    let mut tree = tree();
    let first = tree.add_segment("devices/campus/building", None);
    let second = tree.add_segment("devices/campus/building", None);
    assert_eq!(first, second);
    assert_eq!(tree.get_node("devices/campus"), tree.get_node("devices/campus"));
}

#[test]
fn test_add_segment_partial_existing_ancestors() {
    let mut tree = tree();
    tree.add_segment("campus", None);
    let index = tree.add_segment("campus/building/floor", None);
    let node = tree.node(index).unwrap();
    assert_eq!(node.topic, "devices/campus/building/floor");
    assert!(tree.get_node("devices/campus/building").is_some());
}

#[test]
fn test_add_segment_applies_late_config() {
    let mut tree = tree();
    let config =
        EquipmentConfig::load(&json!({ "group": "east_wing" })).unwrap();
    let index = tree.add_segment("campus/building", Some(config));
    assert_eq!(
        tree.node(index).unwrap().config.group.as_deref(),
        Some("east_wing")
    );
}

// Adding the same device twice yields the same node and no duplicate
// children.
#[test]
fn test_add_device_is_idempotent() {
    let mut tree = tree();
    let first = add_fake_device(&mut tree, "devices/campus/building/fake");
    let point_count = tree.points(Some(first)).len();
    let second = add_fake_device(&mut tree, "devices/campus/building/fake");
    assert_eq!(first, second);
    assert_eq!(tree.points(Some(second)).len(), point_count);
    assert_eq!(tree.devices(None).len(), 1);
}

#[test]
fn test_add_device_materializes_points() {
    let mut tree = tree();
    let device = add_fake_device(&mut tree, "devices/campus/building/fake");
    let node = tree.node(device).unwrap();
    assert_eq!(node.segment_kind(), SegmentKind::Device);
    let points = tree.points(Some(device));
    assert_eq!(points.len(), 2);
    assert!(
        tree.get_node("devices/campus/building/fake/SampleWritableFloat1")
            .is_some()
    );
}

#[test]
fn test_equipment_specific_fields_do_not_override_rows() {
    let mut tree = tree();
    let config = EquipmentConfig::load(&json!({
        "driver_type": "fake",
        "equipment_specific_fields": { "Units": "merged", "Notes": "shared" }
    }))
    .unwrap();
    tree.add_device("devices/d", config, registry_rows(), "remote1").unwrap();
    let point = tree.get_node("devices/d/SampleWritableFloat1").unwrap();
    let row = &tree.node(point).unwrap().as_point().unwrap().registry_row;
    // The row already defines Units; only Notes is merged in.
    assert_eq!(row.units.as_deref(), Some("PPM"));
    assert_eq!(row.notes.as_deref(), Some("shared"));
}

#[test]
fn test_remove_device_prunes_empty_ancestors() {
    let mut tree = tree();
    let device = add_fake_device(&mut tree, "devices/campus/building/fake");
    let removed = tree.remove_segment(device);
    assert_eq!(removed.len(), 2);
    assert!(tree.get_node("devices/campus/building/fake").is_none());
    // Ancestor segments with no remaining equipment disappear too.
    assert!(tree.get_node("devices/campus/building").is_none());
    assert!(tree.get_node("devices/campus").is_none());
}

#[test]
fn test_remove_segment_with_concrete_descendants_demotes() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/campus/building/fake");
    let config =
        EquipmentConfig::load(&json!({ "group": "east_wing" })).unwrap();
    let segment = tree.add_segment("devices/campus/building", Some(config));
    let removed = tree.remove_segment(segment);
    assert!(removed.is_empty());
    // The segment survives as a bare path element, stripped of config.
    let node = tree.node(segment).unwrap();
    assert_eq!(node.segment_kind(), SegmentKind::TopicSegment);
    assert!(node.config.group.is_none());
    assert!(tree.get_node("devices/campus/building/fake").is_some());
}

#[test]
fn test_remove_unknown_node_is_noop() {
    let mut tree = tree();
    let device = add_fake_device(&mut tree, "devices/d");
    tree.remove_segment(device);
    // Second removal through a dead handle changes nothing.
    assert!(tree.remove_segment(device).is_empty());
}

#[test]
fn test_polling_interval_inheritance() {
    let mut tree = tree();
    let config = EquipmentConfig::load(&json!({
        "driver_type": "fake",
        "interval": 5.0
    }))
    .unwrap();
    tree.add_device("devices/d", config, registry_rows(), "remote1").unwrap();
    let point = tree.get_node("devices/d/SampleWritableFloat1").unwrap();
    // Inherited from the device.
    assert_eq!(tree.polling_interval(point), Duration::from_secs(5));
    // Points without any ancestor setting fall back to the default.
    let mut bare = self::tree();
    bare.add_device(
        "devices/e",
        EquipmentConfig::load(&json!({ "driver_type": "fake" })).unwrap(),
        registry_rows(),
        "remote1",
    )
    .unwrap();
    let point = bare.get_node("devices/e/SampleWritableFloat1").unwrap();
    assert_eq!(bare.polling_interval(point), Duration::from_secs(60));
}

#[test]
fn test_group_inheritance() {
    let mut tree = tree();
    let config = EquipmentConfig::load(&json!({ "group": "east_wing" }))
        .unwrap();
    tree.add_segment("campus/building", Some(config));
    add_fake_device(&mut tree, "devices/campus/building/fake");
    let point = tree
        .get_node("devices/campus/building/fake/SampleWritableFloat1")
        .unwrap();
    assert_eq!(tree.group(point), "east_wing");
}

// Activity is inherited: a point under an inactive ancestor reads as
// inactive even when its own flag is set.
#[test]
fn test_active_inheritance() {
    let mut tree = tree();
    let device = add_fake_device(&mut tree, "devices/campus/building/fake");
    let point = tree
        .get_node("devices/campus/building/fake/SampleWritableFloat1")
        .unwrap();
    assert!(tree.is_active(point));

    tree.set_active(device, false);
    assert!(!tree.is_active(point));

    // The point's own flag does not override the ancestor.
    tree.set_active(point, true);
    assert!(!tree.is_active(point));

    // Materialized reading: the point's own flag alone still reads true.
    assert_eq!(tree.node(point).unwrap().active, Some(true));

    tree.set_active(device, true);
    assert!(tree.is_active(point));
    tree.set_active(point, false);
    assert!(!tree.is_active(point));
}

#[test]
fn test_publish_flag_inheritance() {
    let mut tree = tree();
    let config = EquipmentConfig::load(&json!({
        "driver_type": "fake",
        "publish_depth_first_single": true
    }))
    .unwrap();
    tree.add_device("devices/d", config, registry_rows(), "remote1").unwrap();
    let point = tree.get_node("devices/d/SampleWritableFloat1").unwrap();
    assert!(tree.is_published_single_depth(point));
    // Global v2 defaults: multi-depth on, all-depth off.
    assert!(tree.is_published_multi_depth(point));
    assert!(!tree.is_published_all_depth(point));
}

#[test]
fn test_point_topics_depth_and_breadth() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/campus/building/fake");
    let point = tree
        .get_node("devices/campus/building/fake/SampleWritableFloat1")
        .unwrap();
    let (depth, breadth) = tree.get_point_topics(point).unwrap();
    assert_eq!(depth, "devices/campus/building/fake/SampleWritableFloat1");
    assert_eq!(
        breadth,
        "points/SampleWritableFloat1/fake/building/campus"
    );
    let (device_depth, _) = tree.get_device_topics(point).unwrap();
    assert_eq!(device_depth, "devices/campus/building/fake");
}

#[test]
fn test_find_points_exact_and_glob() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/campus/building/fake");
    add_fake_device(&mut tree, "devices/campus/annex/fake2");

    // Exact device topic selects its points.
    let points = tree.find_points("devices/campus/building/fake", None);
    assert_eq!(points.len(), 2);

    // Glob across devices.
    let points = tree.find_points("devices/campus/*/SampleWritableFloat1", None);
    assert_eq!(points.len(), 2);

    // Regex post-filter ANDs with the topic match.
    let regex = regex::Regex::new("building").unwrap();
    let points = tree.find_points("devices/campus/*/SampleWritableFloat1", Some(&regex));
    assert_eq!(points.len(), 1);
}

#[test]
fn test_last_value_updates_timestamp() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/d");
    let point = tree.get_node("devices/d/SampleWritableFloat1").unwrap();
    let (_, updated) = tree.last_value(point).unwrap();
    assert!(updated.is_none());

    let before = chrono::Utc::now();
    tree.set_last_value(point, json!(12.5));
    let (value, updated) = tree.last_value(point).unwrap();
    assert_eq!(value, &json!(12.5));
    let updated = updated.unwrap();
    assert!(updated >= before && updated <= chrono::Utc::now());
}

#[test]
fn test_stale_points() {
    let mut tree = tree();
    add_fake_device(&mut tree, "devices/d");
    let point = tree.get_node("devices/d/SampleWritableFloat1").unwrap();
    let now = chrono::Utc::now();
    // Never polled points are stale.
    assert!(tree.is_stale(point, now));
    tree.set_last_value(point, json!(1.0));
    assert!(!tree.is_stale(point, now));
    // Stale once the timeout (3x the 60s default interval) has passed.
    assert!(tree.is_stale(point, now + chrono::TimeDelta::seconds(181)));
}
