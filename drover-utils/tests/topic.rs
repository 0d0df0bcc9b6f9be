//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use drover_utils::topic;

#[test]
fn test_normalize_strips_and_collapses_separators() {
    assert_eq!(topic::normalize("/a/b/"), "a/b");
    assert_eq!(topic::normalize("a//b"), "a/b");
    assert_eq!(topic::normalize("///a///b///"), "a/b");
    assert_eq!(topic::normalize(""), "");
}

#[test]
fn test_join() {
    assert_eq!(topic::join("a/b", "c"), "a/b/c");
    assert_eq!(topic::join("a/b/", "/c"), "a/b/c");
}

#[test]
fn test_tag_and_parent() {
    assert_eq!(topic::tag("a/b/c"), "c");
    assert_eq!(topic::tag("a"), "a");
    assert_eq!(topic::parent("a/b/c"), Some("a/b"));
    assert_eq!(topic::parent("a"), None);
}

#[test]
fn test_prefixed_does_not_double_prefix() {
    assert_eq!(topic::prefixed("a/b", "devices"), "devices/a/b");
    assert_eq!(topic::prefixed("devices/a/b", "devices"), "devices/a/b");
    assert_eq!(topic::prefixed("/a/b/", "devices"), "devices/a/b");
    assert_eq!(topic::prefixed("devices", "devices"), "devices");
    // A segment merely starting with the base string is still prefixed.
    assert_eq!(topic::prefixed("devices2/a", "devices"), "devices/devices2/a");
}

#[test]
fn test_to_breadth_reverses_path_under_base() {
    assert_eq!(
        topic::to_breadth(
            "devices/campus/building/unit/point",
            "devices",
            "points"
        ),
        "points/point/unit/building/campus"
    );
    assert_eq!(
        topic::to_breadth("devices/unit", "devices", "points"),
        "points/unit"
    );
}
