//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Slash-delimited topic manipulation.
//!
//! Topics identify nodes in the equipment tree ("depth-first" layout) and
//! their cross-cutting index ("breadth-first" layout). All functions here
//! are pure string transforms; the tree itself lives in drover-core.

pub const SEPARATOR: char = '/';

/// Strips leading and trailing separators and collapses duplicates.
///
/// `normalize("/a//b/")` and `normalize("a/b")` produce the same result.
pub fn normalize(topic: &str) -> String {
    topic
        .split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins two topic fragments, normalizing the result.
pub fn join(parent: &str, tag: &str) -> String {
    normalize(&format!("{parent}{SEPARATOR}{tag}"))
}

/// Returns the last path component of a topic.
pub fn tag(topic: &str) -> &str {
    topic.rsplit(SEPARATOR).next().unwrap_or(topic)
}

/// Returns the topic with its last component removed, or `None` for
/// single-segment topics.
pub fn parent(topic: &str) -> Option<&str> {
    topic.rsplit_once(SEPARATOR).map(|(head, _)| head)
}

/// Prefixes `topic` with `base` unless it already starts with it.
///
/// This is the equipment-id normalization applied to every incoming topic:
/// `prefixed("a/b", "devices")` and `prefixed("devices/a/b", "devices")`
/// both yield `"devices/a/b"`.
pub fn prefixed(topic: &str, base: &str) -> String {
    let topic = normalize(topic);
    if topic == base || topic.starts_with(&format!("{base}{SEPARATOR}")) {
        topic
    } else {
        join(base, &topic)
    }
}

/// Derives the breadth-first form of a topic: the path components below
/// `depth_base`, reversed, under `breadth_base`.
///
/// `to_breadth("devices/campus/building/unit/point", "devices", "points")`
/// yields `"points/point/unit/building/campus"`.
pub fn to_breadth(topic: &str, depth_base: &str, breadth_base: &str) -> String {
    let relative = topic
        .strip_prefix(&format!("{depth_base}{SEPARATOR}"))
        .unwrap_or(topic);
    let mut segments: Vec<&str> =
        relative.split(SEPARATOR).filter(|s| !s.is_empty()).collect();
    segments.reverse();
    let mut breadth = vec![breadth_base];
    breadth.extend(segments);
    breadth.join("/")
}
