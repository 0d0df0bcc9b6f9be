//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The equipment model: a typed hierarchical namespace of every
//! controllable point in the plant.
//!
//! Nodes live in an arena and are addressed by stable handles; the tree
//! structure is expressed through parent/child handle links, and a topic
//! index provides lookup by identifier. Schedule data structures hold
//! handles rather than references, so a removed node simply fails the
//! handle check at poll time instead of being pinned alive.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use enum_as_inner::EnumAsInner;
use generational_arena::Arena;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use drover_interface::registry_config::RegistryRow;
use drover_utils::topic;

use crate::config::{AgentConfig, EquipmentConfig, PublishDefaults, seconds};
use crate::error::Error;

pub type NodeIndex = generational_arena::Index;

/// Kind tag of an equipment node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    TopicSegment,
    Device,
    Point,
}

/// Where a point's values come from. Only short polling exists today; COV
/// subscriptions would add a variant here.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DataSource {
    #[default]
    ShortPoll,
}

/// Kind-specific payload of an equipment node.
#[derive(Debug, EnumAsInner)]
pub enum NodeKind {
    Segment,
    Device(DeviceState),
    Point(PointState),
}

#[derive(Debug)]
pub struct DeviceState {
    /// Unique id of the remote serving this device.
    pub remote_id: String,
    pub registry_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct PointState {
    pub data_source: DataSource,
    pub registry_row: RegistryRow,
    pub last_value: Value,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One node of the equipment tree.
#[derive(Debug)]
pub struct EquipmentNode {
    /// Full slash-delimited identifier (the path from the root).
    pub topic: String,
    /// Last path component.
    pub tag: String,
    pub parent: Option<NodeIndex>,
    /// Insertion order is preserved for display, not semantics.
    pub children: Vec<NodeIndex>,
    /// `None` inherits the ancestor's flag.
    pub active: Option<bool>,
    pub config: EquipmentConfig,
    pub kind: NodeKind,
}

/// Tree-wide defaults taken from the service configuration.
#[derive(Clone, Debug)]
pub struct TreeDefaults {
    pub depth_first_base: String,
    pub breadth_first_base: String,
    pub default_polling_interval: Duration,
    pub publish: PublishDefaults,
}

#[derive(Debug)]
pub struct EquipmentTree {
    arena: Arena<EquipmentNode>,
    topic_index: BTreeMap<String, NodeIndex>,
    root: NodeIndex,
    pub defaults: TreeDefaults,
}

pub const DEFAULT_GROUP: &str = "default";

// Points with no explicit stale timeout are considered stale after missing
// this many polling intervals.
const STALE_INTERVAL_MULTIPLIER: u32 = 3;

// ===== impl EquipmentNode =====

impl EquipmentNode {
    pub fn segment_kind(&self) -> SegmentKind {
        match self.kind {
            NodeKind::Segment => SegmentKind::TopicSegment,
            NodeKind::Device(..) => SegmentKind::Device,
            NodeKind::Point(..) => SegmentKind::Point,
        }
    }

    pub fn is_point(&self) -> bool {
        self.kind.is_point()
    }

    pub fn is_device(&self) -> bool {
        self.kind.is_device()
    }

    pub fn as_device(&self) -> Option<&DeviceState> {
        self.kind.as_device()
    }

    pub fn as_point(&self) -> Option<&PointState> {
        self.kind.as_point()
    }

    pub fn as_point_mut(&mut self) -> Option<&mut PointState> {
        self.kind.as_point_mut()
    }

    /// Clears the node's configuration, demoting it to a path-only
    /// segment.
    fn wipe_configuration(&mut self) {
        self.config = EquipmentConfig::default();
        self.active = None;
        self.kind = NodeKind::Segment;
    }
}

// ===== impl EquipmentTree =====

impl EquipmentTree {
    pub fn new(defaults: TreeDefaults) -> EquipmentTree {
        let mut arena = Arena::new();
        let base = defaults.depth_first_base.clone();
        let root = arena.insert(EquipmentNode {
            topic: base.clone(),
            tag: base.clone(),
            parent: None,
            children: vec![],
            active: None,
            config: EquipmentConfig::default(),
            kind: NodeKind::Segment,
        });
        let mut topic_index = BTreeMap::new();
        topic_index.insert(base, root);
        EquipmentTree {
            arena,
            topic_index,
            root,
            defaults,
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Normalizes an incoming topic into a full equipment id: separators
    /// stripped and collapsed, prefixed with the tree root unless already
    /// prefixed, with an optional point name appended.
    pub fn equipment_id(&self, path: &str, point: Option<&str>) -> String {
        let path = match point {
            Some(point) => topic::join(path, point),
            None => topic::normalize(path),
        };
        topic::prefixed(&path, &self.defaults.depth_first_base)
    }

    pub fn get_node(&self, equipment_id: &str) -> Option<NodeIndex> {
        self.topic_index.get(equipment_id).copied()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&EquipmentNode> {
        self.arena.get(index)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut EquipmentNode> {
        self.arena.get_mut(index)
    }

    /// Idempotent creation of a topic segment and all missing ancestors.
    /// Returns the index of the final segment.
    pub fn add_segment(
        &mut self,
        equipment_id: &str,
        config: Option<EquipmentConfig>,
    ) -> NodeIndex {
        let equipment_id =
            topic::prefixed(equipment_id, &self.defaults.depth_first_base);
        let mut parent = self.root;
        let mut parent_topic = self.defaults.depth_first_base.clone();
        let relative = equipment_id
            .strip_prefix(&format!("{}/", self.defaults.depth_first_base))
            .unwrap_or("");
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            let nid = topic::join(&parent_topic, segment);
            parent = match self.topic_index.get(&nid) {
                Some(index) => *index,
                None => self.insert_node(
                    parent,
                    nid.clone(),
                    segment.to_owned(),
                    EquipmentConfig::default(),
                    NodeKind::Segment,
                ),
            };
            parent_topic = nid;
        }
        if let Some(config) = config
            && parent != self.root
            && let Some(node) = self.arena.get_mut(parent)
        {
            node.active = config.active;
            node.config = config;
        }
        parent
    }

    /// Adds a device node, creating missing ancestors and materializing
    /// point children from the registry rows. Adding an existing device
    /// returns the existing node.
    pub fn add_device(
        &mut self,
        device_topic: &str,
        config: EquipmentConfig,
        registry: Vec<serde_json::Map<String, Value>>,
        remote_id: &str,
    ) -> Result<NodeIndex, Error> {
        let device_topic =
            topic::prefixed(device_topic, &self.defaults.depth_first_base);
        let device_tag = topic::tag(&device_topic).to_owned();
        let parent_topic = topic::parent(&device_topic)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "device topic has no parent: {device_topic}"
                ))
            })?
            .to_owned();
        let parent = self.add_segment(&parent_topic, None);

        let device_index = match self.topic_index.get(&device_topic) {
            Some(index) => *index,
            None => {
                let state = DeviceState {
                    remote_id: remote_id.to_owned(),
                    registry_name: config.registry_name.clone(),
                };
                self.insert_node(
                    parent,
                    device_topic.clone(),
                    device_tag,
                    config.clone(),
                    NodeKind::Device(state),
                )
            }
        };

        // Materialize the point children. Equipment-wide fields are merged
        // into each row only where the row does not already define the key.
        for mut row in registry {
            for (key, value) in &config.equipment_specific_fields {
                if !row.contains_key(key) {
                    row.insert(key.clone(), value.clone());
                }
            }
            let row = match RegistryRow::from_value(&Value::Object(row)) {
                Ok(row) => row,
                Err(error) => {
                    warn!(device = %device_topic, %error,
                        "skipping invalid registry row");
                    continue;
                }
            };
            let point_topic = topic::join(&device_topic, &row.point_name);
            if self.topic_index.contains_key(&point_topic) {
                warn!(point = %point_topic,
                    "point already exists on device, keeping existing node");
                continue;
            }
            let point_config = point_config_from_row(&row);
            let tag = row.point_name.clone();
            let state = PointState {
                data_source: DataSource::ShortPoll,
                registry_row: row,
                last_value: Value::Null,
                last_updated: None,
            };
            self.insert_node(
                device_index,
                point_topic,
                tag,
                point_config,
                NodeKind::Point(state),
            );
        }
        Ok(device_index)
    }

    /// Removes a node. Segments that still shelter concrete (device or
    /// point) descendants are demoted to bare path segments instead of
    /// removed; everything else takes its subtree with it. Returns the
    /// removed point indices so the caller can clean up the schedule.
    pub fn remove_segment(&mut self, index: NodeIndex) -> Vec<NodeIndex> {
        let Some(node) = self.arena.get(index) else {
            return vec![];
        };
        let is_bare_segment = matches!(node.kind, NodeKind::Segment);
        if is_bare_segment && self.has_concrete_descendants(index) {
            // Other equipment still lives below this topic; only clear the
            // node's own configuration.
            if let Some(node) = self.arena.get_mut(index) {
                node.wipe_configuration();
            }
            return vec![];
        }

        let subtree = self.subtree(index);
        let removed_points = subtree
            .iter()
            .filter(|&&idx| {
                self.arena.get(idx).is_some_and(EquipmentNode::is_point)
            })
            .copied()
            .collect();
        let parent = self.arena.get(index).and_then(|node| node.parent);
        for idx in subtree {
            if let Some(node) = self.arena.remove(idx) {
                info!(topic = %node.topic, "removed equipment node");
                self.topic_index.remove(&node.topic);
            }
        }
        if let Some(parent) = parent {
            if let Some(node) = self.arena.get_mut(parent) {
                node.children.retain(|&child| child != index);
            }
            self.prune_empty_segments(parent);
        }
        removed_points
    }

    /// All point nodes, or the points in the subtree of `index`.
    pub fn points(&self, index: Option<NodeIndex>) -> Vec<NodeIndex> {
        self.filtered(index, EquipmentNode::is_point)
    }

    /// All device nodes, or the devices in the subtree of `index`.
    pub fn devices(&self, index: Option<NodeIndex>) -> Vec<NodeIndex> {
        self.filtered(index, EquipmentNode::is_device)
    }

    /// Pattern search over point identifiers. The topic selects a subtree
    /// (exact node) or acts as a pattern (`*` wildcards allowed); the
    /// optional regex is a post-filter, AND semantics.
    pub fn find_points(
        &self,
        equipment_id: &str,
        regex: Option<&Regex>,
    ) -> Vec<NodeIndex> {
        let mut points = match self.get_node(equipment_id) {
            Some(index) => self.points(Some(index)),
            None if equipment_id.contains('*') => {
                match glob_to_regex(equipment_id) {
                    Some(pattern) => self
                        .topic_index
                        .iter()
                        .filter(|(topic, _)| pattern.is_match(topic))
                        .map(|(_, index)| *index)
                        .filter(|&index| {
                            self.arena
                                .get(index)
                                .is_some_and(EquipmentNode::is_point)
                        })
                        .collect(),
                    None => vec![],
                }
            }
            None => vec![],
        };
        if let Some(regex) = regex {
            points.retain(|&index| {
                self.arena
                    .get(index)
                    .is_some_and(|node| regex.is_match(&node.topic))
            });
        }
        points
    }

    /// Device node a point hangs off, or the node itself for devices.
    pub fn device_of(&self, index: NodeIndex) -> Option<NodeIndex> {
        let mut current = Some(index);
        while let Some(idx) = current {
            let node = self.arena.get(idx)?;
            if node.is_device() {
                return Some(idx);
            }
            current = node.parent;
        }
        None
    }

    /// Unique id of the remote serving a node.
    pub fn remote_id(&self, index: NodeIndex) -> Option<&str> {
        let device = self.device_of(index)?;
        self.arena
            .get(device)?
            .as_device()
            .map(|state| state.remote_id.as_str())
    }

    // ----- inherited attributes -----

    /// A node is active iff its own flag and every ancestor's flag allows
    /// it; unset flags inherit.
    pub fn is_active(&self, index: NodeIndex) -> bool {
        self.ancestor_chain(index)
            .all(|node| node.active.unwrap_or(true))
    }

    /// Runtime-only active toggle (`start`/`stop`). Touches the node's own
    /// flag only.
    pub fn set_active(&mut self, index: NodeIndex, active: bool) {
        if let Some(node) = self.arena.get_mut(index) {
            node.active = Some(active);
        }
    }

    pub fn polling_interval(&self, index: NodeIndex) -> Duration {
        self.ancestor_chain(index)
            .find_map(|node| node.config.polling_interval)
            .map(seconds)
            .unwrap_or(self.defaults.default_polling_interval)
    }

    pub fn group(&self, index: NodeIndex) -> String {
        self.ancestor_chain(index)
            .find_map(|node| node.config.group.clone())
            .unwrap_or_else(|| DEFAULT_GROUP.to_owned())
    }

    pub fn stale_timeout(&self, index: NodeIndex) -> Duration {
        self.ancestor_chain(index)
            .find_map(|node| node.config.stale_timeout)
            .map(seconds)
            .unwrap_or_else(|| {
                self.polling_interval(index) * STALE_INTERVAL_MULTIPLIER
            })
    }

    pub fn all_publish_interval(&self, index: NodeIndex) -> Option<Duration> {
        self.arena
            .get(index)?
            .config
            .all_publish_interval
            .map(seconds)
    }

    pub fn is_published_single_depth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_single_depth)
            .unwrap_or(self.defaults.publish.single_depth)
    }

    pub fn is_published_single_breadth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_single_breadth)
            .unwrap_or(self.defaults.publish.single_breadth)
    }

    pub fn is_published_multi_depth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_multi_depth)
            .unwrap_or(self.defaults.publish.multi_depth)
    }

    pub fn is_published_multi_breadth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_multi_breadth)
            .unwrap_or(self.defaults.publish.multi_breadth)
    }

    pub fn is_published_all_depth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_all_depth)
            .unwrap_or(self.defaults.publish.all_depth)
    }

    pub fn is_published_all_breadth(&self, index: NodeIndex) -> bool {
        self.publish_flag(index, |flags| flags.publish_all_breadth)
            .unwrap_or(self.defaults.publish.all_breadth)
    }

    // ----- topic derivation -----

    /// Depth- and breadth-first topics of a point.
    pub fn get_point_topics(&self, index: NodeIndex) -> Option<(String, String)> {
        let node = self.arena.get(index)?;
        let depth = node.topic.clone();
        let breadth = topic::to_breadth(
            &node.topic,
            &self.defaults.depth_first_base,
            &self.defaults.breadth_first_base,
        );
        Some((depth, breadth))
    }

    /// Depth- and breadth-first topics of the device a node belongs to.
    pub fn get_device_topics(
        &self,
        index: NodeIndex,
    ) -> Option<(String, String)> {
        let device = self.device_of(index)?;
        self.get_point_topics(device)
    }

    // ----- last-value store -----

    /// Records an observed value; the update timestamp advances to the
    /// current instant atomically with the value.
    pub fn set_last_value(&mut self, index: NodeIndex, value: Value) {
        if let Some(point) =
            self.arena.get_mut(index).and_then(EquipmentNode::as_point_mut)
        {
            point.last_value = value;
            point.last_updated = Some(Utc::now());
        }
    }

    pub fn last_value(&self, index: NodeIndex) -> Option<(&Value, Option<DateTime<Utc>>)> {
        let point = self.arena.get(index)?.as_point()?;
        Some((&point.last_value, point.last_updated))
    }

    pub fn is_stale(&self, index: NodeIndex, now: DateTime<Utc>) -> bool {
        let Some(point) = self.arena.get(index).and_then(EquipmentNode::as_point)
        else {
            return true;
        };
        match point.last_updated {
            Some(updated) => {
                let stale_after = self.stale_timeout(index);
                (now - updated).to_std().unwrap_or(Duration::ZERO)
                    > stale_after
            }
            None => true,
        }
    }

    /// A device is ready for all-publish once every point has been polled
    /// at least once.
    pub fn is_ready(&self, device: NodeIndex) -> bool {
        self.points(Some(device)).iter().all(|&index| {
            self.arena
                .get(index)
                .and_then(EquipmentNode::as_point)
                .is_some_and(|point| point.last_updated.is_some())
        })
    }

    // ----- helpers -----

    fn insert_node(
        &mut self,
        parent: NodeIndex,
        node_topic: String,
        tag: String,
        config: EquipmentConfig,
        kind: NodeKind,
    ) -> NodeIndex {
        let active = config.active;
        let index = self.arena.insert(EquipmentNode {
            topic: node_topic.clone(),
            tag,
            parent: Some(parent),
            children: vec![],
            active,
            config,
            kind,
        });
        self.topic_index.insert(node_topic, index);
        if let Some(parent) = self.arena.get_mut(parent) {
            parent.children.push(index);
        }
        index
    }

    /// Depth-first traversal of a subtree, root included.
    pub fn subtree(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut result = vec![];
        let mut stack = vec![index];
        while let Some(idx) = stack.pop() {
            if let Some(node) = self.arena.get(idx) {
                result.push(idx);
                stack.extend(node.children.iter().rev());
            }
        }
        result
    }

    fn filtered(
        &self,
        index: Option<NodeIndex>,
        predicate: fn(&EquipmentNode) -> bool,
    ) -> Vec<NodeIndex> {
        match index {
            None => self
                .topic_index
                .values()
                .filter(|&&idx| self.arena.get(idx).is_some_and(predicate))
                .copied()
                .collect(),
            Some(index) => self
                .subtree(index)
                .into_iter()
                .filter(|&idx| self.arena.get(idx).is_some_and(predicate))
                .collect(),
        }
    }

    fn has_concrete_descendants(&self, index: NodeIndex) -> bool {
        self.subtree(index).into_iter().skip(1).any(|idx| {
            self.arena
                .get(idx)
                .is_some_and(|node| node.is_device() || node.is_point())
        })
    }

    // Removes ancestor segments left without concrete descendants.
    fn prune_empty_segments(&mut self, mut index: NodeIndex) {
        while index != self.root {
            let Some(node) = self.arena.get(index) else {
                return;
            };
            if !matches!(node.kind, NodeKind::Segment)
                || self.has_concrete_descendants(index)
                || !node.children.is_empty()
            {
                return;
            }
            let parent = node.parent;
            if let Some(node) = self.arena.remove(index) {
                self.topic_index.remove(&node.topic);
            }
            match parent {
                Some(parent_index) => {
                    if let Some(parent_node) = self.arena.get_mut(parent_index)
                    {
                        parent_node.children.retain(|&child| child != index);
                    }
                    index = parent_index;
                }
                None => return,
            }
        }
    }

    fn ancestor_chain(
        &self,
        index: NodeIndex,
    ) -> impl Iterator<Item = &EquipmentNode> {
        let mut current = Some(index);
        std::iter::from_fn(move || {
            let node = self.arena.get(current?)?;
            current = node.parent;
            Some(node)
        })
    }

    fn publish_flag(
        &self,
        index: NodeIndex,
        select: fn(&crate::config::PublishFlags) -> Option<bool>,
    ) -> Option<bool> {
        self.ancestor_chain(index)
            .find_map(|node| select(&node.config.publish_flags))
    }
}

impl From<&AgentConfig> for TreeDefaults {
    fn from(config: &AgentConfig) -> TreeDefaults {
        TreeDefaults {
            depth_first_base: config.depth_first_base.clone(),
            breadth_first_base: config.breadth_first_base.clone(),
            default_polling_interval: seconds(config.default_polling_interval),
            publish: config.publish_defaults(),
        }
    }
}

// ===== global functions =====

// Well-known equipment settings may ride along in registry rows; lift them
// into the point's equipment config.
fn point_config_from_row(row: &RegistryRow) -> EquipmentConfig {
    let mut config = EquipmentConfig::default();
    if let Some(value) = row.extra.get("polling_interval") {
        config.polling_interval = value.as_f64();
    }
    if let Some(value) = row.extra.get("group") {
        config.group = value.as_str().map(str::to_owned);
    }
    if let Some(value) = row.extra.get("active") {
        config.active = value.as_bool();
    }
    if let Some(value) = row.extra.get("stale_timeout") {
        config.stale_timeout = value.as_f64();
    }
    config
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).ok()
}
