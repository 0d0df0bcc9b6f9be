//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Bus publication assembly.
//!
//! Poll results, command responses and all-publish snapshots are pushed
//! out here. One process-wide semaphore bounds how many publications may
//! be in flight toward the bus at any instant.

use std::sync::Arc;

use derive_new::new;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tracing::warn;

use drover_interface::PointValues;
use drover_utils::bus::{BusMsg, BusSender, Headers, Publication};
use drover_utils::topic;

use crate::equipment::{EquipmentTree, NodeIndex};
use crate::poll::PublishSetup;

// Result-message topic prefixes.
pub const VALUE_RESPONSE_PREFIX: &str = "devices/actuators/value";
pub const ERROR_RESPONSE_PREFIX: &str = "devices/actuators/error";
pub const REVERT_POINT_RESPONSE_PREFIX: &str =
    "devices/actuators/reverted/point";
pub const REVERT_DEVICE_RESPONSE_PREFIX: &str =
    "devices/actuators/reverted/device";
pub const RESERVATION_STATE_TOPIC: &str = "devices/actuators/reservations";

/// Publication gateway: every message handed to the bus goes through the
/// concurrency limit.
#[derive(Clone, Debug, new)]
pub struct Publisher {
    bus_tx: BusSender,
    limit: Arc<Semaphore>,
}

// ===== impl Publisher =====

impl Publisher {
    pub fn publish(&self, pub_topic: String, headers: Headers, payload: Value) {
        let Ok(permit) = self.limit.try_acquire() else {
            warn!(topic = %pub_topic, "publish limit reached, dropping message");
            return;
        };
        let _ = self.bus_tx.send(BusMsg::Publish(Publication {
            topic: pub_topic,
            headers,
            payload,
        }));
        drop(permit);
    }

    /// Publishes a per-point result on the appropriate response topic.
    pub fn push_result_topic_pair(
        &self,
        prefix: &str,
        point_topic: &str,
        headers: Headers,
        value: Value,
    ) {
        self.publish(format!("{prefix}/{point_topic}"), headers, value);
    }

    /// Publishes the values of one poll according to the slot's
    /// publication plan.
    pub fn publish_poll_results(
        &self,
        setup: &PublishSetup,
        values: &PointValues,
        requester: Option<&str>,
    ) {
        for point_depth in &setup.single_depth {
            if let Some(value) = values.get(point_depth) {
                self.publish(
                    point_depth.clone(),
                    Headers::now(requester),
                    value.clone(),
                );
            }
        }
        for (point_depth, point_breadth) in &setup.single_breadth {
            if let Some(value) = values.get(point_depth) {
                self.publish(
                    point_breadth.clone(),
                    Headers::now(requester),
                    value.clone(),
                );
            }
        }
        for (device_depth, point_depths) in &setup.multi_depth {
            let payload = multi_payload(values, point_depths);
            if !payload.is_empty() {
                self.publish(
                    format!("{device_depth}/multi"),
                    Headers::now(requester),
                    Value::Object(payload),
                );
            }
        }
        for (device_breadth, point_names) in &setup.multi_breadth {
            let payload: Map<String, Value> = values
                .iter()
                .filter(|(point_topic, _)| {
                    point_names.contains(topic::tag(point_topic))
                })
                .map(|(point_topic, value)| {
                    (topic::tag(point_topic).to_owned(), value.clone())
                })
                .collect();
            if !payload.is_empty() {
                self.publish(
                    format!("{device_breadth}/multi"),
                    Headers::now(requester),
                    Value::Object(payload),
                );
            }
        }
    }

    /// Publishes the all-publish snapshot of one device: a two-element
    /// array of the point values and their metadata.
    pub fn publish_all(
        &self,
        tree: &EquipmentTree,
        device: NodeIndex,
        depth: bool,
        breadth: bool,
    ) {
        let mut values = Map::new();
        let mut metas = Map::new();
        for point in tree.points(Some(device)) {
            let Some(node) = tree.node(point) else {
                continue;
            };
            let Some(state) = node.as_point() else {
                continue;
            };
            values.insert(node.tag.clone(), state.last_value.clone());
            metas.insert(
                node.tag.clone(),
                Value::Object(state.registry_row.meta()),
            );
        }
        let payload = json!([values, metas]);
        let Some((device_depth, device_breadth)) =
            tree.get_point_topics(device)
        else {
            return;
        };
        if depth {
            self.publish(
                format!("{device_depth}/all"),
                Headers::now(None),
                payload.clone(),
            );
        }
        if breadth {
            self.publish(
                format!("{device_breadth}/all"),
                Headers::now(None),
                payload,
            );
        }
    }
}

// ===== global functions =====

fn multi_payload(
    values: &PointValues,
    point_depths: &std::collections::BTreeSet<String>,
) -> Map<String, Value> {
    point_depths
        .iter()
        .filter_map(|point_depth| {
            values.get(point_depth).map(|value| {
                (topic::tag(point_depth).to_owned(), value.clone())
            })
        })
        .collect()
}
