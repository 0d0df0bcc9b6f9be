//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Input messages of the service event loop.
//!
//! All state mutation happens on the loop; RPC peers, the config store and
//! the internal timer tasks all talk to it through these messages.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drover_interface::{CovNotification, PointErrors, PointValues};
use drover_utils::{Responder, UnboundedSender};

use crate::equipment::NodeIndex;
use crate::error::Error;
use crate::poll::PublishSetup;

pub type RpcResponder = Responder<Result<Value, Error>>;
pub type InternalSender = UnboundedSender<InternalMsg>;

/// Point selector shared by most RPC operations: a topic plus optional
/// tag-service query and regex post-filter, AND semantics.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Selector {
    pub topic: String,
    pub tag: Option<String>,
    pub regex: Option<String>,
}

/// The RPC surface exposed to bus peers.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum RpcRequest {
    Get(Selector),
    Set {
        selector: Selector,
        value: Value,
        confirm_values: bool,
        map_points: bool,
    },
    Revert(Selector),
    Last {
        selector: Selector,
        value: bool,
        updated: bool,
    },
    Start(Selector),
    Stop(Selector),
    Enable(Selector),
    Disable(Selector),
    Status(Selector),
    ListTopics {
        selector: Selector,
        active: bool,
        enabled: bool,
    },
    AddNode {
        topic: String,
        config: Value,
        update_schedule: bool,
    },
    RemoveNode {
        topic: String,
        leave_disconnected: bool,
    },
    ListInterfaces,
    AddInterface {
        name: String,
    },
    RemoveInterface {
        name: String,
    },
    NewReservation {
        task_id: Value,
        priority: Value,
        requests: Value,
    },
    CancelReservation {
        task_id: Value,
    },
    SemanticGet {
        query: String,
    },
    SemanticSet {
        query: String,
        value: Value,
        confirm_values: bool,
    },
    SemanticRevert {
        query: String,
    },
    SemanticStatus {
        query: String,
    },
}

/// An RPC request plus its reply channel.
#[derive(Debug)]
pub struct RpcRequestMsg {
    pub sender: String,
    pub request: RpcRequest,
    pub responder: Option<RpcResponder>,
}

/// Config-store change actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ConfigAction {
    New,
    Update,
    Delete,
}

/// A configuration event from the config store.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub struct ConfigMsg {
    pub action: ConfigAction,
    /// `config` for the main service config, `devices/<topic>` for
    /// equipment.
    pub name: String,
    pub contents: Value,
}

/// Messages generated inside the service: timer fires, poll completions
/// and device-pushed notifications.
#[derive(Debug)]
pub enum InternalMsg {
    /// A hyperperiod one-shot fired.
    PollTimer { group: String, hyperperiod: Duration },
    /// A poll batch finished on a worker task.
    PollDone(PollDoneMsg),
    /// An all-publish interval ticked.
    AllPublishTimer { device: String },
    /// The reservation manager's internal update is due.
    ReservationUpdate,
    /// A remote heartbeat toggle is due.
    Heartbeat { remote_id: String },
    /// A device pushed a change-of-value notification.
    Cov(CovNotification),
}

#[derive(Debug)]
pub struct PollDoneMsg {
    pub remote_id: String,
    pub group: String,
    pub start: DateTime<Utc>,
    /// Point handles that were polled, keyed by topic. Handles that no
    /// longer resolve are skipped at application time.
    pub points: BTreeMap<String, NodeIndex>,
    pub values: PointValues,
    pub errors: PointErrors,
    pub publish_setup: PublishSetup,
}

// ===== impl Selector =====

impl Selector {
    pub fn topic(topic: impl Into<String>) -> Selector {
        Selector {
            topic: topic.into(),
            tag: None,
            regex: None,
        }
    }
}

// ===== legacy compatibility shim =====

/// Parses the legacy "actuator-style" argument shapes (`path`,
/// `point_name`, plus `topic`/`point` keyword arguments in any
/// combination) into a canonical selector. This is the only place the
/// dynamic shapes are interpreted.
pub fn selector_from_legacy(
    path: Option<&str>,
    point_name: Option<&str>,
    kwargs: &serde_json::Map<String, Value>,
) -> Selector {
    let path = path
        .or_else(|| kwargs.get("topic").and_then(Value::as_str))
        .unwrap_or_default();
    let point = point_name
        .or_else(|| kwargs.get("point").and_then(Value::as_str))
        .filter(|point| !point.is_empty());
    let topic = match point {
        Some(point) => format!("{path}/{point}"),
        None => path.to_owned(),
    };
    Selector::topic(topic)
}
