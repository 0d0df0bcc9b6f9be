//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Message-bus port.
//!
//! The bus transport itself lives outside the workspace; the core only ever
//! sees these message types flowing over channels. The daemon wires the
//! other end to a real transport (or to an in-process loopback).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Responder, UnboundedReceiver, UnboundedSender};

pub type BusSender = UnboundedSender<BusMsg>;
pub type BusReceiver = UnboundedReceiver<BusMsg>;

/// Outcome of an RPC call to a bus peer.
pub type RpcResult = Result<Value, RpcError>;

/// Headers attached to every bus publication.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Headers {
    /// ISO-8601 UTC timestamp of the publication.
    #[serde(rename = "time")]
    pub time: String,
    #[serde(rename = "requesterID", skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
    #[serde(rename = "taskID", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

/// A message published on (or delivered from) the bus.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Publication {
    pub topic: String,
    pub headers: Headers,
    pub payload: Value,
}

/// Messages exchanged with the bus transport.
#[derive(Debug)]
pub enum BusMsg {
    /// Publish a message on a topic.
    Publish(Publication),
    /// Call a method on a bus peer. The transport answers on the responder.
    RpcCall {
        peer: String,
        method: String,
        args: Value,
        responder: Option<Responder<RpcResult>>,
    },
    /// Subscribe to all topics under a prefix.
    Subscribe {
        prefix: String,
        tx: UnboundedSender<Publication>,
    },
}

/// Failure reported by a bus peer for an RPC call.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RpcError(pub String);

// ===== impl Headers =====

impl Headers {
    pub fn now(requester_id: Option<&str>) -> Headers {
        Headers {
            time: iso8601(Utc::now()),
            requester_id: requester_id.map(str::to_owned),
            task_id: None,
            message_type: None,
        }
    }
}

// ===== impl RpcError =====

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RpcError {}

// ===== global functions =====

/// Renders a timestamp the way it appears in publication headers.
pub fn iso8601(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}
