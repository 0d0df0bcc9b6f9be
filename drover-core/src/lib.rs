//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The driver service core.
//!
//! Three tightly coupled subsystems cooperate under one agent task: the
//! equipment model (a hierarchical namespace of every controllable point),
//! the poll scheduler (hyperperiodic cyclic sampling per remote) and the
//! reservation manager (time-bounded exclusive write access). The service
//! facade exposes them as RPC operations to bus peers.

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod agent;
pub mod config;
pub mod equipment;
pub mod error;
pub mod events;
pub mod poll;
pub mod publish;
pub mod remote;
pub mod reservation;
mod tasks;

pub use crate::agent::{
    AgentChannelsRx, AgentChannelsTx, DriverAgent, NoOverrides, OverridePort,
    agent_channels, event_loop,
};
pub use crate::error::Error;
