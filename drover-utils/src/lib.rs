//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

use std::sync::{Arc, Mutex};

use pickledb::PickleDb;

pub mod bus;
pub mod task;
pub mod topic;

pub type Database = Arc<Mutex<PickleDb>>;
pub type DatabaseError = pickledb::error::Error;

// Channel type aliases used throughout the workspace.
pub type Sender<T> = tokio::sync::mpsc::Sender<T>;
pub type Receiver<T> = tokio::sync::mpsc::Receiver<T>;
pub type UnboundedSender<T> = tokio::sync::mpsc::UnboundedSender<T>;
pub type UnboundedReceiver<T> = tokio::sync::mpsc::UnboundedReceiver<T>;
pub type Responder<T> = tokio::sync::oneshot::Sender<T>;
