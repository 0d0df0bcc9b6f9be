//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Remotes: the core's facades over driver interface connections.
//!
//! A remote wraps exactly one protocol endpoint and owns the device nodes
//! it serves. Remotes are deduplicated by the unique id their interface
//! derives from its configuration; with duplicates allowed the id falls
//! back to the equipment name so every device gets its own connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use drover_interface::registry_config::RegistryRow;
use drover_interface::{
    CovNotification, DriverInterface, InterfaceRegistry, PointErrors,
    PointValues, ProtocolError,
};
use drover_utils::UnboundedSender;
use drover_utils::task::{IntervalTask, Task};

use crate::config::{AgentConfig, EquipmentConfig};
use crate::equipment::NodeIndex;
use crate::error::Error;
use crate::events::{InternalMsg, InternalSender, PollDoneMsg};
use crate::poll::PublishSetup;

#[derive(Debug)]
pub struct Remote {
    pub unique_id: String,
    pub interface: Arc<dyn DriverInterface>,
    /// Topics of the device nodes this remote serves; the remote lives as
    /// long as this set is non-empty.
    pub devices: BTreeSet<String>,
    /// Designated heartbeat point per device, toggled periodically.
    pub heartbeat_points: BTreeMap<String, String>,
    pub heartbeat_task: Option<IntervalTask>,
    heartbeat_state: bool,
    /// Per-device all-publish timers.
    pub publishers: HashMap<String, IntervalTask>,
}

/// The remote registry (C2): deduplicates driver connections.
#[derive(Debug, Default)]
pub struct Remotes {
    map: HashMap<String, Remote>,
}

// ===== impl Remote =====

impl Remote {
    pub fn new(unique_id: &str, interface: Arc<dyn DriverInterface>) -> Remote {
        Remote {
            unique_id: unique_id.to_owned(),
            interface,
            devices: BTreeSet::new(),
            heartbeat_points: BTreeMap::new(),
            heartbeat_task: None,
            heartbeat_state: false,
            publishers: HashMap::new(),
        }
    }

    /// Attaches one device's registry to the connection.
    pub async fn attach_device(
        &mut self,
        device_topic: &str,
        config: &EquipmentConfig,
        registry: &[RegistryRow],
    ) -> Result<(), ProtocolError> {
        self.interface.configure(device_topic, registry).await?;
        self.devices.insert(device_topic.to_owned());
        if let Some(point) = &config.heart_beat_point {
            self.heartbeat_points.insert(
                device_topic.to_owned(),
                format!("{device_topic}/{point}"),
            );
        }
        Ok(())
    }

    /// Detaches a device. Returns true when the remote serves nothing
    /// anymore and should be dropped.
    pub fn detach_device(&mut self, device_topic: &str) -> bool {
        self.devices.remove(device_topic);
        self.heartbeat_points.remove(device_topic);
        self.publishers.remove(device_topic);
        self.devices.is_empty()
    }

    pub async fn get_multiple_points(
        &self,
        point_ids: &[String],
    ) -> Result<(PointValues, PointErrors), ProtocolError> {
        self.interface.get_multiple_points(point_ids).await
    }

    pub async fn set_multiple_points(
        &self,
        pairs: &[(String, Value)],
    ) -> Result<PointErrors, ProtocolError> {
        self.interface.set_multiple_points(pairs).await
    }

    pub async fn revert_point(
        &self,
        point_id: &str,
    ) -> Result<(), ProtocolError> {
        self.interface.revert_point(point_id).await
    }

    pub async fn revert_all(&self) -> Result<(), ProtocolError> {
        self.interface.revert_all().await
    }

    /// Reads a poll set on a worker task; the result returns to the event
    /// loop as a `PollDone` message. The task is detached: an in-flight
    /// poll is allowed to complete even if the schedule that issued it is
    /// torn down.
    pub fn spawn_poll(
        &self,
        group: &str,
        points: BTreeMap<String, NodeIndex>,
        publish_setup: PublishSetup,
        internal_tx: &InternalSender,
    ) {
        let interface = self.interface.clone();
        let remote_id = self.unique_id.clone();
        let group = group.to_owned();
        let internal_tx = internal_tx.clone();
        let mut task = Task::spawn(async move {
            let start = Utc::now();
            let point_ids: Vec<String> = points.keys().cloned().collect();
            let (values, errors) =
                match interface.get_multiple_points(&point_ids).await {
                    Ok(result) => result,
                    Err(error) => {
                        error.log();
                        return;
                    }
                };
            let _ = internal_tx.send(InternalMsg::PollDone(PollDoneMsg {
                remote_id,
                group,
                start,
                points,
                values,
                errors,
                publish_setup,
            }));
        });
        task.detach();
    }

    /// Toggles the designated heartbeat point of every served device.
    pub async fn send_heartbeat(&mut self) {
        self.heartbeat_state = !self.heartbeat_state;
        let value = Value::from(self.heartbeat_state);
        let pairs: Vec<(String, Value)> = self
            .heartbeat_points
            .values()
            .map(|point| (point.clone(), value.clone()))
            .collect();
        if pairs.is_empty() {
            return;
        }
        match self.interface.set_multiple_points(&pairs).await {
            Ok(errors) => {
                for (point, error) in errors {
                    warn!(%point, %error, "heartbeat write failed");
                }
            }
            Err(error) => error.log(),
        }
    }

    /// Stops the remote's timers. The underlying connection closes when
    /// the last `Arc` reference drops.
    pub fn stop(&mut self) {
        info!(remote_id = %self.unique_id, "stopping remote");
        self.heartbeat_task = None;
        self.publishers.clear();
    }
}

// ===== impl Remotes =====

impl Remotes {
    pub fn get(&self, unique_id: &str) -> Option<&Remote> {
        self.map.get(unique_id)
    }

    pub fn get_mut(&mut self, unique_id: &str) -> Option<&mut Remote> {
        self.map.get_mut(unique_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Remote)> {
        self.map.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Remote)> {
        self.map.iter_mut()
    }

    /// Finds or builds the remote serving a device. With duplicates
    /// allowed (globally or per device) the unique id falls back to the
    /// equipment name, giving the device a private connection even when
    /// it is protocol-addressable through an existing one.
    pub fn get_or_create(
        &mut self,
        interfaces: &InterfaceRegistry,
        agent_config: &AgentConfig,
        equipment_name: &str,
        config: &EquipmentConfig,
        cov_tx: &UnboundedSender<CovNotification>,
    ) -> Result<&mut Remote, Error> {
        let driver_type = config.driver_type.as_deref().ok_or_else(|| {
            Error::Validation(format!(
                "equipment config for {equipment_name} names no driver_type"
            ))
        })?;
        let builder = interfaces.get(driver_type)?;
        let allow_duplicates = config
            .allow_duplicate_remotes
            .unwrap_or(agent_config.allow_duplicate_remotes);
        let unique_id = if allow_duplicates {
            equipment_name.to_owned()
        } else {
            builder.unique_remote_id(equipment_name, &config.driver_config)
        };
        if !self.map.contains_key(&unique_id) {
            let interface = builder.build(
                equipment_name,
                &config.driver_config,
                cov_tx.clone(),
            )?;
            info!(remote_id = %unique_id, %driver_type, "created remote");
            self.map
                .insert(unique_id.clone(), Remote::new(&unique_id, interface));
        }
        Ok(self.map.get_mut(&unique_id).expect("remote was just inserted"))
    }

    /// Detaches a device from its remote, dropping the remote when its
    /// refcount reaches zero.
    pub fn release_device(&mut self, unique_id: &str, device_topic: &str) {
        let Some(remote) = self.map.get_mut(unique_id) else {
            return;
        };
        if remote.detach_device(device_topic) {
            remote.stop();
            self.map.remove(unique_id);
            info!(remote_id = %unique_id, "removed unreferenced remote");
        }
    }
}
