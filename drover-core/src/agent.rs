//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The service facade and its event loop.
//!
//! One agent task owns the equipment tree, the remotes, the reservation
//! manager and the poll schedulers. RPC peers, the config store, timers
//! and poll workers all feed messages into the loop; nothing mutates core
//! state from outside it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use drover_interface::{
    CovNotification, InterfaceRegistry, PointErrors, PointValues,
};
use drover_interface::registry_config::RegistryRow;
use drover_utils::bus::{BusMsg, BusSender, Headers};
use drover_utils::task::TimeoutTask;
use drover_utils::{
    Database, Receiver, Sender, UnboundedReceiver, UnboundedSender, topic,
};

use crate::config::{AgentConfig, EquipmentConfig, seconds};
use crate::equipment::{EquipmentTree, NodeIndex, TreeDefaults};
use crate::error::Error;
use crate::events::{
    ConfigAction, ConfigMsg, InternalMsg, InternalSender, PollDoneMsg,
    RpcRequest, RpcRequestMsg, Selector, selector_from_legacy,
};
use crate::poll::{
    self, PollScheduler, PollSetTable, PublishSetup,
};
use crate::publish::{
    ERROR_RESPONSE_PREFIX, Publisher, RESERVATION_STATE_TOPIC,
    REVERT_DEVICE_RESPONSE_PREFIX, REVERT_POINT_RESPONSE_PREFIX,
    VALUE_RESPONSE_PREFIX,
};
use crate::remote::Remotes;
use crate::reservation::ReservationManager;
use crate::tasks;

// Bus peers the facade consults, and how long it waits for them.
const SEMANTIC_SERVICE_PEER: &str = "platform.semantic";
const TAGGING_SERVICE_PEER: &str = "platform.tagging";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

// Config-store entry names.
const MAIN_CONFIG_NAME: &str = "config";
const EQUIPMENT_CONFIG_PREFIX: &str = "devices/";

/// The sibling override manager's only contract with the core.
pub trait OverridePort: Send + std::fmt::Debug {
    fn is_overridden(&self, equipment_id: &str) -> bool;
}

/// Default override port: nothing is ever overridden.
#[derive(Debug, Default)]
pub struct NoOverrides;

impl OverridePort for NoOverrides {
    fn is_overridden(&self, _equipment_id: &str) -> bool {
        false
    }
}

/// Transmit handles into the agent event loop.
#[derive(Clone, Debug)]
pub struct AgentChannelsTx {
    pub rpc: Sender<RpcRequestMsg>,
    pub config: Sender<ConfigMsg>,
    pub internal: InternalSender,
    pub cov: UnboundedSender<CovNotification>,
}

/// Receive side of the agent event loop.
#[derive(Debug)]
pub struct AgentChannelsRx {
    pub rpc: Receiver<RpcRequestMsg>,
    pub config: Receiver<ConfigMsg>,
    pub internal: UnboundedReceiver<InternalMsg>,
    pub cov: UnboundedReceiver<CovNotification>,
}

pub fn agent_channels() -> (AgentChannelsTx, AgentChannelsRx) {
    let (rpc_tx, rpc_rx) = mpsc::channel(4);
    let (config_tx, config_rx) = mpsc::channel(4);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (cov_tx, cov_rx) = mpsc::unbounded_channel();
    (
        AgentChannelsTx {
            rpc: rpc_tx,
            config: config_tx,
            internal: internal_tx,
            cov: cov_tx,
        },
        AgentChannelsRx {
            rpc: rpc_rx,
            config: config_rx,
            internal: internal_rx,
            cov: cov_rx,
        },
    )
}

pub struct DriverAgent {
    pub config: AgentConfig,
    pub equipment: EquipmentTree,
    pub remotes: Remotes,
    pub interfaces: InterfaceRegistry,
    pub reservations: ReservationManager,
    schedulers: BTreeMap<String, Box<dyn PollScheduler>>,
    pub poll_sets: PollSetTable,
    overrides: Box<dyn OverridePort>,
    publisher: Publisher,
    bus_tx: BusSender,
    db: Option<Database>,
    internal_tx: InternalSender,
    cov_tx: UnboundedSender<CovNotification>,
    reservation_timer: Option<TimeoutTask>,
    // Sized at startup; a config change is logged but not re-applied.
    _socket_limit: Option<Arc<Semaphore>>,
    health_reason: Option<String>,
}

// ===== impl DriverAgent =====

impl std::fmt::Debug for DriverAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverAgent")
            .field("config", &self.config)
            .field("equipment", &self.equipment)
            .field("remotes", &self.remotes)
            .field("interfaces", &self.interfaces)
            .field("reservations", &self.reservations)
            .field("schedulers", &self.schedulers)
            .finish()
    }
}

impl DriverAgent {
    pub fn new(
        initial_config: &Value,
        bus_tx: BusSender,
        db: Option<Database>,
        overrides: Box<dyn OverridePort>,
        channels_tx: &AgentChannelsTx,
    ) -> DriverAgent {
        let (config, health_reason) = match AgentConfig::load(initial_config) {
            Ok(config) => (config, None),
            Err(error) => {
                error.log();
                (AgentConfig::default(), Some(error.to_string()))
            }
        };
        let equipment = EquipmentTree::new(TreeDefaults::from(&config));
        let reservations = ReservationManager::new(
            seconds(config.reservation_preempt_grace_time),
            seconds(config.reservation_publish_interval),
            db.clone(),
        );
        let publisher = Publisher::new(
            bus_tx.clone(),
            Arc::new(Semaphore::new(config.max_concurrent_publishes)),
        );
        let socket_limit =
            config.max_open_sockets.map(|n| Arc::new(Semaphore::new(n)));
        DriverAgent {
            config,
            equipment,
            remotes: Remotes::default(),
            interfaces: InterfaceRegistry::new(),
            reservations,
            schedulers: BTreeMap::new(),
            poll_sets: PollSetTable::new(),
            overrides,
            publisher,
            bus_tx,
            db,
            internal_tx: channels_tx.internal.clone(),
            cov_tx: channels_tx.cov.clone(),
            reservation_timer: None,
            _socket_limit: socket_limit,
            health_reason,
        }
    }

    /// Startup: restore persisted reservation state and start the
    /// reservation update cycle.
    pub fn init(&mut self) {
        let now = Utc::now();
        self.reservations.load_state(now);
        let next = self.reservations.update(now);
        self.reservation_timer =
            Some(tasks::reservation_update(next, &self.internal_tx));
        if let Some(reason) = &self.health_reason {
            warn!(%reason, "service started with BAD health");
            self.publish_health();
        }
    }

    // ----- event handlers -----

    pub async fn process_rpc(&mut self, msg: RpcRequestMsg) {
        let RpcRequestMsg {
            sender,
            request,
            responder,
        } = msg;
        let result = self.dispatch_rpc(&sender, request).await;
        if let Err(error) = &result {
            error.log();
        }
        if let Some(responder) = responder {
            let _ = responder.send(result);
        }
    }

    pub async fn process_config(&mut self, msg: ConfigMsg) {
        if let Err(error) = self.handle_config(msg).await {
            // Config events must never take the service down.
            error.log();
        }
    }

    pub async fn process_internal(&mut self, msg: InternalMsg) {
        match msg {
            InternalMsg::PollTimer { group, hyperperiod } => {
                let now = Utc::now();
                let keys = match self.schedulers.get_mut(&group) {
                    Some(scheduler) => scheduler.operate_polling(
                        hyperperiod,
                        &self.internal_tx,
                        now,
                    ),
                    None => vec![],
                };
                self.dispatch_polls(&group, keys);
            }
            InternalMsg::PollDone(msg) => self.apply_poll_results(msg),
            InternalMsg::AllPublishTimer { device } => self.all_publish(&device),
            InternalMsg::ReservationUpdate => self.reservation_update(),
            InternalMsg::Heartbeat { remote_id } => {
                if let Some(remote) = self.remotes.get_mut(&remote_id) {
                    remote.send_heartbeat().await;
                }
            }
            InternalMsg::Cov(notification) => self.publish_cov_value(notification),
        }
    }

    // ----- RPC dispatch -----

    async fn dispatch_rpc(
        &mut self,
        sender: &str,
        request: RpcRequest,
    ) -> Result<Value, Error> {
        match request {
            RpcRequest::Get(selector) => self.get(&selector).await,
            RpcRequest::Set {
                selector,
                value,
                confirm_values,
                map_points,
            } => {
                self.set(sender, &selector, value, confirm_values, map_points)
                    .await
            }
            RpcRequest::Revert(selector) => self.revert(sender, &selector).await,
            RpcRequest::Last {
                selector,
                value,
                updated,
            } => self.last(&selector, value, updated),
            RpcRequest::Start(selector) => self.start(&selector),
            RpcRequest::Stop(selector) => self.stop(&selector),
            RpcRequest::Enable(selector) => self.enable(&selector),
            RpcRequest::Disable(selector) => self.disable(&selector),
            RpcRequest::Status(_) => Err(Error::NotImplemented("status")),
            RpcRequest::ListTopics {
                selector,
                active,
                enabled,
            } => self.list_topics(&selector, active, enabled),
            RpcRequest::AddNode {
                topic,
                config,
                update_schedule,
            } => self.add_node(&topic, &config, update_schedule).await,
            RpcRequest::RemoveNode {
                topic,
                leave_disconnected,
            } => Ok(json!(self.remove_node(&topic, leave_disconnected))),
            RpcRequest::ListInterfaces => {
                Ok(json!(self.interfaces.driver_types()))
            }
            RpcRequest::AddInterface { name } => {
                // Only compiled-in driver types can be installed.
                self.interfaces.get(&name)?;
                Ok(json!(true))
            }
            RpcRequest::RemoveInterface { name } => {
                Ok(json!(self.interfaces.remove(&name)))
            }
            RpcRequest::NewReservation {
                task_id,
                priority,
                requests,
            } => {
                let result = self.reservations.new_task(
                    Some(sender),
                    &task_id,
                    &priority,
                    &requests,
                    Utc::now(),
                );
                self.reservation_update();
                serde_json::to_value(result)
                    .map_err(|error| Error::Validation(error.to_string()))
            }
            RpcRequest::CancelReservation { task_id } => {
                let result = match task_id.as_str() {
                    Some(task_id) => {
                        self.reservations.cancel_task(sender, task_id)
                    }
                    None => crate::reservation::RequestResult::failure(
                        "TASK_ID_DOES_NOT_EXIST",
                    ),
                };
                self.reservation_update();
                serde_json::to_value(result)
                    .map_err(|error| Error::Validation(error.to_string()))
            }
            RpcRequest::SemanticGet { query } => {
                let mut merged = json!({ "values": {}, "errors": {} });
                for topic_str in self.semantic_topics(&query).await? {
                    let result = self.get(&Selector::topic(topic_str)).await?;
                    merge_results(&mut merged, result);
                }
                Ok(merged)
            }
            RpcRequest::SemanticSet {
                query,
                value,
                confirm_values,
            } => {
                let mut merged = json!({ "values": {}, "errors": {} });
                for topic_str in self.semantic_topics(&query).await? {
                    let result = self
                        .set(
                            sender,
                            &Selector::topic(topic_str),
                            value.clone(),
                            confirm_values,
                            false,
                        )
                        .await?;
                    merge_results(&mut merged, result);
                }
                Ok(merged)
            }
            RpcRequest::SemanticRevert { query } => {
                let mut merged = json!({ "values": {}, "errors": {} });
                for topic_str in self.semantic_topics(&query).await? {
                    let result =
                        self.revert(sender, &Selector::topic(topic_str)).await?;
                    merge_results(&mut merged, result);
                }
                Ok(merged)
            }
            RpcRequest::SemanticStatus { .. } => {
                Err(Error::NotImplemented("semantic_status"))
            }
        }
    }

    // ----- core operations (C5) -----

    /// Reads every selected point through its remote and merges the
    /// per-remote results.
    pub async fn get(&mut self, selector: &Selector) -> Result<Value, Error> {
        let plan = self.build_query_plan(selector).await?;
        let mut values = PointValues::new();
        let mut errors = PointErrors::new();
        for (remote_id, points) in plan {
            let point_ids: Vec<String> = points
                .iter()
                .filter_map(|&point| {
                    self.equipment.node(point).map(|node| node.topic.clone())
                })
                .collect();
            let Some(remote) = self.remotes.get(&remote_id) else {
                continue;
            };
            match remote.get_multiple_points(&point_ids).await {
                Ok((batch_values, batch_errors)) => {
                    values.extend(batch_values);
                    errors.extend(batch_errors);
                }
                Err(error) => {
                    // Connection-level failure fails the whole batch.
                    for point_id in point_ids {
                        errors.insert(point_id, error.to_string());
                    }
                }
            }
        }
        Ok(json!({ "values": values, "errors": errors }))
    }

    /// Writes the selected points, honoring reservations and overrides per
    /// device. `map_points` treats `value` as a per-point mapping.
    pub async fn set(
        &mut self,
        sender: &str,
        selector: &Selector,
        value: Value,
        confirm_values: bool,
        map_points: bool,
    ) -> Result<Value, Error> {
        let plan = self.build_query_plan(selector).await?;
        let mut values = PointValues::new();
        let mut errors = PointErrors::new();
        let point_value_map = if map_points {
            let Some(mapping) = value.as_object() else {
                return Err(Error::Validation(
                    "map_points requires an object of point values".to_owned(),
                ));
            };
            Some(
                mapping
                    .iter()
                    .map(|(key, val)| {
                        (self.equipment.equipment_id(key, None), val.clone())
                    })
                    .collect::<HashMap<String, Value>>(),
            )
        } else {
            None
        };

        for (remote_id, points) in plan {
            let mut pairs: Vec<(String, Value)> = vec![];
            for point in points {
                let Some(node) = self.equipment.node(point) else {
                    continue;
                };
                let point_topic = node.topic.clone();
                // Writes pass the lock checks per touched device first.
                if let Err(error) = self.raise_on_locks(point, sender) {
                    self.publisher.push_result_topic_pair(
                        ERROR_RESPONSE_PREFIX,
                        &point_topic,
                        Headers::now(Some(sender)),
                        json!(error.to_string()),
                    );
                    errors.insert(point_topic, error.to_string());
                    continue;
                }
                let point_value = match &point_value_map {
                    Some(mapping) => match mapping.get(&point_topic) {
                        Some(val) => val.clone(),
                        None => continue,
                    },
                    None => value.clone(),
                };
                pairs.push((point_topic, point_value));
            }
            if pairs.is_empty() {
                continue;
            }
            let Some(remote) = self.remotes.get(&remote_id) else {
                continue;
            };
            match remote.set_multiple_points(&pairs).await {
                Ok(batch_errors) => {
                    for (point_id, value) in &pairs {
                        if !batch_errors.contains_key(point_id) {
                            values.insert(point_id.clone(), value.clone());
                        }
                    }
                    errors.extend(batch_errors);
                }
                Err(error) => {
                    for (point_id, _) in pairs {
                        errors.insert(point_id, error.to_string());
                    }
                }
            }
            if confirm_values {
                let read_back: Vec<String> = values.keys().cloned().collect();
                if let Some(remote) = self.remotes.get(&remote_id)
                    && let Ok((confirmed, _)) =
                        remote.get_multiple_points(&read_back).await
                {
                    values.extend(confirmed);
                }
            }
        }
        for (point_topic, value) in &values {
            self.publisher.push_result_topic_pair(
                VALUE_RESPONSE_PREFIX,
                point_topic,
                Headers::now(Some(sender)),
                value.clone(),
            );
        }
        Ok(json!({ "values": values, "errors": errors }))
    }

    /// Restores the selected points to their device defaults.
    pub async fn revert(
        &mut self,
        sender: &str,
        selector: &Selector,
    ) -> Result<Value, Error> {
        let plan = self.build_query_plan(selector).await?;
        let mut errors = PointErrors::new();
        for (remote_id, points) in plan {
            let Some(remote) = self.remotes.get(&remote_id) else {
                continue;
            };
            for point in points {
                let Some(node) = self.equipment.node(point) else {
                    continue;
                };
                let point_topic = node.topic.clone();
                match remote.revert_point(&point_topic).await {
                    Ok(()) => {
                        self.publisher.push_result_topic_pair(
                            REVERT_POINT_RESPONSE_PREFIX,
                            &point_topic,
                            Headers::now(Some(sender)),
                            Value::Null,
                        );
                    }
                    Err(error) => {
                        errors.insert(point_topic, error.to_string());
                    }
                }
            }
        }
        Ok(json!({ "errors": errors }))
    }

    /// Reverts every point a device serves through its remote.
    pub async fn revert_device(
        &mut self,
        sender: &str,
        topic_str: &str,
    ) -> Result<Value, Error> {
        let equipment_id = self.equipment.equipment_id(topic_str, None);
        let device = self
            .equipment
            .get_node(&equipment_id)
            .ok_or_else(|| Error::NoMatchingTopic(equipment_id.clone()))?;
        let remote_id = self
            .equipment
            .remote_id(device)
            .map(str::to_owned)
            .ok_or_else(|| Error::NoMatchingTopic(equipment_id.clone()))?;
        if let Some(remote) = self.remotes.get(&remote_id) {
            remote.revert_all().await?;
            self.publisher.push_result_topic_pair(
                REVERT_DEVICE_RESPONSE_PREFIX,
                &equipment_id,
                Headers::now(Some(sender)),
                Value::Null,
            );
        }
        Ok(json!(true))
    }

    /// In-memory lookup of last-observed values.
    pub fn last(
        &mut self,
        selector: &Selector,
        with_value: bool,
        with_updated: bool,
    ) -> Result<Value, Error> {
        let points = self.find_selected_points(selector)?;
        let mut result = Map::new();
        for point in points {
            let Some(node) = self.equipment.node(point) else {
                continue;
            };
            let Some((value, updated)) = self.equipment.last_value(point)
            else {
                continue;
            };
            let updated = updated
                .map(drover_utils::bus::iso8601)
                .map_or(Value::Null, Value::from);
            let entry = match (with_value, with_updated) {
                (true, true) => json!({ "value": value, "updated": updated }),
                (true, false) => value.clone(),
                (false, true) => updated,
                (false, false) => Value::Null,
            };
            result.insert(node.topic.clone(), entry);
        }
        Ok(Value::Object(result))
    }

    /// Runtime-only activation of points; the persisted flag is untouched.
    pub fn start(&mut self, selector: &Selector) -> Result<Value, Error> {
        let points = self.find_selected_points(selector)?;
        let mut reschedule_required = false;
        for &point in &points {
            if self.equipment.is_active(point) {
                continue;
            }
            self.equipment.set_active(point, true);
            if self.config.allow_reschedule {
                reschedule_required = true;
            } else {
                poll::add_to_schedule(
                    &mut self.poll_sets,
                    &self.equipment,
                    point,
                );
            }
        }
        if reschedule_required {
            self.schedule_all();
        }
        Ok(json!(points.len()))
    }

    /// Runtime-only deactivation of points.
    pub fn stop(&mut self, selector: &Selector) -> Result<Value, Error> {
        let points = self.find_selected_points(selector)?;
        let mut reschedule_required = false;
        for &point in &points {
            if !self.equipment.is_active(point) {
                continue;
            }
            self.equipment.set_active(point, false);
            if self.config.allow_reschedule {
                reschedule_required = true;
            } else {
                poll::remove_from_schedule(
                    &mut self.poll_sets,
                    &self.equipment,
                    point,
                );
            }
        }
        if reschedule_required {
            self.schedule_all();
        }
        Ok(json!(points.len()))
    }

    /// Persists the active flag, unlike `start`/`stop`.
    pub fn enable(&mut self, selector: &Selector) -> Result<Value, Error> {
        self.set_enabled(selector, true)
    }

    pub fn disable(&mut self, selector: &Selector) -> Result<Value, Error> {
        self.set_enabled(selector, false)
    }

    fn set_enabled(
        &mut self,
        selector: &Selector,
        enabled: bool,
    ) -> Result<Value, Error> {
        let equipment_id = self.equipment.equipment_id(&selector.topic, None);
        let Some(index) = self.equipment.get_node(&equipment_id) else {
            return Err(Error::NoMatchingTopic(equipment_id));
        };
        if let Some(node) = self.equipment.node_mut(index) {
            node.active = Some(enabled);
            node.config.active = Some(enabled);
        }
        self.persist_equipment_config(index);
        if self.config.allow_reschedule {
            self.schedule_all();
        }
        Ok(json!(true))
    }

    pub fn list_topics(
        &mut self,
        selector: &Selector,
        active: bool,
        enabled: bool,
    ) -> Result<Value, Error> {
        let equipment_id = self.equipment.equipment_id(&selector.topic, None);
        let Some(index) = self.equipment.get_node(&equipment_id) else {
            return Ok(json!(Vec::<String>::new()));
        };
        let regex = compile_regex(selector.regex.as_deref())?;
        let topics: Vec<String> = self
            .equipment
            .subtree(index)
            .into_iter()
            .skip(1)
            .filter(|&idx| {
                self.equipment
                    .node(idx)
                    .is_some_and(|node| node.is_point() || node.is_device())
            })
            .filter(|&idx| !active || self.equipment.is_active(idx))
            .filter(|&idx| {
                !enabled
                    || self.equipment.node(idx).is_some_and(|node| {
                        node.config.active.unwrap_or(true)
                    })
            })
            .filter_map(|idx| {
                self.equipment.node(idx).map(|node| node.topic.clone())
            })
            .filter(|topic_str| {
                regex
                    .as_ref()
                    .is_none_or(|regex| regex.is_match(topic_str))
            })
            .collect();
        Ok(json!(topics))
    }

    /// Creates or updates an equipment node from configuration.
    pub async fn add_node(
        &mut self,
        node_topic: &str,
        contents: &Value,
        update_schedule: bool,
    ) -> Result<Value, Error> {
        let config = EquipmentConfig::load(contents)?;
        if config.is_device() {
            self.configure_new_equipment(node_topic, config).await?;
            if update_schedule {
                self.schedule_all();
            }
        } else {
            self.equipment.add_segment(node_topic, Some(config));
        }
        Ok(json!(true))
    }

    /// Removes an equipment node, stopping its remote first when it is a
    /// device. `leave_disconnected` keeps the remote's other devices
    /// untouched but skips the refcount release (the node can be
    /// re-added without rebuilding the connection).
    pub fn remove_node(
        &mut self,
        node_topic: &str,
        leave_disconnected: bool,
    ) -> bool {
        let equipment_id = self.equipment.equipment_id(node_topic, None);
        let Some(index) = self.equipment.get_node(&equipment_id) else {
            // Removal of an unknown node is a no-op.
            return false;
        };
        for device in self.equipment.devices(Some(index)) {
            let Some(remote_id) =
                self.equipment.remote_id(device).map(str::to_owned)
            else {
                continue;
            };
            let Some(device_topic) = self
                .equipment
                .node(device)
                .map(|node| node.topic.clone())
            else {
                continue;
            };
            if !leave_disconnected {
                self.remotes.release_device(&remote_id, &device_topic);
            }
        }
        for point in self.equipment.points(Some(index)) {
            poll::remove_from_schedule(
                &mut self.poll_sets,
                &self.equipment,
                point,
            );
        }
        self.equipment.remove_segment(index);
        if self.config.allow_reschedule {
            self.schedule_all();
        }
        true
    }

    // ----- configuration events -----

    async fn handle_config(&mut self, msg: ConfigMsg) -> Result<(), Error> {
        match msg.name.as_str() {
            MAIN_CONFIG_NAME => self.configure_main(msg),
            name => {
                let Some(node_topic) = name.strip_prefix(EQUIPMENT_CONFIG_PREFIX)
                else {
                    debug!(%name, "ignoring unrelated config entry");
                    return Ok(());
                };
                match msg.action {
                    ConfigAction::New | ConfigAction::Update => {
                        self.update_equipment(node_topic, &msg.contents).await
                    }
                    ConfigAction::Delete => {
                        self.remove_node(node_topic, false);
                        Ok(())
                    }
                }
            }
        }
    }

    fn configure_main(&mut self, msg: ConfigMsg) -> Result<(), Error> {
        if msg.action == ConfigAction::Delete {
            warn!("main configuration deleted, reverting to defaults");
            self.config = AgentConfig::default();
            self.equipment.defaults = TreeDefaults::from(&self.config);
            self.schedule_all();
            return Ok(());
        }
        match AgentConfig::load(&msg.contents) {
            Ok(config) => {
                if config.max_open_sockets != self.config.max_open_sockets
                    || config.max_concurrent_publishes
                        != self.config.max_concurrent_publishes
                {
                    info!(
                        "socket/publish limits changed; a restart is required \
                         to apply them"
                    );
                }
                self.config = config;
                self.equipment.defaults = TreeDefaults::from(&self.config);
                self.health_reason = None;
                if msg.action != ConfigAction::New {
                    self.schedule_all();
                }
                Ok(())
            }
            Err(error) => {
                // Keep running on the previous configuration, but flag it.
                self.health_reason = Some(error.to_string());
                self.publish_health();
                Err(error)
            }
        }
    }

    /// Builds the remote for a new device and materializes its nodes.
    /// Failures abort the configuration event for this device only.
    async fn configure_new_equipment(
        &mut self,
        node_topic: &str,
        config: EquipmentConfig,
    ) -> Result<NodeIndex, Error> {
        let equipment_id = self.equipment.equipment_id(node_topic, None);
        let rows = self.resolve_registry(&config)?;
        let remote = self.remotes.get_or_create(
            &self.interfaces,
            &self.config,
            &equipment_id,
            &config,
            &self.cov_tx,
        )?;
        let parsed_rows = parse_rows(&rows, &config);
        remote
            .attach_device(&equipment_id, &config, &parsed_rows)
            .await?;
        let remote_id = remote.unique_id.clone();
        if remote.heartbeat_task.is_none() && !remote.heartbeat_points.is_empty()
        {
            remote.heartbeat_task = Some(tasks::heartbeat(
                &remote_id,
                seconds(self.config.remote_heartbeat_interval),
                &self.internal_tx,
            ));
        }
        let device =
            self.equipment
                .add_device(&equipment_id, config, rows, &remote_id)?;
        Ok(device)
    }

    /// Applies an updated device config: rebuilds the node in place and
    /// reschedules when allowed.
    async fn update_equipment(
        &mut self,
        node_topic: &str,
        contents: &Value,
    ) -> Result<(), Error> {
        let config = EquipmentConfig::load(contents)?;
        if config.is_device() {
            self.configure_new_equipment(node_topic, config).await?;
        } else {
            self.equipment.add_segment(node_topic, Some(config));
        }
        if self.config.allow_reschedule {
            self.schedule_all();
        }
        Ok(())
    }

    // ----- scheduling -----

    /// Full schedule rebuild: recompute the poll-set table, replace every
    /// scheduler (cancelling their timers) and arm fresh ones.
    pub fn schedule_all(&mut self) {
        let now = Utc::now();
        if self.config.scalability_test {
            self.run_scalability_test();
        }
        self.poll_sets = poll::build_poll_sets(&self.equipment);
        // Dropping the old schedulers cancels their timers before the new
        // ones are armed.
        self.schedulers =
            poll::create_poll_schedulers(&self.poll_sets, &self.config);
        for scheduler in self.schedulers.values_mut() {
            scheduler.schedule(&self.poll_sets, &self.internal_tx, now);
        }
        self.start_all_publishes();
    }

    /// Registers the periodic all-publish timers; the first fire waits for
    /// every point's first poll.
    fn start_all_publishes(&mut self) {
        let last_start = self
            .schedulers
            .values()
            .map(|scheduler| scheduler.start_all_datetime())
            .max()
            .unwrap_or_else(Utc::now);
        for device in self.equipment.devices(None) {
            let Some(interval) = self.equipment.all_publish_interval(device)
            else {
                continue;
            };
            if !self.equipment.is_published_all_depth(device)
                && !self.equipment.is_published_all_breadth(device)
            {
                continue;
            }
            let Some(node) = self.equipment.node(device) else {
                continue;
            };
            let device_topic = node.topic.clone();
            let Some(remote_id) =
                self.equipment.remote_id(device).map(str::to_owned)
            else {
                continue;
            };
            debug!(device = %device_topic, "starting all-publish");
            let timer = tasks::all_publish_timer(
                &device_topic,
                last_start,
                interval,
                &self.internal_tx,
            );
            if let Some(remote) = self.remotes.get_mut(&remote_id) {
                remote.publishers.insert(device_topic, timer);
            }
        }
    }

    fn dispatch_polls(&mut self, group: &str, keys: Vec<poll::PollSetKey>) {
        for key in keys {
            let Some(poll_set) = self
                .poll_sets
                .get(group)
                .and_then(|remotes| remotes.get(&key.remote_id))
                .and_then(|intervals| intervals.get(&key.interval))
            else {
                continue;
            };
            let Some(remote) = self.remotes.get(&key.remote_id) else {
                continue;
            };
            remote.spawn_poll(
                group,
                poll_set.points.clone(),
                poll_set.publish_setup.clone(),
                &self.internal_tx,
            );
        }
    }

    fn apply_poll_results(&mut self, msg: PollDoneMsg) {
        let PollDoneMsg {
            remote_id,
            group,
            start: _,
            points,
            values,
            errors,
            publish_setup,
        } = msg;
        for (point_topic, index) in points {
            if let Some(value) = values.get(&point_topic) {
                // A handle that no longer resolves belongs to a removed
                // node; the store ignores it.
                self.equipment.set_last_value(index, value.clone());
            }
        }
        for (point_topic, error) in errors {
            warn!(point = %point_topic, %error, "poll error");
        }
        self.publisher.publish_poll_results(&publish_setup, &values, None);
        let now = Utc::now();
        let next = match self.schedulers.get_mut(&group) {
            Some(scheduler) => {
                scheduler.poll_finished(&remote_id, &self.internal_tx, now)
            }
            None => vec![],
        };
        self.dispatch_polls(&group, next);
    }

    fn all_publish(&mut self, device_topic: &str) {
        let Some(device) = self.equipment.get_node(device_topic) else {
            return;
        };
        if !self.equipment.is_ready(device) {
            debug!(device = %device_topic,
                "skipping all-publish, not all points polled yet");
            return;
        }
        let now = Utc::now();
        let stale = self
            .equipment
            .points(Some(device))
            .iter()
            .any(|&point| self.equipment.is_stale(point, now));
        if stale {
            warn!(device = %device_topic,
                "skipping all-publish, device has stale points");
            return;
        }
        self.publisher.publish_all(
            &self.equipment,
            device,
            self.equipment.is_published_all_depth(device),
            self.equipment.is_published_all_breadth(device),
        );
    }

    fn reservation_update(&mut self) {
        let now = Utc::now();
        let next = self.reservations.update(now);
        let state = self.reservations.get_reservation_state(now);
        self.publisher.publish(
            RESERVATION_STATE_TOPIC.to_owned(),
            Headers::now(None),
            serde_json::to_value(&state).unwrap_or(Value::Null),
        );
        self.reservation_timer =
            Some(tasks::reservation_update(next, &self.internal_tx));
    }

    /// Applies a change-of-value notification pushed by a device.
    fn publish_cov_value(&mut self, notification: CovNotification) {
        let CovNotification { equipment, values } = notification;
        let mut points = vec![];
        for (point_id, value) in &values {
            let point_topic = if point_id.starts_with(&equipment) {
                point_id.clone()
            } else {
                topic::join(&equipment, point_id)
            };
            if let Some(index) = self.equipment.get_node(&point_topic) {
                self.equipment.set_last_value(index, value.clone());
                points.push(index);
            }
        }
        let setup = PublishSetup::build(&self.equipment, &points);
        // COV values are keyed by full point topic for publication.
        let values: PointValues = points
            .iter()
            .filter_map(|&index| {
                let node = self.equipment.node(index)?;
                let state = node.as_point()?;
                Some((node.topic.clone(), state.last_value.clone()))
            })
            .collect();
        self.publisher.publish_poll_results(&setup, &values, None);
    }

    // ----- lock checks -----

    /// Fails when the node's device is reserved by someone other than the
    /// requester, when no reservation exists but one is required, or when
    /// a global override covers the topic.
    pub fn raise_on_locks(
        &self,
        index: NodeIndex,
        requester: &str,
    ) -> Result<(), Error> {
        let Some(device) = self.equipment.device_of(index) else {
            return Ok(());
        };
        let Some(node) = self.equipment.node(device) else {
            return Ok(());
        };
        let now = Utc::now();
        // Reservations may be keyed by full or base-relative topics.
        let relative = node
            .topic
            .strip_prefix(&format!(
                "{}/",
                self.equipment.defaults.depth_first_base
            ))
            .unwrap_or(&node.topic);
        let holder = self
            .reservations
            .holder_of(&node.topic, now)
            .or_else(|| self.reservations.holder_of(relative, now));
        match holder {
            Some((agent_id, _)) if agent_id != requester => {
                return Err(Error::ReservationLock(format!(
                    "equipment {} is reserved by another party; ({requester}) \
                     does not have permission to write at this time",
                    node.topic
                )));
            }
            None if self.config.reservation_required_for_write
                && !self.config.allow_no_lock_write =>
            {
                return Err(Error::ReservationLock(format!(
                    "caller ({requester}) does not have a reservation for \
                     equipment {}; a reservation is required to write",
                    node.topic
                )));
            }
            _ => {}
        }
        if self.overrides.is_overridden(&node.topic) {
            return Err(Error::Override(node.topic.clone()));
        }
        Ok(())
    }

    // ----- query plans -----

    /// Maps each selected point to the remote that serves it.
    async fn build_query_plan(
        &mut self,
        selector: &Selector,
    ) -> Result<HashMap<String, Vec<NodeIndex>>, Error> {
        let points = match &selector.tag {
            Some(tag_query) => {
                match self.tag_service_topics(tag_query).await {
                    Ok(tagged) => {
                        let by_tag: Vec<NodeIndex> = tagged
                            .iter()
                            .filter_map(|topic_str| {
                                self.equipment.get_node(
                                    &self.equipment.equipment_id(topic_str, None),
                                )
                            })
                            .collect();
                        let selected = self.find_selected_points(selector)?;
                        selected
                            .into_iter()
                            .filter(|index| by_tag.contains(index))
                            .collect()
                    }
                    Err(error @ Error::Timeout(..)) => {
                        // Upstream timeout degrades to an empty result.
                        error.log();
                        vec![]
                    }
                    Err(error) => return Err(error),
                }
            }
            None => self.find_selected_points(selector)?,
        };
        let mut plan: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        for point in points {
            let Some(remote_id) =
                self.equipment.remote_id(point).map(str::to_owned)
            else {
                continue;
            };
            plan.entry(remote_id).or_default().push(point);
        }
        Ok(plan)
    }

    fn find_selected_points(
        &self,
        selector: &Selector,
    ) -> Result<Vec<NodeIndex>, Error> {
        let equipment_id = self.equipment.equipment_id(&selector.topic, None);
        let regex = compile_regex(selector.regex.as_deref())?;
        Ok(self.equipment.find_points(&equipment_id, regex.as_ref()))
    }

    // ----- upstream services -----

    /// Resolves a semantic query to topics through the sibling
    /// semantic-query service. An empty list means the query matched
    /// nothing, or the service timed out.
    async fn semantic_topics(
        &mut self,
        query: &str,
    ) -> Result<Vec<String>, Error> {
        match self
            .rpc_call(SEMANTIC_SERVICE_PEER, "semantic_query", json!([query]))
            .await
        {
            Ok(Value::String(topic_str)) => Ok(vec![topic_str]),
            Ok(Value::Array(topics)) => Ok(topics
                .into_iter()
                .filter_map(|entry| entry.as_str().map(str::to_owned))
                .collect()),
            Ok(_) => Ok(vec![]),
            Err(error @ Error::Timeout(..)) => {
                error.log();
                Ok(vec![])
            }
            Err(error) => Err(error),
        }
    }

    async fn tag_service_topics(
        &mut self,
        tag_query: &str,
    ) -> Result<Vec<String>, Error> {
        let result = self
            .rpc_call(
                TAGGING_SERVICE_PEER,
                "get_topics_by_tags",
                json!([tag_query]),
            )
            .await?;
        Ok(result
            .as_array()
            .map(|topics| {
                topics
                    .iter()
                    .filter_map(|entry| entry.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rpc_call(
        &mut self,
        peer: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, Error> {
        let (responder, response) = tokio::sync::oneshot::channel();
        let _ = self.bus_tx.send(BusMsg::RpcCall {
            peer: peer.to_owned(),
            method: method.to_owned(),
            args,
            responder: Some(responder),
        });
        match tokio::time::timeout(UPSTREAM_TIMEOUT, response).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(Error::Validation(error.to_string())),
            Ok(Err(_)) => Err(Error::Timeout(peer.to_owned())),
            Err(_) => Err(Error::Timeout(peer.to_owned())),
        }
    }

    // ----- helpers -----

    fn resolve_registry(
        &self,
        config: &EquipmentConfig,
    ) -> Result<Vec<Map<String, Value>>, Error> {
        if let Some(rows) = config.inline_registry() {
            return Ok(rows);
        }
        if let Some(reference) = config.registry_reference() {
            let Some(db) = &self.db else {
                return Err(Error::Validation(format!(
                    "registry reference config://{reference} requires a \
                     config store"
                )));
            };
            let stored: Option<Value> =
                db.lock().unwrap().get(&format!("registries/{reference}"));
            let rows: Vec<Map<String, Value>> = stored
                .as_ref()
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.as_object().cloned())
                        .collect()
                })
                .unwrap_or_default();
            if rows.is_empty() {
                warn!(registry = %reference, "registry reference is empty");
            }
            return Ok(rows);
        }
        Ok(vec![])
    }

    fn persist_equipment_config(&mut self, index: NodeIndex) {
        let Some(db) = &self.db else {
            return;
        };
        let Some(node) = self.equipment.node(index) else {
            return;
        };
        let key = node.topic.clone();
        match serde_json::to_value(&node.config) {
            Ok(config) => {
                if let Err(error) = db.lock().unwrap().set(&key, &config) {
                    Error::from(error).log();
                }
            }
            Err(error) => {
                warn!(%error, topic = %key, "failed to serialize equipment \
                     config");
            }
        }
    }

    fn publish_health(&self) {
        let status = match &self.health_reason {
            Some(reason) => json!({ "status": "BAD", "context": reason }),
            None => json!({ "status": "GOOD" }),
        };
        self.publisher.publish(
            "alerts/platform_driver/health".to_owned(),
            Headers::now(None),
            status,
        );
    }

    fn run_scalability_test(&self) {
        let iterations = self.config.scalability_test_iterations.max(1);
        let begin = std::time::Instant::now();
        for _ in 0..iterations {
            let _ = poll::build_poll_sets(&self.equipment);
        }
        info!(
            iterations,
            average_ms =
                begin.elapsed().as_millis() as f64 / iterations as f64,
            "poll-set build benchmark"
        );
    }
}

/// Legacy actuator-style entry points, parsed into canonical requests.
impl DriverAgent {
    pub async fn get_point(
        &mut self,
        path: Option<&str>,
        point_name: Option<&str>,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, Error> {
        let selector = selector_from_legacy(path, point_name, kwargs);
        let equipment_id = self.equipment.equipment_id(&selector.topic, None);
        self.equipment
            .get_node(&equipment_id)
            .ok_or_else(|| Error::NoMatchingTopic(equipment_id.clone()))?;
        let result = self.get(&Selector::topic(equipment_id.clone())).await?;
        Ok(result
            .get("values")
            .and_then(|values| values.get(&equipment_id))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn set_point(
        &mut self,
        sender: &str,
        path: Option<&str>,
        point_name: Option<&str>,
        value: Value,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, Error> {
        let selector = selector_from_legacy(path, point_name, kwargs);
        let equipment_id = self.equipment.equipment_id(&selector.topic, None);
        self.equipment
            .get_node(&equipment_id)
            .ok_or_else(|| Error::NoMatchingTopic(equipment_id.clone()))?;
        let result = self
            .set(
                sender,
                &Selector::topic(equipment_id.clone()),
                value,
                false,
                false,
            )
            .await?;
        Ok(result
            .get("values")
            .and_then(|values| values.get(&equipment_id))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

// ===== event loop =====

/// Runs the agent until every input channel closes.
pub async fn event_loop(mut agent: DriverAgent, mut rx: AgentChannelsRx) {
    agent.init();
    loop {
        tokio::select! {
            msg = rx.rpc.recv() => match msg {
                Some(msg) => agent.process_rpc(msg).await,
                None => break,
            },
            Some(msg) = rx.config.recv() => {
                agent.process_config(msg).await;
            }
            Some(msg) = rx.internal.recv() => {
                agent.process_internal(msg).await;
            }
            Some(notification) = rx.cov.recv() => {
                agent
                    .process_internal(InternalMsg::Cov(notification))
                    .await;
            }
        }
    }
    info!("agent event loop stopped");
}

// ===== global functions =====

// Folds one `{values, errors}` result object into an accumulator.
fn merge_results(merged: &mut Value, result: Value) {
    for key in ["values", "errors"] {
        if let (Some(Value::Object(into)), Some(Value::Object(from))) =
            (merged.get_mut(key), result.get(key))
        {
            into.extend(from.clone());
        }
    }
}

fn compile_regex(pattern: Option<&str>) -> Result<Option<Regex>, Error> {
    pattern
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|error| Error::Validation(error.to_string()))
        })
        .transpose()
}

// Applies the equipment-wide field merge before typed parsing; rows that
// fail to parse are dropped with a warning at add_device time instead.
fn parse_rows(
    rows: &[Map<String, Value>],
    config: &EquipmentConfig,
) -> Vec<RegistryRow> {
    rows.iter()
        .filter_map(|row| {
            let mut merged = row.clone();
            for (key, value) in &config.equipment_specific_fields {
                if !merged.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            RegistryRow::from_value(&Value::Object(merged)).ok()
        })
        .collect()
}
