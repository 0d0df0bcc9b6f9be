//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Service and equipment configuration models.
//!
//! Configurations arrive as JSON from the config store. The main service
//! config recognizes two schema versions which differ only in their default
//! publish flags; v1 is still accepted but logged with a deprecation
//! banner.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::Error;

pub const LATEST_CONFIG_VERSION: u32 = 2;

/// Main service configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub config_version: u32,
    pub allow_duplicate_remotes: bool,
    pub allow_no_lock_write: bool,
    pub allow_reschedule: bool,
    pub breadth_first_base: String,
    pub default_polling_interval: f64,
    pub depth_first_base: String,
    pub remote_heartbeat_interval: f64,
    pub group_offset_interval: f64,
    pub max_concurrent_publishes: usize,
    pub max_open_sockets: Option<usize>,
    #[serde(alias = "driver_scrape_interval")]
    pub minimum_polling_interval: f64,
    pub poll_scheduler_configs: HashMap<String, GroupConfig>,
    pub poll_scheduler_class_name: String,
    #[serde(alias = "publish_depth_first_single")]
    pub publish_single_depth: bool,
    #[serde(alias = "publish_breadth_first_single")]
    pub publish_single_breadth: bool,
    #[serde(alias = "publish_breadth_first_all")]
    pub publish_all_breadth: bool,
    #[serde(alias = "publish_breadth_first_multi")]
    pub publish_multi_breadth: bool,
    // Defaults depend on the schema version; resolved by
    // `publish_defaults`.
    #[serde(alias = "publish_depth_first_all")]
    pub publish_all_depth: Option<bool>,
    #[serde(alias = "publish_depth_first_multi")]
    pub publish_multi_depth: Option<bool>,
    pub reservation_preempt_grace_time: f64,
    pub reservation_publish_interval: f64,
    pub reservation_required_for_write: bool,
    pub scalability_test: bool,
    pub scalability_test_iterations: u32,
    pub timezone: String,
}

/// Global default publish flags, resolved for the configured schema
/// version.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublishDefaults {
    pub single_depth: bool,
    pub single_breadth: bool,
    pub multi_depth: bool,
    pub multi_breadth: bool,
    pub all_depth: bool,
    pub all_breadth: bool,
}

/// Per-node publish-flag overrides; unset flags inherit from the nearest
/// ancestor that sets them, then from the global defaults.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct PublishFlags {
    #[serde(alias = "publish_depth_first_single")]
    pub publish_single_depth: Option<bool>,
    #[serde(alias = "publish_breadth_first_single")]
    pub publish_single_breadth: Option<bool>,
    #[serde(alias = "publish_depth_first_multi")]
    pub publish_multi_depth: Option<bool>,
    #[serde(alias = "publish_breadth_first_multi")]
    pub publish_multi_breadth: Option<bool>,
    #[serde(alias = "publish_depth_first_all")]
    pub publish_all_depth: Option<bool>,
    #[serde(alias = "publish_breadth_first_all")]
    pub publish_all_breadth: Option<bool>,
}

/// Configuration of one equipment node: a device when `driver_type` is
/// present, a bare topic segment otherwise.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct EquipmentConfig {
    pub driver_type: Option<String>,
    pub driver_config: Value,
    /// Inline list of registry rows, or a `config://<name>` reference into
    /// the config store.
    pub registry_config: Value,
    pub registry_name: Option<String>,
    /// `None` inherits the ancestor's flag.
    pub active: Option<bool>,
    #[serde(alias = "interval")]
    pub polling_interval: Option<f64>,
    pub group: Option<String>,
    pub heart_beat_point: Option<String>,
    /// Fields merged into every registry row that does not already define
    /// them.
    pub equipment_specific_fields: Map<String, Value>,
    pub all_publish_interval: Option<f64>,
    pub allow_duplicate_remotes: Option<bool>,
    pub stale_timeout: Option<f64>,
    pub meta_data: Map<String, Value>,
    #[serde(flatten)]
    pub publish_flags: PublishFlags,
}

/// Per-group scheduler overrides from `poll_scheduler_configs`.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct GroupConfig {
    pub minimum_polling_interval: Option<f64>,
    pub start_offset: Option<f64>,
    pub parallel_subgroups: bool,
    pub poll_scheduler_class_name: Option<String>,
}

/// Group configuration with every field resolved against the service
/// config.
#[derive(Clone, Debug)]
pub struct ResolvedGroupConfig {
    pub minimum_polling_interval: Duration,
    pub start_offset: Duration,
    pub parallel_subgroups: bool,
    pub scheduler: SchedulerKind,
}

/// Selectable poll-scheduler variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerKind {
    StaticCyclic,
    Serial,
}

// ===== impl AgentConfig =====

impl AgentConfig {
    /// Parses the main service configuration, substituting defaults for
    /// anything invalid or missing so the service stays up.
    pub fn load(contents: &Value) -> Result<AgentConfig, Error> {
        let config: AgentConfig = serde_json::from_value(contents.clone())
            .map_err(|error| Error::Validation(error.to_string()))?;
        if config.config_version < LATEST_CONFIG_VERSION {
            warn!(
                version = config.config_version,
                "Deprecation Warning: configuration schema version 1 is \
                 deprecated, please migrate to version 2"
            );
        }
        Ok(config)
    }

    pub fn publish_defaults(&self) -> PublishDefaults {
        PublishDefaults {
            single_depth: self.publish_single_depth,
            single_breadth: self.publish_single_breadth,
            multi_depth: self
                .publish_multi_depth
                .unwrap_or(self.config_version >= 2),
            multi_breadth: self.publish_multi_breadth,
            all_depth: self.publish_all_depth.unwrap_or(self.config_version < 2),
            all_breadth: self.publish_all_breadth,
        }
    }

    /// Resolves the configuration of one poll group. `group_index` is the
    /// position of the group in creation order and determines the default
    /// stagger offset.
    pub fn group_config(
        &self,
        group: &str,
        group_index: usize,
    ) -> ResolvedGroupConfig {
        let config =
            self.poll_scheduler_configs.get(group).cloned().unwrap_or_default();
        let minimum_polling_interval = config
            .minimum_polling_interval
            .unwrap_or(self.minimum_polling_interval);
        let start_offset = config
            .start_offset
            .unwrap_or(self.group_offset_interval * group_index as f64);
        let class_name = config
            .poll_scheduler_class_name
            .as_deref()
            .unwrap_or(&self.poll_scheduler_class_name);
        ResolvedGroupConfig {
            minimum_polling_interval: seconds(minimum_polling_interval),
            start_offset: seconds(start_offset),
            parallel_subgroups: config.parallel_subgroups,
            scheduler: SchedulerKind::from_class_name(class_name),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            config_version: LATEST_CONFIG_VERSION,
            allow_duplicate_remotes: false,
            allow_no_lock_write: false,
            allow_reschedule: true,
            breadth_first_base: "points".to_owned(),
            default_polling_interval: 60.0,
            depth_first_base: "devices".to_owned(),
            remote_heartbeat_interval: 60.0,
            group_offset_interval: 0.0,
            max_concurrent_publishes: 10000,
            max_open_sockets: None,
            minimum_polling_interval: 0.02,
            poll_scheduler_configs: HashMap::new(),
            poll_scheduler_class_name: "StaticCyclicPollScheduler".to_owned(),
            publish_single_depth: false,
            publish_single_breadth: false,
            publish_all_breadth: false,
            publish_multi_breadth: false,
            publish_all_depth: None,
            publish_multi_depth: None,
            reservation_preempt_grace_time: 60.0,
            reservation_publish_interval: 60.0,
            reservation_required_for_write: false,
            scalability_test: false,
            scalability_test_iterations: 3,
            timezone: "UTC".to_owned(),
        }
    }
}

// ===== impl EquipmentConfig =====

impl EquipmentConfig {
    pub fn load(contents: &Value) -> Result<EquipmentConfig, Error> {
        serde_json::from_value(contents.clone())
            .map_err(|error| Error::Validation(error.to_string()))
    }

    pub fn is_device(&self) -> bool {
        self.driver_type.is_some()
    }

    /// Inline registry rows, before any `config://` reference resolution.
    pub fn inline_registry(&self) -> Option<Vec<Map<String, Value>>> {
        match &self.registry_config {
            Value::Array(rows) => Some(
                rows.iter()
                    .filter_map(|row| row.as_object().cloned())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Name behind a `config://<name>` registry reference, if any.
    pub fn registry_reference(&self) -> Option<&str> {
        self.registry_config.as_str()?.strip_prefix("config://")
    }
}

// ===== impl SchedulerKind =====

impl SchedulerKind {
    pub fn from_class_name(name: &str) -> SchedulerKind {
        match name {
            "StaticCyclicPollScheduler" => SchedulerKind::StaticCyclic,
            "SerialPollScheduler" => SchedulerKind::Serial,
            _ => {
                warn!(
                    class_name = %name,
                    "unknown poll scheduler, using the static cyclic variant"
                );
                SchedulerKind::StaticCyclic
            }
        }
    }
}

// ===== global functions =====

/// Converts a configured seconds value to a `Duration`, clamping negatives
/// to zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
