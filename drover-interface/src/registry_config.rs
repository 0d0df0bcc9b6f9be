//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Registry configuration rows.
//!
//! A device's registry lists the points it exposes, one row per point. Rows
//! arrive as JSON objects (inline in the device config or behind a
//! `config://` reference) using the historical column names of the CSV
//! format they were migrated from.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One point row of a device registry.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RegistryRow {
    /// Platform-facing point name; identifies the point under its device.
    #[serde(rename = "Volttron Point Name")]
    pub point_name: String,
    /// Protocol-level register name, when it differs from the platform
    /// name.
    #[serde(rename = "Point Name", default)]
    pub register_name: Option<String>,
    #[serde(rename = "Units", default)]
    pub units: Option<String>,
    #[serde(rename = "Units Details", default)]
    pub units_details: Option<String>,
    #[serde(
        rename = "Writable",
        default,
        deserialize_with = "flexible_bool"
    )]
    pub writable: bool,
    #[serde(rename = "Starting Value", default)]
    pub starting_value: Option<Value>,
    #[serde(rename = "Type", default)]
    pub point_type: Option<String>,
    #[serde(rename = "Notes", default)]
    pub notes: Option<String>,
    /// Driver-specific columns and equipment-wide extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// Registry rows migrated from CSV carry booleans as strings ("TRUE",
// "false", ...); accept those alongside real booleans.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(value) => Ok(value),
        Value::String(value) => Ok(value.eq_ignore_ascii_case("true")),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected boolean, got {other}"
        ))),
    }
}

// ===== impl RegistryRow =====

impl RegistryRow {
    /// Parses a row from its JSON object form.
    pub fn from_value(value: &Value) -> Result<RegistryRow, serde_json::Error> {
        RegistryRow::deserialize(value)
    }

    /// Point metadata published alongside values in all-publish messages.
    pub fn meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        if let Some(units) = &self.units {
            meta.insert("units".to_owned(), Value::from(units.clone()));
        }
        if let Some(point_type) = &self.point_type {
            meta.insert("type".to_owned(), Value::from(point_type.clone()));
        }
        meta
    }
}
