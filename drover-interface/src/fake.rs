//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Loopback driver interface.
//!
//! Backed by an in-memory register table seeded from the registry config.
//! Used by the test suites and by the demo daemon configuration; it is also
//! the reference for how an interface implementation is expected to behave
//! (per-point errors for point-level failures, whole-batch errors only for
//! connection loss, which the fake never suffers).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use drover_utils::UnboundedSender;

use crate::registry_config::RegistryRow;
use crate::{
    CovNotification, DriverInterface, InterfaceBuilder, InterfaceError,
    PointErrors, PointValues, ProtocolError,
};

pub const DRIVER_TYPE: &str = "fake";

pub struct FakeInterfaceBuilder {}

#[derive(Debug)]
pub struct FakeInterface {
    equipment: String,
    registers: Mutex<HashMap<String, FakeRegister>>,
    cov_tx: UnboundedSender<CovNotification>,
}

#[derive(Clone, Debug)]
struct FakeRegister {
    value: Value,
    starting_value: Value,
    writable: bool,
}

// ===== impl FakeInterfaceBuilder =====

impl InterfaceBuilder for FakeInterfaceBuilder {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn unique_remote_id(&self, _equipment_name: &str, config: &Value) -> String {
        // serde_json maps are ordered, so identical configurations render
        // identically.
        format!("{}://{}", DRIVER_TYPE, config)
    }

    fn build(
        &self,
        equipment_name: &str,
        _config: &Value,
        cov_tx: UnboundedSender<CovNotification>,
    ) -> Result<Arc<dyn DriverInterface>, InterfaceError> {
        Ok(Arc::new(FakeInterface {
            equipment: equipment_name.to_owned(),
            registers: Mutex::new(HashMap::new()),
            cov_tx,
        }))
    }
}

// ===== impl FakeRegister =====

impl FakeRegister {
    fn new(row: &RegistryRow) -> FakeRegister {
        let starting_value = seed_value(row);
        FakeRegister {
            value: starting_value.clone(),
            starting_value,
            writable: row.writable,
        }
    }
}

// Coerces the row's starting value to its declared type. Rows migrated
// from CSV carry all scalars as strings.
fn seed_value(row: &RegistryRow) -> Value {
    let raw = row.starting_value.clone().unwrap_or(Value::Null);
    let point_type =
        row.point_type.as_deref().unwrap_or("float").to_ascii_lowercase();
    let coerced = match (&raw, point_type.as_str()) {
        (Value::String(s), "float") => s.parse::<f64>().ok().map(Value::from),
        (Value::String(s), "int" | "integer") => {
            s.parse::<i64>().ok().map(Value::from)
        }
        (Value::String(s), "bool" | "boolean") => {
            Some(Value::from(s.eq_ignore_ascii_case("true")))
        }
        (Value::Number(n), "float") => n.as_f64().map(Value::from),
        _ => None,
    };
    coerced.unwrap_or(raw)
}

// ===== impl FakeInterface =====

impl FakeInterface {
    /// Simulates a change-of-value push from the device.
    pub fn push_cov(&self, values: PointValues) {
        let _ = self.cov_tx.send(CovNotification {
            equipment: self.equipment.clone(),
            values,
        });
    }
}

#[async_trait]
impl DriverInterface for FakeInterface {
    async fn configure(
        &self,
        device_topic: &str,
        registry: &[RegistryRow],
    ) -> Result<(), ProtocolError> {
        let mut registers = self.registers.lock().unwrap();
        for row in registry {
            let point_id = format!("{device_topic}/{}", row.point_name);
            registers.entry(point_id).or_insert_with(|| FakeRegister::new(row));
        }
        Ok(())
    }

    async fn get_multiple_points(
        &self,
        point_ids: &[String],
    ) -> Result<(PointValues, PointErrors), ProtocolError> {
        let registers = self.registers.lock().unwrap();
        let mut values = PointValues::new();
        let mut errors = PointErrors::new();
        for point_id in point_ids {
            match registers.get(point_id) {
                Some(register) => {
                    values.insert(point_id.clone(), register.value.clone());
                }
                None => {
                    errors.insert(
                        point_id.clone(),
                        format!("unknown point: {point_id}"),
                    );
                }
            }
        }
        Ok((values, errors))
    }

    async fn set_multiple_points(
        &self,
        pairs: &[(String, Value)],
    ) -> Result<PointErrors, ProtocolError> {
        let mut registers = self.registers.lock().unwrap();
        let mut errors = PointErrors::new();
        for (point_id, value) in pairs {
            match registers.get_mut(point_id) {
                Some(register) if register.writable => {
                    debug!(equipment = %self.equipment, point = %point_id,
                        "setting point");
                    register.value = value.clone();
                }
                Some(_) => {
                    errors.insert(
                        point_id.clone(),
                        format!("point is not writable: {point_id}"),
                    );
                }
                None => {
                    errors.insert(
                        point_id.clone(),
                        format!("unknown point: {point_id}"),
                    );
                }
            }
        }
        Ok(errors)
    }

    async fn revert_point(&self, point_id: &str) -> Result<(), ProtocolError> {
        let mut registers = self.registers.lock().unwrap();
        let register = registers
            .get_mut(point_id)
            .ok_or_else(|| ProtocolError::PointNotFound(point_id.to_owned()))?;
        register.value = register.starting_value.clone();
        Ok(())
    }

    async fn revert_all(&self) -> Result<(), ProtocolError> {
        let mut registers = self.registers.lock().unwrap();
        for register in registers.values_mut() {
            register.value = register.starting_value.clone();
        }
        Ok(())
    }

    async fn scrape_all(&self) -> Result<PointValues, ProtocolError> {
        let registers = self.registers.lock().unwrap();
        Ok(registers
            .iter()
            .map(|(point_id, register)| {
                (point_id.clone(), register.value.clone())
            })
            .collect())
    }
}
