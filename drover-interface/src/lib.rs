//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The Interface Port: the contract between the driver core and the
//! per-protocol interface implementations.
//!
//! The core never talks to a device directly. Every protocol (BACnet,
//! Modbus, ...) provides a [`DriverInterface`] implementation plus an
//! [`InterfaceBuilder`] that knows how to validate its configuration and
//! derive the unique id used to deduplicate remotes. Builders are looked up
//! by driver-type name in the [`InterfaceRegistry`].

pub mod fake;
pub mod registry_config;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use drover_utils::UnboundedSender;

use crate::fake::FakeInterfaceBuilder;
use crate::registry_config::RegistryRow;

/// Values read from a batch of points, keyed by point id.
pub type PointValues = HashMap<String, Value>;
/// Per-point failures from a batch operation, keyed by point id.
pub type PointErrors = HashMap<String, String>;

/// An asynchronous change-of-value notification pushed by a device.
#[derive(Clone, Debug)]
pub struct CovNotification {
    /// Topic of the equipment the notification belongs to.
    pub equipment: String,
    pub values: PointValues,
}

/// One protocol-level connection to a device endpoint.
///
/// Batch operations are atomic per call: a protocol failure on a single
/// point is reported in the per-point error map, a connection-level failure
/// fails the whole batch with [`ProtocolError`].
#[async_trait]
pub trait DriverInterface: Send + Sync + std::fmt::Debug {
    /// Attaches one device's registry to the connection. Called once per
    /// device sharing the remote; point ids are full point topics and are
    /// unique across the connection.
    async fn configure(
        &self,
        device_topic: &str,
        registry: &[RegistryRow],
    ) -> Result<(), ProtocolError>;

    /// Reads every requested point in one batch.
    async fn get_multiple_points(
        &self,
        point_ids: &[String],
    ) -> Result<(PointValues, PointErrors), ProtocolError>;

    /// Writes every `(point id, value)` pair in one batch.
    async fn set_multiple_points(
        &self,
        pairs: &[(String, Value)],
    ) -> Result<PointErrors, ProtocolError>;

    /// Restores one point to its device default.
    async fn revert_point(&self, point_id: &str) -> Result<(), ProtocolError>;

    /// Restores every point to its device default.
    async fn revert_all(&self) -> Result<(), ProtocolError>;

    /// Reads every point the interface knows about.
    async fn scrape_all(&self) -> Result<PointValues, ProtocolError>;
}

/// Factory for one driver type.
pub trait InterfaceBuilder: Send + Sync {
    /// The `driver_type` name this builder answers to.
    fn driver_type(&self) -> &'static str;

    /// Derives the id used to deduplicate remotes from the interface
    /// configuration. Devices whose configurations produce the same id
    /// share one connection.
    fn unique_remote_id(&self, equipment_name: &str, config: &Value) -> String;

    /// Validates the configuration and opens the interface. Device
    /// registries are attached afterwards through
    /// [`DriverInterface::configure`].
    fn build(
        &self,
        equipment_name: &str,
        config: &Value,
        cov_tx: UnboundedSender<CovNotification>,
    ) -> Result<Arc<dyn DriverInterface>, InterfaceError>;
}

/// The set of driver types compiled into this service, keyed by name.
pub struct InterfaceRegistry {
    builders: HashMap<&'static str, Box<dyn InterfaceBuilder>>,
}

// Interface Port errors.
#[derive(Debug)]
pub enum InterfaceError {
    UnknownDriverType(String),
    InvalidConfig(String),
    Protocol(ProtocolError),
}

// Failures inside a driver interface.
#[derive(Debug)]
pub enum ProtocolError {
    ConnectionFailed(String),
    PointNotFound(String),
    PointNotWritable(String),
}

// ===== impl InterfaceRegistry =====

impl InterfaceRegistry {
    /// Creates a registry holding the built-in driver types.
    pub fn new() -> InterfaceRegistry {
        let mut registry = InterfaceRegistry {
            builders: HashMap::new(),
        };
        registry.install(Box::new(FakeInterfaceBuilder {}));
        registry
    }

    /// Registers a driver type, replacing any previous builder of the same
    /// name.
    pub fn install(&mut self, builder: Box<dyn InterfaceBuilder>) {
        self.builders.insert(builder.driver_type(), builder);
    }

    /// Unregisters a driver type. Remotes already built from it keep
    /// running.
    pub fn remove(&mut self, driver_type: &str) -> bool {
        self.builders.remove(driver_type).is_some()
    }

    pub fn get(
        &self,
        driver_type: &str,
    ) -> Result<&dyn InterfaceBuilder, InterfaceError> {
        self.builders
            .get(driver_type)
            .map(|builder| builder.as_ref())
            .ok_or_else(|| {
                InterfaceError::UnknownDriverType(driver_type.to_owned())
            })
    }

    /// Names of all registered driver types, sorted for stable display.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.builders.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for InterfaceRegistry {
    fn default() -> InterfaceRegistry {
        InterfaceRegistry::new()
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("builders", &self.driver_types())
            .finish()
    }
}

// ===== impl InterfaceError =====

impl InterfaceError {
    pub fn log(&self) {
        match self {
            InterfaceError::UnknownDriverType(driver_type) => {
                warn!(%driver_type, "{}", self);
            }
            InterfaceError::InvalidConfig(reason) => {
                warn!(%reason, "{}", self);
            }
            InterfaceError::Protocol(error) => {
                error.log();
            }
        }
    }
}

impl std::fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceError::UnknownDriverType(..) => {
                write!(f, "unknown driver type")
            }
            InterfaceError::InvalidConfig(..) => {
                write!(f, "invalid interface configuration")
            }
            InterfaceError::Protocol(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for InterfaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterfaceError::Protocol(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ProtocolError> for InterfaceError {
    fn from(error: ProtocolError) -> InterfaceError {
        InterfaceError::Protocol(error)
    }
}

// ===== impl ProtocolError =====

impl ProtocolError {
    pub fn log(&self) {
        match self {
            ProtocolError::ConnectionFailed(reason) => {
                warn!(%reason, "{}", self);
            }
            ProtocolError::PointNotFound(point)
            | ProtocolError::PointNotWritable(point) => {
                warn!(%point, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::ConnectionFailed(..) => {
                write!(f, "connection to device failed")
            }
            ProtocolError::PointNotFound(..) => {
                write!(f, "point not found on device")
            }
            ProtocolError::PointNotWritable(..) => {
                write!(f, "point is not writable")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
