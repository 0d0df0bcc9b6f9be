//
// Copyright (c) The Drover Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::warn;

use drover_interface::{InterfaceError, ProtocolError};
use drover_utils::DatabaseError;

// Driver service errors.
//
// Errors raised inside scheduled callbacks are caught at the callback
// boundary and logged; errors raised inside RPC handlers propagate to the
// caller unchanged.
#[derive(Debug)]
pub enum Error {
    // Bad configuration or RPC argument shape.
    Validation(String),
    // Write attempted without (or against) a valid reservation.
    ReservationLock(String),
    // Write attempted while a global override covers the topic.
    Override(String),
    // Failure inside a driver interface.
    Protocol(ProtocolError),
    // Interface construction or installation failure.
    Interface(InterfaceError),
    // Failure to persist reservation or equipment state.
    ConfigStore(DatabaseError),
    // Upstream service did not respond in time.
    Timeout(String),
    // No equipment matched the request.
    NoMatchingTopic(String),
    // Operation declared but not available yet.
    NotImplemented(&'static str),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::Validation(reason) => {
                warn!(%reason, "{}", self);
            }
            Error::ReservationLock(topic) | Error::Override(topic) => {
                warn!(%topic, "{}", self);
            }
            Error::Protocol(error) => {
                error.log();
            }
            Error::Interface(error) => {
                error.log();
            }
            Error::ConfigStore(error) => {
                warn!(error = %error, "{}", self);
            }
            Error::Timeout(service) => {
                warn!(%service, "{}", self);
            }
            Error::NoMatchingTopic(topic) => {
                warn!(%topic, "{}", self);
            }
            Error::NotImplemented(operation) => {
                warn!(%operation, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(reason) => {
                write!(f, "validation failed: {reason}")
            }
            Error::ReservationLock(reason) => {
                write!(f, "reservation lock: {reason}")
            }
            Error::Override(topic) => {
                write!(
                    f,
                    "cannot set point on {topic} since global override is set"
                )
            }
            Error::Protocol(error) => error.fmt(f),
            Error::Interface(error) => error.fmt(f),
            Error::ConfigStore(..) => {
                write!(f, "failed to persist state to the config store")
            }
            Error::Timeout(service) => {
                write!(f, "request to {service} timed out")
            }
            Error::NoMatchingTopic(topic) => {
                write!(f, "no equipment found for topic: {topic}")
            }
            Error::NotImplemented(operation) => {
                write!(f, "operation is not implemented: {operation}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(error) => Some(error),
            Error::Interface(error) => Some(error),
            Error::ConfigStore(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(error: ProtocolError) -> Error {
        Error::Protocol(error)
    }
}

impl From<InterfaceError> for Error {
    fn from(error: InterfaceError) -> Error {
        Error::Interface(error)
    }
}

impl From<DatabaseError> for Error {
    fn from(error: DatabaseError) -> Error {
        Error::ConfigStore(error)
    }
}
