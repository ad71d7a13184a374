//! Upstream hardware boundary.
//!
//! This module defines:
//! - `VehicleChannel` trait - the raw property RPC interface of the vehicle
//! - `ChannelCallback` trait - notifications pushed by the vehicle
//! - `StatusCode` / `ChannelError` - what a channel call can report
//!
//! A channel implementation wraps whatever IPC reaches the vehicle (binder,
//! a socket, or the in-process simulator). The broker never assumes anything
//! about the thread on which `ChannelCallback` methods are invoked.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::property::{AreaId, PropertyDescriptor, PropertyId, PropertyValue, SubscribeOptions};

/// Status codes of the vehicle property interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    /// Success.
    Ok = 0,
    /// Transient condition, call again shortly.
    TryAgain = 1,
    /// Malformed request.
    InvalidArg = 2,
    /// Property has no value right now.
    NotAvailable = 3,
    /// Caller not allowed.
    AccessDenied = 4,
    /// Generic failure.
    InternalError = 5,
}

impl StatusCode {
    /// Decode a raw status, unknown values map to `InternalError`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::TryAgain,
            2 => Self::InvalidArg,
            3 => Self::NotAvailable,
            4 => Self::AccessDenied,
            _ => Self::InternalError,
        }
    }

    /// Raw wire value.
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::TryAgain => "TRY_AGAIN",
            Self::InvalidArg => "INVALID_ARG",
            Self::NotAvailable => "NOT_AVAILABLE",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Failure of a single channel call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The vehicle answered with a non-OK status.
    #[error("vehicle returned {0}")]
    Status(StatusCode),

    /// The call never reached the vehicle.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Status code, if the vehicle answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status) => Some(*status),
            Self::Transport(_) => None,
        }
    }
}

impl From<StatusCode> for ChannelError {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

/// Result of a channel call.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Notifications pushed by the vehicle.
///
/// Implementations must return quickly: they run on the transport's own
/// thread.
pub trait ChannelCallback: Send + Sync {
    /// A batch of property change events.
    fn on_property_event(&self, values: Vec<PropertyValue>);

    /// The vehicle applied a value written by this side.
    fn on_property_set(&self, value: PropertyValue);

    /// An earlier asynchronous write failed.
    fn on_property_set_error(&self, status: StatusCode, prop: PropertyId, area: AreaId);
}

/// Raw property interface of the vehicle.
///
/// # Contract
///
/// | Operation | Blocking | Notes |
/// |-----------|----------|-------|
/// | `get_all_prop_configs()` | yes | called once at startup |
/// | `get()` / `set()` | yes | may return `TryAgain` |
/// | `subscribe()` / `unsubscribe()` | yes | events flow to the callback |
pub trait VehicleChannel: Send + Sync {
    /// Every property the vehicle exposes.
    fn get_all_prop_configs(&self) -> ChannelResult<Vec<PropertyDescriptor>>;

    /// Read a value. `request` carries prop/area and, for request-style
    /// properties, an encoded query payload.
    fn get(&self, request: &PropertyValue) -> ChannelResult<PropertyValue>;

    /// Write a value.
    fn set(&self, value: &PropertyValue) -> ChannelResult<()>;

    /// Start (or update) delivery of events for the given properties.
    fn subscribe(
        &self,
        callback: Arc<dyn ChannelCallback>,
        options: &[SubscribeOptions],
    ) -> ChannelResult<()>;

    /// Stop delivery of events for `prop`.
    fn unsubscribe(&self, callback: Arc<dyn ChannelCallback>, prop: PropertyId) -> ChannelResult<()>;
}
