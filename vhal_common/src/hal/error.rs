//! Broker error taxonomy.

use thiserror::Error;

use super::channel::StatusCode;
use crate::property::ids::to_hex;
use crate::property::{AreaId, PropertyId};

fn hex(prop: &PropertyId) -> String {
    to_hex(*prop)
}

/// Error returned by broker operations.
///
/// Only `InvalidArgument` is a caller bug; `NotAvailable` and
/// `PropertyAccess` describe hardware conditions the caller may retry later.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HalError {
    /// The channel rejected the request as malformed. Never retried.
    #[error("invalid argument for property {} area {area}", hex(.prop))]
    InvalidArgument {
        /// Property.
        prop: PropertyId,
        /// Area.
        area: AreaId,
    },

    /// No value right now, or transient retries exhausted.
    #[error("property {} area {area} not available ({status})", hex(.prop))]
    NotAvailable {
        /// Property.
        prop: PropertyId,
        /// Area.
        area: AreaId,
        /// Last status observed.
        status: StatusCode,
    },

    /// Any other non-OK status from the channel.
    #[error("property {} area {area} failed with {status}", hex(.prop))]
    PropertyAccess {
        /// Property.
        prop: PropertyId,
        /// Area.
        area: AreaId,
        /// Status returned.
        status: StatusCode,
    },

    /// Property not present in this vehicle.
    #[error("property {} not supported", hex(.0))]
    Unsupported(PropertyId),

    /// Property exists but cannot be subscribed (static or not readable).
    #[error("property {} is not subscribable", hex(.0))]
    NotSubscribable(PropertyId),

    /// A service acted on a property it does not own.
    #[error("service '{service}' does not own property {}", hex(.prop))]
    NotOwner {
        /// Offending service.
        service: String,
        /// Property.
        prop: PropertyId,
    },

    /// Two services claimed the same property.
    #[error("property {} claimed by both '{first}' and '{second}'", hex(.prop))]
    OwnershipConflict {
        /// Property.
        prop: PropertyId,
        /// Service registered first.
        first: String,
        /// Service registered later.
        second: String,
    },

    /// Transport-level failure (remote died, link broken).
    #[error("channel failure: {0}")]
    Channel(String),

    /// Operation needs `init()` first.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Startup failed.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request rejected before being sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The router backing a service handle is gone.
    #[error("vehicle HAL is no longer available")]
    Disconnected,
}

impl HalError {
    /// True for conditions worth re-issuing later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotAvailable { .. } | Self::Channel(_))
    }
}
