//! Common re-exports.
//!
//! ```rust
//! use vhal_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{BrokerConfig, ConfigError, ConfigLoader, LogLevel, SharedConfig};

// ─── Hardware boundary ──────────────────────────────────────────────
pub use crate::hal::{ChannelCallback, ChannelError, ChannelResult, HalError, StatusCode, VehicleChannel};

// ─── Data model ─────────────────────────────────────────────────────
pub use crate::property::ids;
pub use crate::property::{
    AreaConfig, AreaId, ChangeMode, GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyStatus,
    PropertyValue, RawValue, SubscribeFlags, SubscribeOptions, ValueType, VehicleAccess,
};
