//! Property data model.
//!
//! - `PropertyDescriptor` - static description of one hardware property
//! - `PropertyValue` / `RawValue` - timestamped typed payload
//! - `SubscribeOptions` / `SubscribeFlags` - subscription request

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::ids;

/// Numeric property identifier.
pub type PropertyId = i32;

/// Area (zone) identifier inside a property. `0` is the global area.
pub type AreaId = i32;

/// Area ID of global properties.
pub const GLOBAL_AREA: AreaId = 0;

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VehicleAccess {
    /// Neither readable nor writable.
    #[default]
    None,
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

impl VehicleAccess {
    /// True for `Read` and `ReadWrite`.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// True for `Write` and `ReadWrite`.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// How a property's value changes over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Constant for the lifetime of the vehicle.
    #[default]
    Static,
    /// Reported when it changes.
    OnChange,
    /// Sampled at a rate.
    Continuous,
}

/// Payload type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// UTF-8 string.
    String,
    /// Boolean stored as one int32.
    Boolean,
    /// Single int32.
    Int32,
    /// Vector of int32.
    Int32Vec,
    /// Single int64.
    Int64,
    /// Vector of int64.
    Int64Vec,
    /// Single float.
    Float,
    /// Vector of float.
    FloatVec,
    /// Raw bytes.
    Bytes,
    /// Any combination, described by the config array.
    Mixed,
}

impl ValueType {
    /// Decode the value-type byte of a property ID (already masked).
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0x0010_0000 => Self::String,
            0x0020_0000 => Self::Boolean,
            0x0040_0000 => Self::Int32,
            0x0041_0000 => Self::Int32Vec,
            0x0050_0000 => Self::Int64,
            0x0051_0000 => Self::Int64Vec,
            0x0060_0000 => Self::Float,
            0x0061_0000 => Self::FloatVec,
            0x0070_0000 => Self::Bytes,
            0x00E0_0000 => Self::Mixed,
            _ => return None,
        })
    }
}

/// Per-area limits of a property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Area this entry describes.
    pub area_id: AreaId,
    /// Minimum int32 value, if bounded.
    #[serde(default)]
    pub min_int32: Option<i32>,
    /// Maximum int32 value, if bounded.
    #[serde(default)]
    pub max_int32: Option<i32>,
    /// Minimum int64 value, if bounded.
    #[serde(default)]
    pub min_int64: Option<i64>,
    /// Maximum int64 value, if bounded.
    #[serde(default)]
    pub max_int64: Option<i64>,
    /// Minimum float value, if bounded.
    #[serde(default)]
    pub min_float: Option<f32>,
    /// Maximum float value, if bounded.
    #[serde(default)]
    pub max_float: Option<f32>,
}

impl AreaConfig {
    /// Unbounded area.
    pub fn new(area_id: AreaId) -> Self {
        Self {
            area_id,
            ..Default::default()
        }
    }

    /// Area with an inclusive int32 range.
    pub fn with_int32_range(area_id: AreaId, min: i32, max: i32) -> Self {
        Self {
            area_id,
            min_int32: Some(min),
            max_int32: Some(max),
            ..Default::default()
        }
    }

    /// Area with an inclusive float range.
    pub fn with_float_range(area_id: AreaId, min: f32, max: f32) -> Self {
        Self {
            area_id,
            min_float: Some(min),
            max_float: Some(max),
            ..Default::default()
        }
    }
}

/// Static description of one hardware property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property ID.
    pub prop: PropertyId,
    /// Access mode.
    pub access: VehicleAccess,
    /// Change mode.
    pub change_mode: ChangeMode,
    /// Payload type.
    pub value_type: ValueType,
    /// Per-area limits. Empty for global properties without limits.
    #[serde(default)]
    pub area_configs: Vec<AreaConfig>,
    /// Lowest supported sample rate (Hz), continuous properties only.
    #[serde(default)]
    pub min_sample_rate: f32,
    /// Highest supported sample rate (Hz), continuous properties only.
    #[serde(default)]
    pub max_sample_rate: f32,
    /// Property-specific configuration (mixed types, vendor sensor counts).
    #[serde(default)]
    pub config_array: Vec<i32>,
    /// Property-specific configuration string.
    #[serde(default)]
    pub config_string: String,
}

impl PropertyDescriptor {
    /// Descriptor with the value type decoded from the ID and no limits.
    ///
    /// Falls back to `Mixed` when the ID carries no recognised type byte.
    pub fn new(prop: PropertyId, access: VehicleAccess, change_mode: ChangeMode) -> Self {
        Self {
            prop,
            access,
            change_mode,
            value_type: ids::property_value_type(prop).unwrap_or(ValueType::Mixed),
            area_configs: Vec::new(),
            min_sample_rate: 0.0,
            max_sample_rate: 0.0,
            config_array: Vec::new(),
            config_string: String::new(),
        }
    }

    /// Builder: sample rate range.
    pub fn with_sample_rates(mut self, min: f32, max: f32) -> Self {
        self.min_sample_rate = min;
        self.max_sample_rate = max;
        self
    }

    /// Builder: add an area.
    pub fn with_area(mut self, area: AreaConfig) -> Self {
        self.area_configs.push(area);
        self
    }

    /// Builder: config array.
    pub fn with_config_array(mut self, config_array: Vec<i32>) -> Self {
        self.config_array = config_array;
        self
    }

    /// Limits for `area_id`, if declared.
    pub fn area_config(&self, area_id: AreaId) -> Option<&AreaConfig> {
        self.area_configs.iter().find(|a| a.area_id == area_id)
    }

    /// Clamp a requested sample rate into `[min_sample_rate, max_sample_rate]`.
    ///
    /// A descriptor with an inverted range collapses to its minimum; NaN
    /// requests become the minimum.
    pub fn clamp_sample_rate(&self, rate: f32) -> f32 {
        let min = self.min_sample_rate;
        let max = self.max_sample_rate.max(min);
        if rate.is_nan() || rate < min {
            min
        } else if rate > max {
            max
        } else {
            rate
        }
    }
}

/// Availability of a `PropertyValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    /// Value is valid.
    #[default]
    Available,
    /// Property temporarily has no value.
    Unavailable,
    /// Hardware reported an error.
    Error,
}

/// Untyped payload container; which fields are used depends on the value type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawValue {
    /// int32 / boolean / int32-vector payload.
    #[serde(default)]
    pub int32_values: Vec<i32>,
    /// int64 payload.
    #[serde(default)]
    pub int64_values: Vec<i64>,
    /// float payload.
    #[serde(default)]
    pub float_values: Vec<f32>,
    /// bytes payload.
    #[serde(default)]
    pub bytes: Vec<u8>,
    /// string payload.
    #[serde(default)]
    pub string_value: String,
}

/// A timestamped, typed value of one property area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Property ID.
    pub prop: PropertyId,
    /// Area ID.
    pub area_id: AreaId,
    /// Elapsed-realtime timestamp in nanoseconds.
    pub timestamp_ns: i64,
    /// Availability.
    #[serde(default)]
    pub status: PropertyStatus,
    /// Payload.
    #[serde(default)]
    pub value: RawValue,
}

impl PropertyValue {
    /// Empty value of the global area.
    pub fn new(prop: PropertyId) -> Self {
        Self {
            prop,
            ..Default::default()
        }
    }

    /// Request value used for `get` calls.
    pub fn request(prop: PropertyId, area_id: AreaId) -> Self {
        Self {
            prop,
            area_id,
            ..Default::default()
        }
    }

    /// Value carrying a single int32.
    pub fn int32(prop: PropertyId, area_id: AreaId, v: i32) -> Self {
        Self::request(prop, area_id).with_int32s(vec![v])
    }

    /// Value carrying a single float.
    pub fn float(prop: PropertyId, area_id: AreaId, v: f32) -> Self {
        let mut value = Self::request(prop, area_id);
        value.value.float_values = vec![v];
        value
    }

    /// Value carrying a boolean (as int32 0/1).
    pub fn boolean(prop: PropertyId, area_id: AreaId, v: bool) -> Self {
        Self::int32(prop, area_id, i32::from(v))
    }

    /// Builder: replace the int32 payload.
    pub fn with_int32s(mut self, values: Vec<i32>) -> Self {
        self.value.int32_values = values;
        self
    }

    /// Builder: replace the string payload.
    pub fn with_string(mut self, s: impl Into<String>) -> Self {
        self.value.string_value = s.into();
        self
    }

    /// Builder: replace the bytes payload.
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.value.bytes = bytes;
        self
    }

    /// Builder: set the timestamp.
    pub fn at(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// First int32, if any.
    pub fn first_int32(&self) -> Option<i32> {
        self.value.int32_values.first().copied()
    }

    /// First float, if any.
    pub fn first_float(&self) -> Option<f32> {
        self.value.float_values.first().copied()
    }
}

bitflags! {
    /// Which event sources a subscription wants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SubscribeFlags: i32 {
        /// Changes originating in the vehicle.
        const EVENTS_FROM_CAR = 0x1;
        /// Echo of writes made by this side.
        const EVENTS_FROM_ANDROID = 0x2;
    }
}

impl Default for SubscribeFlags {
    fn default() -> Self {
        Self::EVENTS_FROM_CAR
    }
}

/// One entry of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Property to subscribe to.
    pub prop: PropertyId,
    /// Sample rate in Hz (0 for on-change).
    pub sample_rate: f32,
    /// Event source selection.
    pub flags: SubscribeFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_predicates() {
        assert!(VehicleAccess::Read.is_readable());
        assert!(!VehicleAccess::Read.is_writable());
        assert!(VehicleAccess::ReadWrite.is_readable());
        assert!(VehicleAccess::ReadWrite.is_writable());
        assert!(!VehicleAccess::None.is_readable());
    }

    #[test]
    fn test_descriptor_value_type_from_id() {
        let desc = PropertyDescriptor::new(
            ids::PERF_VEHICLE_SPEED,
            VehicleAccess::Read,
            ChangeMode::Continuous,
        );
        assert_eq!(desc.value_type, ValueType::Float);

        let untyped = PropertyDescriptor::new(0x0100, VehicleAccess::Read, ChangeMode::OnChange);
        assert_eq!(untyped.value_type, ValueType::Mixed);
    }

    #[test]
    fn test_clamp_sample_rate() {
        let desc = PropertyDescriptor::new(0x0200, VehicleAccess::Read, ChangeMode::Continuous)
            .with_sample_rates(1.0, 10.0);
        assert_eq!(desc.clamp_sample_rate(50.0), 10.0);
        assert_eq!(desc.clamp_sample_rate(0.1), 1.0);
        assert_eq!(desc.clamp_sample_rate(5.0), 5.0);
        assert_eq!(desc.clamp_sample_rate(f32::NAN), 1.0);
    }

    #[test]
    fn test_clamp_inverted_range() {
        let desc = PropertyDescriptor::new(0x0200, VehicleAccess::Read, ChangeMode::Continuous)
            .with_sample_rates(5.0, 2.0);
        assert_eq!(desc.clamp_sample_rate(100.0), 5.0);
    }

    #[test]
    fn test_subscribe_flags_default() {
        assert_eq!(SubscribeFlags::default(), SubscribeFlags::EVENTS_FROM_CAR);
    }

    #[test]
    fn test_value_builders() {
        let v = PropertyValue::boolean(ids::DOOR_LOCK, 0x1, true).at(42);
        assert_eq!(v.first_int32(), Some(1));
        assert_eq!(v.area_id, 0x1);
        assert_eq!(v.timestamp_ns, 42);
        assert_eq!(v.status, PropertyStatus::Available);
    }
}
