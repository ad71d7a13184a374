//! Property-ID namespace.
//!
//! A property ID packs three fields next to a 16-bit index:
//!
//! ```text
//!  31      28 27      24 23             16 15                0
//! ┌──────────┬──────────┬─────────────────┬──────────────────┐
//! │  group   │ area type│   value type    │      index       │
//! └──────────┴──────────┴─────────────────┴──────────────────┘
//! ```

use static_assertions::const_assert_eq;

use super::types::{PropertyId, ValueType};

/// Mask selecting the group nibble.
pub const GROUP_MASK: i32 = 0xF000_0000_u32 as i32;
/// Mask selecting the area type nibble.
pub const AREA_TYPE_MASK: i32 = 0x0F00_0000;
/// Mask selecting the value type byte.
pub const VALUE_TYPE_MASK: i32 = 0x00FF_0000;
/// Mask selecting the per-group index.
pub const INDEX_MASK: i32 = 0x0000_FFFF;

const_assert_eq!(GROUP_MASK & AREA_TYPE_MASK, 0);
const_assert_eq!(AREA_TYPE_MASK & VALUE_TYPE_MASK, 0);
const_assert_eq!(VALUE_TYPE_MASK & INDEX_MASK, 0);
const_assert_eq!(GROUP_MASK | AREA_TYPE_MASK | VALUE_TYPE_MASK | INDEX_MASK, -1);

/// Who defined the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyGroup {
    /// Platform-defined.
    System,
    /// OEM-defined.
    Vendor,
    /// Anything else (not produced by conforming HALs).
    Unknown(i32),
}

/// Hardware zone addressing of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaType {
    /// Single global value.
    Global,
    /// Per window.
    Window,
    /// Per mirror.
    Mirror,
    /// Per seat.
    Seat,
    /// Per door.
    Door,
    /// Per wheel.
    Wheel,
    /// Unrecognised nibble.
    Unknown(i32),
}

/// Group nibble of `prop`.
pub fn property_group(prop: PropertyId) -> PropertyGroup {
    match prop & GROUP_MASK {
        0x1000_0000 => PropertyGroup::System,
        0x2000_0000 => PropertyGroup::Vendor,
        other => PropertyGroup::Unknown(other),
    }
}

/// Area type nibble of `prop`.
pub fn property_area_type(prop: PropertyId) -> AreaType {
    match prop & AREA_TYPE_MASK {
        0x0100_0000 => AreaType::Global,
        0x0300_0000 => AreaType::Window,
        0x0400_0000 => AreaType::Mirror,
        0x0500_0000 => AreaType::Seat,
        0x0600_0000 => AreaType::Door,
        0x0700_0000 => AreaType::Wheel,
        other => AreaType::Unknown(other),
    }
}

/// Value type byte of `prop`, `None` when unrecognised.
pub fn property_value_type(prop: PropertyId) -> Option<ValueType> {
    ValueType::from_raw(prop & VALUE_TYPE_MASK)
}

/// True when `prop` is in the vendor group.
pub fn is_vendor_property(prop: PropertyId) -> bool {
    property_group(prop) == PropertyGroup::Vendor
}

/// Human readable `0x…` form used in log lines.
pub fn to_hex(prop: PropertyId) -> String {
    format!("0x{:08x}", prop as u32)
}

// ─── Info ───────────────────────────────────────────────────────────

/// VIN string.
pub const INFO_VIN: PropertyId = 0x1110_0100;
/// Manufacturer string.
pub const INFO_MAKE: PropertyId = 0x1110_0101;

// ─── Powertrain ─────────────────────────────────────────────────────

/// Vehicle speed, m/s.
pub const PERF_VEHICLE_SPEED: PropertyId = 0x1160_0207;
/// Fuel level, ml.
pub const FUEL_LEVEL: PropertyId = 0x1160_0307;
/// Selected gear (`VehicleGear` bit values).
pub const GEAR_SELECTION: PropertyId = 0x1140_0400;
/// Turn signal state.
pub const TURN_SIGNAL_STATE: PropertyId = 0x1140_0408;
/// Ignition state.
pub const IGNITION_STATE: PropertyId = 0x1140_0409;

// ─── HVAC ───────────────────────────────────────────────────────────

/// Fan speed, per seat.
pub const HVAC_FAN_SPEED: PropertyId = 0x1540_0500;
/// Fan direction bit flags, per seat.
pub const HVAC_FAN_DIRECTION: PropertyId = 0x1540_0501;
/// Target temperature, per seat.
pub const HVAC_TEMPERATURE_SET: PropertyId = 0x1560_0503;
/// HVAC power, per seat.
pub const HVAC_POWER_ON: PropertyId = 0x1520_0510;

// ─── Doors ──────────────────────────────────────────────────────────

/// Door lock, per door.
pub const DOOR_LOCK: PropertyId = 0x1620_0B02;

// ─── Power ──────────────────────────────────────────────────────────

/// Power state request from the vehicle.
pub const AP_POWER_STATE_REQ: PropertyId = 0x1141_0A00;
/// Power state report to the vehicle.
pub const AP_POWER_STATE_REPORT: PropertyId = 0x1141_0A01;
/// Boot-up reason.
pub const AP_POWER_BOOTUP_REASON: PropertyId = 0x1140_0A02;
/// Display brightness.
pub const DISPLAY_BRIGHTNESS: PropertyId = 0x1140_0A03;

// ─── Input ──────────────────────────────────────────────────────────

/// Hardware key event.
pub const HW_KEY_INPUT: PropertyId = 0x1141_0A10;

// ─── Vehicle map service ────────────────────────────────────────────

/// VMS message channel.
pub const VEHICLE_MAP_SERVICE: PropertyId = 0x11E1_0C00;

// ─── Diagnostics ────────────────────────────────────────────────────

/// OBD2 live sensor frame.
pub const OBD2_LIVE_FRAME: PropertyId = 0x11E0_0D00;
/// OBD2 freeze frame.
pub const OBD2_FREEZE_FRAME: PropertyId = 0x11E0_0D01;
/// Timestamps of stored freeze frames.
pub const OBD2_FREEZE_FRAME_INFO: PropertyId = 0x11E0_0D02;
/// Clear stored freeze frames.
pub const OBD2_FREEZE_FRAME_CLEAR: PropertyId = 0x11E0_0D03;

// ─── User management ────────────────────────────────────────────────

/// Initial user selection on boot/resume.
pub const INITIAL_USER_INFO: PropertyId = 0x11E0_0F07;
/// User switch handshake.
pub const SWITCH_USER: PropertyId = 0x11E0_0F08;
/// User created.
pub const CREATE_USER: PropertyId = 0x11E0_0F09;
/// User removed.
pub const REMOVE_USER: PropertyId = 0x11E0_0F0A;
/// User identification association.
pub const USER_IDENTIFICATION_ASSOCIATION: PropertyId = 0x11E0_0F0B;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_known_ids() {
        assert_eq!(property_group(GEAR_SELECTION), PropertyGroup::System);
        assert_eq!(property_area_type(GEAR_SELECTION), AreaType::Global);
        assert_eq!(property_value_type(GEAR_SELECTION), Some(ValueType::Int32));

        assert_eq!(property_area_type(HVAC_TEMPERATURE_SET), AreaType::Seat);
        assert_eq!(property_value_type(HVAC_TEMPERATURE_SET), Some(ValueType::Float));

        assert_eq!(property_area_type(DOOR_LOCK), AreaType::Door);
        assert_eq!(property_value_type(DOOR_LOCK), Some(ValueType::Boolean));

        assert_eq!(property_value_type(HW_KEY_INPUT), Some(ValueType::Int32Vec));
        assert_eq!(property_value_type(INITIAL_USER_INFO), Some(ValueType::Mixed));
        assert_eq!(property_value_type(INFO_VIN), Some(ValueType::String));
    }

    #[test]
    fn vendor_group_detected() {
        let vendor = 0x2140_0001;
        assert!(is_vendor_property(vendor));
        assert!(!is_vendor_property(PERF_VEHICLE_SPEED));
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(to_hex(AP_POWER_STATE_REQ), "0x11410a00");
        assert_eq!(to_hex(0x0100), "0x00000100");
    }
}
