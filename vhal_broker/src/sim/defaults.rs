//! Property table of the simulated vehicle.

use vhal_common::property::ids;
use vhal_common::property::{
    AreaConfig, AreaId, ChangeMode, GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyValue,
    VehicleAccess,
};

use crate::services::diagnostic::{STANDARD_FLOAT_SENSORS, STANDARD_INT_SENSORS};

/// Seat area covering both front seats.
pub const HVAC_AREA: AreaId = 0x0001 | 0x0004;
/// Driver door.
pub const DRIVER_DOOR: AreaId = 0x0001;
/// Vendor counter bumped on every simulation tick.
pub const VENDOR_TICK_COUNTER: PropertyId = 0x2140_0001;
/// Timestamp of the freeze frame stored at startup.
pub const STORED_FREEZE_FRAME_TS: i64 = 1_000_000_000;
/// Largest raw `DISPLAY_BRIGHTNESS` value.
pub const MAX_BRIGHTNESS: i32 = 255;

/// Parking gear.
pub const GEAR_PARK: i32 = 0x0004;
/// Ignition on.
pub const IGNITION_ON: i32 = 4;

fn read(prop: PropertyId, mode: ChangeMode) -> PropertyDescriptor {
    PropertyDescriptor::new(prop, VehicleAccess::Read, mode)
}

fn write(prop: PropertyId) -> PropertyDescriptor {
    PropertyDescriptor::new(prop, VehicleAccess::Write, ChangeMode::OnChange)
}

fn read_write(prop: PropertyId) -> PropertyDescriptor {
    PropertyDescriptor::new(prop, VehicleAccess::ReadWrite, ChangeMode::OnChange)
}

/// Every property the simulated vehicle exposes.
pub fn descriptors() -> Vec<PropertyDescriptor> {
    vec![
        read(ids::INFO_VIN, ChangeMode::Static),
        read(ids::INFO_MAKE, ChangeMode::Static),
        read(ids::PERF_VEHICLE_SPEED, ChangeMode::Continuous).with_sample_rates(1.0, 10.0),
        read(ids::FUEL_LEVEL, ChangeMode::Continuous)
            .with_sample_rates(0.1, 1.0)
            .with_area(AreaConfig::with_float_range(GLOBAL_AREA, 0.0, 50_000.0)),
        read(ids::GEAR_SELECTION, ChangeMode::OnChange),
        read(ids::TURN_SIGNAL_STATE, ChangeMode::OnChange),
        read(ids::IGNITION_STATE, ChangeMode::OnChange),
        read_write(ids::HVAC_FAN_SPEED).with_area(AreaConfig::with_int32_range(HVAC_AREA, 1, 6)),
        read_write(ids::HVAC_FAN_DIRECTION).with_area(AreaConfig::new(HVAC_AREA)),
        read_write(ids::HVAC_TEMPERATURE_SET)
            .with_area(AreaConfig::with_float_range(HVAC_AREA, 16.0, 28.0)),
        read_write(ids::HVAC_POWER_ON).with_area(AreaConfig::new(HVAC_AREA)),
        read_write(ids::DOOR_LOCK).with_area(AreaConfig::new(DRIVER_DOOR)),
        read(ids::AP_POWER_STATE_REQ, ChangeMode::OnChange),
        write(ids::AP_POWER_STATE_REPORT),
        read(ids::AP_POWER_BOOTUP_REASON, ChangeMode::Static),
        read_write(ids::DISPLAY_BRIGHTNESS)
            .with_area(AreaConfig::with_int32_range(GLOBAL_AREA, 0, MAX_BRIGHTNESS)),
        read(ids::HW_KEY_INPUT, ChangeMode::OnChange),
        read_write(ids::VEHICLE_MAP_SERVICE),
        read(ids::OBD2_LIVE_FRAME, ChangeMode::OnChange).with_config_array(vec![0, 0]),
        read(ids::OBD2_FREEZE_FRAME, ChangeMode::OnChange).with_config_array(vec![0, 0]),
        read(ids::OBD2_FREEZE_FRAME_INFO, ChangeMode::OnChange),
        write(ids::OBD2_FREEZE_FRAME_CLEAR),
        read_write(ids::INITIAL_USER_INFO),
        read_write(ids::SWITCH_USER),
        read_write(ids::CREATE_USER),
        write(ids::REMOVE_USER),
        read_write(ids::USER_IDENTIFICATION_ASSOCIATION),
        read_write(VENDOR_TICK_COUNTER),
    ]
}

/// Values present before anything is written.
pub fn initial_values() -> Vec<PropertyValue> {
    vec![
        PropertyValue::new(ids::INFO_VIN).with_string("1VHALSIM000000001"),
        PropertyValue::new(ids::INFO_MAKE).with_string("Simulated Motors"),
        PropertyValue::float(ids::PERF_VEHICLE_SPEED, GLOBAL_AREA, 0.0),
        PropertyValue::float(ids::FUEL_LEVEL, GLOBAL_AREA, 42_000.0),
        PropertyValue::int32(ids::GEAR_SELECTION, GLOBAL_AREA, GEAR_PARK),
        PropertyValue::int32(ids::TURN_SIGNAL_STATE, GLOBAL_AREA, 0),
        PropertyValue::int32(ids::IGNITION_STATE, GLOBAL_AREA, IGNITION_ON),
        PropertyValue::int32(ids::HVAC_FAN_SPEED, HVAC_AREA, 3),
        PropertyValue::int32(ids::HVAC_FAN_DIRECTION, HVAC_AREA, 0x1),
        PropertyValue::float(ids::HVAC_TEMPERATURE_SET, HVAC_AREA, 21.0),
        PropertyValue::boolean(ids::HVAC_POWER_ON, HVAC_AREA, true),
        PropertyValue::boolean(ids::DOOR_LOCK, DRIVER_DOOR, true),
        PropertyValue::new(ids::AP_POWER_STATE_REQ).with_int32s(vec![0, 0]),
        PropertyValue::int32(ids::AP_POWER_BOOTUP_REASON, GLOBAL_AREA, 0),
        PropertyValue::int32(ids::DISPLAY_BRIGHTNESS, GLOBAL_AREA, MAX_BRIGHTNESS / 2),
        live_frame(0, 850.0),
        PropertyValue::int32(VENDOR_TICK_COUNTER, GLOBAL_AREA, 0),
    ]
}

/// Diagnostic frame with int sensor 0 and float sensor 4 (engine RPM) set.
pub fn diagnostic_frame(prop: PropertyId, fuel_status: i32, rpm: f32) -> PropertyValue {
    let mut ints = vec![0; STANDARD_INT_SENSORS];
    ints[0] = fuel_status;
    let mut floats = vec![0.0; STANDARD_FLOAT_SENSORS];
    floats[4] = rpm;

    let mut bitmask = vec![0u8; (STANDARD_INT_SENSORS + STANDARD_FLOAT_SENSORS).div_ceil(8)];
    for bit in [0, STANDARD_INT_SENSORS + 4] {
        bitmask[bit / 8] |= 1 << (bit % 8);
    }

    let mut value = PropertyValue::new(prop).with_int32s(ints).with_bytes(bitmask);
    value.value.float_values = floats;
    value
}

/// Live frame with the given sensor values.
pub fn live_frame(fuel_status: i32, rpm: f32) -> PropertyValue {
    diagnostic_frame(ids::OBD2_LIVE_FRAME, fuel_status, rpm)
}

/// The freeze frame stored at startup.
pub fn stored_freeze_frame() -> PropertyValue {
    let mut value = diagnostic_frame(ids::OBD2_FREEZE_FRAME, 4, 3200.0)
        .with_string("P0301")
        .at(STORED_FREEZE_FRAME_TS);
    value.value.int64_values = vec![STORED_FREEZE_FRAME_TS];
    value
}
