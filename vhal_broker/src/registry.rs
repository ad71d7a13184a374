//! Property registry.
//!
//! Holds the descriptor set fetched at startup (written once, read lock-free)
//! and the static policy table of known system properties: permission names
//! and which int32 values are valid.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use tracing::{debug, info, warn};
use vhal_common::property::ids::{self, to_hex};
use vhal_common::property::{ChangeMode, PropertyDescriptor, PropertyId, PropertyValue};

// ─── Permissions ────────────────────────────────────────────────────

const PERMISSION_CAR_INFO: &str = "android.car.permission.CAR_INFO";
const PERMISSION_SPEED: &str = "android.car.permission.CAR_SPEED";
const PERMISSION_ENERGY: &str = "android.car.permission.CAR_ENERGY";
const PERMISSION_POWERTRAIN: &str = "android.car.permission.CAR_POWERTRAIN";
const PERMISSION_EXTERIOR_LIGHTS: &str = "android.car.permission.CAR_EXTERIOR_LIGHTS";
const PERMISSION_CONTROL_CLIMATE: &str = "android.car.permission.CONTROL_CAR_CLIMATE";
const PERMISSION_CONTROL_DOORS: &str = "android.car.permission.CONTROL_CAR_DOORS";
const PERMISSION_VENDOR_EXTENSION: &str = "android.car.permission.CAR_VENDOR_EXTENSION";

/// Rule every int32 payload element of a property must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueValidity {
    /// No restriction.
    Any,
    /// Value must be one of the set.
    Enumerated(BTreeSet<i32>),
    /// Value may only use bits inside the mask.
    BitFlags(i32),
}

impl ValueValidity {
    fn enumerated(values: &[i32]) -> Self {
        Self::Enumerated(values.iter().copied().collect())
    }

    /// True if `value` satisfies the rule.
    pub fn accepts(&self, value: i32) -> bool {
        match self {
            Self::Any => true,
            Self::Enumerated(valid) => valid.contains(&value),
            Self::BitFlags(mask) => value & !mask == 0,
        }
    }
}

/// Permissions and validity rule of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPolicy {
    /// Permission needed to read, if readable by clients.
    pub read_permission: Option<&'static str>,
    /// Permission needed to write, if writable by clients.
    pub write_permission: Option<&'static str>,
    /// Payload rule.
    pub validity: ValueValidity,
}

impl PropertyPolicy {
    fn read_only(permission: &'static str, validity: ValueValidity) -> Self {
        Self {
            read_permission: Some(permission),
            write_permission: None,
            validity,
        }
    }

    fn read_write(permission: &'static str, validity: ValueValidity) -> Self {
        Self {
            read_permission: Some(permission),
            write_permission: Some(permission),
            validity,
        }
    }
}

// VehicleGear bit values.
const GEARS: &[i32] = &[
    0x0000, 0x0001, 0x0002, 0x0004, 0x0008, 0x0010, 0x0020, 0x0040, 0x0080, 0x0100, 0x0200,
    0x0400, 0x0800, 0x1000,
];
// VehicleTurnSignal.
const TURN_SIGNALS: &[i32] = &[0, 1, 2];
// VehicleIgnitionState.
const IGNITION_STATES: &[i32] = &[0, 1, 2, 3, 4, 5];
// FACE | FLOOR | DEFROST
const FAN_DIRECTION_MASK: i32 = 0x7;

/// Policy of `prop`, `None` for properties without one.
///
/// Vendor properties share a single vendor-extension policy.
pub fn policy_for(prop: PropertyId) -> Option<PropertyPolicy> {
    let policy = match prop {
        ids::INFO_VIN | ids::INFO_MAKE => {
            PropertyPolicy::read_only(PERMISSION_CAR_INFO, ValueValidity::Any)
        }
        ids::PERF_VEHICLE_SPEED => PropertyPolicy::read_only(PERMISSION_SPEED, ValueValidity::Any),
        ids::FUEL_LEVEL => PropertyPolicy::read_only(PERMISSION_ENERGY, ValueValidity::Any),
        ids::GEAR_SELECTION => {
            PropertyPolicy::read_only(PERMISSION_POWERTRAIN, ValueValidity::enumerated(GEARS))
        }
        ids::IGNITION_STATE => PropertyPolicy::read_only(
            PERMISSION_POWERTRAIN,
            ValueValidity::enumerated(IGNITION_STATES),
        ),
        ids::TURN_SIGNAL_STATE => PropertyPolicy::read_only(
            PERMISSION_EXTERIOR_LIGHTS,
            ValueValidity::enumerated(TURN_SIGNALS),
        ),
        ids::HVAC_FAN_SPEED | ids::HVAC_TEMPERATURE_SET | ids::HVAC_POWER_ON => {
            PropertyPolicy::read_write(PERMISSION_CONTROL_CLIMATE, ValueValidity::Any)
        }
        ids::HVAC_FAN_DIRECTION => PropertyPolicy::read_write(
            PERMISSION_CONTROL_CLIMATE,
            ValueValidity::BitFlags(FAN_DIRECTION_MASK),
        ),
        ids::DOOR_LOCK => PropertyPolicy::read_write(PERMISSION_CONTROL_DOORS, ValueValidity::Any),
        _ if ids::is_vendor_property(prop) => {
            PropertyPolicy::read_write(PERMISSION_VENDOR_EXTENSION, ValueValidity::Any)
        }
        _ => return None,
    };
    Some(policy)
}

/// Descriptor store, populated once at startup.
#[derive(Debug, Default)]
pub struct PropertyRegistry {
    descriptors: OnceLock<BTreeMap<PropertyId, PropertyDescriptor>>,
}

impl PropertyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the descriptor set. Later calls are ignored.
    pub fn populate(&self, descriptors: Vec<PropertyDescriptor>) {
        let count = descriptors.len();
        let map = descriptors.into_iter().map(|d| (d.prop, d)).collect();
        if self.descriptors.set(map).is_err() {
            warn!("Property registry already populated, ignoring {} descriptors", count);
            return;
        }
        info!("Property registry populated with {} descriptors", self.len());
    }

    /// True once `populate` ran.
    pub fn is_populated(&self) -> bool {
        self.descriptors.get().is_some()
    }

    /// Descriptor of `prop`.
    pub fn get(&self, prop: PropertyId) -> Option<&PropertyDescriptor> {
        self.descriptors.get()?.get(&prop)
    }

    /// All descriptors, ordered by ID.
    pub fn descriptors(&self) -> Vec<PropertyDescriptor> {
        self.descriptors
            .get()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.get().map_or(0, BTreeMap::len)
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Readable and not static.
    pub fn is_subscribable(descriptor: &PropertyDescriptor) -> bool {
        descriptor.access.is_readable() && descriptor.change_mode != ChangeMode::Static
    }

    /// Readable per its descriptor. Unknown properties are not.
    pub fn is_readable(&self, prop: PropertyId) -> bool {
        self.get(prop).is_some_and(|d| d.access.is_readable())
    }

    /// Writable per its descriptor. Unknown properties are not.
    pub fn is_writable(&self, prop: PropertyId) -> bool {
        self.get(prop).is_some_and(|d| d.access.is_writable())
    }

    /// Policy of a property, see [`policy_for`].
    pub fn policy(&self, prop: PropertyId) -> Option<PropertyPolicy> {
        policy_for(prop)
    }

    /// Validate a payload against the validity rule and the area limits.
    pub fn check_value(&self, value: &PropertyValue) -> bool {
        let validity = policy_for(value.prop)
            .map(|p| p.validity)
            .unwrap_or(ValueValidity::Any);
        if let Some(bad) = value
            .value
            .int32_values
            .iter()
            .find(|v| !validity.accepts(**v))
        {
            debug!(prop = %to_hex(value.prop), value = bad, "Value rejected by validity rule");
            return false;
        }

        let Some(area) = self
            .get(value.prop)
            .and_then(|d| d.area_config(value.area_id))
        else {
            return true;
        };

        let int_ok = value.value.int32_values.iter().all(|v| {
            area.min_int32.is_none_or(|min| *v >= min) && area.max_int32.is_none_or(|max| *v <= max)
        });
        let int64_ok = value.value.int64_values.iter().all(|v| {
            area.min_int64.is_none_or(|min| *v >= min) && area.max_int64.is_none_or(|max| *v <= max)
        });
        let float_ok = value.value.float_values.iter().all(|v| {
            area.min_float.is_none_or(|min| *v >= min) && area.max_float.is_none_or(|max| *v <= max)
        });
        if !(int_ok && int64_ok && float_ok) {
            debug!(
                prop = %to_hex(value.prop),
                area = value.area_id,
                "Value outside area limits"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhal_common::property::{AreaConfig, VehicleAccess};

    fn registry() -> PropertyRegistry {
        let registry = PropertyRegistry::new();
        registry.populate(vec![
            PropertyDescriptor::new(ids::INFO_VIN, VehicleAccess::Read, ChangeMode::Static),
            PropertyDescriptor::new(ids::GEAR_SELECTION, VehicleAccess::Read, ChangeMode::OnChange),
            PropertyDescriptor::new(
                ids::HVAC_FAN_SPEED,
                VehicleAccess::ReadWrite,
                ChangeMode::OnChange,
            )
            .with_area(AreaConfig::with_int32_range(1, 1, 6)),
            PropertyDescriptor::new(
                ids::HVAC_TEMPERATURE_SET,
                VehicleAccess::ReadWrite,
                ChangeMode::OnChange,
            )
            .with_area(AreaConfig::with_float_range(1, 16.0, 28.0)),
            PropertyDescriptor::new(
                ids::AP_POWER_STATE_REPORT,
                VehicleAccess::Write,
                ChangeMode::OnChange,
            ),
        ]);
        registry
    }

    #[test]
    fn test_populate_once() {
        let registry = registry();
        assert_eq!(registry.len(), 5);
        registry.populate(Vec::new());
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_subscribability() {
        let registry = registry();
        assert!(!PropertyRegistry::is_subscribable(
            registry.get(ids::INFO_VIN).unwrap()
        ));
        assert!(PropertyRegistry::is_subscribable(
            registry.get(ids::GEAR_SELECTION).unwrap()
        ));
        assert!(!PropertyRegistry::is_subscribable(
            registry.get(ids::AP_POWER_STATE_REPORT).unwrap()
        ));
    }

    #[test]
    fn test_access_lookups() {
        let registry = registry();
        assert!(registry.is_readable(ids::GEAR_SELECTION));
        assert!(!registry.is_writable(ids::GEAR_SELECTION));
        assert!(registry.is_writable(ids::AP_POWER_STATE_REPORT));
        assert!(!registry.is_readable(ids::DOOR_LOCK));
    }

    #[test]
    fn test_enumerated_validity() {
        let registry = registry();
        assert!(registry.check_value(&PropertyValue::int32(ids::GEAR_SELECTION, 0, 0x0008)));
        assert!(!registry.check_value(&PropertyValue::int32(ids::GEAR_SELECTION, 0, 0x0003)));
    }

    #[test]
    fn test_bitflag_validity() {
        let validity = ValueValidity::BitFlags(FAN_DIRECTION_MASK);
        assert!(validity.accepts(0x6));
        assert!(!validity.accepts(0x8));
    }

    #[test]
    fn test_area_limits() {
        let registry = registry();
        assert!(registry.check_value(&PropertyValue::int32(ids::HVAC_FAN_SPEED, 1, 3)));
        assert!(!registry.check_value(&PropertyValue::int32(ids::HVAC_FAN_SPEED, 1, 9)));
        // Area without limits accepts anything.
        assert!(registry.check_value(&PropertyValue::int32(ids::HVAC_FAN_SPEED, 2, 9)));
        assert!(!registry.check_value(&PropertyValue::float(ids::HVAC_TEMPERATURE_SET, 1, 40.0)));
    }

    #[test]
    fn test_policy_lookup() {
        let registry = registry();
        let policy = registry.policy(ids::HVAC_FAN_SPEED).unwrap();
        assert_eq!(policy.read_permission, Some(PERMISSION_CONTROL_CLIMATE));
        assert_eq!(policy.write_permission, Some(PERMISSION_CONTROL_CLIMATE));
        assert!(registry.policy(ids::AP_POWER_STATE_REQ).is_none());
        assert!(registry.policy(0x2140_0001).is_some());
    }
}
