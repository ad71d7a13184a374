//! Generic property passthrough.
//!
//! Wildcard service picking up every descriptor no dedicated service claimed,
//! provided the registry has a policy for it (known system properties and the
//! whole vendor group). Payloads are validated in both directions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vhal_common::hal::{HalError, StatusCode};
use vhal_common::property::ids::to_hex;
use vhal_common::property::{AreaId, PropertyDescriptor, PropertyId, PropertyValue};

use crate::registry::{PropertyRegistry, policy_for};
use crate::service::{HalContext, HalService, SupportedProperties};

/// Receives passthrough events on the dispatch thread.
pub trait PropertyHalListener: Send + Sync {
    /// Validated property changes.
    fn on_property_change(&self, values: Vec<PropertyValue>);

    /// A write was rejected by the vehicle.
    fn on_property_set_error(&self, prop: PropertyId, area: AreaId, status: StatusCode);
}

/// Generic property service.
pub struct PropertyHalService {
    context: Mutex<Option<HalContext>>,
    registry: Mutex<Option<Arc<PropertyRegistry>>>,
    properties: Mutex<BTreeMap<PropertyId, PropertyDescriptor>>,
    listener: Mutex<Option<Arc<dyn PropertyHalListener>>>,
}

impl PropertyHalService {
    /// Service without listener.
    pub fn new() -> Self {
        Self {
            context: Mutex::new(None),
            registry: Mutex::new(None),
            properties: Mutex::new(BTreeMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Attach the listener.
    pub fn set_listener(&self, listener: Arc<dyn PropertyHalListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Descriptors handled by this service, ordered by ID.
    pub fn property_list(&self) -> Vec<PropertyDescriptor> {
        self.properties.lock().values().cloned().collect()
    }

    /// Permission needed to read `prop`.
    pub fn read_permission(&self, prop: PropertyId) -> Option<&'static str> {
        policy_for(prop)?.read_permission
    }

    /// Permission needed to write `prop`.
    pub fn write_permission(&self, prop: PropertyId) -> Option<&'static str> {
        policy_for(prop)?.write_permission
    }

    fn context_for(&self, prop: PropertyId) -> Result<HalContext, HalError> {
        if !self.properties.lock().contains_key(&prop) {
            return Err(HalError::Unsupported(prop));
        }
        self.context
            .lock()
            .clone()
            .ok_or_else(|| HalError::NotInitialized("property service".to_string()))
    }

    /// Read a value.
    pub fn get_property(&self, prop: PropertyId, area: AreaId) -> Result<PropertyValue, HalError> {
        self.context_for(prop)?.get_property(prop, area)
    }

    /// Validate and write a value. Invalid payloads never reach the vehicle.
    pub fn set_property(&self, value: &PropertyValue) -> Result<(), HalError> {
        let context = self.context_for(value.prop)?;
        let valid = self
            .registry
            .lock()
            .as_ref()
            .is_some_and(|registry| registry.check_value(value));
        if !valid {
            warn!(prop = %to_hex(value.prop), area = value.area_id, "Rejecting invalid value");
            return Err(HalError::InvalidArgument {
                prop: value.prop,
                area: value.area_id,
            });
        }
        context.set_property(value)
    }

    /// Start streaming `prop`.
    pub fn subscribe_property(&self, prop: PropertyId, sample_rate: f32) -> Result<(), HalError> {
        self.context_for(prop)?.subscribe_property(prop, sample_rate)
    }

    /// Stop streaming `prop`.
    pub fn unsubscribe_property(&self, prop: PropertyId) -> Result<(), HalError> {
        self.context_for(prop)?.unsubscribe_property(prop)
    }
}

impl Default for PropertyHalService {
    fn default() -> Self {
        Self::new()
    }
}

impl HalService for PropertyHalService {
    fn name(&self) -> &str {
        "property"
    }

    fn supported_properties(&self) -> SupportedProperties {
        SupportedProperties::Any
    }

    fn is_supported_property(&self, descriptor: &PropertyDescriptor) -> bool {
        policy_for(descriptor.prop).is_some()
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        *self.registry.lock() = context.registry().ok();
        *self.properties.lock() = properties.into_iter().map(|d| (d.prop, d)).collect();
        *self.context.lock() = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        debug!("Property service handles {} properties", self.properties.lock().len());
        Ok(())
    }

    fn release(&self) {
        self.properties.lock().clear();
        *self.listener.lock() = None;
    }

    fn on_events(&self, values: &[PropertyValue]) {
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };
        let registry = self.registry.lock().clone();
        let valid: Vec<PropertyValue> = values
            .iter()
            .filter(|value| match &registry {
                Some(registry) if !registry.check_value(value) => {
                    warn!(prop = %to_hex(value.prop), "Dropping malformed event");
                    false
                }
                _ => true,
            })
            .cloned()
            .collect();
        if !valid.is_empty() {
            listener.on_property_change(valid);
        }
    }

    fn on_property_set_error(&self, prop: PropertyId, area: AreaId, status: StatusCode) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_property_set_error(prop, area, status);
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "*Property HAL*")?;
        for prop in self.properties.lock().keys() {
            writeln!(out, "  {}", to_hex(*prop))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhal_common::property::{ChangeMode, VehicleAccess, ids};

    #[test]
    fn test_supported_filter() {
        let service = PropertyHalService::new();
        let gear =
            PropertyDescriptor::new(ids::GEAR_SELECTION, VehicleAccess::Read, ChangeMode::OnChange);
        let power = PropertyDescriptor::new(
            ids::AP_POWER_STATE_REQ,
            VehicleAccess::Read,
            ChangeMode::OnChange,
        );
        let vendor =
            PropertyDescriptor::new(0x2140_0010, VehicleAccess::ReadWrite, ChangeMode::OnChange);
        assert!(service.is_supported_property(&gear));
        assert!(!service.is_supported_property(&power));
        assert!(service.is_supported_property(&vendor));
    }

    #[test]
    fn test_permissions() {
        let service = PropertyHalService::new();
        assert_eq!(
            service.read_permission(ids::PERF_VEHICLE_SPEED),
            Some("android.car.permission.CAR_SPEED")
        );
        assert_eq!(service.write_permission(ids::PERF_VEHICLE_SPEED), None);
    }

    #[test]
    fn test_set_unknown_property_rejected() {
        let service = PropertyHalService::new();
        assert!(matches!(
            service.set_property(&PropertyValue::int32(ids::DOOR_LOCK, 1, 1)),
            Err(HalError::Unsupported(_))
        ));
    }
}
