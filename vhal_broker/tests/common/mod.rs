//! Shared fixtures for the broker integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use vhal_broker::{HalContext, HalService, SimulatedVehicle, SupportedProperties};
use vhal_common::config::TransportConfig;
use vhal_common::hal::{HalError, StatusCode};
use vhal_common::property::{
    AreaId, ChangeMode, PropertyDescriptor, PropertyId, PropertyValue, VehicleAccess,
};

/// Readable on-change property of the two-service scenario.
pub const PROP_A: PropertyId = 0x0100;
/// Readable continuous property of the two-service scenario, rate [1, 10].
pub const PROP_B: PropertyId = 0x0200;
/// Static property.
pub const PROP_STATIC: PropertyId = 0x0300;

/// Service recording everything the router hands it.
pub struct RecordingService {
    name: String,
    claims: SupportedProperties,
    pub context: Mutex<Option<HalContext>>,
    pub owned: Mutex<Vec<PropertyId>>,
    pub batches: Mutex<Vec<Vec<PropertyValue>>>,
    pub set_errors: Mutex<Vec<(PropertyId, AreaId, StatusCode)>>,
    pub released: Mutex<bool>,
}

impl RecordingService {
    pub fn explicit(name: &str, props: &[PropertyId]) -> Arc<Self> {
        Arc::new(Self::with_claims(name, SupportedProperties::Explicit(props.to_vec())))
    }

    pub fn wildcard(name: &str) -> Arc<Self> {
        Arc::new(Self::with_claims(name, SupportedProperties::Any))
    }

    fn with_claims(name: &str, claims: SupportedProperties) -> Self {
        Self {
            name: name.to_string(),
            claims,
            context: Mutex::new(None),
            owned: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            set_errors: Mutex::new(Vec::new()),
            released: Mutex::new(false),
        }
    }

    pub fn ctx(&self) -> HalContext {
        self.context.lock().clone().expect("service not initialized")
    }

    pub fn events(&self) -> Vec<PropertyValue> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl HalService for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_properties(&self) -> SupportedProperties {
        self.claims.clone()
    }

    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>) {
        *self.owned.lock() = properties.iter().map(|d| d.prop).collect();
        *self.context.lock() = Some(context);
    }

    fn init(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn release(&self) {
        *self.released.lock() = true;
    }

    fn on_events(&self, values: &[PropertyValue]) {
        self.batches.lock().push(values.to_vec());
    }

    fn on_property_set_error(&self, prop: PropertyId, area: AreaId, status: StatusCode) {
        self.set_errors.lock().push((prop, area, status));
    }
}

/// Vehicle with `PROP_A`, `PROP_B` and `PROP_STATIC`.
pub fn scenario_vehicle() -> Arc<SimulatedVehicle> {
    Arc::new(SimulatedVehicle::new(
        vec![
            PropertyDescriptor::new(PROP_A, VehicleAccess::ReadWrite, ChangeMode::OnChange),
            PropertyDescriptor::new(PROP_B, VehicleAccess::Read, ChangeMode::Continuous)
                .with_sample_rates(1.0, 10.0),
            PropertyDescriptor::new(PROP_STATIC, VehicleAccess::Read, ChangeMode::Static),
        ],
        vec![
            PropertyValue::int32(PROP_A, 0, 1),
            PropertyValue::int32(PROP_B, 0, 2),
            PropertyValue::int32(PROP_STATIC, 0, 3),
        ],
    ))
}

/// Fast retry settings: 100 ms budget, 10 ms interval.
pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        retry_budget_ms: 100,
        retry_interval_ms: 10,
    }
}
