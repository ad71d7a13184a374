//! Domain service contract.
//!
//! Every domain service (power, input, user, ...) implements [`HalService`]
//! and is driven by the router:
//!
//! ```text
//! VehicleHal::init()
//!   ├── supported_properties() / is_supported_property()   (ownership)
//!   ├── take_properties(ctx, owned descriptors)
//!   └── init()
//! dispatch thread
//!   ├── on_events(batch)            once per batch, owned props only
//!   └── on_property_set_error(..)
//! VehicleHal::release()
//!   └── release()                   reverse registration order
//! ```
//!
//! Services talk back to the vehicle only through their [`HalContext`], which
//! carries the service identity so the router can enforce ownership.

use std::fmt;
use std::sync::{Arc, Weak};

use vhal_common::hal::{HalError, StatusCode};
use vhal_common::property::{
    AreaId, PropertyDescriptor, PropertyId, PropertyValue, SubscribeFlags,
};

use crate::registry::PropertyRegistry;
use crate::router::VehicleHal;

/// Index of a service in the router's registration order.
pub type ServiceId = usize;

/// Properties a service wants to own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupportedProperties {
    /// Exactly these IDs (those the vehicle does not expose are skipped).
    Explicit(Vec<PropertyId>),
    /// Any descriptor no explicit service claimed, filtered by
    /// [`HalService::is_supported_property`].
    Any,
}

/// A domain service attached to the router.
pub trait HalService: Send + Sync {
    /// Name used in logs and ownership errors.
    fn name(&self) -> &str;

    /// Ownership declaration.
    fn supported_properties(&self) -> SupportedProperties;

    /// Per-descriptor filter applied on top of [`supported_properties`](Self::supported_properties).
    fn is_supported_property(&self, _descriptor: &PropertyDescriptor) -> bool {
        true
    }

    /// Receive the handle and the descriptors this service owns. Called once,
    /// before [`init`](Self::init).
    fn take_properties(&self, context: HalContext, properties: Vec<PropertyDescriptor>);

    /// Start the service (typically subscribe).
    fn init(&self) -> Result<(), HalError>;

    /// Stop the service.
    fn release(&self);

    /// Events of owned properties, on the dispatch thread.
    fn on_events(&self, values: &[PropertyValue]);

    /// Asynchronous write failure of an owned property, on the dispatch thread.
    fn on_property_set_error(&self, _prop: PropertyId, _area: AreaId, _status: StatusCode) {}

    /// Append diagnostic state.
    fn dump(&self, _out: &mut dyn fmt::Write) -> fmt::Result {
        Ok(())
    }
}

/// A service's handle back into the router.
///
/// Cheap to clone. Once the router is dropped every call returns
/// `HalError::Disconnected`.
#[derive(Clone)]
pub struct HalContext {
    hal: Weak<VehicleHal>,
    id: ServiceId,
}

impl HalContext {
    pub(crate) fn new(hal: Weak<VehicleHal>, id: ServiceId) -> Self {
        Self { hal, id }
    }

    fn hal(&self) -> Result<Arc<VehicleHal>, HalError> {
        self.hal.upgrade().ok_or(HalError::Disconnected)
    }

    /// Identity of the service holding this context.
    pub fn service_id(&self) -> ServiceId {
        self.id
    }

    /// Read an owned property.
    pub fn get_property(&self, prop: PropertyId, area: AreaId) -> Result<PropertyValue, HalError> {
        self.hal()?.get_property(self.id, prop, area)
    }

    /// Read an owned property with an encoded request payload.
    pub fn get_value(&self, request: &PropertyValue) -> Result<PropertyValue, HalError> {
        self.hal()?.get_value(self.id, request)
    }

    /// Write an owned property.
    pub fn set_property(&self, value: &PropertyValue) -> Result<(), HalError> {
        self.hal()?.set_property(self.id, value)
    }

    /// Subscribe with the default flags.
    pub fn subscribe_property(&self, prop: PropertyId, sample_rate: f32) -> Result<(), HalError> {
        self.subscribe_with_flags(prop, sample_rate, SubscribeFlags::default())
    }

    /// Subscribe with explicit flags.
    pub fn subscribe_with_flags(
        &self,
        prop: PropertyId,
        sample_rate: f32,
        flags: SubscribeFlags,
    ) -> Result<(), HalError> {
        self.hal()?
            .subscribe_property(self.id, prop, sample_rate, flags)
    }

    /// Drop a subscription.
    pub fn unsubscribe_property(&self, prop: PropertyId) -> Result<(), HalError> {
        self.hal()?.unsubscribe_property(self.id, prop)
    }

    /// Descriptor of any vehicle property.
    pub fn property_config(&self, prop: PropertyId) -> Option<PropertyDescriptor> {
        self.hal.upgrade()?.property_config(prop)
    }

    /// Shared registry.
    pub fn registry(&self) -> Result<Arc<PropertyRegistry>, HalError> {
        Ok(self.hal()?.registry())
    }
}

impl fmt::Debug for HalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HalContext")
            .field("service", &self.id)
            .field("connected", &(self.hal.strong_count() > 0))
            .finish()
    }
}
