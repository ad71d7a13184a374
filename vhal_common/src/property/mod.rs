//! Vehicle property data model and ID namespace.

pub mod ids;
pub mod types;

pub use types::{
    AreaConfig, AreaId, ChangeMode, GLOBAL_AREA, PropertyDescriptor, PropertyId, PropertyStatus,
    PropertyValue, RawValue, SubscribeFlags, SubscribeOptions, ValueType, VehicleAccess,
};
