//! VHAL Common Library
//!
//! Shared data model and contracts for the vehicle HAL broker workspace.
//!
//! # Module Structure
//!
//! - [`property`] - Property descriptors, values and the property-ID namespace
//! - [`hal`] - Vehicle channel trait, status codes and the broker error type
//! - [`config`] - Configuration types and the TOML loader
//! - [`consts`] - Timing defaults and names
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use vhal_common::prelude::*;
//!
//! let speed = PropertyValue::float(ids::PERF_VEHICLE_SPEED, GLOBAL_AREA, 12.5);
//! assert_eq!(speed.first_float(), Some(12.5));
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod consts;
pub mod hal;
pub mod prelude;
pub mod property;
