//! # Vehicle HAL broker
//!
//! Mediates between a vehicle's property interface and the domain services
//! that consume it.
//!
//! # Module Structure
//!
//! - [`transport`] - channel client with bounded retry of transient failures
//! - [`dispatch`] - single-threaded delivery of channel callbacks
//! - [`registry`] - descriptor store, access and value policy
//! - [`router`] - ownership, subscriptions, event fan-out ([`VehicleHal`])
//! - [`service`] - the [`HalService`] contract and [`HalContext`] handle
//! - [`services`] - power, input, user, diagnostics, VMS and passthrough
//! - [`sim`] - in-process simulated vehicle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           vhal_broker                            │
//! │  ┌─────────┐ ┌─────────┐ ┌────────┐ ┌────────────┐ ┌──────────┐  │
//! │  │  power  │ │  input  │ │  user  │ │ diagnostic │ │ property │  │
//! │  └────┬────┘ └────┬────┘ └───┬────┘ └─────┬──────┘ └────┬─────┘  │
//! │       └───────────┴──────────┼────────────┴─────────────┘        │
//! │                              ▼  HalService / HalContext          │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────────────────┐  │
//! │  │   Registry   │◄───│  VehicleHal  │◄───│  DispatchQueue     │  │
//! │  └──────────────┘    └──────┬───────┘    │  (vhal-dispatch)   │  │
//! │                             ▼            └─────────▲──────────┘  │
//! │                     ┌────────────────┐             │             │
//! │                     │TransportClient │             │ callbacks   │
//! │                     └───────┬────────┘             │             │
//! └─────────────────────────────┼──────────────────────┼─────────────┘
//!                               ▼                      │
//!                     VehicleChannel (hardware or SimulatedVehicle)
//! ```

#![deny(missing_docs)]

pub mod dispatch;
pub mod registry;
pub mod router;
pub mod service;
pub mod services;
pub mod sim;
pub mod transport;

// Re-export key types for convenience
pub use crate::registry::PropertyRegistry;
pub use crate::router::{SubscriptionEntry, VehicleHal};
pub use crate::service::{HalContext, HalService, ServiceId, SupportedProperties};
pub use crate::services::ServiceSet;
pub use crate::sim::SimulatedVehicle;
pub use crate::transport::{RetryPolicy, TransportClient};
