//! Hardware boundary of the broker.
//!
//! - [`channel`] - raw vehicle property interface and its status codes
//! - [`error`] - error taxonomy shared by every broker layer

pub mod channel;
pub mod error;

pub use channel::{ChannelCallback, ChannelError, ChannelResult, StatusCode, VehicleChannel};
pub use error::HalError;
