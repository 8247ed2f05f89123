//! Upper-level host driver core for USB-attached precision energy/measurement
//! instruments (spec.md §1). Translates between application-level pub/sub
//! commands and the instrument's binary wire protocol, and reassembles
//! high-rate sampled streams for delivery to subscribers.
//!
//! The USB backend, pub/sub broker, and logging infrastructure are external
//! collaborators (out of scope); this crate only consumes and produces
//! messages through the queues in [`messages`] and the driver in [`driver`].

pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod frontpanel;
pub mod memory_op;
pub mod messages;
pub mod pubsub;
pub mod state_machine;
pub mod stream;
pub mod suppressor;

pub use config::{DeviceGeneration, DriverConfig};
pub use driver::{Driver, DriverHandle};
pub use error::{DriverError, Result};
