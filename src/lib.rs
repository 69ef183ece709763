//! ramses-rf: an RF protocol engine for RAMSES-II HVAC networks
//!
//! Speaks the Honeywell/Resideo RAMSES-II protocol (evohome and friends)
//! through an evofw3/HGI80-style serial interface: frame parsing, typed
//! command construction, QoS transmission with echo/reply correlation,
//! device binding, and zone schedule exchange.

pub mod binding;
pub mod core;
pub mod protocol;
pub mod schedule;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Error, Result};
pub use crate::protocol::{Command, DeviceAddress, Packet, QosTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
