//! Core types and constants for the RAMSES-II protocol engine
//!
//! This module contains the fundamental building blocks used throughout the library.

use std::time::Duration;

pub mod error;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{Code, Priority, Qos, Verb};

/// Maximum payload size in bytes (96 hex characters)
pub const MAX_PAYLOAD_BYTES: usize = 48;

/// Base echo/reply timeout for a sent command
pub const QOS_TX_TIMEOUT: Duration = Duration::from_millis(50);

/// Default number of retransmissions after the initial send
pub const QOS_TX_RETRIES: u8 = 2;

/// Timeout for the expected reply once the echo has been seen
pub const QOS_RX_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum exponential backoff exponent
pub const QOS_MAX_BACKOFF: u32 = 3;

/// Hard ceiling on any single exchange, regardless of QoS parameters
pub const MAX_SEND_TIMEOUT: Duration = Duration::from_secs(30);
