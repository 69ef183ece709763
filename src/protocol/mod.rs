//! RAMSES-II protocol implementation
//!
//! This module covers the wire side of the engine: device addresses, the
//! code schema, frame parsing and header derivation, outbound command
//! construction, the serial line codec, and the QoS transmit layer.

pub mod address;
pub mod codec;
pub mod command;
pub mod frame;
pub mod port;
pub mod ramses;
pub mod transport;

pub use self::address::{AddressCache, DeviceAddress};
pub use self::codec::LineCodec;
pub use self::command::{Command, ScheduleZone, SystemMode, ZoneMode};
pub use self::frame::{Packet, PacketFramer};
pub use self::port::{PortChannels, PortConfig};
pub use self::transport::{QosTransport, TransportConfig};
