use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// Packet verb: information, request, reply, or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Unsolicited information broadcast
    I,
    /// Request
    Rq,
    /// Reply (to an RQ)
    Rp,
    /// Write
    W,
}

impl Verb {
    /// Parses the two-character wire form (" I", "RQ", "RP", " W")
    pub fn from_wire(s: &str) -> Result<Self> {
        match s {
            " I" | "I" => Ok(Verb::I),
            "RQ" => Ok(Verb::Rq),
            "RP" => Ok(Verb::Rp),
            " W" | "W" => Ok(Verb::W),
            _ => Err(Error::structure(format!("unknown verb: {s:?}"))),
        }
    }

    /// Returns the two-character wire form
    pub fn as_wire(&self) -> &'static str {
        match self {
            Verb::I => " I",
            Verb::Rq => "RQ",
            Verb::Rp => "RP",
            Verb::W => " W",
        }
    }

    /// Returns the trimmed display form ("I", "RQ", "RP", "W")
    pub fn as_str(&self) -> &'static str {
        self.as_wire().trim_start()
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 4-hex-digit command code (e.g. 2309 is zone setpoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code(pub u16);

impl Code {
    pub const RF_UNKNOWN: Code = Code(0x0001);
    pub const OUTDOOR_SENSOR: Code = Code(0x0002);
    pub const ZONE_NAME: Code = Code(0x0004);
    pub const SYSTEM_ZONES: Code = Code(0x0005);
    pub const SCHEDULE_VERSION: Code = Code(0x0006);
    pub const RELAY_DEMAND: Code = Code(0x0008);
    pub const RELAY_FAILSAFE: Code = Code(0x0009);
    pub const ZONE_PARAMS: Code = Code(0x000A);
    pub const ZONE_DEVICES: Code = Code(0x000C);
    pub const RF_CHECK: Code = Code(0x0016);
    pub const LANGUAGE: Code = Code(0x0100);
    pub const ZONE_SCHEDULE: Code = Code(0x0404);
    pub const SYSTEM_FAULT: Code = Code(0x0418);
    pub const MIXVALVE_PARAMS: Code = Code(0x1030);
    pub const DEVICE_BATTERY: Code = Code(0x1060);
    pub const DHW_PARAMS: Code = Code(0x10A0);
    pub const DEVICE_INFO: Code = Code(0x10E0);
    pub const TPI_PARAMS: Code = Code(0x1100);
    pub const DHW_TEMP: Code = Code(0x1260);
    pub const OUTDOOR_TEMP: Code = Code(0x1290);
    pub const SYSTEM_SYNC: Code = Code(0x1F09);
    pub const DHW_MODE: Code = Code(0x1F41);
    pub const RF_BIND: Code = Code(0x1FC9);
    pub const OPENTHERM_SYNC: Code = Code(0x1FD4);
    pub const SETPOINT: Code = Code(0x2309);
    pub const ZONE_MODE: Code = Code(0x2349);
    pub const SYSTEM_MODE: Code = Code(0x2E04);
    pub const TEMPERATURE: Code = Code(0x30C9);
    pub const DATETIME: Code = Code(0x313F);
    pub const HEAT_DEMAND: Code = Code(0x3150);
    pub const OPENTHERM_MSG: Code = Code(0x3220);
    pub const ACTUATOR_SYNC: Code = Code(0x3B00);
    pub const ACTUATOR_STATE: Code = Code(0x3EF0);
    pub const ACTUATOR_CYCLE: Code = Code(0x3EF1);
    pub const WINDOW_STATE: Code = Code(0x12B0);
    pub const PUZZLE: Code = Code(0x7FFF);

    /// Parses a 4-hex-digit code
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 4 {
            return Err(Error::structure(format!("bad code: {s:?}")));
        }
        u16::from_str_radix(s, 16)
            .map(Code)
            .map_err(|_| Error::structure(format!("bad code: {s:?}")))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Dispatch priority for queued commands (lower sorts first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Highest = 0,
    High = 2,
    Default = 4,
    Low = 6,
    Lowest = 8,
}

/// Per-command QoS parameters governing retry/backoff in the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    /// Queue priority
    pub priority: Priority,
    /// Number of retransmissions after the initial send
    pub retry_limit: u8,
    /// Base echo/reply timeout (doubled per backoff step)
    pub tx_timeout: Duration,
    /// Suppresses exponential backoff when set
    pub disable_backoff: bool,
}

impl Default for Qos {
    fn default() -> Self {
        Qos {
            priority: Priority::Default,
            retry_limit: super::QOS_TX_RETRIES,
            tx_timeout: super::QOS_TX_TIMEOUT,
            disable_backoff: false,
        }
    }
}
