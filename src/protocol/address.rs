//! Device address codec
//!
//! RAMSES-II device ids have a textual form `TT:NNNNNN` (class + decimal
//! serial) and a 24-bit wire form: the top 6 bits are the class, the low
//! 18 bits the serial. Two sentinels exist: the placeholder `--:------`
//! (no device) and the null/broadcast id `63:262142` (wire `FFFFFE`).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::core::{Error, Result};

/// The placeholder id used for empty address slots
pub const NON_ID: &str = "--:------";

/// The null/broadcast device id (wire form `FFFFFE`)
pub const NUL_ID: &str = "63:262142";

/// The well-known gateway interface id
pub const HGI_ID: &str = "18:000730";

/// Device classes this engine will accept in an address
const KNOWN_CLASSES: &[&str] = &[
    "00", "01", "02", "03", "04", "07", "08", "10", "12", "13", "17", "18", "20", "21", "22",
    "23", "29", "30", "31", "32", "34", "37", "63",
];

/// A validated device address; equality and hashing are by id
#[derive(Debug, Clone, Eq)]
pub struct DeviceAddress {
    id: String,
    class: String,
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for DeviceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl DeviceAddress {
    /// The placeholder (no-device) address
    pub fn none() -> Self {
        DeviceAddress {
            id: NON_ID.to_string(),
            class: "--".to_string(),
        }
    }

    /// The null/broadcast address
    pub fn null() -> Self {
        DeviceAddress {
            id: NUL_ID.to_string(),
            class: "63".to_string(),
        }
    }

    /// The local gateway interface address
    pub fn hgi() -> Self {
        DeviceAddress {
            id: HGI_ID.to_string(),
            class: "18".to_string(),
        }
    }

    /// Builds an address from its textual id, validating class and pattern
    pub fn from_id(id: &str) -> Result<Self> {
        if id == NON_ID {
            return Ok(DeviceAddress::none());
        }
        if !is_valid_id(id) {
            return Err(Error::addr_set(format!("invalid device id: {id:?}")));
        }
        Ok(DeviceAddress {
            id: id.to_string(),
            class: id[..2].to_string(),
        })
    }

    /// Builds an address from its 6-hex wire form
    pub fn from_hex(hex: &str) -> Result<Self> {
        DeviceAddress::from_id(&hex_to_id(hex)?)
    }

    /// The textual id, e.g. `01:145038`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The two-character device class, e.g. `01`
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The 6-hex wire form
    pub fn to_hex(&self) -> Result<String> {
        id_to_hex(&self.id)
    }

    /// True for the placeholder address
    pub fn is_none(&self) -> bool {
        self.id == NON_ID
    }

    /// True for the null/broadcast address
    pub fn is_null(&self) -> bool {
        self.id == NUL_ID
    }

    /// True for an actual device (neither placeholder nor null)
    pub fn is_real(&self) -> bool {
        !self.is_none() && !self.is_null()
    }
}

/// Converts a 6-hex wire address to its textual id
pub fn hex_to_id(hex: &str) -> Result<String> {
    if hex.len() != 6 {
        return Err(Error::addr_set(format!("invalid hex address: {hex:?}")));
    }
    let value = u32::from_str_radix(hex, 16)
        .map_err(|_| Error::addr_set(format!("invalid hex address: {hex:?}")))?;
    if value == 0xFFFFFE {
        return Ok(NUL_ID.to_string()); // aka not-a-device
    }
    Ok(format!(
        "{:02}:{:06}",
        (value & 0xFC0000) >> 18,
        value & 0x03FFFF
    ))
}

/// Converts a textual device id to its 6-hex wire form
pub fn id_to_hex(id: &str) -> Result<String> {
    if !is_valid_id(id) {
        return Err(Error::addr_set(format!("invalid device id: {id:?}")));
    }
    let class: u32 = id[..2]
        .parse()
        .map_err(|_| Error::addr_set(format!("invalid device id: {id:?}")))?;
    let serial: u32 = id[3..]
        .parse()
        .map_err(|_| Error::addr_set(format!("invalid device id: {id:?}")))?;
    Ok(format!("{:06X}", (class << 18) + serial))
}

/// Checks a textual id for pattern validity and a known device class
pub fn is_valid_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != 9 || bytes[2] != b':' {
        return false;
    }
    if !id[..2].bytes().all(|b| b.is_ascii_digit())
        || !id[3..].bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }
    if id[3..].parse::<u32>().map_or(true, |n| n > 0x03FFFF) {
        return false;
    }
    KNOWN_CLASSES.contains(&&id[..2])
}

/// Bounded least-recently-used cache of decoded addresses
///
/// Addresses recur in every packet; the framer keeps one of these so a hot
/// id is validated and allocated once.
#[derive(Debug)]
pub struct AddressCache {
    map: HashMap<String, DeviceAddress>,
    order: VecDeque<String>,
    capacity: usize,
}

impl AddressCache {
    /// Creates a cache bounded to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        AddressCache {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Resolves an id to an address, inserting on miss and evicting the
    /// least-recently-used entry at capacity
    pub fn resolve(&mut self, id: &str) -> Result<DeviceAddress> {
        if let Some(addr) = self.map.get(id) {
            let addr = addr.clone();
            if let Some(pos) = self.order.iter().position(|k| k == id) {
                self.order.remove(pos);
            }
            self.order.push_back(id.to_string());
            return Ok(addr);
        }
        let addr = DeviceAddress::from_id(id)?;
        if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(id.to_string(), addr.clone());
        self.order.push_back(id.to_string());
        Ok(addr)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        AddressCache::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_id() {
        assert_eq!(hex_to_id("06368E").unwrap(), "01:145038");
        assert_eq!(hex_to_id("FFFFFE").unwrap(), NUL_ID);
        assert!(hex_to_id("06368").is_err());
        assert!(hex_to_id("06368G").is_err());
    }

    #[test]
    fn test_id_to_hex() {
        assert_eq!(id_to_hex("01:145038").unwrap(), "06368E");
        assert_eq!(id_to_hex(NUL_ID).unwrap(), "FFFFFE");
        assert_eq!(id_to_hex(HGI_ID).unwrap(), "4802DA");
        assert!(id_to_hex("01:999999").is_err());
        assert!(id_to_hex("99:000001").is_err());
    }

    #[test]
    fn test_round_trip() {
        for hex in ["06368E", "4802DA", "FFFFFE", "8855B7"] {
            let id = hex_to_id(hex).unwrap();
            assert_eq!(hex_to_id(&id_to_hex(&id).unwrap()).unwrap(), id);
        }
    }

    #[test]
    fn test_sentinels() {
        let non = DeviceAddress::none();
        assert!(non.is_none() && !non.is_real());
        let nul = DeviceAddress::null();
        assert!(nul.is_null() && !nul.is_real());
        assert_eq!(nul.to_hex().unwrap(), "FFFFFE");
        let hgi = DeviceAddress::hgi();
        assert!(hgi.is_real());
        assert_eq!(hgi.class(), "18");
    }

    #[test]
    fn test_invalid_ids() {
        assert!(DeviceAddress::from_id("01-145038").is_err());
        assert!(DeviceAddress::from_id("1:145038").is_err());
        assert!(DeviceAddress::from_id("99:000001").is_err());
        assert!(DeviceAddress::from_id("01:14503").is_err());
    }

    #[test]
    fn test_cache_eviction() {
        let mut cache = AddressCache::new(2);
        cache.resolve("01:145038").unwrap();
        cache.resolve("13:237335").unwrap();
        cache.resolve("01:145038").unwrap(); // refresh
        cache.resolve("04:189076").unwrap(); // evicts 13:237335
        assert_eq!(cache.len(), 2);
        assert!(cache.map.contains_key("01:145038"));
        assert!(!cache.map.contains_key("13:237335"));
    }
}
