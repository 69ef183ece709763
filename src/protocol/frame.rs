//! Packet framing and header derivation
//!
//! Turns one raw text line into a validated [`Packet`], enforcing the frame
//! grammar, the declared-length invariant, and the address-set rules. Also
//! derives the correlation headers (`verb|device_id|code[|idx]`) used by the
//! QoS transport to match a sent command against its echo and reply.

use std::fmt;
use std::sync::{LazyLock, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::core::{Code, Error, Result, Verb};
use crate::protocol::address::{AddressCache, DeviceAddress, NUL_ID};
use crate::protocol::ramses::{self, IdxRule};

/// Grammar for one wire line (after annotations are stripped)
static MESSAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{3}|-{3}|\.{3}) ( I|RP|RQ| W) (\d{3}|-{3}|\.{3}) (-{2}:-{6}|\d{2}:\d{6}) (-{2}:-{6}|\d{2}:\d{6}) (-{2}:-{6}|\d{2}:\d{6}) ([0-9A-F]{4}) (\d{3}) (([0-9A-F]{2}){1,48})$",
    )
    .expect("frame grammar is valid")
});

/// Codes whose payload may legitimately start with a domain id (F8..FC)
const DOMAIN_CODES: &[Code] = &[
    Code::RF_UNKNOWN,
    Code::RELAY_DEMAND,
    Code::RELAY_FAILSAFE,
    Code::TPI_PARAMS,
    Code::RF_BIND,
    Code::HEAT_DEMAND,
    Code::ACTUATOR_SYNC,
];

/// Element length (bytes) for codes that may carry arrays of elements
fn array_element_len(code: Code) -> Option<usize> {
    match code {
        Code::SYSTEM_ZONES => Some(4),
        Code::RELAY_FAILSAFE => Some(3),
        Code::ZONE_PARAMS => Some(6),
        Code::SETPOINT => Some(3),
        Code::TEMPERATURE => Some(3),
        Code(0x2249) => Some(7),
        Code(0x22C9) => Some(6),
        Code::HEAT_DEMAND => Some(2),
        _ => None,
    }
}

/// A validated inbound frame
#[derive(Debug, Clone)]
pub struct Packet {
    /// Reception timestamp
    pub dtm: DateTime<Utc>,
    /// Signal strength field as received (`045`, `---` or `...`)
    pub rssi: String,
    pub verb: Verb,
    /// Sequence number, when the device sent one
    pub seqn: Option<u16>,
    /// The three raw address slots
    pub addrs: [DeviceAddress; 3],
    /// First real device in the address slots
    pub src: DeviceAddress,
    /// Second real device, or the placeholder when absent
    pub dst: DeviceAddress,
    pub code: Code,
    /// Uppercase hex payload
    pub payload: String,
    tx_hdr: OnceLock<Option<String>>,
    rx_hdr: OnceLock<Option<String>>,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seqn = match self.seqn {
            Some(n) => format!("{n:03}"),
            None => "---".to_string(),
        };
        write!(
            f,
            "{} {} {} {} {} {} {} {:03} {}",
            self.rssi,
            self.verb.as_wire(),
            seqn,
            self.addrs[0],
            self.addrs[1],
            self.addrs[2],
            self.code,
            self.payload.len() / 2,
            self.payload,
        )
    }
}

impl Packet {
    /// The fingerprint of this packet itself, used to spot our own echo
    pub fn tx_header(&self) -> Option<&str> {
        self.tx_hdr
            .get_or_init(|| {
                header_for(
                    self.verb,
                    &self.src,
                    &self.dst,
                    self.code,
                    &self.payload,
                    false,
                )
            })
            .as_deref()
    }

    /// The fingerprint of the expected reply, when one is expected
    pub fn rx_header(&self) -> Option<&str> {
        self.rx_hdr
            .get_or_init(|| {
                header_for(
                    self.verb,
                    &self.src,
                    &self.dst,
                    self.code,
                    &self.payload,
                    true,
                )
            })
            .as_deref()
    }
}

/// Line → [`Packet`] parser holding the shared address cache
#[derive(Debug, Default)]
pub struct PacketFramer {
    cache: AddressCache,
}

impl PacketFramer {
    pub fn new() -> Self {
        PacketFramer {
            cache: AddressCache::default(),
        }
    }

    /// Parses one raw line into a validated packet
    ///
    /// Returns `Error::Structure` for grammar/length violations and
    /// `Error::AddrSet` for an illegal address combination. Callers drop
    /// (and log) failures; bad input is routine on an RF link.
    pub fn parse(&mut self, line: &str) -> Result<Packet> {
        let frame = strip_annotations(line);
        let caps = MESSAGE_REGEX
            .captures(frame)
            .ok_or_else(|| Error::structure(format!("not a valid frame: {frame:?}")))?;

        let rssi = caps[1].to_string();
        let verb = Verb::from_wire(&caps[2])?;
        let seqn = caps[3].parse::<u16>().ok();
        let code = Code::from_hex(&caps[7])?;
        let len: usize = caps[8]
            .parse()
            .map_err(|_| Error::structure(format!("bad length field: {:?}", &caps[8])))?;
        let payload = caps[9].to_string();

        if payload.len() != len * 2 {
            return Err(Error::structure(format!(
                "declared length {} but payload is {} bytes",
                len,
                payload.len() / 2,
            )));
        }

        let (src, dst, addrs) = pkt_addrs(&mut self.cache, &caps[4], &caps[5], &caps[6])?;
        check_payload(verb, code, &payload)?;

        Ok(Packet {
            dtm: Utc::now(),
            rssi,
            verb,
            seqn,
            addrs,
            src,
            dst,
            code,
            payload,
            tx_hdr: OnceLock::new(),
            rx_hdr: OnceLock::new(),
        })
    }
}

/// Drops trailing `* err` / `# comment` annotations
fn strip_annotations(line: &str) -> &str {
    let line = line.split('#').next().unwrap_or(line);
    let line = line.split('*').next().unwrap_or(line);
    line.trim()
}

/// Validates the three address slots and derives src/dst
///
/// Exactly three shapes are accepted (observed-hardware knowledge, treated
/// as normative):
/// - `src --:------ xx` (announcements, often self-addressed)
/// - `src dst --:------` (directed traffic)
/// - `--:------ --:------ src` (anonymous announcements)
pub fn pkt_addrs(
    cache: &mut AddressCache,
    a0: &str,
    a1: &str,
    a2: &str,
) -> Result<(DeviceAddress, DeviceAddress, [DeviceAddress; 3])> {
    let addrs = [cache.resolve(a0)?, cache.resolve(a1)?, cache.resolve(a2)?];
    let (src, dst) = validate_addrs(&addrs)?;
    Ok((src, dst, addrs))
}

/// Applies the address-shape rules to three resolved slots, deriving src/dst
pub fn validate_addrs(addrs: &[DeviceAddress; 3]) -> Result<(DeviceAddress, DeviceAddress)> {
    let [addr0, addr1, addr2] = addrs;

    let shape_announce = addr0.is_real() && addr1.is_none() && !addr2.is_none();
    let shape_directed =
        addr0.is_real() && !addr1.is_none() && addr1 != addr0 && addr2.is_none();
    let shape_anonymous = addr0.is_none() && addr1.is_none() && addr2.is_real();

    if !shape_announce && !shape_directed && !shape_anonymous {
        return Err(Error::addr_set(format!(
            "invalid address set: {addr0} {addr1} {addr2}",
        )));
    }

    let mut devices = [addr0, addr1, addr2].into_iter().filter(|a| !a.is_none());
    let src = devices.next().cloned().unwrap_or_else(DeviceAddress::none);
    let dst = devices.next().cloned().unwrap_or_else(DeviceAddress::none);

    Ok((src, dst))
}

/// Checks the payload against the per-(verb, code) schema
fn check_payload(verb: Verb, code: Code, payload: &str) -> Result<()> {
    if ramses::schema(code).is_none() {
        debug!(%code, "code not in schema table, accepting");
        return Ok(());
    }
    match ramses::payload_regex(code, verb) {
        None => Err(Error::structure(format!(
            "verb {verb} not expected for code {code}"
        ))),
        Some(re) if re.is_match(payload) => Ok(()),
        Some(_) => Err(Error::structure(format!(
            "payload {payload:?} not valid for {verb}|{code}"
        ))),
    }
}

/// Derives a packet's correlation header, `verb|device_id|code[|idx]`
///
/// With `rx` set, derives instead the header of the expected reply (RQ
/// answered by RP, W answered by I), or `None` when no reply is expected.
pub fn header_for(
    verb: Verb,
    src: &DeviceAddress,
    dst: &DeviceAddress,
    code: Code,
    payload: &str,
    rx: bool,
) -> Option<String> {
    if code == Code::RF_BIND {
        // The bind handshake correlates differently: an Offer is answered
        // by a W (Accept), an Accept by an I (Confirm).
        if !rx {
            let device_id = if src == dst { NUL_ID } else { dst.id() };
            return Some(format!("{verb}|{device_id}|{code}"));
        }
        if src == dst {
            return Some(format!("W|{}|{code}", src.id()));
        }
        if verb == Verb::W {
            return Some(format!("I|{}|{code}", src.id()));
        }
        return None;
    }

    // RQ and W key on dst.id rather than src.id: cmd.src may be the local
    // gateway id, while the echo comes back with the port's own id.
    let header = if rx {
        if matches!(verb, Verb::I | Verb::Rp) || src == dst {
            return None; // no reply expected
        }
        let reply = if verb == Verb::Rq { Verb::Rp } else { Verb::I };
        format!("{reply}|{}|{code}", dst.id())
    } else if matches!(verb, Verb::I | Verb::Rp) || src == dst {
        format!("{verb}|{}|{code}", src.id())
    } else {
        format!("{verb}|{}|{code}", dst.id())
    };

    match payload_ctx(verb, src, dst, code, payload) {
        Some(ctx) => Some(format!("{header}|{ctx}")),
        None => Some(header),
    }
}

/// The payload's full context: the index plus, for schedule packets, the
/// fragment number
fn payload_ctx(
    verb: Verb,
    src: &DeviceAddress,
    dst: &DeviceAddress,
    code: Code,
    payload: &str,
) -> Option<String> {
    match code {
        Code::SYSTEM_ZONES | Code::ZONE_DEVICES => payload.get(0..4).map(str::to_string),
        Code::ZONE_SCHEDULE => {
            let idx = if payload.get(2..4) == Some("23") {
                "HW".to_string()
            } else {
                payload.get(0..2)?.to_string()
            };
            Some(format!("{idx}{}", payload.get(10..12).unwrap_or("")))
        }
        _ => payload_idx(verb, src, dst, code, payload),
    }
}

/// The payload's 2-char index (zone_idx, domain_id or log_idx), when the
/// code carries one
fn payload_idx(
    verb: Verb,
    src: &DeviceAddress,
    dst: &DeviceAddress,
    code: Code,
    payload: &str,
) -> Option<String> {
    let first = payload.get(0..2)?;

    match code {
        Code::SYSTEM_FAULT => return payload.get(4..6).map(str::to_string),
        Code::TPI_PARAMS => {
            return if first.starts_with('F') {
                Some(first.to_string())
            } else {
                None
            };
        }
        Code::OPENTHERM_MSG => return payload.get(4..6).map(str::to_string),
        Code::RELAY_FAILSAFE if src.class() == "10" => return None,
        _ => {}
    }

    match ramses::idx_rule(code) {
        None | Some(IdxRule::None) => None,
        Some(IdxRule::Complex) => None, // handled above
        Some(IdxRule::Simple) => {
            if has_array(verb, src, dst, code, payload) {
                return None;
            }
            if matches!(first, "F8" | "F9" | "FA" | "FC") {
                if DOMAIN_CODES.contains(&code) {
                    return Some(first.to_string());
                }
                debug!(%code, idx = first, "unexpected domain id in payload");
                return None;
            }
            if has_ctl(src, dst, code, payload) {
                return Some(first.to_string());
            }
            if matches!(code.0, 0x31D9 | 0x31DA) {
                return Some(first.to_string());
            }
            if first != "00" {
                debug!(%code, idx = first, "payload has an index where none expected");
            }
            None
        }
    }
}

/// True when the payload is an array of per-zone elements
fn has_array(
    verb: Verb,
    src: &DeviceAddress,
    dst: &DeviceAddress,
    code: Code,
    payload: &str,
) -> bool {
    if code == Code::RF_BIND {
        return verb != Verb::Rq;
    }
    if verb != Verb::I {
        return false;
    }
    let Some(element) = array_element_len(code) else {
        return false;
    };
    let len = payload.len() / 2;
    if len != element {
        return len % element == 0;
    }
    // single-element UFC arrays are still arrays
    matches!(code.0, 0x22C9 | 0x3150)
        && src.class() == "02"
        && src == dst
        && !payload.starts_with('F')
}

/// True when the packet is to/from a controller-class device
fn has_ctl(src: &DeviceAddress, dst: &DeviceAddress, code: Code, payload: &str) -> bool {
    const CTL_CLASSES: &[&str] = &["01", "02", "23"];
    const ONLY_FROM_CTL: &[u16] = &[0x1030, 0x1F09, 0x22D0, 0x313F, 0x31D9, 0x31DA];

    if CTL_CLASSES.contains(&src.class()) || CTL_CLASSES.contains(&dst.class()) {
        return true;
    }
    if src == dst {
        return ONLY_FROM_CTL.contains(&code.0)
            || (code == Code::ACTUATOR_SYNC && payload.starts_with("FC"));
    }
    if dst.is_none() {
        return src.class() != "10";
    }
    matches!(dst.class(), "12" | "22")
}
