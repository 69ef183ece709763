//! Outbound command construction
//!
//! One typed constructor per (verb, code) operation, each encoding its
//! arguments into the code's fixed-width hex layout and validating them
//! before anything reaches the wire. A generic [`Command::packet`] exists
//! for low-trust raw injection. Every constructed command is re-checked
//! against the code's payload schema.

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

use crate::core::{Code, Error, Priority, Qos, Result, Verb};
use crate::protocol::address::{id_to_hex, DeviceAddress};
use crate::protocol::frame::{header_for, validate_addrs};
use crate::protocol::ramses;
use crate::util::{dtm_to_hex, str_to_hex, temp_to_hex};

/// Operating mode for a zone (or stored hot water)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMode {
    FollowSchedule,
    AdvancedOverride,
    PermanentOverride,
    Countdown,
    TemporaryOverride,
}

impl ZoneMode {
    fn as_hex(&self) -> &'static str {
        match self {
            ZoneMode::FollowSchedule => "00",
            ZoneMode::AdvancedOverride => "01",
            ZoneMode::PermanentOverride => "02",
            ZoneMode::Countdown => "03",
            ZoneMode::TemporaryOverride => "04",
        }
    }
}

/// Operating mode for the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Auto,
    HeatOff,
    EcoBoost,
    Away,
    DayOff,
    DayOffEco,
    AutoWithReset,
    Custom,
}

impl SystemMode {
    fn as_hex(&self) -> &'static str {
        match self {
            SystemMode::Auto => "00",
            SystemMode::HeatOff => "01",
            SystemMode::EcoBoost => "02",
            SystemMode::Away => "03",
            SystemMode::DayOff => "04",
            SystemMode::DayOffEco => "05",
            SystemMode::AutoWithReset => "06",
            SystemMode::Custom => "07",
        }
    }
}

/// Target of a schedule exchange: a numbered zone or stored hot water
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Zone(u8),
    Dhw,
}

impl ScheduleZone {
    /// The `{zone_idx}{kind}` payload prefix ("xx20" for zones, "0023" DHW)
    pub fn wire_prefix(&self) -> Result<String> {
        match self {
            ScheduleZone::Zone(idx) if *idx <= 0x0F => Ok(format!("{idx:02X}20")),
            ScheduleZone::Zone(idx) => Err(Error::command(format!("bad zone_idx: {idx}"))),
            ScheduleZone::Dhw => Ok("0023".to_string()),
        }
    }
}

/// QoS defaults for a (verb, code) pair, overridable by the caller
pub fn default_qos(verb: Verb, code: Code) -> Qos {
    let qos = Qos::default();
    match (verb, code) {
        (Verb::Rq, Code::RF_CHECK) | (Verb::Rq, Code::SYSTEM_SYNC) => Qos {
            priority: Priority::High,
            retry_limit: 5,
            ..qos
        },
        (Verb::I, Code::RF_BIND) => Qos {
            priority: Priority::High,
            retry_limit: 2,
            tx_timeout: Duration::from_secs(1),
            disable_backoff: true,
        },
        (Verb::Rq | Verb::W, Code::ZONE_SCHEDULE) => Qos {
            priority: Priority::High,
            retry_limit: 5,
            tx_timeout: Duration::from_millis(300),
            ..qos
        },
        (Verb::Rq, Code::SYSTEM_FAULT) => Qos {
            priority: Priority::Low,
            retry_limit: 3,
            ..qos
        },
        (Verb::Rq, Code::OPENTHERM_MSG) => Qos {
            priority: Priority::Default,
            retry_limit: 1,
            tx_timeout: Duration::from_secs(1),
            disable_backoff: true,
        },
        _ => qos,
    }
}

/// A validated outbound frame with its QoS parameters
///
/// Commands order by `(priority, creation time)`; the transport's queue
/// relies on this.
#[derive(Debug, Clone)]
pub struct Command {
    pub verb: Verb,
    pub seqn: Option<u16>,
    pub addrs: [DeviceAddress; 3],
    pub src: DeviceAddress,
    pub dst: DeviceAddress,
    pub code: Code,
    pub payload: String,
    pub qos: Qos,
    created: Instant,
    tx_hdr: OnceLock<Option<String>>,
    rx_hdr: OnceLock<Option<String>>,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seqn = match self.seqn {
            Some(n) => format!("{n:03}"),
            None => "---".to_string(),
        };
        write!(
            f,
            "{} {} {} {} {} {} {:03} {}",
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

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.qos.priority == other.qos.priority && self.created == other.created
    }
}

impl Eq for Command {}

impl PartialOrd for Command {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Command {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.qos.priority, self.created).cmp(&(other.qos.priority, other.created))
    }
}

impl Command {
    fn new(verb: Verb, code: Code, payload: String, addrs: [DeviceAddress; 3]) -> Result<Self> {
        if payload.is_empty()
            || payload.len() % 2 != 0
            || payload.len() > crate::core::MAX_PAYLOAD_BYTES * 2
        {
            return Err(Error::command(format!(
                "payload must be 1..=48 bytes of hex: {payload:?}"
            )));
        }
        if !payload
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        {
            return Err(Error::command(format!("payload is not hex: {payload:?}")));
        }
        if ramses::schema(code).is_some() {
            match ramses::payload_regex(code, verb) {
                None => {
                    return Err(Error::command(format!(
                        "verb {verb} not valid for code {code}"
                    )))
                }
                Some(re) if !re.is_match(&payload) => {
                    return Err(Error::command(format!(
                        "payload {payload:?} not valid for {verb}|{code}"
                    )))
                }
                _ => {}
            }
        }
        let (src, dst) = validate_addrs(&addrs).map_err(|e| Error::command(e.to_string()))?;

        Ok(Command {
            verb,
            seqn: None,
            addrs,
            src,
            dst,
            code,
            payload,
            qos: default_qos(verb, code),
            created: Instant::now(),
            tx_hdr: OnceLock::new(),
            rx_hdr: OnceLock::new(),
        })
    }

    /// Low-trust constructor taking all three address slots verbatim
    pub fn packet(
        verb: Verb,
        code: Code,
        addr0: &DeviceAddress,
        addr1: &DeviceAddress,
        addr2: &DeviceAddress,
        payload: &str,
    ) -> Result<Self> {
        Command::new(
            verb,
            code,
            payload.to_string(),
            [addr0.clone(), addr1.clone(), addr2.clone()],
        )
    }

    /// Directed command from the local gateway to `dst`
    pub fn from_attrs(verb: Verb, dst: &DeviceAddress, code: Code, payload: &str) -> Result<Self> {
        Command::new(
            verb,
            code,
            payload.to_string(),
            [DeviceAddress::hgi(), dst.clone(), DeviceAddress::none()],
        )
    }

    /// Self-addressed announcement in the name of `src` (used by faked
    /// sensors and the bind handshake)
    fn announce(verb: Verb, src: &DeviceAddress, code: Code, payload: &str) -> Result<Self> {
        Command::new(
            verb,
            code,
            payload.to_string(),
            [src.clone(), DeviceAddress::none(), src.clone()],
        )
    }

    /// Replaces the QoS parameters wholesale
    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Replaces just the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.qos.priority = priority;
        self
    }

    /// The fingerprint of this command, matched against its echo
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

    // -- zones ----------------------------------------------------------

    pub fn get_zone_setpoint(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::SETPOINT, &format!("{zone:02X}"))
    }

    pub fn set_zone_setpoint(ctl: &DeviceAddress, zone_idx: u8, setpoint: f64) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        let payload = format!("{zone:02X}{}", temp_to_hex(Some(setpoint))?);
        Command::from_attrs(Verb::W, ctl, Code::SETPOINT, &payload)
    }

    pub fn get_zone_temp(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::TEMPERATURE, &format!("{zone:02X}"))
    }

    pub fn get_zone_name(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::ZONE_NAME, &format!("{zone:02X}00"))
    }

    pub fn set_zone_name(ctl: &DeviceAddress, zone_idx: u8, name: &str) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        if name.len() > 20 || !name.is_ascii() {
            return Err(Error::command(format!("bad zone name: {name:?}")));
        }
        let mut hex = str_to_hex(name);
        hex.push_str(&"00".repeat(20 - name.len()));
        Command::from_attrs(Verb::W, ctl, Code::ZONE_NAME, &format!("{zone:02X}00{hex}"))
    }

    pub fn get_zone_config(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::ZONE_PARAMS, &format!("{zone:02X}00"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_zone_config(
        ctl: &DeviceAddress,
        zone_idx: u8,
        min_temp: f64,
        max_temp: f64,
        local_override: bool,
        openwindow_function: bool,
        multiroom_mode: bool,
    ) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        if !(5.0..=21.0).contains(&min_temp) {
            return Err(Error::command(format!("min_temp out of range: {min_temp}")));
        }
        if !(21.0..=35.0).contains(&max_temp) {
            return Err(Error::command(format!("max_temp out of range: {max_temp}")));
        }
        let bitmap = u8::from(local_override)
            | u8::from(openwindow_function) << 1
            | u8::from(multiroom_mode) << 2;
        let payload = format!(
            "{zone:02X}{bitmap:02X}{}{}",
            temp_to_hex(Some(min_temp))?,
            temp_to_hex(Some(max_temp))?,
        );
        Command::from_attrs(Verb::W, ctl, Code::ZONE_PARAMS, &payload)
    }

    pub fn get_zone_mode(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::ZONE_MODE, &format!("{zone:02X}00"))
    }

    /// `until` and `duration` are mutually exclusive; one of them is
    /// required for a temporary override and forbidden for all other modes
    pub fn set_zone_mode(
        ctl: &DeviceAddress,
        zone_idx: u8,
        mode: ZoneMode,
        setpoint: Option<f64>,
        until: Option<NaiveDateTime>,
        duration: Option<Duration>,
    ) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        if until.is_some() && duration.is_some() {
            return Err(Error::command("until and duration are mutually exclusive"));
        }
        let expiring = matches!(mode, ZoneMode::TemporaryOverride | ZoneMode::Countdown);
        if expiring && until.is_none() && duration.is_none() {
            return Err(Error::command(format!("{mode:?} requires until or duration")));
        }
        if !expiring && (until.is_some() || duration.is_some()) {
            return Err(Error::command(format!("{mode:?} forbids until/duration")));
        }
        if mode != ZoneMode::FollowSchedule && setpoint.is_none() {
            return Err(Error::command(format!("{mode:?} requires a setpoint")));
        }

        let until = until.or_else(|| {
            duration.and_then(|d| {
                chrono::Duration::from_std(d)
                    .ok()
                    .map(|d| chrono::Utc::now().naive_utc() + d)
            })
        });
        let mut payload = format!(
            "{zone:02X}{}{}FFFFFF",
            temp_to_hex(setpoint)?,
            mode.as_hex(),
        );
        if let Some(until) = until {
            payload.push_str(&dtm_to_hex(Some(until)));
        }
        Command::from_attrs(Verb::W, ctl, Code::ZONE_MODE, &payload)
    }

    pub fn get_zone_window_state(ctl: &DeviceAddress, zone_idx: u8) -> Result<Self> {
        let zone = check_zone_idx(zone_idx)?;
        Command::from_attrs(Verb::Rq, ctl, Code::WINDOW_STATE, &format!("{zone:02X}"))
    }

    // -- system ---------------------------------------------------------

    pub fn get_system_mode(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::SYSTEM_MODE, "FF")
    }

    pub fn set_system_mode(
        ctl: &DeviceAddress,
        mode: SystemMode,
        until: Option<NaiveDateTime>,
    ) -> Result<Self> {
        if until.is_some() && matches!(mode, SystemMode::Auto | SystemMode::HeatOff) {
            return Err(Error::command(format!("{mode:?} forbids until")));
        }
        let payload = format!(
            "{}{}{}",
            mode.as_hex(),
            dtm_to_hex(until),
            if until.is_some() { "01" } else { "00" },
        );
        Command::from_attrs(Verb::W, ctl, Code::SYSTEM_MODE, &payload)
    }

    pub fn get_system_time(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::DATETIME, "00")
    }

    pub fn set_system_time(ctl: &DeviceAddress, dtm: NaiveDateTime) -> Result<Self> {
        let payload = format!("006000{}", dtm_to_hex(Some(dtm)));
        Command::from_attrs(Verb::W, ctl, Code::DATETIME, &payload)
    }

    pub fn get_system_log_entry(ctl: &DeviceAddress, log_idx: u8) -> Result<Self> {
        if log_idx > 0x3F {
            return Err(Error::command(format!("bad log_idx: {log_idx}")));
        }
        Command::from_attrs(Verb::Rq, ctl, Code::SYSTEM_FAULT, &format!("0000{log_idx:02X}"))
    }

    pub fn get_relay_demand(dev: &DeviceAddress, zone_idx: Option<u8>) -> Result<Self> {
        let payload = match zone_idx {
            None => "00".to_string(),
            Some(idx) => format!("{:02X}", check_zone_idx(idx)?),
        };
        Command::from_attrs(Verb::Rq, dev, Code::RELAY_DEMAND, &payload)
    }

    pub fn get_tpi_params(dev: &DeviceAddress, domain_id: Option<&str>) -> Result<Self> {
        // relays hold their params against 00, controllers against FC
        let domain = domain_id.unwrap_or(if dev.class() == "13" { "00" } else { "FC" });
        Command::from_attrs(Verb::Rq, dev, Code::TPI_PARAMS, domain)
    }

    pub fn set_tpi_params(
        dev: &DeviceAddress,
        domain_id: &str,
        cycle_rate: u8,
        min_on_time: u8,
        min_off_time: u8,
        proportional_band_width: Option<f64>,
    ) -> Result<Self> {
        if ![3, 6, 9, 12].contains(&cycle_rate) {
            return Err(Error::command(format!("bad cycle_rate: {cycle_rate}")));
        }
        if !(1..=5).contains(&min_on_time) || min_off_time > 5 {
            return Err(Error::command("bad min_on_time/min_off_time"));
        }
        if let Some(pbw) = proportional_band_width {
            if !(1.5..=3.0).contains(&pbw) {
                return Err(Error::command(format!("bad proportional band: {pbw}")));
            }
        }
        let mut payload = format!(
            "{domain_id}{:02X}{:02X}{:02X}00",
            cycle_rate * 4,
            min_on_time * 4,
            min_off_time * 4,
        );
        if let Some(pbw) = proportional_band_width {
            payload.push_str(&format!("{:04X}01", (pbw * 100.0) as u16));
        }
        Command::from_attrs(Verb::W, dev, Code::TPI_PARAMS, &payload)
    }

    // -- stored hot water -----------------------------------------------

    pub fn get_dhw_mode(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::DHW_MODE, "00")
    }

    pub fn set_dhw_mode(
        ctl: &DeviceAddress,
        active: Option<bool>,
        mode: ZoneMode,
        until: Option<NaiveDateTime>,
    ) -> Result<Self> {
        if mode == ZoneMode::TemporaryOverride && until.is_none() {
            return Err(Error::command("TemporaryOverride requires until"));
        }
        if mode != ZoneMode::TemporaryOverride && until.is_some() {
            return Err(Error::command(format!("{mode:?} forbids until")));
        }
        let active = match active {
            None => "FF".to_string(),
            Some(on) => format!("{:02X}", u8::from(on)),
        };
        let mut payload = format!("00{active}{}FFFFFF", mode.as_hex());
        if let Some(until) = until {
            payload.push_str(&dtm_to_hex(Some(until)));
        }
        Command::from_attrs(Verb::W, ctl, Code::DHW_MODE, &payload)
    }

    pub fn get_dhw_params(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::DHW_PARAMS, "00")
    }

    pub fn set_dhw_params(
        ctl: &DeviceAddress,
        setpoint: f64,
        overrun_mins: u8,
        differential: f64,
    ) -> Result<Self> {
        if !(30.0..=85.0).contains(&setpoint) {
            return Err(Error::command(format!("setpoint out of range: {setpoint}")));
        }
        if overrun_mins > 10 || !(1.0..=10.0).contains(&differential) {
            return Err(Error::command("bad overrun/differential"));
        }
        let payload = format!(
            "00{}{overrun_mins:02X}{}",
            temp_to_hex(Some(setpoint))?,
            temp_to_hex(Some(differential))?,
        );
        Command::from_attrs(Verb::W, ctl, Code::DHW_PARAMS, &payload)
    }

    pub fn get_dhw_temp(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::DHW_TEMP, "00")
    }

    // -- schedules ------------------------------------------------------

    pub fn get_schedule_version(ctl: &DeviceAddress) -> Result<Self> {
        Command::from_attrs(Verb::Rq, ctl, Code::SCHEDULE_VERSION, "00")
    }

    /// Requests fragment `frag_num` (1-based) of a schedule; `frag_cnt` is
    /// 0 until the total is learned from the first reply
    pub fn get_schedule_fragment(
        ctl: &DeviceAddress,
        zone: ScheduleZone,
        frag_num: u8,
        frag_cnt: u8,
    ) -> Result<Self> {
        if frag_num == 0 {
            return Err(Error::command("fragment numbers are 1-based"));
        }
        let payload = format!(
            "{}000800{frag_num:02X}{frag_cnt:02X}",
            zone.wire_prefix()?,
        );
        Command::from_attrs(Verb::Rq, ctl, Code::ZONE_SCHEDULE, &payload)
    }

    /// Writes fragment `frag_num` (1-based) of `frag_cnt`; `fragment` is
    /// the uppercase-hex fragment body
    pub fn put_schedule_fragment(
        ctl: &DeviceAddress,
        zone: ScheduleZone,
        frag_num: u8,
        frag_cnt: u8,
        fragment: &str,
    ) -> Result<Self> {
        if frag_num == 0 || frag_num > frag_cnt {
            return Err(Error::command(format!(
                "bad fragment number: {frag_num}/{frag_cnt}"
            )));
        }
        let frag_len = fragment.len() / 2;
        let payload = format!(
            "{}0008{frag_len:02X}{frag_num:02X}{frag_cnt:02X}{fragment}",
            zone.wire_prefix()?,
        );
        Command::from_attrs(Verb::W, ctl, Code::ZONE_SCHEDULE, &payload)
    }

    // -- opentherm ------------------------------------------------------

    /// Read-Data request for one OpenTherm data-id
    pub fn get_opentherm_data(otb: &DeviceAddress, msg_id: u8) -> Result<Self> {
        // the OT frame's parity bit covers the whole 32-bit frame
        let parity = if msg_id.count_ones() % 2 == 1 { "80" } else { "00" };
        let payload = format!("00{parity}{msg_id:02X}0000");
        Command::from_attrs(Verb::Rq, otb, Code::OPENTHERM_MSG, &payload)
    }

    // -- binding --------------------------------------------------------

    /// Offer: self-addressed I listing every offered code plus 1FC9 itself
    pub fn put_bind_offer(src: &DeviceAddress, codes: &[Code]) -> Result<Self> {
        let hex_id = id_to_hex(src.id())?;
        let payload: String = codes
            .iter()
            .chain([&Code::RF_BIND])
            .map(|c| format!("00{c}{hex_id}"))
            .collect();
        Ok(Command::announce(Verb::I, src, Code::RF_BIND, &payload)?.with_qos(Qos {
            priority: Priority::High,
            retry_limit: 3,
            tx_timeout: Duration::from_secs(1),
            disable_backoff: true,
        }))
    }

    /// Accept: W from the respondent back to the offering device
    pub fn put_bind_accept(
        src: &DeviceAddress,
        dst: &DeviceAddress,
        code: Code,
    ) -> Result<Self> {
        let payload = format!("00{code}{}", id_to_hex(src.id())?);
        Ok(Command::new(
            Verb::W,
            Code::RF_BIND,
            payload,
            [src.clone(), dst.clone(), DeviceAddress::none()],
        )?
        .with_qos(Qos {
            priority: Priority::High,
            retry_limit: 3,
            tx_timeout: Duration::from_secs(1),
            disable_backoff: true,
        }))
    }

    /// Confirm: I from the supplicant back to the accepting device
    pub fn put_bind_confirm(
        src: &DeviceAddress,
        dst: &DeviceAddress,
        code: Code,
    ) -> Result<Self> {
        let payload = format!("00{code}{}", id_to_hex(src.id())?);
        Ok(Command::new(
            Verb::I,
            Code::RF_BIND,
            payload,
            [src.clone(), dst.clone(), DeviceAddress::none()],
        )?
        .with_qos(Qos {
            priority: Priority::High,
            retry_limit: 3,
            tx_timeout: Duration::from_secs(1),
            disable_backoff: true,
        }))
    }

    // -- faked sensors / announcements ----------------------------------

    pub fn put_sensor_temp(dev: &DeviceAddress, temp: Option<f64>) -> Result<Self> {
        let payload = format!("00{}", temp_to_hex(temp)?);
        Command::announce(Verb::I, dev, Code::TEMPERATURE, &payload)
    }

    pub fn put_outdoor_temp(dev: &DeviceAddress, temp: f64) -> Result<Self> {
        let payload = format!("00{}01", temp_to_hex(Some(temp))?);
        Command::announce(Verb::I, dev, Code::OUTDOOR_SENSOR, &payload)
    }

    /// Benign engine announcement; also cast before impersonating another
    /// device id so listeners can tell the traffic apart
    pub fn put_puzzle(message: &str) -> Result<Self> {
        let ms = chrono::Utc::now().timestamp_millis() as u64;
        let mut payload = format!("0011{ms:012X}{}", str_to_hex(message));
        payload.truncate(48);
        Ok(
            Command::from_attrs(Verb::I, &DeviceAddress::null(), Code::PUZZLE, &payload)?
                .with_qos(Qos {
                    priority: Priority::Highest,
                    retry_limit: 0,
                    tx_timeout: Duration::from_millis(50),
                    disable_backoff: true,
                }),
        )
    }
}

fn check_zone_idx(zone_idx: u8) -> Result<u8> {
    if zone_idx > 0x0F {
        return Err(Error::command(format!("bad zone_idx: {zone_idx}")));
    }
    Ok(zone_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctl() -> DeviceAddress {
        DeviceAddress::from_id("01:145038").unwrap()
    }

    #[test]
    fn test_get_zone_setpoint() {
        let cmd = Command::get_zone_setpoint(&ctl(), 1).unwrap();
        assert_eq!(
            cmd.to_string(),
            "RQ --- 18:000730 01:145038 --:------ 2309 001 01",
        );
        assert_eq!(cmd.rx_header(), Some("RP|01:145038|2309|01"));
    }

    #[test]
    fn test_set_zone_setpoint() {
        let cmd = Command::set_zone_setpoint(&ctl(), 1, 20.0).unwrap();
        assert_eq!(cmd.payload, "0107D0");
        assert_eq!(cmd.verb, Verb::W);
        assert_eq!(cmd.rx_header(), Some("I|01:145038|2309|01"));
        assert!(Command::set_zone_setpoint(&ctl(), 16, 20.0).is_err());
    }

    #[test]
    fn test_set_zone_name_padding() {
        let cmd = Command::set_zone_name(&ctl(), 0, "Hall").unwrap();
        assert_eq!(cmd.payload.len(), 4 + 40);
        assert!(cmd.payload.starts_with("000048616C6C"));
        assert!(Command::set_zone_name(&ctl(), 0, "a name longer than twenty").is_err());
    }

    #[test]
    fn test_set_zone_mode_validation() {
        let until = chrono::NaiveDate::from_ymd_opt(2023, 11, 5)
            .unwrap()
            .and_hms_opt(21, 30, 0)
            .unwrap();
        // until and duration are exclusive
        assert!(Command::set_zone_mode(
            &ctl(),
            1,
            ZoneMode::TemporaryOverride,
            Some(20.0),
            Some(until),
            Some(Duration::from_secs(3600)),
        )
        .is_err());
        // temporary override needs an expiry
        assert!(Command::set_zone_mode(
            &ctl(),
            1,
            ZoneMode::TemporaryOverride,
            Some(20.0),
            None,
            None,
        )
        .is_err());
        // permanent override forbids one
        assert!(Command::set_zone_mode(
            &ctl(),
            1,
            ZoneMode::PermanentOverride,
            Some(20.0),
            Some(until),
            None,
        )
        .is_err());

        let cmd = Command::set_zone_mode(
            &ctl(),
            1,
            ZoneMode::TemporaryOverride,
            Some(20.0),
            Some(until),
            None,
        )
        .unwrap();
        assert_eq!(cmd.payload, "0107D004FFFFFF1E15050B07E7");
    }

    #[test]
    fn test_set_system_mode() {
        let cmd = Command::set_system_mode(&ctl(), SystemMode::Away, None).unwrap();
        assert_eq!(cmd.payload, "03FFFFFFFFFFFF00");
    }

    #[test]
    fn test_schedule_fragment_payloads() {
        let cmd = Command::get_schedule_fragment(&ctl(), ScheduleZone::Zone(1), 1, 0).unwrap();
        assert_eq!(cmd.payload, "01200008000100");
        assert_eq!(cmd.rx_header(), Some("RP|01:145038|0404|0101"));

        let cmd =
            Command::put_schedule_fragment(&ctl(), ScheduleZone::Dhw, 2, 3, "C8AF00").unwrap();
        assert_eq!(cmd.payload, "00230008030203C8AF00");
        assert!(Command::get_schedule_fragment(&ctl(), ScheduleZone::Zone(1), 0, 0).is_err());
    }

    #[test]
    fn test_opentherm_parity() {
        // data-id 0x00 has even parity, 0x01 odd
        assert_eq!(
            Command::get_opentherm_data(&ctl(), 0).unwrap().payload,
            "0000000000",
        );
        assert_eq!(
            Command::get_opentherm_data(&ctl(), 1).unwrap().payload,
            "0080010000",
        );
    }

    #[test]
    fn test_bind_offer_payload() {
        let dev = DeviceAddress::from_id("34:021943").unwrap();
        let cmd = Command::put_bind_offer(&dev, &[Code::SETPOINT]).unwrap();
        assert_eq!(cmd.payload, "0023098855B7001FC98855B7");
        assert_eq!(cmd.addrs[2], dev);
        assert_eq!(cmd.tx_header(), Some("I|63:262142|1FC9"));
        assert_eq!(cmd.rx_header(), Some("W|34:021943|1FC9"));
        assert_eq!(cmd.qos.retry_limit, 3);
    }

    #[test]
    fn test_bind_accept_payload() {
        let ctl = ctl();
        let dev = DeviceAddress::from_id("34:021943").unwrap();
        let cmd = Command::put_bind_accept(&ctl, &dev, Code::SETPOINT).unwrap();
        assert_eq!(cmd.payload, "00230906368E");
        assert_eq!(cmd.rx_header(), Some("I|01:145038|1FC9"));
    }

    #[test]
    fn test_command_ordering() {
        let a = Command::get_zone_setpoint(&ctl(), 0).unwrap(); // Default
        let b = Command::get_system_log_entry(&ctl(), 0).unwrap(); // Low
        let c = Command::get_zone_setpoint(&ctl(), 1).unwrap(); // Default, later
        assert!(a < b, "priority beats age");
        assert!(a < c, "older first within a priority");
    }

    #[test]
    fn test_packet_rejects_bad_payload() {
        let ctl = ctl();
        let err = Command::from_attrs(Verb::Rq, &ctl, Code::SETPOINT, "GG").unwrap_err();
        assert!(matches!(err, Error::Command(_)), "{err}");
        let err = Command::from_attrs(Verb::W, &ctl, Code::TEMPERATURE, "0107D0").unwrap_err();
        assert!(matches!(err, Error::Command(_)), "{err}");
    }

    #[test]
    fn test_qos_table() {
        assert_eq!(default_qos(Verb::Rq, Code::SYSTEM_SYNC).retry_limit, 5);
        assert_eq!(
            default_qos(Verb::Rq, Code::ZONE_SCHEDULE).tx_timeout,
            Duration::from_millis(300),
        );
        assert!(default_qos(Verb::I, Code::RF_BIND).disable_backoff);
        assert_eq!(default_qos(Verb::Rq, Code::SETPOINT), Qos::default());
    }
}
