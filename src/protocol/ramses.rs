//! The RAMSES-II code table
//!
//! A closed set of 4-hex command codes, each with per-verb payload patterns
//! and an index-extraction rule. The patterns are fixed protocol knowledge
//! gathered from observed traffic; they are the authority on what a payload
//! may look like for a given (verb, code).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::{Code, Verb};

/// How the 2-char payload context (zone_idx, domain_id, log_idx) is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxRule {
    /// The code never carries a context
    None,
    /// Context is `payload[0..2]`
    Simple,
    /// Context needs custom extraction (see the framer)
    Complex,
}

/// Schema for one code: per-verb payload patterns and the index rule
#[derive(Debug)]
pub struct CodeSchema {
    pub code: u16,
    pub name: &'static str,
    pub i: Option<&'static str>,
    pub rq: Option<&'static str>,
    pub rp: Option<&'static str>,
    pub w: Option<&'static str>,
    pub idx: IdxRule,
}

macro_rules! schema {
    ($code:literal, $name:literal, $idx:ident $(, $verb:ident : $re:literal)* $(,)?) => {{
        #[allow(unused_mut)]
        let mut s = CodeSchema {
            code: $code,
            name: $name,
            i: None,
            rq: None,
            rp: None,
            w: None,
            idx: IdxRule::$idx,
        };
        $(s.$verb = Some($re);)*
        s
    }};
}

/// The code table, sorted by code
pub static CODES_SCHEMA: LazyLock<Vec<CodeSchema>> = LazyLock::new(|| {
    vec![
        schema!(0x0001, "rf_unknown", None,
            i: r"^00FFFF02(00|FF)$",
            rq: r"^00([28A]0)00(0[0-9A-F])(FF|04)$",
            rp: r"^00([28A]0)00(0[0-9A-F])",
            w: r"^(0[0-9A-F]|FC|FF)000005(01|05)$"),
        schema!(0x0002, "outdoor_sensor", Simple,
            i: r"^0[0-4][0-9A-F]{4}(00|01|02|05)$",
            rq: r"^00$"),
        schema!(0x0004, "zone_name", Simple,
            i: r"^0[0-9A-F]00([0-9A-F]){40}$",
            rq: r"^0[0-9A-F]00$",
            w: r"^0[0-9A-F]00([0-9A-F]){40}$"),
        schema!(0x0005, "system_zones", Complex,
            i: r"^(00[01][0-9A-F]{5}){1,3}$",
            rq: r"^00[01][0-9A-F]$",
            rp: r"^00[01][0-9A-F]{3,5}$"),
        schema!(0x0006, "schedule_version", None,
            rq: r"^00$",
            rp: r"^0005[0-9A-F]{4}$"),
        schema!(0x0008, "relay_demand", Simple,
            i: r"^((0[0-9A-F]|F[9AC])[0-9A-F]{2}|00[0-9A-F]{24})$",
            rq: r"^0[0-9A-F]$",
            rp: r"^00[0-9A-F]{2}$"),
        schema!(0x0009, "relay_failsafe", Simple,
            i: r"^((0[0-9A-F]|F[9AC])0[0-1](00|FF))+$"),
        schema!(0x000A, "zone_params", Simple,
            i: r"^(0[0-9A-F][0-9A-F]{10}){1,8}$",
            rq: r"^0[0-9A-F]((00)?|([0-9A-F]{10})+)$",
            rp: r"^0[0-9A-F][0-9A-F]{10}$",
            w: r"^0[0-9A-F][0-9A-F]{10}$"),
        schema!(0x000C, "zone_devices", Complex,
            i: r"^0[0-9A-F][01][0-9A-F]|7F[0-9A-F]{6}([0-9A-F]{10}|[0-9A-F]{12}){1,7}$",
            rq: r"^0[0-9A-F][01][0-9A-F]$"),
        schema!(0x000E, "message_000e", None,
            i: r"^0000(14|28)$"),
        schema!(0x0016, "rf_check", Simple,
            rq: r"^0[0-9A-F]([0-9A-F]{2})?$",
            rp: r"^0[0-9A-F]{3}$"),
        schema!(0x0100, "language", None,
            rq: r"^00([0-9A-F]{4}F{4})?$",
            rp: r"^00[0-9A-F]{4}F{4}$"),
        schema!(0x0150, "message_0150", None,
            rq: r"^00$",
            rp: r"^000000$"),
        schema!(0x01D0, "message_01d0", Simple,
            i: r"^0[0-9A-F][0-9A-F]{2}$",
            w: r"^0[0-9A-F][0-9A-F]{2}$"),
        schema!(0x01E9, "message_01e9", Simple,
            i: r"^0[0-9A-F][0-9A-F]{2}$",
            w: r"^0[0-9A-F][0-9A-F]{2}$"),
        schema!(0x0404, "zone_schedule", Complex,
            i: r"^0[0-9A-F](20|23)[0-9A-F]{2}08[0-9A-F]{6}$",
            rq: r"^0[0-9A-F](20|23)000800[0-9A-F]{4}$",
            rp: r"^0[0-9A-F](20|23)0008[0-9A-F]{6}([0-9A-F]{2,82})?$",
            w: r"^0[0-9A-F](20|23)[0-9A-F]{2}08[0-9A-F]{6}[0-9A-F]{2,82}$"),
        schema!(0x0418, "system_fault", Complex,
            i: r"^00(00|40|C0)[0-3][0-9A-F]B0[0-9A-F]{6}0000[0-9A-F]{12}FFFF700[012][0-9A-F]{6}$",
            rq: r"^0000[0-3][0-9A-F]$"),
        schema!(0x042F, "message_042f", None,
            i: r"^00([0-9A-F]{2}){7,8}$",
            rq: r"^00$",
            rp: r"^00([0-9A-F]{2}){7,8}$"),
        schema!(0x0B04, "message_0b04", None,
            i: r"^00(00|C8)$"),
        schema!(0x1030, "mixvalve_params", Simple,
            i: r"^0[0-9A-F](C[89A-C]01[0-9A-F]{2}){5}$",
            rp: r"^00((20|21)01[0-9A-F]{2}){2}$",
            w: r"^0[0-9A-F](C[89A-C]01[0-9A-F]{2}){5}$"),
        schema!(0x1060, "device_battery", Simple,
            i: r"^0[0-9A-F](FF|[0-9A-F]{2})0[01]$"),
        schema!(0x1081, "max_ch_setpoint", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x1090, "message_1090", None,
            rq: r"^00$",
            rp: r"^00"),
        schema!(0x10A0, "dhw_params", Simple,
            i: r"^(00|01)[0-9A-F]{4}([0-9A-F]{6})?$",
            rq: r"^(00|01)([0-9A-F]{10})?$",
            w: r"^(00|01)[0-9A-F]{4}([0-9A-F]{6})?$"),
        schema!(0x10E0, "device_info", None,
            i: r"^(00|FF)([0-9A-F]{30,})?$",
            rq: r"^00$"),
        schema!(0x10E1, "device_id", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{6}$"),
        schema!(0x1100, "tpi_params", Complex,
            i: r"^(00|FC)[0-9A-F]{6}(00|FF)([0-9A-F]{4}0[01])?$",
            rq: r"^(00|FC)([0-9A-F]{6}(00|FF)([0-9A-F]{4}0[01])?)?$",
            w: r"^(00|FC)[0-9A-F]{6}(00|FF)([0-9A-F]{4}0[01])?$"),
        schema!(0x1260, "dhw_temp", Simple,
            i: r"^(00|01)[0-9A-F]{4}$",
            rq: r"^(00|01)(00)?$"),
        schema!(0x1280, "outdoor_humidity", None,
            i: r"^00[0-9A-F]{2}[0-9A-F]{8}?$"),
        schema!(0x1290, "outdoor_temp", None,
            i: r"^00[0-9A-F]{4}$",
            rq: r"^00$"),
        schema!(0x1298, "co2_level", None,
            i: r"^00[0-9A-F]{4}$",
            rq: r"^00$"),
        schema!(0x12A0, "indoor_humidity", Simple,
            i: r"^(0[0-9A-F]{3}([0-9A-F]{8}(00)?)?)+$",
            rp: r"^0[0-9A-F]{3}([0-9A-F]{8}(00)?)?$"),
        schema!(0x12B0, "window_state", Simple,
            i: r"^0[0-9A-F](0000|C800|FFFF)$",
            rq: r"^0[0-9A-F](00)?$"),
        schema!(0x12C0, "displayed_temp", None,
            i: r"^00[0-9A-F]{2}0[01](FF)?$"),
        schema!(0x12C8, "air_quality", None,
            i: r"^00[0-9A-F]{4}$"),
        schema!(0x12F0, "dhw_flow_rate", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x1300, "ch_pressure", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x1F09, "system_sync", None,
            i: r"^(00|01|DB|FF)[0-9A-F]{4}$",
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$",
            w: r"^F8[0-9A-F]{4}$"),
        schema!(0x1F41, "dhw_mode", Simple,
            i: r"^(00|01)(00|01|FF)0[0-5]F{6}(([0-9A-F]){12})?$",
            rq: r"^(00|01)$",
            w: r"^(00|01)(00|01|FF)0[0-5]F{6}(([0-9A-F]){12})?$"),
        schema!(0x1FC9, "rf_bind", Simple,
            i: r"^((0[0-9A-F]|F[69ABCF]|[0-9A-F]{2})([0-9A-F]{10}))+|00|21$",
            rq: r"^00$",
            rp: r"^((0[0-9A-F]|F[69ABCF]|[0-9A-F]{2})([0-9A-F]{10}))+$",
            w: r"^((0[0-9A-F]|F[69ABCF]|[0-9A-F]{2})([0-9A-F]{10}))+$"),
        schema!(0x1FD4, "opentherm_sync", None,
            i: r"^00([0-9A-F]{4})$"),
        schema!(0x2249, "setpoint_now", Simple,
            i: r"^(0[0-9A-F]{13}){1,2}$"),
        schema!(0x22C9, "setpoint_bounds", Simple,
            i: r"^(0[0-9A-F][0-9A-F]{8}0[12]){1,4}(0[12]03)?$",
            w: r"^(0[0-9A-F][0-9A-F]{8}0[12])$"),
        schema!(0x22D0, "message_22d0", Simple,
            i: r"^(00|03)",
            w: r"^03"),
        schema!(0x22D9, "boiler_setpoint", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x22F1, "fan_mode", None,
            i: r"^(00|63)(0[0-9A-F]){1,2}$",
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x22F3, "fan_boost", None,
            i: r"^(00|63)(021E)?[0-9A-F]{4}([0-9A-F]{8})?$"),
        schema!(0x2309, "setpoint", Simple,
            i: r"^(0[0-9A-F]{5})+$",
            rq: r"^0[0-9A-F]([0-9A-F]{4})?$",
            w: r"^0[0-9A-F]{5}$"),
        schema!(0x2349, "zone_mode", Simple,
            i: r"^0[0-9A-F]{5}0[0-4][0-9A-F]{6}([0-9A-F]{12})?$",
            rq: r"^0[0-9A-F](00|[0-9A-F]{12})?$",
            w: r"^0[0-9A-F]{5}0[0-4][0-9A-F]{6}([0-9A-F]{12})?$"),
        schema!(0x2389, "message_2389", None,
            i: r"^0[0-4][0-9A-F]{4}$"),
        schema!(0x2411, "fan_params", Simple,
            i: r"^(00|01|15|16|17|21)00[0-9A-F]{6}([0-9A-F]{8}){4}[0-9A-F]{4}$",
            rq: r"^(00|01|15|16|17|21)00[0-9A-F]{2}((00){19})?$",
            w: r"^(00|01|15|16|17|21)00[0-9A-F]{6}[0-9A-F]{8}(([0-9A-F]{8}){3}[0-9A-F]{4})?$"),
        schema!(0x2D49, "message_2d49", Simple,
            i: r"^(0[0-9A-F]|88|F6|FD)[0-9A-F]{2}(00||FF)$"),
        schema!(0x2E04, "system_mode", None,
            i: r"^0[0-7][0-9A-F]{12}0[01]$",
            rq: r"^FF$",
            w: r"^0[0-7][0-9A-F]{12}0[01]$"),
        schema!(0x2E10, "presence_detect", None,
            i: r"^00(00|01)(00)?$"),
        schema!(0x30C9, "temperature", Simple,
            i: r"^(0[0-9A-F][0-9A-F]{4})+$",
            rq: r"^0[0-9A-F](00)?$",
            rp: r"^0[0-9A-F][0-9A-F]{4}$"),
        schema!(0x3110, "ufc_demand", Simple,
            i: r"^(00|01)00[0-9A-F]{2}(00|10|20)"),
        schema!(0x3120, "message_3120", None,
            i: r"^00[0-9A-F]{10}FF$",
            rq: r"^00$"),
        schema!(0x313F, "datetime", None,
            i: r"^00[0-9A-F]{16}$",
            rq: r"^00$",
            w: r"^00[0-9A-F]{16}$"),
        schema!(0x3150, "heat_demand", Simple,
            i: r"^((0[0-9A-F])[0-9A-F]{2}|FC[0-9A-F]{2})+$"),
        schema!(0x31D9, "fan_state", Simple,
            i: r"^(00|01|15|16|17|21)[0-9A-F]{2}([0-9A-F]{2})?(([0-9A-F]{2})(00|20){0,12}(00|01|04|08)?)?$",
            rq: r"^(00|01|15|16|17|21)$"),
        schema!(0x31DA, "hvac_state", Simple,
            i: r"^(00|01|15|16|17|21)[0-9A-F]{56}(00|20)?$",
            rq: r"^(00|01|15|16|17|21)$"),
        schema!(0x31E0, "fan_demand", None,
            i: r"^00([0-9A-F]{4}){1,3}(00|FF)?$"),
        schema!(0x3200, "boiler_output", None,
            i: r"^00[0-9A-F]{4}$",
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x3210, "boiler_return", None,
            rq: r"^00$",
            rp: r"^00[0-9A-F]{4}$"),
        schema!(0x3220, "opentherm_msg", Complex,
            rq: r"^00[0-9A-F]{8}$",
            rp: r"^00[0-9A-F]{8}$"),
        schema!(0x3B00, "actuator_sync", Simple,
            i: r"^(00|FC)(00|C8)$"),
        schema!(0x3EF0, "actuator_state", None,
            i: r"^..((00|C8)FF|[0-9A-F]{10}|[0-9A-F]{16}|[0-9A-F]{38})$",
            rq: r"^00(00)?$",
            rp: r"^00((00|C8)FF|[0-9A-F]{10}|[0-9A-F]{16})$"),
        schema!(0x3EF1, "actuator_cycle", None,
            rq: r"^00((00)?|[0-9A-F]{22})$",
            rp: r"^00([0-9A-F]{12}|[0-9A-F]{34})$"),
        schema!(0x7FFF, "puzzle_packet", None,
            i: r"^00(([0-9A-F]){2})+$"),
    ]
});

/// Looks up the schema for a code
pub fn schema(code: Code) -> Option<&'static CodeSchema> {
    CODES_SCHEMA
        .binary_search_by_key(&code.0, |s| s.code)
        .ok()
        .map(|i| &CODES_SCHEMA[i])
}

/// True when the code is in the closed set
pub fn is_known_code(code: Code) -> bool {
    schema(code).is_some()
}

/// The payload pattern for a (code, verb) pair
///
/// A code with an RQ pattern but no RP pattern replies in its I shape, so
/// RP falls back to I there.
pub fn payload_pattern(code: Code, verb: Verb) -> Option<&'static str> {
    let s = schema(code)?;
    match verb {
        Verb::I => s.i,
        Verb::Rq => s.rq,
        Verb::W => s.w,
        Verb::Rp => s.rp.or_else(|| if s.rq.is_some() { s.i } else { None }),
    }
}

static COMPILED: LazyLock<HashMap<(u16, Verb), Regex>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for s in CODES_SCHEMA.iter() {
        for verb in [Verb::I, Verb::Rq, Verb::Rp, Verb::W] {
            if let Some(pattern) = payload_pattern(Code(s.code), verb) {
                if let Ok(re) = Regex::new(pattern) {
                    map.insert((s.code, verb), re);
                }
            }
        }
    }
    map
});

/// The compiled payload regex for a (code, verb) pair
pub fn payload_regex(code: Code, verb: Verb) -> Option<&'static Regex> {
    COMPILED.get(&(code.0, verb))
}

/// The index-extraction rule for a code (None when the code is unknown)
pub fn idx_rule(code: Code) -> Option<IdxRule> {
    schema(code).map(|s| s.idx)
}
