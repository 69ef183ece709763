//! Utility module
//!
//! Hex field encoders/decoders shared by the command builders and the
//! schedule engine, plus the tracing setup helper.

use chrono::{NaiveDateTime, Timelike};

use crate::core::{Error, Result};

/// Initializes a tracing subscriber honoring `RUST_LOG` (for binaries/tests)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Decodes an even-length uppercase hex string into bytes
pub fn bytes_from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::structure(format!("odd-length hex: {s:?}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| Error::structure(format!("bad hex: {:?}", &s[i..i + 2])))
        })
        .collect()
}

/// Encodes bytes as an uppercase hex string
pub fn hex_from_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Encodes an ASCII string as hex (e.g. for zone names)
pub fn str_to_hex(s: &str) -> String {
    hex_from_bytes(s.as_bytes())
}

/// Encodes a temperature in Celsius as a 4-hex fixed-point field (x100,
/// two's complement). `None` encodes the null sentinel 7FFF.
pub fn temp_to_hex(temp: Option<f64>) -> Result<String> {
    match temp {
        None => Ok("7FFF".to_string()),
        Some(t) if !(-(0x8000 as f64) / 100.0..0x7FFF as f64 / 100.0).contains(&t) => {
            Err(Error::command(format!("temperature out of range: {t}")))
        }
        Some(t) => Ok(format!("{:04X}", (t * 100.0).round() as i16 as u16)),
    }
}

/// Decodes a 4-hex fixed-point temperature field; 7FFF is the null sentinel
pub fn temp_from_hex(s: &str) -> Result<Option<f64>> {
    if s == "7FFF" {
        return Ok(None);
    }
    let raw = u16::from_str_radix(s, 16)
        .map_err(|_| Error::structure(format!("bad temperature field: {s:?}")))?;
    Ok(Some(raw as i16 as f64 / 100.0))
}

/// Encodes a datetime as the packed 12-hex wire field
/// `{minute}{hour}{day}{month}{year:04X}`; `None` is all-FF
pub fn dtm_to_hex(dtm: Option<NaiveDateTime>) -> String {
    match dtm {
        None => "FF".repeat(6),
        Some(dt) => {
            use chrono::Datelike;
            format!(
                "{:02X}{:02X}{:02X}{:02X}{:04X}",
                dt.minute(),
                dt.hour(),
                dt.day(),
                dt.month(),
                dt.year() as u16,
            )
        }
    }
}

/// Decodes a packed 12-hex datetime field; all-FF decodes to `None`
pub fn dtm_from_hex(s: &str) -> Result<Option<NaiveDateTime>> {
    if s.len() != 12 {
        return Err(Error::structure(format!("bad datetime field: {s:?}")));
    }
    if s == "FF".repeat(6) {
        return Ok(None);
    }
    let field = |range: std::ops::Range<usize>| {
        u32::from_str_radix(&s[range], 16)
            .map_err(|_| Error::structure(format!("bad datetime field: {s:?}")))
    };
    let (minute, hour, day, month) = (field(0..2)?, field(2..4)?, field(4..6)?, field(6..8)?);
    let year = field(8..12)?;
    chrono::NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .map(Some)
        .ok_or_else(|| Error::structure(format!("bad datetime field: {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let bytes = bytes_from_hex("00FFA5").unwrap();
        assert_eq!(bytes, vec![0x00, 0xFF, 0xA5]);
        assert_eq!(hex_from_bytes(&bytes), "00FFA5");
        assert!(bytes_from_hex("0FF").is_err());
        assert!(bytes_from_hex("GG").is_err());
    }

    #[test]
    fn test_temp_fields() {
        assert_eq!(temp_to_hex(Some(20.0)).unwrap(), "07D0");
        assert_eq!(temp_to_hex(Some(-5.0)).unwrap(), "FE0C");
        assert_eq!(temp_to_hex(None).unwrap(), "7FFF");
        assert_eq!(temp_from_hex("07D0").unwrap(), Some(20.0));
        assert_eq!(temp_from_hex("FE0C").unwrap(), Some(-5.0));
        assert_eq!(temp_from_hex("7FFF").unwrap(), None);
    }

    #[test]
    fn test_dtm_fields() {
        let dt = chrono::NaiveDate::from_ymd_opt(2023, 11, 5)
            .unwrap()
            .and_hms_opt(21, 30, 0)
            .unwrap();
        let hex = dtm_to_hex(Some(dt));
        assert_eq!(hex, "1E15050B07E7");
        assert_eq!(dtm_from_hex(&hex).unwrap(), Some(dt));
        assert_eq!(dtm_from_hex(&"FF".repeat(6)).unwrap(), None);
        assert_eq!(dtm_to_hex(None), "FFFFFFFFFFFF");
    }

    #[test]
    fn test_str_to_hex() {
        assert_eq!(str_to_hex("AB"), "4142");
    }
}
