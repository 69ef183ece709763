use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result};
use super::command::Command;
use super::frame::{Packet, PacketFramer};

/// Line codec for the serial interface: raw bytes in, [`Packet`]s out,
/// [`Command`]s encoded back as CRLF-terminated frame text
///
/// Evofw3-style interfaces emit one frame per line. Lines that fail to
/// parse are surfaced as errors per-line so one corrupt frame never stalls
/// the stream.
#[derive(Default)]
pub struct LineCodec {
    framer: PacketFramer,
}

impl LineCodec {
    pub fn new() -> Self {
        LineCodec {
            framer: PacketFramer::new(),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Result<Packet>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos);
            src.advance(1); // the newline itself

            // The interface is RF-fed and can emit mojibake mid-line
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\r').trim();
            if text.is_empty() || text.starts_with('!') {
                continue; // blank line or evofw3 diagnostic
            }
            return Ok(Some(self.framer.parse(text)));
        }
    }
}

impl Encoder<&Command> for LineCodec {
    type Error = Error;

    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
