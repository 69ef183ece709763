//! Serial interface bridge
//!
//! The RF dongle presents as a serial device. serialport's API is
//! blocking, so reads and writes each get a dedicated thread bridged to
//! the async side over channels. The transport only ever sees the
//! channel pair, which is also how the tests substitute a loopback.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::core::{Error, Result};
use super::codec::LineCodec;
use super::frame::Packet;

/// Serial device settings for an evofw3/HGI80-style interface
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    /// Baud rate (evofw3 runs at 115200)
    pub baud_rate: u32,
    /// Capacity of the inbound and outbound channels
    pub channel_capacity: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            channel_capacity: 100,
        }
    }
}

/// The transport's view of the interface: frame text out, parsed packets in
pub struct PortChannels {
    pub line_tx: mpsc::Sender<String>,
    pub pkt_rx: mpsc::Receiver<Result<Packet>>,
}

/// Opens the serial device and spawns its reader and writer threads
///
/// The threads exit when their channel counterpart is dropped.
pub fn open(config: &PortConfig) -> Result<PortChannels> {
    let port = serialport::new(&config.device, config.baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| Error::transport(format!("Failed to open {}: {}", config.device, e)))?;

    let writer = port
        .try_clone()
        .map_err(|e| Error::transport(format!("Failed to clone port handle: {}", e)))?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(config.channel_capacity);
    let (pkt_tx, pkt_rx) = mpsc::channel::<Result<Packet>>(config.channel_capacity);

    std::thread::Builder::new()
        .name("ramses-rx".to_string())
        .spawn(move || {
            let mut codec = LineCodec::new();
            let mut reader = BufReader::new(port);
            let mut buf = BytesMut::with_capacity(1024);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break, // EOF, device unplugged
                    Ok(_) => {
                        buf.extend_from_slice(&line);
                        while let Ok(Some(pkt)) = codec.decode(&mut buf) {
                            if pkt_tx.blocking_send(pkt).is_err() {
                                return; // receiver gone, shut down
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("Serial read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Serial reader thread exiting");
        })
        .map_err(|e| Error::transport(format!("Failed to spawn reader thread: {}", e)))?;

    std::thread::Builder::new()
        .name("ramses-tx".to_string())
        .spawn(move || {
            let mut writer = writer;
            while let Some(line) = line_rx.blocking_recv() {
                if let Err(e) = writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\r\n"))
                    .and_then(|_| writer.flush())
                {
                    warn!("Serial write failed: {}", e);
                    break;
                }
            }
            debug!("Serial writer thread exiting");
        })
        .map_err(|e| Error::transport(format!("Failed to spawn writer thread: {}", e)))?;

    Ok(PortChannels { line_tx, pkt_rx })
}

/// An in-process loopback pair, used by tests and dry-run mode
///
/// Returns the transport-facing [`PortChannels`] plus the far end: a
/// receiver yielding every line the transport writes, and a sender for
/// injecting frame text as if it had arrived over RF.
pub fn loopback(capacity: usize) -> (PortChannels, mpsc::Receiver<String>, mpsc::Sender<String>) {
    let (line_tx, line_rx) = mpsc::channel::<String>(capacity);
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(capacity);
    let (pkt_tx, pkt_rx) = mpsc::channel::<Result<Packet>>(capacity);

    tokio::spawn(async move {
        let mut codec = LineCodec::new();
        while let Some(text) = frame_rx.recv().await {
            let mut buf = BytesMut::from(text.as_bytes());
            buf.extend_from_slice(b"\r\n");
            while let Ok(Some(pkt)) = codec.decode(&mut buf) {
                if pkt_tx.send(pkt).await.is_err() {
                    return;
                }
            }
        }
    });

    (PortChannels { line_tx, pkt_rx }, line_rx, frame_tx)
}
