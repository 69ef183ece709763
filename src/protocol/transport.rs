//! QoS transmit layer
//!
//! One supervisor task owns every piece of transmit state: the priority
//! queue of pending commands, the single in-flight slot, and its timers.
//! Callers get a cheap cloneable handle whose `send` resolves once the
//! exchange completes or times out. At most one want-reply exchange is
//! outstanding at a time, so retries are never interleaved with new sends.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::core::{Code, Error, Qos, Result, MAX_SEND_TIMEOUT, QOS_MAX_BACKOFF, QOS_RX_TIMEOUT};
use super::command::Command;
use super::frame::Packet;
use super::port::PortChannels;

/// Transport-wide settings; per-command settings live in [`Qos`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long to wait for a reply once the echo is seen
    pub rx_timeout: Duration,
    /// Bound on the backoff exponent
    pub max_backoff: u32,
    /// Hard ceiling on any one exchange, whatever its QoS says
    pub send_ceiling: Duration,
    /// Capacity of the submission queue
    pub queue_capacity: usize,
    /// Capacity of the inbound packet fanout
    pub fanout_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            rx_timeout: QOS_RX_TIMEOUT,
            max_backoff: QOS_MAX_BACKOFF,
            send_ceiling: MAX_SEND_TIMEOUT,
            queue_capacity: 100,
            fanout_capacity: 100,
        }
    }
}

struct Pending {
    cmd: Command,
    done: oneshot::Sender<Result<Option<Packet>>>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmd == other.cmd
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmd.cmp(&other.cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    AwaitingEcho,
    AwaitingReply,
}

struct InFlight {
    cmd: Command,
    done: oneshot::Sender<Result<Option<Packet>>>,
    state: SendState,
    retries_left: u8,
    backoff: u32,
    deadline: Instant,
    expires: Instant,
}

/// Handle to the supervisor task
#[derive(Clone)]
pub struct QosTransport {
    cmd_tx: mpsc::Sender<Pending>,
    fanout: broadcast::Sender<Packet>,
}

impl QosTransport {
    /// Spawns the supervisor over a port's channel pair
    pub fn spawn(channels: PortChannels, config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity);
        let (fanout, _) = broadcast::channel(config.fanout_capacity);

        let supervisor = Supervisor {
            config,
            line_tx: channels.line_tx,
            pkt_rx: channels.pkt_rx,
            cmd_rx,
            fanout: fanout.clone(),
            queue: BinaryHeap::new(),
            in_flight: None,
        };
        tokio::spawn(supervisor.run());

        QosTransport { cmd_tx, fanout }
    }

    /// Sends a command with its built-in QoS
    ///
    /// Resolves with the reply packet, `None` when no reply was expected,
    /// or `Error::Timeout` when retries are exhausted.
    pub async fn send(&self, cmd: Command) -> Result<Option<Packet>> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Pending { cmd, done })
            .await
            .map_err(|_| Error::transport("Transport task has stopped"))?;
        rx.await
            .map_err(|_| Error::transport("Transport task has stopped"))?
    }

    /// Sends with the built-in QoS replaced
    pub async fn send_with_qos(&self, cmd: Command, qos: Qos) -> Result<Option<Packet>> {
        self.send(cmd.with_qos(qos)).await
    }

    /// Subscribes to every structurally-valid inbound packet
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.fanout.subscribe()
    }
}

struct Supervisor {
    config: TransportConfig,
    line_tx: mpsc::Sender<String>,
    pkt_rx: mpsc::Receiver<Result<Packet>>,
    cmd_rx: mpsc::Receiver<Pending>,
    fanout: broadcast::Sender<Packet>,
    queue: BinaryHeap<Reverse<Pending>>,
    in_flight: Option<InFlight>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let deadline = self
                .in_flight
                .as_ref()
                .map(|f| f.deadline.min(f.expires));
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                pending = self.cmd_rx.recv() => match pending {
                    Some(pending) => self.queue.push(Reverse(pending)),
                    None => break, // every handle dropped
                },
                pkt = self.pkt_rx.recv() => match pkt {
                    Some(Ok(pkt)) => self.handle_packet(pkt),
                    Some(Err(e)) => debug!("Dropped inbound frame: {}", e),
                    None => break, // port gone
                },
                _ = timer => self.handle_timeout().await,
            }

            self.dispatch().await;
        }
        debug!("Transport supervisor exiting");
    }

    /// Starts the best queued command when the wire is idle
    async fn dispatch(&mut self) {
        while self.in_flight.is_none() {
            let Some(Reverse(pending)) = self.queue.pop() else {
                return;
            };
            if pending.done.is_closed() {
                continue; // caller gave up while queued
            }
            let Pending { cmd, done } = pending;

            // Announce before transmitting under another device's id, so
            // listeners can tell engine traffic from the real device's.
            if cmd.src.class() != "18" && cmd.code != Code::PUZZLE {
                match Command::put_puzzle(&format!("{} v{}", cmd.src.id(), crate::VERSION)) {
                    Ok(puzzle) => {
                        if self.line_tx.send(puzzle.to_string()).await.is_err() {
                            let _ = done.send(Err(Error::transport("Serial port closed")));
                            return;
                        }
                    }
                    Err(e) => warn!("Could not announce impersonation: {}", e),
                }
            }

            trace!("Transmitting: {}", cmd);
            if self.line_tx.send(cmd.to_string()).await.is_err() {
                let _ = done.send(Err(Error::transport("Serial port closed")));
                return;
            }
            let now = Instant::now();
            self.in_flight = Some(InFlight {
                state: SendState::AwaitingEcho,
                retries_left: cmd.qos.retry_limit,
                backoff: 0,
                deadline: now + cmd.qos.tx_timeout,
                expires: now + self.config.send_ceiling,
                cmd,
                done,
            });
        }
    }

    fn handle_packet(&mut self, pkt: Packet) {
        let _ = self.fanout.send(pkt.clone());

        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        let hdr = pkt.tx_header();

        match flight.state {
            SendState::AwaitingEcho => {
                if hdr.is_some() && hdr == flight.cmd.tx_header() {
                    if flight.cmd.rx_header().is_none() {
                        trace!("Echo confirmed, no reply expected: {}", pkt);
                        self.complete(Ok(None));
                    } else {
                        trace!("Echo confirmed, awaiting reply: {}", pkt);
                        flight.state = SendState::AwaitingReply;
                        flight.deadline = Instant::now() + self.config.rx_timeout;
                    }
                }
            }
            SendState::AwaitingReply => {
                if hdr.is_some() && hdr == flight.cmd.rx_header() {
                    trace!("Reply received: {}", pkt);
                    self.complete(Ok(Some(pkt)));
                } else if hdr.is_some() && hdr == flight.cmd.tx_header() {
                    // A retransmit duplicate of our own frame only re-arms
                    // the reply timer.
                    flight.deadline = Instant::now() + self.config.rx_timeout;
                }
            }
        }
    }

    async fn handle_timeout(&mut self) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        let now = Instant::now();
        if flight.retries_left == 0 || now >= flight.expires {
            let waiting = match flight.state {
                SendState::AwaitingEcho => "echo",
                SendState::AwaitingReply => "reply",
            };
            let header = flight.cmd.tx_header().unwrap_or("?").to_string();
            debug!("Exchange failed, no {} for {}", waiting, header);
            self.complete(Err(Error::timeout(format!("No {waiting} for {header}"))));
            return;
        }

        flight.retries_left -= 1;
        if !flight.cmd.qos.disable_backoff {
            flight.backoff = (flight.backoff + 1).min(self.config.max_backoff);
        }
        trace!("Retransmitting ({} left): {}", flight.retries_left, flight.cmd);
        if self.line_tx.send(flight.cmd.to_string()).await.is_err() {
            self.complete(Err(Error::transport("Serial port closed")));
            return;
        }
        flight.state = SendState::AwaitingEcho;
        flight.deadline = now + flight.cmd.qos.tx_timeout * 2u32.pow(flight.backoff);
    }

    fn complete(&mut self, result: Result<Option<Packet>>) {
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use crate::protocol::address::DeviceAddress;
    use crate::protocol::port;

    fn ctl() -> DeviceAddress {
        DeviceAddress::from_id("01:145038").unwrap()
    }

    /// Far end that echoes every line straight back, as the dongle does
    fn echoing_far_end(
        mut line_rx: mpsc::Receiver<String>,
        frame_tx: mpsc::Sender<String>,
        reply: Option<&'static str>,
    ) {
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if frame_tx.send(format!("000 {line}")).await.is_err() {
                    break;
                }
                if let Some(reply) = reply {
                    if line.contains("2309") {
                        let _ = frame_tx.send(reply.to_string()).await;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_resolves_with_reply() {
        let (channels, line_rx, frame_tx) = port::loopback(16);
        echoing_far_end(
            line_rx,
            frame_tx,
            Some("045 RP --- 01:145038 18:000730 --:------ 2309 003 0107D0"),
        );
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let cmd = Command::get_zone_setpoint(&ctl(), 1).unwrap();
        let reply = transport.send(cmd).await.unwrap().unwrap();
        assert_eq!(reply.payload, "0107D0");
    }

    #[tokio::test]
    async fn test_announce_completes_on_echo() {
        let (channels, line_rx, frame_tx) = port::loopback(16);
        echoing_far_end(line_rx, frame_tx, None);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let dev = DeviceAddress::from_id("18:000730").unwrap();
        let cmd = Command::put_sensor_temp(&dev, Some(21.5)).unwrap();
        let reply = transport.send(cmd).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_retransmits_then_times_out() {
        let (channels, mut line_rx, _frame_tx) = port::loopback(16);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let cmd = Command::get_zone_setpoint(&ctl(), 1)
            .unwrap()
            .with_qos(Qos {
                priority: Priority::Default,
                retry_limit: 2,
                tx_timeout: Duration::from_millis(50),
                disable_backoff: true,
            });
        let started = Instant::now();
        let err = transport.send(cmd).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");

        // Three 50ms echo windows: the original send plus two retransmits
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "failed at {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "failed at {elapsed:?}");

        let mut lines = Vec::new();
        while let Ok(line) = line_rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 3, "one send and exactly two retransmits");
        assert_eq!(lines[0], lines[1]);
        assert_eq!(lines[1], lines[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_the_echo_window() {
        let (channels, _line_rx, _frame_tx) = port::loopback(16);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let cmd = Command::get_zone_setpoint(&ctl(), 1)
            .unwrap()
            .with_qos(Qos {
                priority: Priority::Default,
                retry_limit: 2,
                tx_timeout: Duration::from_millis(50),
                disable_backoff: false,
            });
        let started = Instant::now();
        let _ = transport.send(cmd).await;
        // 50 + 100 + 200 ms
        assert_eq!(started.elapsed(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_orders_dispatch() {
        let (channels, mut line_rx, _frame_tx) = port::loopback(32);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let quick_fail = |priority| Qos {
            priority,
            retry_limit: 0,
            tx_timeout: Duration::from_millis(50),
            disable_backoff: true,
        };
        // The first command occupies the wire; the other two queue behind
        // it and must dispatch by priority, not submission order.
        let first = Command::get_zone_setpoint(&ctl(), 1)
            .unwrap()
            .with_qos(quick_fail(Priority::Default));
        let low = Command::get_zone_setpoint(&ctl(), 2)
            .unwrap()
            .with_qos(quick_fail(Priority::Low));
        let high = Command::get_zone_setpoint(&ctl(), 3)
            .unwrap()
            .with_qos(quick_fail(Priority::Highest));

        let t = transport.clone();
        let a = tokio::spawn(async move { t.send(first).await });
        let occupying = line_rx.recv().await.unwrap();
        assert!(occupying.ends_with("001 01"), "{occupying}");

        let t = transport.clone();
        let b = tokio::spawn(async move { t.send(low).await });
        let t = transport.clone();
        let c = tokio::spawn(async move { t.send(high).await });

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert!(c.await.unwrap().is_err());

        let mut zones = Vec::new();
        while let Ok(line) = line_rx.try_recv() {
            zones.push(line.split(' ').next_back().unwrap().to_string());
        }
        assert_eq!(zones, ["03", "02"]);
    }

    #[tokio::test]
    async fn test_impersonation_is_announced_first() {
        let (channels, mut line_rx, _frame_tx) = port::loopback(16);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let sensor = DeviceAddress::from_id("34:021943").unwrap();
        let t = transport.clone();
        tokio::spawn(async move {
            let _ = t
                .send(Command::put_sensor_temp(&sensor, Some(19.0)).unwrap())
                .await;
        });

        let announce = line_rx.recv().await.unwrap();
        assert!(announce.contains("7FFF"), "{announce}");
        let frame = line_rx.recv().await.unwrap();
        assert!(frame.contains("30C9"), "{frame}");
        assert!(frame.starts_with(" I --- 34:021943"), "{frame}");
    }
}
