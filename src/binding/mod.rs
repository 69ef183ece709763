//! Device binding
//!
//! RAMSES devices pair over 1FC9: a supplicant casts an Offer naming the
//! codes it will transmit, a respondent answers with an addressed Accept,
//! and the supplicant closes with a Confirm. The state machine lives in
//! [`state`]; the drivers here run it over a [`QosTransport`].

pub mod state;

use std::time::Duration;

use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info};

use crate::core::{Code, Error, Result};
use crate::protocol::address::DeviceAddress;
use crate::protocol::command::Command;
use crate::protocol::frame::Packet;
use crate::protocol::transport::QosTransport;

pub use state::{BindContext, BindEvent, BindRole, BindState, BIND_SEND_LIMIT};

/// Handshake timing; the send limit is fixed in [`state`]
#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// How long to wait for the counterpart message
    pub wait_timeout: Duration,
    /// Quiet period after which an accepted binding is considered settled
    pub quiesce_timeout: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        BindingConfig {
            wait_timeout: Duration::from_secs(3),
            quiesce_timeout: Duration::from_secs(3),
        }
    }
}

/// One `{idx}{code}{device_hex}` triple from a 1FC9 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindTriple {
    pub idx: String,
    pub code: Code,
    pub device_hex: String,
}

/// Splits a 1FC9 payload into its triples
pub fn parse_triples(payload: &str) -> Result<Vec<BindTriple>> {
    if payload.len() % 12 != 0 || payload.is_empty() {
        return Err(Error::bind_flow(format!(
            "Malformed 1FC9 payload: {payload:?}"
        )));
    }
    (0..payload.len())
        .step_by(12)
        .map(|at| {
            Ok(BindTriple {
                idx: payload[at..at + 2].to_string(),
                code: Code::from_hex(&payload[at + 2..at + 6])?,
                device_hex: payload[at + 6..at + 12].to_string(),
            })
        })
        .collect()
}

fn is_offer(pkt: &Packet, us: &DeviceAddress) -> bool {
    pkt.code == Code::RF_BIND
        && pkt.verb == crate::core::Verb::I
        && pkt.src == pkt.dst
        && pkt.src != *us
}

fn is_confirm(pkt: &Packet, supplicant: &DeviceAddress, us: &DeviceAddress) -> bool {
    pkt.code == Code::RF_BIND
        && pkt.verb == crate::core::Verb::I
        && pkt.src == *supplicant
        && pkt.dst == *us
}

/// Binds as the respondent: waits for an Offer covering one of `codes`,
/// accepts it, and settles once the supplicant's Confirms go quiet
///
/// Returns the supplicant's address and the bound code.
pub async fn bind_as_respondent(
    transport: &QosTransport,
    us: &DeviceAddress,
    codes: &[Code],
    config: &BindingConfig,
) -> Result<(DeviceAddress, Code)> {
    let mut ctx = BindContext::new(BindRole::Respondent);
    let mut inbound = transport.subscribe();

    // Listening: scan for an acceptable Offer
    let (supplicant, code) = loop {
        let pkt = match timeout(config.wait_timeout, inbound.recv()).await {
            Ok(Ok(pkt)) => pkt,
            Ok(Err(_)) => return Err(Error::transport("Transport task has stopped")),
            Err(_) => {
                ctx.advance(BindEvent::WaitTimeout)?;
                unreachable!("WaitTimeout always errors while Listening");
            }
        };
        if !is_offer(&pkt, us) {
            continue;
        }
        let triples = parse_triples(&pkt.payload)?;
        let Some(triple) = triples.iter().find(|t| codes.contains(&t.code)) else {
            debug!("Ignoring an Offer with no acceptable code: {}", pkt);
            continue;
        };
        ctx.advance(BindEvent::RxOffer { from_self: false })?;
        break (pkt.src.clone(), triple.code);
    };
    info!("Accepting a bind Offer of {} from {}", code, supplicant);

    // Accepting: the Accept's expected reply is the Confirm
    let accept = Command::put_bind_accept(us, &supplicant, code)?;
    ctx.advance(BindEvent::TxAccept)?;
    match timeout(config.wait_timeout, transport.send(accept)).await {
        Ok(Ok(Some(_confirm))) => {
            ctx.advance(BindEvent::RxConfirm { from_self: false })?;
        }
        Ok(Ok(None)) | Ok(Err(Error::Timeout(_))) | Err(_) => {
            ctx.advance(BindEvent::WaitTimeout)?;
        }
        Ok(Err(e)) => return Err(e),
    }

    // BoundAccepted: absorb Confirm retransmits until things go quiet
    let quiesce = Instant::now() + config.quiesce_timeout;
    while ctx.state() == BindState::BoundAccepted {
        tokio::select! {
            pkt = inbound.recv() => {
                if let Ok(pkt) = pkt {
                    if is_confirm(&pkt, &supplicant, us) {
                        ctx.advance(BindEvent::RxConfirm { from_self: false })?;
                    }
                }
            }
            _ = sleep_until(quiesce) => {
                ctx.advance(BindEvent::QuiesceTimeout)?;
            }
        }
    }
    info!("Bound to {} for {}", supplicant, code);
    Ok((supplicant, code))
}

/// Binds as the supplicant: casts an Offer for `codes`, awaits the Accept,
/// and confirms it
///
/// Returns the respondent's address and the accepted code.
pub async fn bind_as_supplicant(
    transport: &QosTransport,
    us: &DeviceAddress,
    codes: &[Code],
    config: &BindingConfig,
) -> Result<(DeviceAddress, Code)> {
    let mut ctx = BindContext::new(BindRole::Supplicant);

    // Offering: the Offer's expected reply is the Accept
    let offer = Command::put_bind_offer(us, codes)?;
    ctx.advance(BindEvent::TxOffer)?;
    let accept = match timeout(config.wait_timeout, transport.send(offer)).await {
        Ok(Ok(Some(accept))) => accept,
        Ok(Ok(None)) | Ok(Err(Error::Timeout(_))) | Err(_) => {
            ctx.advance(BindEvent::WaitTimeout)?;
            unreachable!("WaitTimeout always errors while Offered");
        }
        Ok(Err(e)) => return Err(e),
    };
    let respondent = accept.src.clone();
    let triples = parse_triples(&accept.payload)?;
    let code = triples
        .first()
        .map(|t| t.code)
        .ok_or_else(|| Error::bind_flow("Accept carried no code"))?;
    ctx.advance(BindEvent::RxAccept { from_self: false })?;
    info!("Bind Accepted by {} for {}", respondent, code);

    // Confirming: retransmit for lossy RF; the third send settles it
    while ctx.state() != BindState::Bound {
        let confirm = Command::put_bind_confirm(us, &respondent, code)?;
        transport.send(confirm).await?;
        ctx.advance(BindEvent::TxConfirm)?;
    }
    info!("Bound to {} for {}", respondent, code);
    Ok((respondent, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::port;
    use crate::protocol::transport::TransportConfig;
    use tokio::sync::mpsc;

    fn supplicant_addr() -> DeviceAddress {
        DeviceAddress::from_id("34:021943").unwrap()
    }

    fn respondent_addr() -> DeviceAddress {
        DeviceAddress::from_id("01:145038").unwrap()
    }

    #[test]
    fn test_parse_triples() {
        let triples = parse_triples("0023098855B7001FC98855B7").unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].code, Code::SETPOINT);
        assert_eq!(triples[1].code, Code::RF_BIND);
        assert_eq!(triples[1].device_hex, "8855B7");
        assert!(parse_triples("0023").is_err());
    }

    /// Scripted far end playing the respondent controller
    fn scripted_respondent(mut line_rx: mpsc::Receiver<String>, frame_tx: mpsc::Sender<String>) {
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                // echo everything, as the dongle does
                if frame_tx.send(format!("000 {line}")).await.is_err() {
                    break;
                }
                if line.contains("1FC9") && line.starts_with(" I --- 34:021943 --:------") {
                    let accept =
                        "065  W --- 01:145038 34:021943 --:------ 1FC9 006 00230906368E";
                    let _ = frame_tx.send(accept.to_string()).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_supplicant_three_packet_exchange() {
        let (channels, line_rx, frame_tx) = port::loopback(32);
        scripted_respondent(line_rx, frame_tx);
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let (respondent, code) = bind_as_supplicant(
            &transport,
            &supplicant_addr(),
            &[Code::SETPOINT],
            &BindingConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(respondent, respondent_addr());
        assert_eq!(code, Code::SETPOINT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplicant_times_out_without_accept() {
        let (channels, mut line_rx, _frame_tx) = port::loopback(32);
        // drain writes so the channel never fills
        tokio::spawn(async move { while line_rx.recv().await.is_some() {} });
        let transport = QosTransport::spawn(channels, TransportConfig::default());

        let err = bind_as_supplicant(
            &transport,
            &supplicant_addr(),
            &[Code::SETPOINT],
            &BindingConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BindTimeout(_)), "{err}");
    }

    #[tokio::test]
    async fn test_respondent_three_packet_exchange() {
        crate::util::init_tracing();
        let (channels, line_rx, frame_tx) = port::loopback(32);
        let transport = QosTransport::spawn(channels, TransportConfig::default());
        let config = BindingConfig {
            wait_timeout: Duration::from_secs(3),
            quiesce_timeout: Duration::from_millis(200),
        };

        // Scripted supplicant: cast the Offer, confirm on seeing the Accept
        let far_tx = frame_tx.clone();
        tokio::spawn(async move {
            let mut line_rx = line_rx;
            let offer =
                "045  I --- 34:021943 --:------ 34:021943 1FC9 012 0023098855B7001FC98855B7";
            let _ = far_tx.send(offer.to_string()).await;
            while let Some(line) = line_rx.recv().await {
                if far_tx.send(format!("000 {line}")).await.is_err() {
                    break;
                }
                if line.contains("1FC9") && line.starts_with(" W ---") {
                    let confirm =
                        "052  I --- 34:021943 01:145038 --:------ 1FC9 006 0023098855B7";
                    let _ = far_tx.send(confirm.to_string()).await;
                }
            }
        });

        let (supplicant, code) = bind_as_respondent(
            &transport,
            &respondent_addr(),
            &[Code::SETPOINT, Code::WINDOW_STATE],
            &config,
        )
        .await
        .unwrap();
        assert_eq!(supplicant, supplicant_addr());
        assert_eq!(code, Code::SETPOINT);
    }
}
