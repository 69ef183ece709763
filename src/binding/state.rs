//! Binding handshake state machine
//!
//! The handshake is a three-packet 1FC9 exchange: the supplicant casts an
//! Offer, the respondent answers with an addressed Accept, the supplicant
//! closes with a Confirm (retransmitted a couple of times for lossy RF).
//! Each side runs one [`BindContext`] holding the current [`BindState`];
//! every transition goes through the table in [`BindContext::advance`], so
//! there is exactly one place where a wrong-phase event can be rejected.

use tracing::warn;

use crate::core::{Error, Result};

/// Which side of the handshake this context plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindRole {
    /// Listens for an Offer and accepts it
    Respondent,
    /// Casts the Offer and confirms the Accept
    Supplicant,
}

/// Handshake phase
///
/// `Unknown` is absorbing: the first event in it logs a warning, everything
/// after is silently swallowed. A context that has fallen out of the flow
/// must never take the engine down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    // respondent path
    Listening,
    Accepting,
    Accepted,
    BoundAccepted,
    // supplicant path
    Offering,
    Offered,
    Confirming,
    Confirmed,
    // terminal
    Bound,
    Unknown,
}

impl BindState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BindState::Bound | BindState::Unknown)
    }
}

/// A handshake event, from either the wire or our own transmit path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindEvent {
    /// Offer seen on the wire; `from_self` marks our own echo
    RxOffer { from_self: bool },
    RxAccept { from_self: bool },
    RxConfirm { from_self: bool },
    TxOffer,
    TxAccept,
    TxConfirm,
    /// No counterpart message arrived in time
    WaitTimeout,
    /// The post-confirm quiet period elapsed
    QuiesceTimeout,
}

/// Per-device handshake bookkeeping
#[derive(Debug)]
pub struct BindContext {
    role: BindRole,
    state: BindState,
    sends: u8,
    /// Confirms observed while BoundAccepted, counted toward promotion
    confirms_seen: u8,
    warned: bool,
}

/// Retransmit allowance for any one handshake message
pub const BIND_SEND_LIMIT: u8 = 3;

/// Confirm retransmits that promote either side to Bound
pub const CONFIRM_PROMOTE_COUNT: u8 = 3;

impl BindContext {
    pub fn new(role: BindRole) -> Self {
        let state = match role {
            BindRole::Respondent => BindState::Listening,
            BindRole::Supplicant => BindState::Offering,
        };
        BindContext {
            role,
            state,
            sends: 0,
            confirms_seen: 0,
            warned: false,
        }
    }

    pub fn role(&self) -> BindRole {
        self.role
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    /// Applies one event, returning the resulting state
    ///
    /// Wrong-phase events fail with `Error::BindFlow` without changing
    /// state, except where the flow explicitly tolerates them (our own
    /// echoes, duplicate Offers while already mid-handshake).
    pub fn advance(&mut self, event: BindEvent) -> Result<BindState> {
        use BindEvent::*;
        use BindState::*;

        if self.state == Unknown {
            if !self.warned {
                self.warned = true;
                warn!("Bind context is in an unknown state, ignoring {:?}", event);
            }
            return Ok(Unknown);
        }

        let next = match (self.role, self.state, event) {
            // -- respondent ---------------------------------------------
            (BindRole::Respondent, Listening, RxOffer { from_self: false }) => Accepting,
            (BindRole::Respondent, Accepting, TxAccept) => {
                self.sends += 1;
                Accepted
            }
            // the supplicant retransmits its Offer until our Accept lands
            (BindRole::Respondent, Accepted, RxOffer { from_self: false }) => Accepted,
            (BindRole::Respondent, Accepted, RxAccept { from_self: true }) => Accepted,
            (BindRole::Respondent, Accepted, TxAccept) => {
                self.sends += 1;
                if self.sends > BIND_SEND_LIMIT {
                    self.fall_out("Accept retransmit limit reached")?
                } else {
                    Accepted
                }
            }
            (BindRole::Respondent, Accepted, RxConfirm { from_self: false }) => {
                self.confirms_seen = 1;
                BoundAccepted
            }
            (BindRole::Respondent, BoundAccepted, RxConfirm { from_self: false }) => {
                self.confirms_seen += 1;
                if self.confirms_seen >= CONFIRM_PROMOTE_COUNT {
                    Bound
                } else {
                    BoundAccepted
                }
            }
            (BindRole::Respondent, BoundAccepted, QuiesceTimeout) => Bound,

            // -- supplicant ---------------------------------------------
            (BindRole::Supplicant, Offering, TxOffer) => {
                self.sends += 1;
                Offered
            }
            (BindRole::Supplicant, Offered, RxOffer { from_self: true }) => Offered,
            (BindRole::Supplicant, Offered, TxOffer) => {
                self.sends += 1;
                if self.sends > BIND_SEND_LIMIT {
                    self.fall_out("Offer retransmit limit reached")?
                } else {
                    Offered
                }
            }
            (BindRole::Supplicant, Offered, RxAccept { from_self: false }) => Confirming,
            (BindRole::Supplicant, Confirming, TxConfirm) => {
                self.sends = 1;
                Confirmed
            }
            (BindRole::Supplicant, Confirmed, RxConfirm { from_self: true }) => Confirmed,
            (BindRole::Supplicant, Confirmed, RxAccept { from_self: false }) => Confirmed,
            (BindRole::Supplicant, Confirmed, TxConfirm) => {
                self.sends += 1;
                if self.sends >= CONFIRM_PROMOTE_COUNT {
                    Bound
                } else {
                    Confirmed
                }
            }

            // -- timers -------------------------------------------------
            (_, Listening | Offered | Accepted | Confirming, WaitTimeout) => {
                self.fall_out("Timed out awaiting the counterpart message")?
            }

            (role, state, event) => {
                return Err(Error::bind_flow(format!(
                    "{role:?} cannot take {event:?} in {state:?}"
                )));
            }
        };

        self.state = next;
        Ok(next)
    }

    /// Transitions to Unknown, reporting why as the error
    fn fall_out(&mut self, reason: &str) -> Result<BindState> {
        self.state = BindState::Unknown;
        if self.sends > BIND_SEND_LIMIT {
            Err(Error::bind_retry(reason))
        } else {
            Err(Error::bind_timeout(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BindEvent::*;
    use BindState::*;

    #[test]
    fn test_respondent_happy_path() {
        let mut ctx = BindContext::new(BindRole::Respondent);
        assert_eq!(ctx.state(), Listening);
        assert_eq!(ctx.advance(RxOffer { from_self: false }).unwrap(), Accepting);
        assert_eq!(ctx.advance(TxAccept).unwrap(), Accepted);
        assert_eq!(
            ctx.advance(RxConfirm { from_self: false }).unwrap(),
            BoundAccepted,
        );
        assert_eq!(ctx.advance(QuiesceTimeout).unwrap(), Bound);
    }

    #[test]
    fn test_respondent_promotes_on_third_confirm() {
        let mut ctx = BindContext::new(BindRole::Respondent);
        ctx.advance(RxOffer { from_self: false }).unwrap();
        ctx.advance(TxAccept).unwrap();
        ctx.advance(RxConfirm { from_self: false }).unwrap();
        assert_eq!(
            ctx.advance(RxConfirm { from_self: false }).unwrap(),
            BoundAccepted,
        );
        assert_eq!(ctx.advance(RxConfirm { from_self: false }).unwrap(), Bound);
    }

    #[test]
    fn test_supplicant_happy_path() {
        let mut ctx = BindContext::new(BindRole::Supplicant);
        assert_eq!(ctx.advance(TxOffer).unwrap(), Offered);
        assert_eq!(ctx.advance(RxOffer { from_self: true }).unwrap(), Offered);
        assert_eq!(ctx.advance(RxAccept { from_self: false }).unwrap(), Confirming);
        assert_eq!(ctx.advance(TxConfirm).unwrap(), Confirmed);
        assert_eq!(ctx.advance(TxConfirm).unwrap(), Confirmed);
        assert_eq!(ctx.advance(TxConfirm).unwrap(), Bound);
    }

    #[test]
    fn test_offer_retry_limit_falls_out() {
        let mut ctx = BindContext::new(BindRole::Supplicant);
        ctx.advance(TxOffer).unwrap();
        ctx.advance(TxOffer).unwrap();
        ctx.advance(TxOffer).unwrap();
        // the 4th Offer exceeds the send limit
        let err = ctx.advance(TxOffer).unwrap_err();
        assert!(matches!(err, crate::core::Error::BindRetry(_)), "{err}");
        assert_eq!(ctx.state(), Unknown);
    }

    #[test]
    fn test_unknown_absorbs_and_warns_once() {
        let mut ctx = BindContext::new(BindRole::Supplicant);
        ctx.advance(TxOffer).unwrap();
        let _ = ctx.advance(WaitTimeout);
        assert_eq!(ctx.state(), Unknown);
        // absorbed, not re-raised
        assert_eq!(ctx.advance(RxAccept { from_self: false }).unwrap(), Unknown);
        assert_eq!(ctx.advance(TxConfirm).unwrap(), Unknown);
    }

    #[test]
    fn test_wrong_phase_event_is_a_flow_error() {
        let mut ctx = BindContext::new(BindRole::Respondent);
        let err = ctx.advance(RxConfirm { from_self: false }).unwrap_err();
        assert!(matches!(err, crate::core::Error::BindFlow(_)), "{err}");
        // state unchanged, the flow can still proceed
        assert_eq!(ctx.state(), Listening);
        assert_eq!(ctx.advance(RxOffer { from_self: false }).unwrap(), Accepting);
    }

    #[test]
    fn test_wait_timeout_while_listening() {
        let mut ctx = BindContext::new(BindRole::Respondent);
        let err = ctx.advance(WaitTimeout).unwrap_err();
        assert!(matches!(err, crate::core::Error::BindTimeout(_)), "{err}");
        assert_eq!(ctx.state(), Unknown);
    }
}
