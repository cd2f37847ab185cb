//! Per-session state: crypto, flow control, and the registration state
//! machine (server view, §4.4).

use ntp_flow::{ContiguousErrors, FlowControl};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingR2,
    Active,
}

/// A live session, keyed externally by its 16-byte session-id.
pub struct Session {
    pub state: SessionState,
    pub crypto: ntp_crypto::Session,
    pub flow: FlowControl<Vec<u8>>,
    pub contiguous_errors: ContiguousErrors,
    pub peer_addr: SocketAddr,
    /// Set once `generate_challenge` has been issued, so a matching
    /// `REGISTER_CHALLENGE2` can be checked against the right control value.
    pub pending_control: Option<[u8; ntp_crypto::CONTROL_LEN]>,
}

impl Session {
    pub fn new_awaiting_r2(crypto: ntp_crypto::Session, peer_addr: SocketAddr) -> Self {
        Self {
            state: SessionState::AwaitingR2,
            crypto,
            flow: FlowControl::new(),
            contiguous_errors: ContiguousErrors::new(),
            peer_addr,
            pending_control: None,
        }
    }

    /// A session that is already authenticated, entering straight into
    /// `Active` — either side of a just-completed handshake, or a 0-RTT
    /// revival once the server has confirmed it.
    pub fn new_active(crypto: ntp_crypto::Session, peer_addr: SocketAddr) -> Self {
        Self {
            state: SessionState::Active,
            crypto,
            flow: FlowControl::new(),
            contiguous_errors: ContiguousErrors::new(),
            peer_addr,
            pending_control: None,
        }
    }

    pub fn activate(&mut self) {
        self.state = SessionState::Active;
    }
}
