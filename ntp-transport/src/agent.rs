//! The agent-side counterpart to [`crate::endpoint::ServerEndpoint`]: issues
//! REGISTER or a 0-RTT WAKE at startup, drives the handshake through to
//! ACTIVE, and hands decoded PUSH_SCHEMAS/metric traffic back to the
//! caller's I/O loop.
//!
//! An agent only ever talks to one server, so unlike the server's
//! session-per-peer `DashMap` this holds a single `Mutex<AgentState>`.

use crate::keystore::Keystore;
use crate::session::Session;
use ntp_proto::{Datagram, DatagramType, PrivateHeader, RejectReason};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Proto(#[from] ntp_proto::ProtoError),
    #[error("inbound datagram did not match the agent's current state")]
    UnexpectedDatagram,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// What the caller's I/O loop must do after a call into the agent core.
#[derive(Debug, Clone)]
pub enum AgentAction {
    Send { to: SocketAddr, bytes: Vec<u8> },
    PersistKeystore(Keystore),
    DeleteKeystore,
    /// PUSH_SCHEMAS decoded into the agent's task subset.
    TasksReceived(BTreeMap<String, spack::Task>),
    SendMetrics { to: SocketAddr, bytes: Vec<u8> },
    /// A terminal CONNECTION_REJECTED outside of a 0-RTT attempt: the agent
    /// loop should log `reason` and exit non-zero.
    Terminate(RejectReason),
}

enum AgentState {
    Idle,
    AwaitingChallenge { crypto: ntp_crypto::Session },
    AwaitingRevivalConfirm { session: Session },
    Active { session: Session },
}

fn next_private_header(seq: u32, ack: u32, nack: u32, dtype: DatagramType) -> PrivateHeader {
    PrivateHeader {
        version: ntp_proto::header::PROTOCOL_VERSION,
        seq,
        ack,
        nack,
        dtype: dtype as u32,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct AgentEndpoint {
    server_addr: SocketAddr,
    state: Mutex<AgentState>,
    session_id: Mutex<[u8; 16]>,
    seed_source: AtomicU32,
}

impl AgentEndpoint {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            state: Mutex::new(AgentState::Idle),
            session_id: Mutex::new([0u8; 16]),
            seed_source: AtomicU32::new(1),
        }
    }

    /// The session-id this agent is currently registered under, or all-zero
    /// before a handshake has completed.
    pub fn session_id(&self) -> [u8; 16] {
        *self.session_id.lock().unwrap()
    }

    fn set_session_id(&self, id: [u8; 16]) {
        *self.session_id.lock().unwrap() = id;
    }

    /// Starts a fresh handshake: a REGISTER carrying a new ephemeral public
    /// key, addressed with the placeholder all-zero session-id.
    pub fn start_register(&self) -> Vec<AgentAction> {
        let (next, actions) = self.build_register();
        *self.state.lock().unwrap() = next;
        self.set_session_id([0u8; 16]);
        actions
    }

    /// Builds the REGISTER state transition without touching `self.state` —
    /// callers that already hold the state lock (e.g. a revival-rejection
    /// fallback) can fold the result in directly instead of deadlocking on
    /// a re-entrant lock.
    fn build_register(&self) -> (AgentState, Vec<AgentAction>) {
        let crypto = ntp_crypto::Session::new(ntp_crypto::Curve::P256);
        let public_key = crypto.public_key().unwrap().as_bytes().to_vec();
        let dg = Datagram::Register { public_key };
        let header = next_private_header(1, 0, 0, DatagramType::Register);
        let bytes = match ntp_proto::encode([0u8; 16], header, &dg, None) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode REGISTER");
                return (AgentState::Idle, Vec::new());
            }
        };
        (
            AgentState::AwaitingChallenge { crypto },
            vec![AgentAction::Send { to: self.server_addr, bytes }],
        )
    }

    /// Attempts 0-RTT revival from a persisted keystore: a WAKE encrypted
    /// under the revived session key, sent before any handshake.
    pub fn start_revival(&self, keystore: Keystore) -> Vec<AgentAction> {
        let crypto = match ntp_crypto::Session::new_revived(keystore.secret, keystore.salt) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "keystore failed to reconstruct a key schedule, falling back to REGISTER");
                return self.start_register();
            }
        };
        let session = Session::new_active(crypto, self.server_addr);
        let seed = self.seed_source.fetch_add(1, Ordering::Relaxed);
        let dg = Datagram::Wake { seed };
        let header = next_private_header(seed, 0, 0, DatagramType::Wake);
        let bytes = match ntp_proto::encode(keystore.session_id, header, &dg, Some(&session.crypto)) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode 0-RTT WAKE");
                return self.start_register();
            }
        };
        self.set_session_id(keystore.session_id);
        *self.state.lock().unwrap() = AgentState::AwaitingRevivalConfirm { session };
        vec![AgentAction::Send { to: self.server_addr, bytes }]
    }

    /// Handles one inbound UDP payload from the server. Takes ownership of
    /// the current state up front (leaving a placeholder `Idle` behind) so
    /// each arm is free to move its fields around before deciding the next
    /// state.
    pub fn handle_inbound(&self, bytes: &[u8]) -> Vec<AgentAction> {
        let mut state_guard = self.state.lock().unwrap();
        let old = std::mem::replace(&mut *state_guard, AgentState::Idle);

        let (next, actions) = match old {
            AgentState::Idle => (AgentState::Idle, Vec::new()),
            AgentState::AwaitingChallenge { mut crypto } => {
                let decoded = ntp_proto::decode(bytes, None);
                match decoded {
                    Ok((public, _private, Datagram::RegisterChallenge { server_public_key, challenge_ciphertext, salt })) => {
                        self.accept_challenge(&mut crypto, public.session_id, &server_public_key, &challenge_ciphertext, &salt)
                            .unwrap_or((AgentState::AwaitingChallenge { crypto }, Vec::new()))
                    }
                    Ok((_public, _private, Datagram::ConnectionRejected { reason })) => {
                        (AgentState::Idle, vec![AgentAction::Terminate(reason)])
                    }
                    Ok(_) => (AgentState::AwaitingChallenge { crypto }, Vec::new()),
                    Err(e) => {
                        debug!(error = %e, "failed to decode REGISTER_CHALLENGE");
                        (AgentState::AwaitingChallenge { crypto }, Vec::new())
                    }
                }
            }
            AgentState::AwaitingRevivalConfirm { mut session } => {
                match ntp_proto::decode(bytes, Some(&session.crypto)) {
                    Ok((_public, _private, Datagram::Wake { seed })) => {
                        session.flow.reset(seed);
                        session.activate();
                        (AgentState::Active { session }, Vec::new())
                    }
                    Ok((_public, _private, Datagram::ConnectionRejected { .. })) => {
                        let (next, register_actions) = self.build_register();
                        self.set_session_id([0u8; 16]);
                        let mut actions = vec![AgentAction::DeleteKeystore];
                        actions.extend(register_actions);
                        (next, actions)
                    }
                    Ok(_) => (AgentState::AwaitingRevivalConfirm { session }, Vec::new()),
                    Err(e) => {
                        debug!(error = %e, "failed to decode reply to 0-RTT WAKE");
                        (AgentState::AwaitingRevivalConfirm { session }, Vec::new())
                    }
                }
            }
            AgentState::Active { mut session } => {
                let decoded = ntp_proto::decode(bytes, Some(&session.crypto));
                match decoded {
                    Ok((_public, _private, Datagram::PushSchemas { task_collection })) => {
                        session.contiguous_errors.record_success();
                        let tasks = spack::Value::decode(&task_collection)
                            .map_err(ntp_proto::ProtoError::from)
                            .and_then(|v| spack::unpack_task_collection(&v).map_err(ntp_proto::ProtoError::from));
                        match tasks {
                            Ok(tasks) => (AgentState::Active { session }, vec![AgentAction::TasksReceived(tasks)]),
                            Err(e) => {
                                warn!(error = %e, "failed to decode PUSH_SCHEMAS");
                                (AgentState::Active { session }, Vec::new())
                            }
                        }
                    }
                    Ok((_public, _private, Datagram::ConnectionReset { timestamp_ms })) => {
                        if ntp_proto::is_reset_timestamp_valid(timestamp_ms, now_ms()) {
                            (AgentState::Idle, vec![AgentAction::DeleteKeystore])
                        } else {
                            debug!("rejected a stale CONNECTION_RESET");
                            (AgentState::Active { session }, Vec::new())
                        }
                    }
                    Ok((_public, _private, Datagram::ConnectionRejected { reason })) => {
                        (AgentState::Idle, vec![AgentAction::Terminate(reason)])
                    }
                    Ok((_public, private, Datagram::Bodyless)) => {
                        session.contiguous_errors.record_success();
                        if private.nack != 0 {
                            let action = match session.flow.recovery_entry(private.nack) {
                                Ok(bytes) => vec![AgentAction::Send { to: self.server_addr, bytes: bytes.clone() }],
                                Err(_) => Vec::new(),
                            };
                            (AgentState::Active { session }, action)
                        } else {
                            (AgentState::Active { session }, Vec::new())
                        }
                    }
                    Ok(_) => (AgentState::Active { session }, Vec::new()),
                    Err(e) => {
                        debug!(error = %e, "failed to decode datagram while active");
                        if session.contiguous_errors.record_error() {
                            (AgentState::Idle, Vec::new())
                        } else {
                            (AgentState::Active { session }, Vec::new())
                        }
                    }
                }
            }
        };

        *state_guard = next;
        actions
    }

    /// Completes the handshake given a decoded `REGISTER_CHALLENGE`: links
    /// the shared secret, verifies and re-encrypts the challenge, and
    /// builds the `REGISTER_CHALLENGE2` reply. On success returns the new
    /// `Active` state plus the actions to take; `None` leaves the caller to
    /// keep waiting in `AwaitingChallenge`.
    fn accept_challenge(
        &self,
        crypto: &mut ntp_crypto::Session,
        session_id: [u8; 16],
        server_public_key: &[u8],
        challenge_ciphertext: &[u8],
        salt: &[u8],
    ) -> Option<(AgentState, Vec<AgentAction>)> {
        let server_pub = ntp_crypto::EncodedPoint::from_bytes(server_public_key).ok()?;
        if salt.len() != 16 {
            return None;
        }
        let mut salt_arr = [0u8; 16];
        salt_arr.copy_from_slice(salt);
        crypto.link(&server_pub, Some(salt_arr)).ok()?;
        let (tag, ciphertext) = ntp_proto::envelope::decode_challenge_blob(challenge_ciphertext).ok()?;
        let envelope = ntp_crypto::ChallengeEnvelope { salt: salt_arr, tag, ciphertext };
        let (control, response) = crypto.verify_challenge(&envelope).ok()?;
        crypto.regenerate_keys(control).ok()?;

        let response_bytes = ntp_proto::envelope::encode_envelope(&response);
        let dg = Datagram::RegisterChallenge2 { response: response_bytes };
        let header = next_private_header(1, 0, 0, DatagramType::RegisterChallenge2);
        let bytes = ntp_proto::encode(session_id, header, &dg, None).ok()?;

        let crypto_owned = std::mem::replace(crypto, ntp_crypto::Session::new(ntp_crypto::Curve::P256));
        let session = Session::new_active(crypto_owned, self.server_addr);
        let keystore = Keystore {
            session_id,
            secret: *session.crypto.secret().unwrap(),
            salt: session.crypto.last_salt().unwrap(),
        };
        self.set_session_id(session_id);

        Some((
            AgentState::Active { session },
            vec![
                AgentAction::Send { to: self.server_addr, bytes },
                AgentAction::PersistKeystore(keystore),
            ],
        ))
    }

    /// Encodes and sends a SEND_METRICS datagram for an already-ACTIVE
    /// session. Returns an empty vec if the agent has not reached ACTIVE or
    /// the send window has no room right now (SEND_METRICS stays queued in
    /// `flow` for a later call to drain).
    pub fn send_metrics(&self, task_id: &str, blob: Vec<u8>) -> Vec<AgentAction> {
        let mut state = self.state.lock().unwrap();
        let AgentState::Active { session } = &mut *state else {
            return Vec::new();
        };
        let dg = Datagram::SendMetrics {
            task_id: task_id.to_string(),
            metric_blob: blob,
        };
        let seq = session.flow.last_seq();
        let header = next_private_header(seq, session.flow.last_ack(), 0, DatagramType::SendMetrics);
        let bytes = match ntp_proto::encode(self.session_id(), header, &dg, Some(&session.crypto)) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode SEND_METRICS");
                return Vec::new();
            }
        };
        let assigned = session.flow.ready_to_send(bytes.clone());
        debug_assert_eq!(assigned, seq);
        match session.flow.controlled_send(Some(bytes)) {
            Ok(to_send) => {
                // SEND_METRICS bypasses retransmission tracking, so no timer
                // is armed here; see Datagram::bypasses_retransmission.
                vec![AgentAction::SendMetrics { to: self.server_addr, bytes: to_send }]
            }
            Err(e) => {
                debug!(error = %e, "metrics send deferred, retransmission window is full");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServerEndpoint;
    use std::net::{IpAddr, Ipv4Addr};

    struct EmptyCatalogue;
    impl crate::endpoint::TaskCatalogue for EmptyCatalogue {
        fn task_collection(&self, _session_id: &[u8; 16]) -> BTreeMap<String, spack::Task> {
            BTreeMap::new()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn fresh_handshake_reaches_active_against_a_real_server() {
        let server = ServerEndpoint::new();
        let catalogue = EmptyCatalogue;
        let agent = AgentEndpoint::new(addr(9000));

        let register_actions = agent.start_register();
        let AgentAction::Send { bytes: register_bytes, .. } = &register_actions[0] else {
            panic!("expected REGISTER send");
        };

        let server_actions = server.handle_inbound(register_bytes, addr(12345), &catalogue);
        let crate::endpoint::Action::Send { bytes: challenge_bytes, .. } = &server_actions[0] else {
            panic!("expected REGISTER_CHALLENGE reply");
        };

        let agent_actions = agent.handle_inbound(challenge_bytes);
        let AgentAction::Send { bytes: r2_bytes, .. } = &agent_actions[0] else {
            panic!("expected REGISTER_CHALLENGE2 send");
        };
        assert!(agent_actions.iter().any(|a| matches!(a, AgentAction::PersistKeystore(_))));

        let server_actions = server.handle_inbound(r2_bytes, addr(12345), &catalogue);
        assert!(server_actions.iter().any(|a| matches!(a, crate::endpoint::Action::PersistKeystore(_))));
        let crate::endpoint::Action::Send { bytes: push_schemas_bytes, .. } = server_actions
            .iter()
            .find(|a| matches!(a, crate::endpoint::Action::Send { .. }))
            .unwrap()
        else {
            unreachable!()
        };

        let agent_actions = agent.handle_inbound(push_schemas_bytes);
        assert!(agent_actions.iter().any(|a| matches!(a, AgentAction::TasksReceived(_))));
    }

    #[test]
    fn revival_failure_deletes_keystore_and_falls_back_to_register() {
        let agent = AgentEndpoint::new(addr(9000));
        let stale = Keystore {
            session_id: [7u8; 16],
            secret: [1u8; 32],
            salt: [2u8; 16],
        };
        let actions = agent.start_revival(stale);
        assert!(matches!(actions[0], AgentAction::Send { .. }));

        let reject = Datagram::ConnectionRejected { reason: RejectReason::AuthError };
        let header = next_private_header(0, 0, 0, DatagramType::ConnectionRejected);
        let bytes = ntp_proto::encode([7u8; 16], header, &reject, None).unwrap();

        let actions = agent.handle_inbound(&bytes);
        assert!(actions.iter().any(|a| matches!(a, AgentAction::DeleteKeystore)));
        assert!(actions.iter().any(|a| matches!(a, AgentAction::Send { .. })));
    }
}
