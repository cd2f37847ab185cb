//! The UDP endpoint: demultiplexes inbound datagrams by session-id, drives
//! the registration state machine and 0-RTT revival, and runs outbound
//! sends through flow control.
//!
//! Socket I/O is kept to a thin `run` loop; the actual decision logic lives
//! in `handle_inbound`/`agent_handle_inbound`, which are plain synchronous
//! functions over a session table and therefore unit-testable without a
//! runtime.

use crate::keystore::Keystore;
use crate::session::{Session, SessionState};
use dashmap::DashMap;
use ntp_proto::{Datagram, DatagramType, PrivateHeader};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Proto(#[from] ntp_proto::ProtoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no session for session-id {0:02x?}")]
    UnknownSession([u8; 16]),
}

pub type Result<T> = std::result::Result<T, EndpointError>;

/// Supplies the task collection a server pushes to a freshly-registered
/// agent. External to the core (the catalogue is configuration-sourced),
/// kept as a narrow trait seam so the endpoint doesn't depend on whatever
/// backs it.
pub trait TaskCatalogue: Send + Sync {
    fn task_collection(&self, session_id: &[u8; 16]) -> BTreeMap<String, spack::Task>;
}

/// What the caller's I/O loop must do after a call into the dispatch core.
#[derive(Debug, Clone)]
pub enum Action {
    Send { to: SocketAddr, bytes: Vec<u8> },
    PersistKeystore(Keystore),
    DeleteKeystore,
    DeleteSession([u8; 16]),
    MetricReceived {
        session_id: [u8; 16],
        task_id: String,
        report: spack::MetricReport,
    },
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

/// Server-side session table and dispatch core.
pub struct ServerEndpoint {
    pub sessions: DashMap<[u8; 16], Session>,
    seed_source: AtomicU32,
}

impl ServerEndpoint {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            seed_source: AtomicU32::new(1),
        }
    }

    fn fresh_seed(&self) -> u32 {
        self.seed_source.fetch_add(1, Ordering::Relaxed)
    }

    /// Handles one inbound UDP payload from `addr`. Mutates the session
    /// table in place; returns the actions the caller's I/O loop must take.
    pub fn handle_inbound(&self, bytes: &[u8], addr: SocketAddr, catalogue: &dyn TaskCatalogue) -> Vec<Action> {
        let public = match ntp_proto::PublicHeader::read(&mut ntp_buffer::Reader::new(bytes)) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "failed to parse public header");
                return Vec::new();
            }
        };

        if public.session_id == [0u8; 16] {
            return self.handle_register(bytes, addr);
        }

        let mut session = match self.sessions.get_mut(&public.session_id) {
            Some(s) => s,
            None => {
                return vec![Action::Send {
                    to: addr,
                    bytes: reject(public.session_id, RejectReason::Unknown),
                }]
            }
        };

        let (_, private, dg) = match ntp_proto::decode(bytes, Some(&session.crypto)) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "failed to decode datagram");
                if session.contiguous_errors.record_error() {
                    let session_id = public.session_id;
                    let bytes = connection_reset(session_id, &session.crypto);
                    drop(session);
                    self.sessions.remove(&session_id);
                    return vec![Action::Send { to: addr, bytes }];
                }
                return Vec::new();
            }
        };
        session.contiguous_errors.record_success();

        let actions = match dg {
            Datagram::RegisterChallenge2 { response } => self.handle_r2(&mut session, public.session_id, &response, addr, catalogue),
            Datagram::Wake { seed } => self.handle_wake(&mut session, public.session_id, seed, addr),
            Datagram::SendMetrics { task_id, metric_blob } => {
                self.handle_send_metrics(&mut session, public.session_id, private, task_id, metric_blob, addr)
            }
            Datagram::Bodyless => self.handle_bodyless(&mut session, public.session_id, private, addr),
            _ => Vec::new(),
        };
        drop(session);
        for action in &actions {
            if let Action::DeleteSession(id) = action {
                self.sessions.remove(id);
            }
        }
        actions
    }

    fn handle_register(&self, bytes: &[u8], addr: SocketAddr) -> Vec<Action> {
        let (_, _, dg) = match ntp_proto::decode(bytes, None) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed REGISTER");
                return Vec::new();
            }
        };
        let Datagram::Register { public_key } = dg else {
            return Vec::new();
        };
        let peer_pk = match ntp_crypto::EncodedPoint::from_bytes(&public_key) {
            Ok(p) => p,
            Err(_) => {
                return vec![Action::Send {
                    to: addr,
                    bytes: reject([0u8; 16], RejectReason::CryptoError),
                }]
            }
        };

        let mut server_crypto = ntp_crypto::Session::new(ntp_crypto::Curve::P256);
        let server_pub = server_crypto.public_key().unwrap();
        let salt = match server_crypto.link(&peer_pk, None) {
            Ok(s) => s,
            Err(_) => {
                return vec![Action::Send {
                    to: addr,
                    bytes: reject([0u8; 16], RejectReason::CryptoError),
                }]
            }
        };
        let session_id = server_crypto.generate_session_id(Some(salt)).unwrap();
        let challenge = server_crypto.generate_challenge(None, Some(salt)).unwrap();

        let mut session = Session::new_awaiting_r2(server_crypto, addr);
        session.pending_control = Some(challenge.control);
        self.sessions.insert(session_id, session);

        let dg = Datagram::RegisterChallenge {
            server_public_key: server_pub.as_bytes().to_vec(),
            challenge_ciphertext: ntp_proto::envelope::encode_challenge_blob(
                &challenge.envelope.tag,
                &challenge.envelope.ciphertext,
            ),
            salt: challenge.envelope.salt.to_vec(),
        };
        let header = next_private_header(1, 0, 0, DatagramType::RegisterChallenge);
        let bytes = ntp_proto::encode(session_id, header, &dg, None).unwrap();
        vec![Action::Send { to: addr, bytes }]
    }

    fn handle_r2(
        &self,
        session: &mut Session,
        session_id: [u8; 16],
        response_bytes: &[u8],
        addr: SocketAddr,
        catalogue: &dyn TaskCatalogue,
    ) -> Vec<Action> {
        if session.state != SessionState::AwaitingR2 {
            // Replay of a REGISTER_CHALLENGE2 against an already-active
            // session; ignored per the tie-break for replayed handshakes.
            return Vec::new();
        }
        let Some(control) = session.pending_control else {
            return Vec::new();
        };
        let envelope = match decode_response_envelope(response_bytes) {
            Ok(e) => e,
            Err(_) => return vec![Action::Send { to: addr, bytes: reject(session_id, RejectReason::AuthError) }],
        };
        if !session.crypto.confirm_challenge(&envelope, &control) {
            self.sessions.remove(&session_id);
            return vec![Action::Send { to: addr, bytes: reject(session_id, RejectReason::AuthError) }];
        }

        if session.crypto.regenerate_keys(control).is_err() {
            return vec![Action::Send { to: addr, bytes: reject(session_id, RejectReason::CryptoError) }];
        }
        session.activate();
        session.pending_control = None;

        let keystore = Keystore {
            session_id,
            secret: *session.crypto.secret().unwrap(),
            salt: session.crypto.last_salt().unwrap(),
        };

        let tasks = catalogue.task_collection(&session_id);
        let blob = spack::pack_task_collection(&tasks).encode().unwrap();
        let dg = Datagram::PushSchemas { task_collection: blob };
        let seq = session.flow.last_seq();
        let header = next_private_header(seq, session.flow.last_ack(), 0, DatagramType::PushSchemas);
        let bytes = ntp_proto::encode(session_id, header, &dg, Some(&session.crypto)).unwrap();

        let mut actions = vec![Action::PersistKeystore(keystore)];
        actions.extend(send_windowed(&mut session.flow, &dg, addr, bytes));
        actions
    }

    fn handle_wake(&self, session: &mut Session, session_id: [u8; 16], _incoming_seed: u32, addr: SocketAddr) -> Vec<Action> {
        if session.state != SessionState::Active {
            return vec![Action::Send { to: addr, bytes: reject(session_id, RejectReason::Unknown) }];
        }
        let new_seed = self.fresh_seed();
        session.flow.reset(new_seed);
        let dg = Datagram::Wake { seed: new_seed };
        let header = next_private_header(new_seed, 0, 0, DatagramType::Wake);
        let bytes = ntp_proto::encode(session_id, header, &dg, Some(&session.crypto)).unwrap();
        send_windowed(&mut session.flow, &dg, addr, bytes)
    }

    fn handle_send_metrics(
        &self,
        session: &mut Session,
        session_id: [u8; 16],
        private: PrivateHeader,
        task_id: String,
        metric_blob: Vec<u8>,
        addr: SocketAddr,
    ) -> Vec<Action> {
        let meta = ntp_flow::InboundMeta {
            dtype: DatagramType::SendMetrics,
            seq: private.seq,
            ack: private.ack,
        };
        match session.flow.evaluate(meta) {
            Ok(ntp_flow::Evaluation::Accepted) => {}
            Ok(ntp_flow::Evaluation::RequestRetransmission(want)) => {
                return vec![Action::Send {
                    to: addr,
                    bytes: nack(session_id, want),
                }]
            }
            Err(ntp_flow::FlowError::Duplicate(_)) => return Vec::new(),
            Err(e) => {
                error!(error = %e, "flow evaluate failed on SEND_METRICS");
                return Vec::new();
            }
        }
        let report = match spack::Value::decode(&metric_blob).and_then(|v| spack::MetricReport::unpack(&v)) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to decode metric report");
                if session.contiguous_errors.record_error() {
                    let bytes = connection_reset(session_id, &session.crypto);
                    return vec![Action::Send { to: addr, bytes }, Action::DeleteSession(session_id)];
                }
                return Vec::new();
            }
        };
        vec![Action::MetricReceived { session_id, task_id, report }]
    }

    /// Drives retransmission-timeout expiry: called periodically by the
    /// owning I/O loop (see `run_server`). Every session with an armed timer
    /// gets its recovery-buffered bytes resent and the timer rearmed; a
    /// sequence that has now exhausted `max_retransmissions` tears its
    /// session down with an encrypted `CONNECTION_RESET` instead, per §5.
    pub fn poll_retransmissions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut to_remove = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session_id = *entry.key();
            let session = entry.value_mut();
            if session.state != SessionState::Active {
                continue;
            }
            for seq in session.flow.armed_sequences() {
                let bytes = match session.flow.recovery_entry(seq) {
                    Ok(b) => b.clone(),
                    Err(_) => continue,
                };
                match session.flow.start_timer(seq) {
                    Ok(()) => actions.push(Action::Send { to: session.peer_addr, bytes }),
                    Err(e) => {
                        warn!(error = %e, "retransmissions exhausted, tearing down session");
                        let reset_bytes = connection_reset(session_id, &session.crypto);
                        actions.push(Action::Send { to: session.peer_addr, bytes: reset_bytes });
                        to_remove.push(session_id);
                        break;
                    }
                }
            }
        }
        for id in to_remove {
            self.sessions.remove(&id);
        }
        actions
    }

    fn handle_bodyless(&self, session: &mut Session, session_id: [u8; 16], private: PrivateHeader, addr: SocketAddr) -> Vec<Action> {
        if private.nack != 0 {
            return match session.flow.recovery_entry(private.nack) {
                Ok(bytes) => vec![Action::Send { to: addr, bytes: bytes.clone() }],
                Err(_) => {
                    debug!(nack = private.nack, "nack referenced an entry no longer in recovery");
                    Vec::new()
                }
            };
        }
        let meta = ntp_flow::InboundMeta {
            dtype: DatagramType::Bodyless,
            seq: private.seq,
            ack: private.ack,
        };
        match session.flow.evaluate(meta) {
            Ok(ntp_flow::Evaluation::RequestRetransmission(want)) => {
                vec![Action::Send { to: addr, bytes: nack(session_id, want) }]
            }
            _ => Vec::new(),
        }
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum RejectReason {
    Unknown,
    CryptoError,
    AuthError,
}

fn reject(session_id: [u8; 16], reason: RejectReason) -> Vec<u8> {
    let reason = match reason {
        RejectReason::Unknown => ntp_proto::RejectReason::Unknown,
        RejectReason::CryptoError => ntp_proto::RejectReason::CryptoError,
        RejectReason::AuthError => ntp_proto::RejectReason::AuthError,
    };
    let dg = Datagram::ConnectionRejected { reason };
    let header = next_private_header(0, 0, 0, DatagramType::ConnectionRejected);
    ntp_proto::encode(session_id, header, &dg, None).expect("plaintext encode never fails")
}

fn nack(session_id: [u8; 16], want: u32) -> Vec<u8> {
    let dg = Datagram::Bodyless;
    let header = next_private_header(0, 0, want, DatagramType::Bodyless);
    ntp_proto::encode(session_id, header, &dg, None).expect("plaintext encode never fails")
}

/// Builds an encrypted `CONNECTION_RESET`, sealed under the session's own
/// key. Used when a session is torn down on the server's own initiative
/// (§4.4/§4.6) rather than a rejection the peer caused.
fn connection_reset(session_id: [u8; 16], crypto: &ntp_crypto::Session) -> Vec<u8> {
    let dg = Datagram::ConnectionReset { timestamp_ms: now_ms() };
    let header = next_private_header(0, 0, 0, DatagramType::ConnectionReset);
    ntp_proto::encode(session_id, header, &dg, Some(crypto)).expect("CONNECTION_RESET always encodes")
}

/// Pushes `bytes` through the send window and, unless `dg` bypasses
/// retransmission tracking, arms a retransmission timer for the sequence it
/// was assigned. Returns the actions for the caller's I/O loop: empty if the
/// window has no room right now (the datagram stays queued in `flow` for a
/// later send).
fn send_windowed(flow: &mut ntp_flow::FlowControl<Vec<u8>>, dg: &Datagram, to: SocketAddr, bytes: Vec<u8>) -> Vec<Action> {
    let seq = flow.last_seq();
    let assigned = flow.ready_to_send(bytes.clone());
    debug_assert_eq!(assigned, seq);
    match flow.controlled_send(Some(bytes)) {
        Ok(to_send) => {
            if !dg.bypasses_retransmission() {
                if let Err(e) = flow.start_timer(seq) {
                    warn!(error = %e, "retransmission timer could not be armed");
                }
            }
            vec![Action::Send { to, bytes: to_send }]
        }
        Err(e) => {
            debug!(error = %e, "send deferred, retransmission window is full");
            Vec::new()
        }
    }
}

/// `REGISTER_CHALLENGE2`'s body is a plain length-prefixed blob on the
/// wire; it decodes into an AEAD envelope whose IV is carried in full
/// (unlike `REGISTER_CHALLENGE`, which derives its IV from the salt).
fn decode_response_envelope(bytes: &[u8]) -> ntp_proto::Result<ntp_crypto::Envelope> {
    ntp_proto::envelope::decode_envelope(bytes).map_err(ntp_proto::ProtoError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct EmptyCatalogue;
    impl TaskCatalogue for EmptyCatalogue {
        fn task_collection(&self, _session_id: &[u8; 16]) -> BTreeMap<String, spack::Task> {
            BTreeMap::new()
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn full_handshake_reaches_active_and_pushes_schemas() {
        let server = ServerEndpoint::new();
        let catalogue = EmptyCatalogue;

        let mut agent_crypto = ntp_crypto::Session::new(ntp_crypto::Curve::P256);
        let agent_pub = agent_crypto.public_key().unwrap();
        let register = Datagram::Register {
            public_key: agent_pub.as_bytes().to_vec(),
        };
        let header = next_private_header(1, 0, 0, DatagramType::Register);
        let bytes = ntp_proto::encode([0u8; 16], header, &register, None).unwrap();

        let actions = server.handle_inbound(&bytes, addr(), &catalogue);
        let Action::Send { bytes: challenge_bytes, .. } = &actions[0] else {
            panic!("expected a REGISTER_CHALLENGE reply");
        };
        let (public, _private, dg) = ntp_proto::decode(challenge_bytes, None).unwrap();
        let Datagram::RegisterChallenge { server_public_key, challenge_ciphertext, salt } = dg else {
            panic!("expected RegisterChallenge");
        };
        let session_id = public.session_id;

        let server_pub = ntp_crypto::EncodedPoint::from_bytes(&server_public_key).unwrap();
        let mut salt_arr = [0u8; 16];
        salt_arr.copy_from_slice(&salt);
        agent_crypto.link(&server_pub, Some(salt_arr)).unwrap();

        let (tag, ciphertext) = ntp_proto::envelope::decode_challenge_blob(&challenge_ciphertext).unwrap();
        let envelope = ntp_crypto::ChallengeEnvelope {
            salt: salt_arr,
            tag,
            ciphertext,
        };
        let (control, response) = agent_crypto.verify_challenge(&envelope).unwrap();
        agent_crypto.regenerate_keys(control).unwrap();

        let response_bytes = {
            let mut w = ntp_buffer::Writer::new();
            ntp_proto::envelope::write_envelope(&mut w, &response);
            w.into_vec()
        };
        let r2 = Datagram::RegisterChallenge2 { response: response_bytes };
        let header = next_private_header(1, 0, 0, DatagramType::RegisterChallenge2);
        let r2_bytes = ntp_proto::encode(session_id, header, &r2, None).unwrap();

        let actions = server.handle_inbound(&r2_bytes, addr(), &catalogue);
        assert!(actions.iter().any(|a| matches!(a, Action::PersistKeystore(_))));
        assert!(server.sessions.get(&session_id).unwrap().state == SessionState::Active);
    }
}
