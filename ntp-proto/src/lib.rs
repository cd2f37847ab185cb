//! The NTP datagram: public/private header framing, the per-variant body
//! codec, and the envelope wrapper that seals the private frame under a
//! session's AEAD key when the crypto-mark is `CC`.

pub mod datagram;
pub mod envelope;
pub mod header;

pub use datagram::{Datagram, DatagramError, DatagramType, RejectReason};
pub use envelope::EnvelopeWireError;
pub use header::{HeaderError, PrivateHeader, PublicHeader};

use ntp_buffer::{Reader, Writer};
use thiserror::Error;

/// The symmetric clock-skew bound applied to `CONNECTION_RESET` timestamps,
/// per §9's guidance to bound skew in both directions rather than only
/// rejecting stale resets.
pub const RESET_SKEW_MS: u64 = 1_000;

/// The protocol's maximum body size before fragmentation would be needed.
/// Fragmentation itself is out of scope; callers that exceed this still
/// queue the datagram whole, per §4.5.
pub const MAX_PAYLOAD_BYTES: usize = 1425;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
    #[error(transparent)]
    EnvelopeWire(#[from] EnvelopeWireError),
    #[error(transparent)]
    Crypto(#[from] ntp_crypto::CryptoError),
    #[error("datagram is marked encrypted but no session key is available")]
    CryptoRequired,
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Encodes a full on-wire datagram: public header, then either the
/// plaintext private frame or its AEAD envelope.
pub fn encode(
    session_id: [u8; 16],
    private: PrivateHeader,
    dg: &Datagram,
    crypto: Option<&ntp_crypto::Session>,
) -> Result<Vec<u8>> {
    let mut frame = Writer::new();
    private.write(&mut frame);
    dg.write_body(&mut frame);
    let frame_bytes = frame.into_vec();

    let (encrypted, payload) = if dg.is_plaintext() {
        (false, frame_bytes)
    } else {
        let session = crypto.ok_or(ProtoError::CryptoRequired)?;
        let sealed = session.envelope(&frame_bytes)?;
        (true, envelope::encode_envelope(&sealed))
    };

    let public = PublicHeader {
        session_id,
        encrypted,
        payload_size: payload.len() as u32,
        more_fragments: false,
        fragment_offset: 0,
    };

    let mut w = Writer::new();
    public.write(&mut w);
    w.write_bytes(&payload);
    Ok(w.into_vec())
}

/// Scans `bytes` for the public header, opens the envelope if marked `CC`,
/// and parses the private frame. `crypto` must be `Some` for any datagram
/// whose public header is marked encrypted.
pub fn decode(bytes: &[u8], crypto: Option<&ntp_crypto::Session>) -> Result<(PublicHeader, PrivateHeader, Datagram)> {
    let mut r = Reader::new(bytes);
    let public = PublicHeader::read(&mut r)?;
    let payload = r.read(public.payload_size as usize)?;

    let frame_bytes = if public.encrypted {
        let session = crypto.ok_or(ProtoError::CryptoRequired)?;
        let sealed = envelope::decode_envelope(payload)?;
        session.deenvelope(&sealed)?
    } else {
        payload.to_vec()
    };

    let mut frame_reader = Reader::new(&frame_bytes);
    let private = PrivateHeader::read(&mut frame_reader)?;
    let dtype = DatagramType::try_from(private.dtype)?;
    let dg = Datagram::read_body(dtype, &mut frame_reader)?;
    Ok((public, private, dg))
}

/// `CONNECTION_RESET`'s timestamp must fall within [`RESET_SKEW_MS`] of
/// `now_ms` in either direction; a skew of exactly `RESET_SKEW_MS` is
/// rejected, not just anything past it.
pub fn is_reset_timestamp_valid(timestamp_ms: u64, now_ms: u64) -> bool {
    let skew = if timestamp_ms >= now_ms {
        timestamp_ms - now_ms
    } else {
        now_ms - timestamp_ms
    };
    skew < RESET_SKEW_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_pair() -> (ntp_crypto::Session, ntp_crypto::Session) {
        let mut agent = ntp_crypto::Session::new(ntp_crypto::Curve::P256);
        let mut server = ntp_crypto::Session::new(ntp_crypto::Curve::P256);
        let agent_pub = agent.public_key().unwrap();
        let server_pub = server.public_key().unwrap();
        let salt = server.link(&agent_pub, None).unwrap();
        agent.link(&server_pub, Some(salt)).unwrap();
        (agent, server)
    }

    #[test]
    fn plaintext_register_round_trips_without_crypto() {
        let dg = Datagram::Register {
            public_key: vec![1, 2, 3, 4],
        };
        let private = PrivateHeader {
            version: header::PROTOCOL_VERSION,
            seq: 1,
            ack: 0,
            nack: 0,
            dtype: DatagramType::Register as u32,
        };
        let bytes = encode([0u8; 16], private, &dg, None).unwrap();
        let (public, decoded_private, decoded_dg) = decode(&bytes, None).unwrap();
        assert!(!public.encrypted);
        assert_eq!(decoded_private, private);
        assert_eq!(decoded_dg, dg);
    }

    #[test]
    fn encrypted_send_metrics_round_trips_under_session_key() {
        let (agent, server) = linked_pair();
        let dg = Datagram::SendMetrics {
            task_id: "ping-gateway".to_string(),
            metric_blob: vec![1, 2, 3],
        };
        let private = PrivateHeader {
            version: header::PROTOCOL_VERSION,
            seq: 5,
            ack: 4,
            nack: 0,
            dtype: DatagramType::SendMetrics as u32,
        };
        let bytes = encode([9u8; 16], private, &dg, Some(&agent)).unwrap();
        let (public, decoded_private, decoded_dg) = decode(&bytes, Some(&server)).unwrap();
        assert!(public.encrypted);
        assert_eq!(decoded_private, private);
        assert_eq!(decoded_dg, dg);
    }

    #[test]
    fn encrypted_datagram_without_crypto_session_fails() {
        let private = PrivateHeader {
            version: header::PROTOCOL_VERSION,
            seq: 1,
            ack: 0,
            nack: 0,
            dtype: DatagramType::ConnectionReset as u32,
        };
        let (agent, _server) = linked_pair();
        let encrypted_bytes = encode([1u8; 16], private, &Datagram::ConnectionReset { timestamp_ms: 0 }, Some(&agent))
            .unwrap();
        assert!(matches!(decode(&encrypted_bytes, None), Err(ProtoError::CryptoRequired)));
    }

    #[test]
    fn reset_timestamp_skew_bound_is_symmetric() {
        assert!(is_reset_timestamp_valid(10_000, 10_500));
        assert!(is_reset_timestamp_valid(10_500, 10_000));
        assert!(!is_reset_timestamp_valid(10_000, 11_500));
        assert!(!is_reset_timestamp_valid(11_500, 10_000));
    }

    #[test]
    fn reset_timestamp_skew_bound_is_exclusive_at_exactly_one_second() {
        assert!(!is_reset_timestamp_valid(10_000, 11_000));
        assert!(!is_reset_timestamp_valid(11_000, 10_000));
        assert!(is_reset_timestamp_valid(10_001, 11_000));
        assert!(is_reset_timestamp_valid(11_000, 10_001));
    }
}
