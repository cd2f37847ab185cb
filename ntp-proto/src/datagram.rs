//! The tagged datagram variants and their bodies.

use ntp_buffer::{Reader, Writer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DatagramError {
    #[error("unknown datagram type {0}")]
    UnknownType(u32),
    #[error("unknown reject reason {0}")]
    UnknownRejectReason(u8),
    #[error("body is not valid utf-8")]
    InvalidUtf8,
    #[error("WAKE body is missing the WAKEPING marker")]
    BadWakeMarker,
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, DatagramError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DatagramType {
    Register = 0,
    RegisterChallenge = 1,
    RegisterChallenge2 = 2,
    ConnectionRejected = 3,
    ConnectionReset = 4,
    PushSchemas = 5,
    SendMetrics = 6,
    Wake = 7,
    Bodyless = 8,
}

impl TryFrom<u32> for DatagramType {
    type Error = DatagramError;

    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Self::Register,
            1 => Self::RegisterChallenge,
            2 => Self::RegisterChallenge2,
            3 => Self::ConnectionRejected,
            4 => Self::ConnectionReset,
            5 => Self::PushSchemas,
            6 => Self::SendMetrics,
            7 => Self::Wake,
            8 => Self::Bodyless,
            other => return Err(DatagramError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Null = 0,
    Unknown = 1,
    CryptoError = 2,
    AuthError = 3,
}

impl TryFrom<u8> for RejectReason {
    type Error = DatagramError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Null,
            1 => Self::Unknown,
            2 => Self::CryptoError,
            3 => Self::AuthError,
            other => return Err(DatagramError::UnknownRejectReason(other)),
        })
    }
}

const WAKE_MARKER: &[u8; 8] = b"WAKEPING";

/// Every NTP datagram body, tagged by the variant it carries. Plaintext vs.
/// encrypted is a property of the public header's crypto-mark, not of this
/// type; callers route plaintext variants through `deenvelope`-free
/// encode/decode paths per §4.4.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Register {
        public_key: Vec<u8>,
    },
    RegisterChallenge {
        server_public_key: Vec<u8>,
        challenge_ciphertext: Vec<u8>,
        salt: Vec<u8>,
    },
    RegisterChallenge2 {
        response: Vec<u8>,
    },
    ConnectionRejected {
        reason: RejectReason,
    },
    ConnectionReset {
        timestamp_ms: u64,
    },
    PushSchemas {
        task_collection: Vec<u8>,
    },
    SendMetrics {
        task_id: String,
        metric_blob: Vec<u8>,
    },
    Wake {
        seed: u32,
    },
    Bodyless,
}

fn write_length_prefixed(w: &mut Writer, bytes: &[u8]) {
    w.write_u32(bytes.len() as u32);
    w.write_bytes(bytes);
}

fn read_length_prefixed<'a>(r: &mut Reader<'a>) -> Result<&'a [u8]> {
    let len = r.read_u32()? as usize;
    Ok(r.read(len)?)
}

impl Datagram {
    pub fn dtype(&self) -> DatagramType {
        match self {
            Datagram::Register { .. } => DatagramType::Register,
            Datagram::RegisterChallenge { .. } => DatagramType::RegisterChallenge,
            Datagram::RegisterChallenge2 { .. } => DatagramType::RegisterChallenge2,
            Datagram::ConnectionRejected { .. } => DatagramType::ConnectionRejected,
            Datagram::ConnectionReset { .. } => DatagramType::ConnectionReset,
            Datagram::PushSchemas { .. } => DatagramType::PushSchemas,
            Datagram::SendMetrics { .. } => DatagramType::SendMetrics,
            Datagram::Wake { .. } => DatagramType::Wake,
            Datagram::Bodyless => DatagramType::Bodyless,
        }
    }

    pub fn write_body(&self, w: &mut Writer) {
        match self {
            Datagram::Register { public_key } => write_length_prefixed(w, public_key),
            Datagram::RegisterChallenge {
                server_public_key,
                challenge_ciphertext,
                salt,
            } => {
                write_length_prefixed(w, server_public_key);
                write_length_prefixed(w, challenge_ciphertext);
                write_length_prefixed(w, salt);
            }
            Datagram::RegisterChallenge2 { response } => write_length_prefixed(w, response),
            Datagram::ConnectionRejected { reason } => w.write_u8(*reason as u8),
            Datagram::ConnectionReset { timestamp_ms } => {
                w.write_bytes(&timestamp_ms.to_be_bytes());
            }
            Datagram::PushSchemas { task_collection } => write_length_prefixed(w, task_collection),
            Datagram::SendMetrics { task_id, metric_blob } => {
                write_length_prefixed(w, task_id.as_bytes());
                write_length_prefixed(w, metric_blob);
            }
            Datagram::Wake { seed } => {
                w.write_bytes(WAKE_MARKER);
                w.write_u32(*seed);
            }
            Datagram::Bodyless => {}
        }
    }

    pub fn read_body(dtype: DatagramType, r: &mut Reader) -> Result<Self> {
        Ok(match dtype {
            DatagramType::Register => Datagram::Register {
                public_key: read_length_prefixed(r)?.to_vec(),
            },
            DatagramType::RegisterChallenge => {
                let server_public_key = read_length_prefixed(r)?.to_vec();
                let challenge_ciphertext = read_length_prefixed(r)?.to_vec();
                let salt = read_length_prefixed(r)?.to_vec();
                Datagram::RegisterChallenge {
                    server_public_key,
                    challenge_ciphertext,
                    salt,
                }
            }
            DatagramType::RegisterChallenge2 => Datagram::RegisterChallenge2 {
                response: read_length_prefixed(r)?.to_vec(),
            },
            DatagramType::ConnectionRejected => {
                let reason = RejectReason::try_from(r.read_u8()?)?;
                Datagram::ConnectionRejected { reason }
            }
            DatagramType::ConnectionReset => {
                let bytes = r.read_bytes::<8>()?;
                Datagram::ConnectionReset {
                    timestamp_ms: u64::from_be_bytes(bytes),
                }
            }
            DatagramType::PushSchemas => Datagram::PushSchemas {
                task_collection: read_length_prefixed(r)?.to_vec(),
            },
            DatagramType::SendMetrics => {
                let task_id_bytes = read_length_prefixed(r)?;
                let task_id = std::str::from_utf8(task_id_bytes)
                    .map_err(|_| DatagramError::InvalidUtf8)?
                    .to_string();
                let metric_blob = read_length_prefixed(r)?.to_vec();
                Datagram::SendMetrics { task_id, metric_blob }
            }
            DatagramType::Wake => {
                let marker = r.read_bytes::<8>()?;
                if &marker != WAKE_MARKER {
                    return Err(DatagramError::BadWakeMarker);
                }
                let seed = r.read_u32()?;
                Datagram::Wake { seed }
            }
            DatagramType::Bodyless => Datagram::Bodyless,
        })
    }

    /// BODYLESS, WAKE, CONNECTION_REJECTED and SEND_METRICS bypass
    /// retransmission arming on send, per §4.6.
    pub fn bypasses_retransmission(&self) -> bool {
        matches!(
            self,
            Datagram::Bodyless
                | Datagram::Wake { .. }
                | Datagram::ConnectionRejected { .. }
                | Datagram::SendMetrics { .. }
        )
    }

    /// REGISTER_CHALLENGE and WAKE carry cryptographic material in
    /// plaintext by design (pre-handshake / 0-RTT probe); every other
    /// variant marked encrypted in practice is CC on the wire. This mirrors
    /// §4.4's per-variant plaintext/encrypted split.
    pub fn is_plaintext(&self) -> bool {
        matches!(
            self,
            Datagram::Register { .. }
                | Datagram::RegisterChallenge { .. }
                | Datagram::RegisterChallenge2 { .. }
                | Datagram::ConnectionRejected { .. }
                | Datagram::Bodyless
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(dg: Datagram) {
        let mut w = Writer::new();
        dg.write_body(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let decoded = Datagram::read_body(dg.dtype(), &mut r).unwrap();
        assert_eq!(dg, decoded);
        assert!(r.eof());
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(Datagram::Register {
            public_key: vec![1, 2, 3],
        });
        round_trip(Datagram::RegisterChallenge {
            server_public_key: vec![4, 5, 6],
            challenge_ciphertext: vec![7, 8],
            salt: vec![9; 16],
        });
        round_trip(Datagram::RegisterChallenge2 { response: vec![1; 12] });
        round_trip(Datagram::ConnectionRejected {
            reason: RejectReason::AuthError,
        });
        round_trip(Datagram::ConnectionReset { timestamp_ms: 123_456 });
        round_trip(Datagram::PushSchemas {
            task_collection: vec![0xAB; 30],
        });
        round_trip(Datagram::SendMetrics {
            task_id: "ping-gateway".to_string(),
            metric_blob: vec![0x42; 10],
        });
        round_trip(Datagram::Wake { seed: 0xDEAD_BEEF });
        round_trip(Datagram::Bodyless);
    }

    #[test]
    fn wake_without_marker_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(b"GARBAGE!");
        w.write_u32(1);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(
            Datagram::read_body(DatagramType::Wake, &mut r),
            Err(DatagramError::BadWakeMarker)
        );
    }

    #[test]
    fn bypass_retransmission_matches_spec_list() {
        assert!(Datagram::Bodyless.bypasses_retransmission());
        assert!(Datagram::Wake { seed: 0 }.bypasses_retransmission());
        assert!(!Datagram::Register { public_key: vec![] }.bypasses_retransmission());
    }
}
