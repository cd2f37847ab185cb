//! The 0-RTT revival keystore: `{session-id, secret, salt}`. On disk it is
//! JSON with base64url byte fields, then the JSON bytes are reversed and
//! XORed with `0x69`. Deterministic, and deliberately not a confidentiality
//! boundary — it only keeps the secret from showing up verbatim in a `cat`
//! of the file. Actual file I/O is an external collaborator; this module
//! only does the (de)serialisation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const XOR_KEY: u8 = 0x69;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("malformed keystore json: {0}")]
    Json(String),
    #[error("malformed base64 field: {0}")]
    Base64(String),
    #[error("field {field} has length {actual}, expected {expected}")]
    BadLength { field: &'static str, expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keystore {
    pub session_id: [u8; 16],
    pub secret: [u8; 32],
    pub salt: [u8; 16],
}

#[derive(Serialize, Deserialize)]
struct Wire {
    #[serde(rename = "sessionId")]
    session_id: String,
    secret: String,
    salt: String,
}

impl Keystore {
    /// Encodes `{sessionId, secret, salt}` as JSON with base64url byte
    /// fields, then reverses the JSON bytes and XORs every byte with
    /// `0x69`.
    pub fn serialize(&self) -> Vec<u8> {
        let wire = Wire {
            session_id: BASE64.encode(self.session_id),
            secret: BASE64.encode(self.secret),
            salt: BASE64.encode(self.salt),
        };
        let mut bytes = serde_json::to_vec(&wire).expect("keystore json never fails to serialise");
        bytes.reverse();
        for b in &mut bytes {
            *b ^= XOR_KEY;
        }
        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut plain: Vec<u8> = bytes.iter().map(|b| b ^ XOR_KEY).collect();
        plain.reverse();

        let wire: Wire = serde_json::from_slice(&plain).map_err(|e| KeystoreError::Json(e.to_string()))?;
        let session_id = decode_fixed::<16>("sessionId", &wire.session_id)?;
        let secret = decode_fixed::<32>("secret", &wire.secret)?;
        let salt = decode_fixed::<16>("salt", &wire.salt)?;
        Ok(Self { session_id, secret, salt })
    }
}

fn decode_fixed<const N: usize>(field: &'static str, text: &str) -> Result<[u8; N]> {
    let bytes = BASE64.decode(text).map_err(|e| KeystoreError::Base64(e.to_string()))?;
    if bytes.len() != N {
        return Err(KeystoreError::BadLength { field, expected: N, actual: bytes.len() });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystore_round_trips_through_json_and_obfuscation() {
        let keystore = Keystore {
            session_id: [1u8; 16],
            secret: [2u8; 32],
            salt: [3u8; 16],
        };
        let bytes = keystore.serialize();
        assert!(std::str::from_utf8(&bytes).is_err() || !bytes.iter().any(|b| *b == b'{'));
        assert_eq!(Keystore::deserialize(&bytes).unwrap(), keystore);
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        assert!(Keystore::deserialize(&[0u8; 10]).is_err());
    }
}
