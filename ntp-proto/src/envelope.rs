//! Wire form of the AEAD envelope carried after the public header when the
//! crypto-mark is `CC`: `{u32 iv-len, iv, u32 tag-len, tag, u32 ct-len, ct}`.

use ntp_buffer::{Reader, Writer};
use ntp_crypto::Envelope;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeWireError {
    #[error("iv length {0} does not match the fixed iv size")]
    BadIvLength(usize),
    #[error("tag length {0} does not match the fixed tag size")]
    BadTagLength(usize),
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, EnvelopeWireError>;

pub fn write_envelope(w: &mut Writer, envelope: &Envelope) {
    w.write_u32(envelope.iv.len() as u32);
    w.write_bytes(&envelope.iv);
    w.write_u32(envelope.tag.len() as u32);
    w.write_bytes(&envelope.tag);
    w.write_u32(envelope.ciphertext.len() as u32);
    w.write_bytes(&envelope.ciphertext);
}

pub fn read_envelope(r: &mut Reader) -> Result<Envelope> {
    let iv_len = r.read_u32()? as usize;
    let iv_bytes = r.read(iv_len)?;
    if iv_len != ntp_crypto::IV_LEN {
        return Err(EnvelopeWireError::BadIvLength(iv_len));
    }
    let mut iv = [0u8; ntp_crypto::IV_LEN];
    iv.copy_from_slice(iv_bytes);

    let tag_len = r.read_u32()? as usize;
    let tag_bytes = r.read(tag_len)?;
    if tag_len != ntp_crypto::TAG_LEN {
        return Err(EnvelopeWireError::BadTagLength(tag_len));
    }
    let mut tag = [0u8; ntp_crypto::TAG_LEN];
    tag.copy_from_slice(tag_bytes);

    let ct_len = r.read_u32()? as usize;
    let ciphertext = r.read(ct_len)?.to_vec();

    Ok(Envelope { iv, tag, ciphertext })
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    let mut w = Writer::new();
    write_envelope(&mut w, envelope);
    w.into_vec()
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let mut r = Reader::new(bytes);
    read_envelope(&mut r)
}

/// The `REGISTER_CHALLENGE` ciphertext blob: the IV is derived from the
/// accompanying salt rather than carried, so the blob is just the
/// ciphertext with the auth tag appended.
pub fn encode_challenge_blob(tag: &[u8; ntp_crypto::TAG_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(ciphertext.len() + ntp_crypto::TAG_LEN);
    blob.extend_from_slice(ciphertext);
    blob.extend_from_slice(tag);
    blob
}

pub fn decode_challenge_blob(blob: &[u8]) -> Result<([u8; ntp_crypto::TAG_LEN], Vec<u8>)> {
    if blob.len() < ntp_crypto::TAG_LEN {
        return Err(EnvelopeWireError::BadTagLength(blob.len()));
    }
    let split = blob.len() - ntp_crypto::TAG_LEN;
    let mut tag = [0u8; ntp_crypto::TAG_LEN];
    tag.copy_from_slice(&blob[split..]);
    Ok((tag, blob[..split].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope {
            iv: [9u8; ntp_crypto::IV_LEN],
            tag: [8u8; ntp_crypto::TAG_LEN],
            ciphertext: vec![1, 2, 3, 4, 5],
        };
        let bytes = encode_envelope(&envelope);
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn challenge_blob_round_trips() {
        let tag = [3u8; ntp_crypto::TAG_LEN];
        let ciphertext = vec![1, 2, 3, 4];
        let blob = encode_challenge_blob(&tag, &ciphertext);
        let (decoded_tag, decoded_ct) = decode_challenge_blob(&blob).unwrap();
        assert_eq!(decoded_tag, tag);
        assert_eq!(decoded_ct, ciphertext);
    }
}
