//! The public and private header layouts, bit-exact per the wire format.

use ntp_buffer::{Reader, Writer};
use thiserror::Error;

pub const SIGNATURE: &[u8; 4] = b"NTTK";
pub const MARK_CC: [u8; 2] = *b"CC";
pub const MARK_NC: [u8; 2] = *b"NC";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum HeaderError {
    #[error("no NTTK signature found in the remaining buffer")]
    SignatureNotFound,
    #[error("crypto-mark is neither CC nor NC")]
    BadMark,
    #[error("private header version {0} is not supported")]
    BadVersion(u32),
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, HeaderError>;

/// Scans `buf` for the next occurrence of the 4-byte signature and returns
/// its start offset. Framing "garbage" ahead of the signature (partial
/// fragments, stray bytes from a previous read) is silently skipped, per
/// the endpoint's "scan forward" contract.
pub fn find_signature(buf: &[u8]) -> Option<usize> {
    buf.windows(SIGNATURE.len()).position(|w| w == SIGNATURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicHeader {
    pub session_id: [u8; 16],
    pub encrypted: bool,
    pub payload_size: u32,
    pub more_fragments: bool,
    pub fragment_offset: u32,
}

impl PublicHeader {
    pub fn write(&self, w: &mut Writer) {
        w.write_bytes(SIGNATURE);
        w.write_bytes(&self.session_id);
        w.write_bytes(if self.encrypted { &MARK_CC } else { &MARK_NC });
        w.write_u32(self.payload_size);
        w.write_u8(self.more_fragments as u8);
        w.write_u32(self.fragment_offset);
    }

    /// Scans `r`'s remaining bytes for the signature, then parses the fixed
    /// fields that follow it. The cursor is left just past the header.
    pub fn read(r: &mut Reader) -> Result<Self> {
        let skip = find_signature(r.peek(r.remaining())?).ok_or(HeaderError::SignatureNotFound)?;
        r.read(skip + SIGNATURE.len())?;

        let session_id = r.read_bytes::<16>()?;
        let mark = r.read_bytes::<2>()?;
        let encrypted = match mark {
            m if m == MARK_CC => true,
            m if m == MARK_NC => false,
            _ => return Err(HeaderError::BadMark),
        };
        let payload_size = r.read_u32()?;
        let more_fragments = r.read_u8()? != 0;
        let fragment_offset = r.read_u32()?;
        Ok(Self {
            session_id,
            encrypted,
            payload_size,
            more_fragments,
            fragment_offset,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateHeader {
    pub version: u32,
    pub seq: u32,
    pub ack: u32,
    pub nack: u32,
    pub dtype: u32,
}

impl PrivateHeader {
    pub fn write(&self, w: &mut Writer) {
        w.write_u32(self.version);
        w.write_u32(self.seq);
        w.write_u32(self.ack);
        w.write_u32(self.nack);
        w.write_u32(self.dtype);
    }

    pub fn read(r: &mut Reader) -> Result<Self> {
        let version = r.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(HeaderError::BadVersion(version));
        }
        let seq = r.read_u32()?;
        let ack = r.read_u32()?;
        let nack = r.read_u32()?;
        let dtype = r.read_u32()?;
        Ok(Self {
            version,
            seq,
            ack,
            nack,
            dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_header_round_trips() {
        let header = PublicHeader {
            session_id: [7u8; 16],
            encrypted: true,
            payload_size: 128,
            more_fragments: false,
            fragment_offset: 0,
        };
        let mut w = Writer::new();
        header.write(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(PublicHeader::read(&mut r).unwrap(), header);
    }

    #[test]
    fn scan_skips_leading_garbage() {
        let mut bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let header = PublicHeader {
            session_id: [1u8; 16],
            encrypted: false,
            payload_size: 0,
            more_fragments: false,
            fragment_offset: 0,
        };
        let mut w = Writer::new();
        header.write(&mut w);
        bytes.extend_from_slice(w.as_slice());
        let mut r = Reader::new(&bytes);
        assert_eq!(PublicHeader::read(&mut r).unwrap(), header);
    }

    #[test]
    fn missing_signature_is_reported() {
        let bytes = [0u8; 8];
        let mut r = Reader::new(&bytes);
        assert_eq!(PublicHeader::read(&mut r), Err(HeaderError::SignatureNotFound));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut w = Writer::new();
        w.write_u32(2);
        w.write_u32(0);
        w.write_u32(0);
        w.write_u32(0);
        w.write_u32(0);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(PrivateHeader::read(&mut r), Err(HeaderError::BadVersion(2)));
    }

    proptest::proptest! {
        #[test]
        fn public_header_round_trips_for_arbitrary_fields(
            session_id: [u8; 16], encrypted: bool, payload_size: u32,
            more_fragments: bool, fragment_offset: u32,
        ) {
            let header = PublicHeader { session_id, encrypted, payload_size, more_fragments, fragment_offset };
            let mut w = Writer::new();
            header.write(&mut w);
            let bytes = w.into_vec();
            let mut r = Reader::new(&bytes);
            proptest::prop_assert_eq!(PublicHeader::read(&mut r).unwrap(), header);
        }

        #[test]
        fn private_header_round_trips_for_arbitrary_fields(seq: u32, ack: u32, nack: u32, dtype: u32) {
            let header = PrivateHeader { version: PROTOCOL_VERSION, seq, ack, nack, dtype };
            let mut w = Writer::new();
            header.write(&mut w);
            let bytes = w.into_vec();
            let mut r = Reader::new(&bytes);
            proptest::prop_assert_eq!(PrivateHeader::read(&mut r).unwrap(), header);
        }
    }
}
