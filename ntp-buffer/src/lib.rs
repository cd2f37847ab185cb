//! Typed big-endian reader/writer over byte slices, with bounds checking.
//!
//! This is the sole API every other crate in the workspace uses to touch
//! raw bytes on the wire. It never panics: every operation that would run
//! past the end of the underlying buffer returns [`BufferError::ShortBuffer`].

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("short buffer: needed {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// A read cursor over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            Err(BufferError::ShortBuffer {
                needed: n,
                available: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    /// Returns the next `n` bytes without advancing the cursor.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;
        Ok(&self.buf[self.pos..self.pos + n])
    }

    /// Reads and returns the next `n` bytes, advancing the cursor.
    pub fn read(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self.peek(n)?;
        self.pos += n;
        Ok(slice)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_bytes::<2>()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_bytes::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_bytes::<4>()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_bytes::<4>()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.read_bytes::<4>()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_bytes::<8>()?))
    }
}

/// An append-only byte writer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_integer_widths() {
        let mut w = Writer::new();
        w.write_u8(0xAB);
        w.write_i8(-5);
        w.write_u16(0x1234);
        w.write_i16(-1234);
        w.write_u32(0xDEAD_BEEF);
        w.write_i32(-123_456);
        w.write_f32(1.5);
        w.write_f64(2.25);

        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_i8().unwrap(), -5);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_i16().unwrap(), -1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i32().unwrap(), -123_456);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), 2.25);
        assert!(r.eof());
    }

    #[test]
    fn short_buffer_is_reported_and_never_panics() {
        let bytes = [0u8; 2];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            r.read_u32(),
            Err(BufferError::ShortBuffer {
                needed: 4,
                available: 2
            })
        );
    }

    #[test]
    fn peek_does_not_advance_cursor() {
        let bytes = [1, 2, 3, 4];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.peek(2).unwrap(), &[1, 2]);
        assert_eq!(r.position(), 0);
        assert_eq!(r.read(2).unwrap(), &[1, 2]);
        assert_eq!(r.position(), 2);
    }

    #[test]
    fn fixed_slice_round_trip() {
        let mut w = Writer::new();
        w.write_bytes(&[9u8; 16]);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read(16).unwrap(), &[9u8; 16]);
    }

    proptest::proptest! {
        #[test]
        fn integers_round_trip_through_writer_and_reader(
            u8v: u8, i8v: i8, u16v: u16, i16v: i16, u32v: u32, i32v: i32,
        ) {
            let mut w = Writer::new();
            w.write_u8(u8v);
            w.write_i8(i8v);
            w.write_u16(u16v);
            w.write_i16(i16v);
            w.write_u32(u32v);
            w.write_i32(i32v);

            let bytes = w.into_vec();
            let mut r = Reader::new(&bytes);
            proptest::prop_assert_eq!(r.read_u8().unwrap(), u8v);
            proptest::prop_assert_eq!(r.read_i8().unwrap(), i8v);
            proptest::prop_assert_eq!(r.read_u16().unwrap(), u16v);
            proptest::prop_assert_eq!(r.read_i16().unwrap(), i16v);
            proptest::prop_assert_eq!(r.read_u32().unwrap(), u32v);
            proptest::prop_assert_eq!(r.read_i32().unwrap(), i32v);
            proptest::prop_assert!(r.eof());
        }

        #[test]
        fn read_past_end_never_panics(bytes: Vec<u8>, n in 0usize..64) {
            let mut r = Reader::new(&bytes);
            let _ = r.read(n);
        }
    }
}
