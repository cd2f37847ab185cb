//! The generic tag-length-value engine SPACK is built on. Everything above
//! this module (task records, metric reports) compiles down to a tree of
//! [`Value`]s keyed by [`Key`] and back.

use ntp_buffer::{Reader, Writer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SpackError {
    #[error("unknown key {0}")]
    UnknownKey(u8),
    #[error("bad value for key {0}")]
    BadValueForKey(&'static str),
    #[error("dynamic key with no name table")]
    MissingKeymap,
    #[error("truncated object")]
    TruncatedObject,
    #[error("unknown type code {0}")]
    UnknownTypeCode(u8),
    #[error(transparent)]
    Buffer(#[from] ntp_buffer::BufferError),
}

pub type Result<T> = std::result::Result<T, SpackError>;

const TYPE_U8: u8 = 1;
const TYPE_U16: u8 = 2;
const TYPE_U32: u8 = 3;
const TYPE_S8: u8 = 4;
const TYPE_S16: u8 = 5;
const TYPE_S32: u8 = 6;
const TYPE_FLOAT: u8 = 7;
const TYPE_DOUBLE: u8 = 8;
const TYPE_OBJECT: u8 = 255;

/// The reserved key byte that signals a dynamic, named field.
pub const NAMED_KEY: u8 = 255;

/// An object field key: either a static dictionary identifier or a dynamic
/// UTF-8 name (interface names, and the like).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Id(u8),
    Named(String),
}

impl Key {
    fn write(&self, w: &mut Writer) -> Result<()> {
        match self {
            Key::Id(id) => {
                if *id == NAMED_KEY {
                    return Err(SpackError::BadValueForKey("dictionary id collides with NAMED_KEY"));
                }
                w.write_u8(*id);
            }
            Key::Named(name) => {
                w.write_u8(NAMED_KEY);
                let bytes = name.as_bytes();
                if bytes.len() > u8::MAX as usize {
                    return Err(SpackError::BadValueForKey("dynamic key name too long"));
                }
                w.write_u8(bytes.len() as u8);
                w.write_bytes(bytes);
            }
        }
        Ok(())
    }

    fn read(r: &mut Reader) -> Result<Self> {
        let tag = r.read_u8()?;
        if tag == NAMED_KEY {
            let len = r.read_u8()? as usize;
            let bytes = r.read(len)?;
            let name = std::str::from_utf8(bytes)
                .map_err(|_| SpackError::BadValueForKey("dynamic key name is not utf-8"))?;
            Ok(Key::Named(name.to_string()))
        } else {
            Ok(Key::Id(tag))
        }
    }
}

/// A single SPACK value: either a scalar of one of the eight primitive
/// types, or a nested object. Integers are always stored widened to the
/// natural width of the variant; [`Value::pack_int`]/[`Value::pack_signed`]
/// pick the narrowest wire representation on encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    S8(i8),
    S16(i16),
    S32(i32),
    Float(f32),
    Double(f64),
    Object(Vec<(Key, Value)>),
}

impl Value {
    /// Builds the narrowest unsigned integer representation for `v`.
    pub fn pack_int(v: u32) -> Value {
        if v <= u8::MAX as u32 {
            Value::U8(v as u8)
        } else if v <= u16::MAX as u32 {
            Value::U16(v as u16)
        } else {
            Value::U32(v)
        }
    }

    /// Builds the narrowest signed integer representation for `v`.
    pub fn pack_signed(v: i32) -> Value {
        if v >= i8::MIN as i32 && v <= i8::MAX as i32 {
            Value::S8(v as i8)
        } else if v >= i16::MIN as i32 && v <= i16::MAX as i32 {
            Value::S16(v as i16)
        } else {
            Value::S32(v)
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Value::U8(v) => Ok(v as u32),
            Value::U16(v) => Ok(v as u32),
            Value::U32(v) => Ok(v),
            _ => Err(SpackError::BadValueForKey("expected an unsigned integer")),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match *self {
            Value::S8(v) => Ok(v as i32),
            Value::S16(v) => Ok(v as i32),
            Value::S32(v) => Ok(v),
            _ => Err(SpackError::BadValueForKey("expected a signed integer")),
        }
    }

    pub fn as_object(&self) -> Result<&[(Key, Value)]> {
        match self {
            Value::Object(fields) => Ok(fields),
            _ => Err(SpackError::BadValueForKey("expected an object")),
        }
    }

    pub fn write(&self, w: &mut Writer) -> Result<()> {
        match self {
            Value::U8(v) => {
                w.write_u8(TYPE_U8);
                w.write_u8(*v);
            }
            Value::U16(v) => {
                w.write_u8(TYPE_U16);
                w.write_u16(*v);
            }
            Value::U32(v) => {
                w.write_u8(TYPE_U32);
                w.write_u32(*v);
            }
            Value::S8(v) => {
                w.write_u8(TYPE_S8);
                w.write_i8(*v);
            }
            Value::S16(v) => {
                w.write_u8(TYPE_S16);
                w.write_i16(*v);
            }
            Value::S32(v) => {
                w.write_u8(TYPE_S32);
                w.write_i32(*v);
            }
            Value::Float(v) => {
                w.write_u8(TYPE_FLOAT);
                w.write_f32(*v);
            }
            Value::Double(v) => {
                w.write_u8(TYPE_DOUBLE);
                w.write_f64(*v);
            }
            Value::Object(fields) => {
                w.write_u8(TYPE_OBJECT);
                if fields.len() > u8::MAX as usize {
                    return Err(SpackError::BadValueForKey("object has too many fields"));
                }
                w.write_u8(fields.len() as u8);
                for (key, value) in fields {
                    key.write(w)?;
                    value.write(w)?;
                }
            }
        }
        Ok(())
    }

    pub fn read(r: &mut Reader) -> Result<Self> {
        let type_code = r.read_u8()?;
        match type_code {
            TYPE_U8 => Ok(Value::U8(r.read_u8()?)),
            TYPE_U16 => Ok(Value::U16(r.read_u16()?)),
            TYPE_U32 => Ok(Value::U32(r.read_u32()?)),
            TYPE_S8 => Ok(Value::S8(r.read_i8()?)),
            TYPE_S16 => Ok(Value::S16(r.read_i16()?)),
            TYPE_S32 => Ok(Value::S32(r.read_i32()?)),
            TYPE_FLOAT => Ok(Value::Float(r.read_f32()?)),
            TYPE_DOUBLE => Ok(Value::Double(r.read_f64()?)),
            TYPE_OBJECT => {
                let count = r.read_u8().map_err(|_| SpackError::TruncatedObject)?;
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = Key::read(r).map_err(|_| SpackError::TruncatedObject)?;
                    let value = Value::read(r)?;
                    fields.push((key, value));
                }
                Ok(Value::Object(fields))
            }
            other => Err(SpackError::UnknownTypeCode(other)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        self.write(&mut w)?;
        Ok(w.into_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Value::read(&mut r)
    }
}

/// Looks up a field by static dictionary id within an already-decoded
/// object's fields.
pub fn field_by_id(fields: &[(Key, Value)], id: u8) -> Option<&Value> {
    fields.iter().find_map(|(k, v)| match k {
        Key::Id(found) if *found == id => Some(v),
        _ => None,
    })
}
