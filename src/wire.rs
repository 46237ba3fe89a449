//! Item-coded byte stream primitives (C1).
//!
//! A frame on the wire is one item-code byte followed by a payload whose
//! shape is fixed by the code: zero or more fixed-width big-endian
//! integers and/or 4-byte-length-prefixed byte strings. This module only
//! knows how to encode/decode those shapes against a plain `Read`/`Write`;
//! it has no notion of a socket, a call, or a state machine — that lives
//! in [`crate::srpc`].

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Errors raised while decoding or encoding a frame.
#[derive(Debug)]
pub enum Error {
    /// The underlying byte pipe failed (covers EOF, reset, timeout-as-EOF).
    Io(io::Error),
    /// A byte didn't correspond to any known [`ItemCode`].
    UnknownItemCode(u8),
    /// A length-prefixed field declared more bytes than the configured cap.
    TooLong { declared: usize, max: usize },
    /// A `chars`/`text` field wasn't valid UTF-8.
    NotUtf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "wire io error: {e}"),
            Error::UnknownItemCode(b) => write!(f, "unknown item code {b:#04x}"),
            Error::TooLong { declared, max } => {
                write!(f, "length {declared} exceeds maximum {max}")
            }
            Error::NotUtf8 => write!(f, "field is not valid utf-8"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// `Error::Io` is the only variant that means "need more bytes"; the SRPC
/// layer retries reads on this specifically.
impl Error {
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default send/receive buffer size per endpoint (spec §4.1).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// The maximum byte string length we will ever decode without an explicit
/// caller-provided cap (guards a hostile peer claiming a multi-gigabyte
/// length).
pub const HARD_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Tags the shape of the next frame on the wire.
///
/// The 16 datum codes are exactly the ones enumerated in §4.1/§4.2; the
/// control codes (`hello`, `start_call`, `end`, `end_ack`, `failure`) ride
/// the same byte space, leaving the documented "room for extension".
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ItemCode {
    Int16 = 0,
    Int32 = 1,
    Int64 = 2,
    BoolTrue = 3,
    BoolFalse = 4,
    Chars = 5,
    Text = 6,
    Bytes = 7,
    SocketAddr = 8,
    Int16Array = 9,
    Int32Array = 10,
    Int64Array = 11,
    CharsSeq = 12,
    BytesSeq = 13,
    SeqStart = 14,
    SeqEnd = 15,
    Hello = 16,
    StartCall = 17,
    End = 18,
    EndAck = 19,
    Failure = 20,
}

/// Reads the one-byte item code heading every frame.
pub fn read_item_code(src: &mut impl Read) -> Result<ItemCode> {
    let byte = src.read_u8()?;
    ItemCode::from_u8(byte).ok_or(Error::UnknownItemCode(byte))
}

/// Writes the one-byte item code heading a frame.
pub fn write_item_code(dest: &mut impl Write, code: ItemCode) -> Result<()> {
    dest.write_u8(code.to_u8().expect("ItemCode fits in a byte"))?;
    Ok(())
}

pub fn read_i16(src: &mut impl Read) -> Result<i16> {
    Ok(src.read_i16::<BigEndian>()?)
}

pub fn write_i16(dest: &mut impl Write, v: i16) -> Result<()> {
    Ok(dest.write_i16::<BigEndian>(v)?)
}

pub fn read_i32(src: &mut impl Read) -> Result<i32> {
    Ok(src.read_i32::<BigEndian>()?)
}

pub fn write_i32(dest: &mut impl Write, v: i32) -> Result<()> {
    Ok(dest.write_i32::<BigEndian>(v)?)
}

pub fn read_i64(src: &mut impl Read) -> Result<i64> {
    Ok(src.read_i64::<BigEndian>()?)
}

pub fn write_i64(dest: &mut impl Write, v: i64) -> Result<()> {
    Ok(dest.write_i64::<BigEndian>(v)?)
}

/// Reads a length-prefixed byte string, capped at `max`.
pub fn read_bytes(src: &mut impl Read, max: usize) -> Result<Vec<u8>> {
    let len = src.read_u32::<BigEndian>()? as usize;
    if len > max {
        return Err(Error::TooLong { declared: len, max });
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(dest: &mut impl Write, bytes: &[u8]) -> Result<()> {
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| Error::TooLong { declared: bytes.len(), max: u32::MAX as usize })?;
    dest.write_u32::<BigEndian>(len)?;
    dest.write_all(bytes)?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string (the `text`/`chars` payload shape).
pub fn read_text(src: &mut impl Read, max: usize) -> Result<String> {
    String::from_utf8(read_bytes(src, max)?).map_err(|_| Error::NotUtf8)
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_text(dest: &mut impl Write, s: &str) -> Result<()> {
    write_bytes(dest, s.as_bytes())
}

/// Reads a homogeneous array of fixed-width integers (`int-array` codes),
/// length-prefixed like a byte string but counting elements, not bytes.
pub fn read_i32_array(src: &mut impl Read, max_len: usize) -> Result<Vec<i32>> {
    let len = src.read_u32::<BigEndian>()? as usize;
    if len > max_len {
        return Err(Error::TooLong { declared: len, max: max_len });
    }
    (0..len).map(|_| read_i32(src)).collect()
}

pub fn write_i32_array(dest: &mut impl Write, values: &[i32]) -> Result<()> {
    let len: u32 = values
        .len()
        .try_into()
        .map_err(|_| Error::TooLong { declared: values.len(), max: u32::MAX as usize })?;
    dest.write_u32::<BigEndian>(len)?;
    for v in values {
        write_i32(dest, *v)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn item_code_roundtrips() {
        let mut buf = Vec::new();
        write_item_code(&mut buf, ItemCode::Int32).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_item_code(&mut cur).unwrap(), ItemCode::Int32);
    }

    #[test]
    fn bytes_roundtrip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_bytes(&mut cur, 1024).unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn bytes_over_cap_rejected() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &vec![0u8; 100]).unwrap();
        let mut cur = Cursor::new(buf);
        assert!(matches!(read_bytes(&mut cur, 10), Err(Error::TooLong { .. })));
    }

    #[test]
    fn unknown_item_code_is_rejected() {
        let mut cur = Cursor::new(vec![0xEEu8]);
        assert!(matches!(read_item_code(&mut cur), Err(Error::UnknownItemCode(0xEE))));
    }

    #[test]
    fn int64_roundtrips_extreme_values() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX] {
            let mut buf = Vec::new();
            write_i64(&mut buf, v).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(read_i64(&mut cur).unwrap(), v);
        }
    }
}
