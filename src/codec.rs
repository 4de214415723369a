//! Binary record codec
//!
//! Every record persisted by the state layer implements [`BufferWriter`] and
//! [`BufferReader`]. Records know their encoded length up front, write
//! themselves into a `BytesMut`, and re-hydrate from a byte slice.
//!
//! # Layout rules
//!
//! - Fixed-width integers are big-endian in every record type.
//! - Strings and blobs are prefixed with their length as a `u32`.
//! - Value records start with a single layout version byte ([`LAYOUT_VERSION`]).
//!   Keys carry no version byte (see [`crate::db::key`]).
//!
//! Decoding never guesses: an undersized buffer, an unknown version or an
//! unknown enum tag is a [`DecodeError`]. A string or blob too long for its
//! length prefix is an [`EncodeError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Current layout version written in front of every value record
pub const LAYOUT_VERSION: u8 = 1;

/// Errors raised while decoding a stored record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer ended before a field could be read
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Record was written with a layout this build does not understand
    #[error("unsupported layout version {0}")]
    UnsupportedVersion(u8),

    /// Enum discriminant out of range
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u16 },

    /// String field was not valid UTF-8
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Bytes left over after the record was fully read
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Errors raised while encoding a record or key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// String or blob longer than its `u32` length prefix can describe
    #[error("field of {0} bytes does not fit a u32 length prefix")]
    FieldTooLarge(usize),
}

/// A record that can write itself into a buffer
pub trait BufferWriter {
    /// Exact number of bytes [`BufferWriter::write`] will append
    fn encoded_len(&self) -> usize;

    /// Append the encoded record to `buf`
    fn write(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// A record that can be re-hydrated from a buffer slice
pub trait BufferReader: Sized {
    /// Read one record from the front of `buf`, advancing it
    fn read(buf: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decode a buffer holding exactly one record
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        let record = Self::read(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(record)
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

/// Read and check the layout version byte
pub fn read_version(buf: &mut &[u8]) -> Result<(), DecodeError> {
    match read_u8(buf)? {
        LAYOUT_VERSION => Ok(()),
        other => Err(DecodeError::UnsupportedVersion(other)),
    }
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut &[u8]) -> Result<bool, DecodeError> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut &[u8]) -> Result<i64, DecodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Decode a value that is exactly one big-endian `i64`
pub fn decode_i64(bytes: &[u8]) -> Result<i64, DecodeError> {
    let mut buf = bytes;
    let value = read_i64(&mut buf)?;
    ensure_consumed(buf)?;
    Ok(value)
}

/// Decode a value that is exactly one big-endian `i32`
pub fn decode_i32(bytes: &[u8]) -> Result<i32, DecodeError> {
    let mut buf = bytes;
    let value = read_i32(&mut buf)?;
    ensure_consumed(buf)?;
    Ok(value)
}

fn ensure_consumed(buf: &[u8]) -> Result<(), DecodeError> {
    if !buf.is_empty() {
        return Err(DecodeError::TrailingBytes(buf.len()));
    }
    Ok(())
}

pub fn read_blob(buf: &mut &[u8]) -> Result<Bytes, DecodeError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn read_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let raw = read_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

pub fn put_blob(buf: &mut BytesMut, value: &[u8]) -> Result<(), EncodeError> {
    let len = u32::try_from(value.len()).map_err(|_| EncodeError::FieldTooLarge(value.len()))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), EncodeError> {
    put_blob(buf, value.as_bytes())
}

/// Encoded size of a length-prefixed string or blob
pub fn blob_len(value: &[u8]) -> usize {
    4 + value.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_integer_is_an_error() {
        let mut buf: &[u8] = &[0, 0, 1];
        assert_eq!(
            read_i32(&mut buf),
            Err(DecodeError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_blob_length_larger_than_buffer() {
        let mut encoded = BytesMut::new();
        encoded.put_u32(10);
        encoded.put_slice(b"abc");
        let mut buf: &[u8] = &encoded;
        assert!(matches!(
            read_blob(&mut buf),
            Err(DecodeError::Truncated { needed: 10, .. })
        ));
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_i64(1);
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf: &[u8] = &[9];
        assert_eq!(read_version(&mut buf), Err(DecodeError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut encoded = BytesMut::new();
        put_blob(&mut encoded, &[0xff, 0xfe]).unwrap();
        let mut buf: &[u8] = &encoded;
        assert_eq!(read_string(&mut buf), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_single_integer_values_reject_trailing_bytes() {
        assert_eq!(decode_i64(&7i64.to_be_bytes()).unwrap(), 7);
        assert_eq!(decode_i32(&3i32.to_be_bytes()).unwrap(), 3);

        let mut padded = 7i64.to_be_bytes().to_vec();
        padded.push(0);
        assert_eq!(decode_i64(&padded), Err(DecodeError::TrailingBytes(1)));
        assert_eq!(decode_i32(&[0, 0, 0, 3, 9, 9]), Err(DecodeError::TrailingBytes(2)));
        assert!(matches!(decode_i64(&[0, 1]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_blob_length_prefix_fits_u32() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abc").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
        assert_eq!(buf.len(), blob_len(b"abc"));
    }
}
