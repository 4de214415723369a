//! Composite key encoding
//!
//! Keys are compared by the store as raw bytes, so every component is encoded
//! such that byte order equals logical order:
//!
//! - `i64`: 8 bytes, big-endian, sign bit flipped (`-1 < 0 < 1` holds bytewise)
//! - `u8`: one byte
//! - strings: `u32` big-endian length followed by the UTF-8 bytes
//!
//! Tuples concatenate their components in order, so a prefix scan over the
//! leading components of a composite key matches exactly those entries. The
//! length prefix on strings keeps `"order"` from matching `"order-2"`.

use crate::codec::{self, DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

const SIGN_BIT: u64 = 1 << 63;

/// A value usable as (a component of) a store key
pub trait DbKey {
    fn key_len(&self) -> usize;

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    fn to_key_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.key_len());
        self.write_key(&mut buf)?;
        Ok(buf.to_vec())
    }
}

impl DbKey for i64 {
    fn key_len(&self) -> usize {
        8
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u64((*self as u64) ^ SIGN_BIT);
        Ok(())
    }
}

impl DbKey for u8 {
    fn key_len(&self) -> usize {
        1
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(*self);
        Ok(())
    }
}

impl DbKey for str {
    fn key_len(&self) -> usize {
        codec::blob_len(self.as_bytes())
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        codec::put_string(buf, self)
    }
}

impl DbKey for String {
    fn key_len(&self) -> usize {
        self.as_str().key_len()
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_str().write_key(buf)
    }
}

impl<T: DbKey + ?Sized> DbKey for &T {
    fn key_len(&self) -> usize {
        (**self).key_len()
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        (**self).write_key(buf)
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn key_len(&self) -> usize {
        self.0.key_len() + self.1.key_len()
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.write_key(buf)?;
        self.1.write_key(buf)
    }
}

impl<A: DbKey, B: DbKey, C: DbKey> DbKey for (A, B, C) {
    fn key_len(&self) -> usize {
        self.0.key_len() + self.1.key_len() + self.2.key_len()
    }

    fn write_key(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.write_key(buf)?;
        self.1.write_key(buf)?;
        self.2.write_key(buf)
    }
}

/// Read an `i64` key component written by [`DbKey::write_key`]
pub fn read_i64_key(buf: &mut &[u8]) -> Result<i64, DecodeError> {
    let raw = codec::read_i64(buf)? as u64;
    Ok((raw ^ SIGN_BIT) as i64)
}

pub fn read_u8_key(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    codec::read_u8(buf)
}

pub fn read_string_key(buf: &mut &[u8]) -> Result<String, DecodeError> {
    codec::read_string(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_byte_order_matches_numeric_order() {
        let values = [i64::MIN, -1_000, -1, 0, 1, 255, 256, 1_700_000_000_000, i64::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| v.to_key_bytes().unwrap()).collect();

        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_i64_key_roundtrip_through_reader() {
        for value in [-1i64, 0, 42, i64::MIN] {
            let bytes = value.to_key_bytes().unwrap();
            let mut buf: &[u8] = &bytes;
            assert_eq!(read_i64_key(&mut buf).unwrap(), value);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_composite_prefix_is_exact() {
        let short = ("order", 1i64).to_key_bytes().unwrap();
        let long = ("order-2", 1i64).to_key_bytes().unwrap();
        let prefix = "order".to_key_bytes().unwrap();

        assert!(short.starts_with(&prefix));
        assert!(!long.starts_with(&prefix));
    }

    #[test]
    fn test_triple_key_layout() {
        let key = (7i64, 2u8, 9i64).to_key_bytes().unwrap();
        assert_eq!(key.len(), 17);

        let mut buf: &[u8] = &key;
        assert_eq!(read_i64_key(&mut buf).unwrap(), 7);
        assert_eq!(read_u8_key(&mut buf).unwrap(), 2);
        assert_eq!(read_i64_key(&mut buf).unwrap(), 9);
    }
}
