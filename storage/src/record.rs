//! On-disk record codec.
//!
//! Layout (little-endian), mirroring the original Go `datastore/entry.go`:
//!
//! ```text
//! offset 0..3    uint32 total_size   (everything after this field)
//! offset 4       uint8  flag         (0 = live, 1 = tombstone)
//! offset 5..8    uint32 key_length
//! offset 9..9+K  bytes  key
//! offset 9+K..+3 uint32 value_length
//! offset +4..+V  bytes  value
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Bytes preceding `total_size` itself; not counted in `total_size`.
const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single log entry: a key, a value, and a tombstone flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
}

impl Record {
    pub fn live(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tombstone: false,
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            tombstone: true,
        }
    }

    /// Size in bytes of this record once encoded.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + 1 + 4 + self.key.len() + 4 + self.value.len()
    }

    /// Encode this record to its on-disk byte representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let total_size = (1 + 4 + self.key.len() + 4 + self.value.len()) as u32;

        buf.write_u32::<LittleEndian>(total_size).unwrap();
        buf.write_u8(if self.tombstone { 1 } else { 0 }).unwrap();
        buf.write_u32::<LittleEndian>(self.key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.key);
        buf.write_u32::<LittleEndian>(self.value.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.value);

        buf
    }

    /// Decode the `total_size` length prefix from the first 4 bytes of `buf`.
    ///
    /// Returns the number of further bytes the caller must supply to [`Record::decode`].
    pub fn decode_len_prefix(buf: &[u8]) -> Result<u32, Error> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Err(Error::Malformed("buffer shorter than length prefix"));
        }
        let mut cursor = Cursor::new(buf);
        Ok(cursor.read_u32::<LittleEndian>()?)
    }

    /// Decode a record body (everything after the length prefix) of `total_size` bytes.
    pub fn decode_body(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 1 + 4 {
            return Err(Error::Malformed("body shorter than fixed header"));
        }
        let mut cursor = Cursor::new(body);
        let flag = cursor.read_u8()?;
        let key_len = cursor.read_u32::<LittleEndian>()? as usize;

        let key_start = cursor.position() as usize;
        if body.len() < key_start + key_len + 4 {
            return Err(Error::Malformed("body shorter than declared key + value length field"));
        }
        let key = body[key_start..key_start + key_len].to_vec();

        let mut cursor = Cursor::new(&body[key_start + key_len..]);
        let value_len = cursor.read_u32::<LittleEndian>()? as usize;
        let value_start = key_start + key_len + 4;
        if body.len() < value_start + value_len {
            return Err(Error::Malformed("body shorter than declared value length"));
        }
        let value = body[value_start..value_start + value_len].to_vec();

        Ok(Self {
            key,
            value,
            tombstone: flag == 1,
        })
    }

    /// Decode a full buffer that starts with the length prefix.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let total_size = Self::decode_len_prefix(buf)? as usize;
        let body = &buf[LENGTH_PREFIX_SIZE..];
        if body.len() < total_size {
            return Err(Error::Malformed("buffer shorter than declared total_size"));
        }
        Self::decode_body(&body[..total_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_live_record() {
        let r = Record::live(b"k1".to_vec(), b"v1".to_vec());
        let encoded = r.encode();
        assert_eq!(encoded.len(), r.encoded_len());
        assert_eq!(Record::decode(&encoded).unwrap(), r);
    }

    #[test]
    fn round_trip_tombstone() {
        let r = Record::tombstone(b"x".to_vec());
        let encoded = r.encode();
        let decoded = Record::decode(&encoded).unwrap();
        assert_eq!(decoded, r);
        assert!(decoded.tombstone);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn round_trip_empty_key_and_value() {
        let r = Record::live(Vec::new(), Vec::new());
        let encoded = r.encode();
        assert_eq!(Record::decode(&encoded).unwrap(), r);
    }

    #[test]
    fn encoded_len_matches_layout() {
        let r = Record::live(b"hello".to_vec(), b"world!!".to_vec());
        assert_eq!(r.encoded_len(), 4 + 1 + 4 + 5 + 4 + 7);
        assert_eq!(r.encode().len(), r.encoded_len());
    }

    #[test]
    fn decode_rejects_short_length_prefix() {
        let err = Record::decode(&[1, 2]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let r = Record::live(b"longer-key".to_vec(), b"a-decent-sized-value".to_vec());
        let mut encoded = r.encode();
        encoded.truncate(encoded.len() - 3);
        let err = Record::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn total_size_excludes_length_prefix() {
        let r = Record::live(b"k".to_vec(), b"v".to_vec());
        let encoded = r.encode();
        let total_size = Record::decode_len_prefix(&encoded).unwrap();
        assert_eq!(total_size as usize, encoded.len() - 4);
    }
}
