// Copyright 2020 Joyent, Inc.

//! Running checksums over call arguments.
//!
//! The checksum of a fragment covers the argument bytes carried by that
//! fragment, seeded with the checksum of the previous fragment of the same
//! message, so the value in the final fragment covers every argument byte.

use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::Deserialize;

use crate::error::{Error, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    None = 0x00,
    Crc32 = 0x01,
    Farm32 = 0x02,
    Crc32c = 0x03,
}

impl Default for ChecksumType {
    fn default() -> Self {
        ChecksumType::Crc32
    }
}

impl ChecksumType {
    pub fn from_byte(b: u8) -> Result<ChecksumType> {
        FromPrimitive::from_u8(b).ok_or(Error::UnsupportedChecksum(b))
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Number of checksum bytes that follow the type byte on the wire.
    pub fn size(self) -> usize {
        match self {
            ChecksumType::None => 0,
            _ => 4,
        }
    }

    /// Continues a checksum from `prior` over `chunks`, in order.
    pub fn compute(self, prior: u32, chunks: &[&[u8]]) -> Result<u32> {
        match self {
            ChecksumType::None => Ok(0),
            ChecksumType::Crc32 => {
                let mut hasher = crc32fast::Hasher::new_with_initial(prior);
                for chunk in chunks {
                    hasher.update(chunk);
                }
                Ok(hasher.finalize())
            }
            ChecksumType::Crc32c => Ok(chunks
                .iter()
                .fold(prior, |crc, chunk| crc32c::crc32c_append(crc, chunk))),
            ChecksumType::Farm32 => {
                Err(Error::UnsupportedChecksum(self.as_byte()))
            }
        }
    }

    /// Checks `expected` against the checksum of `chunks` and returns the
    /// value to seed the next fragment with.
    pub fn verify(self, prior: u32, chunks: &[&[u8]], expected: u32) -> Result<u32> {
        let actual = self.compute(prior, chunks)?;
        if self != ChecksumType::None && actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_checksum_matches_single_pass() {
        let whole = b"hello, relay world";
        for csum in &[ChecksumType::Crc32, ChecksumType::Crc32c] {
            let once = csum.compute(0, &[&whole[..]]).unwrap();
            let first = csum.compute(0, &[&whole[..5]]).unwrap();
            let second = csum.compute(first, &[&whole[5..9], &whole[9..]]).unwrap();
            assert_eq!(once, second, "{:?}", csum);
        }
    }

    #[test]
    fn crc32_known_value() {
        let v = ChecksumType::Crc32.compute(0, &[&b"123456789"[..]]).unwrap();
        assert_eq!(v, 0xcbf4_3926);
        let v = ChecksumType::Crc32c.compute(0, &[&b"123456789"[..]]).unwrap();
        assert_eq!(v, 0xe306_9283);
    }

    #[test]
    fn verify_detects_corruption() {
        let good = ChecksumType::Crc32.compute(0, &[&b"payload"[..]]).unwrap();
        assert!(ChecksumType::Crc32.verify(0, &[&b"payload"[..]], good).is_ok());
        match ChecksumType::Crc32.verify(0, &[&b"paylaod"[..]], good) {
            Err(Error::ChecksumMismatch { expected, .. }) => {
                assert_eq!(expected, good)
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(ChecksumType::None.verify(0, &[&b"paylaod"[..]], good).is_ok());
    }

    #[test]
    fn unsupported_types() {
        assert!(ChecksumType::from_byte(0x09).is_err());
        assert_eq!(ChecksumType::from_byte(0x03).unwrap(), ChecksumType::Crc32c);
        assert!(ChecksumType::Farm32.compute(0, &[&b"x"[..]]).is_err());
        assert_eq!(ChecksumType::None.size(), 0);
        assert_eq!(ChecksumType::Crc32c.size(), 4);
    }
}
