//! Bit addressing of the secret.
//!
//! The secret is leaked as one stream of bits: a 16-bit big-endian length
//! header followed by the payload, most significant bit first within each
//! byte. For a secret of `L` bytes the stream has `16 + 8 * L` bits.

use std::sync::Arc;

use crate::error::{ConfigError, RangeError};

/// Number of bits in the length header.
pub const HEADER_BITS: u32 = 16;

/// Longest secret the 16-bit header can describe.
pub const MAX_SECRET_LEN: usize = u16::MAX as usize;

/// Total number of addressable bits for a secret of `len` bytes.
#[must_use]
pub fn total_bits(len: u16) -> u32 {
    HEADER_BITS + 8 * u32::from(len)
}

/// One leaked bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bit {
    /// Signalled with the low threshold.
    Low,
    /// Signalled with the high threshold.
    High,
}

impl Bit {
    /// Numeric value of the bit.
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Bit::Low => 0,
            Bit::High => 1,
        }
    }
}

impl From<bool> for Bit {
    fn from(set: bool) -> Self {
        if set { Bit::High } else { Bit::Low }
    }
}

/// Read-only view of the secret as a bit stream.
///
/// Built once per server and shared by every worker.
#[derive(Clone)]
pub struct BitSource {
    secret: Arc<[u8]>,
    len: u16,
}

impl std::fmt::Debug for BitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret itself.
        f.debug_struct("BitSource")
            .field("len", &self.secret.len())
            .finish_non_exhaustive()
    }
}

impl BitSource {
    /// Wrap a secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SecretTooLong`] if the secret is longer than
    /// 65535 bytes.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let secret = secret.into();
        let len = u16::try_from(secret.len()).map_err(|_| ConfigError::SecretTooLong {
            len: secret.len(),
            max: MAX_SECRET_LEN,
        })?;
        Ok(Self {
            secret: secret.into(),
            len,
        })
    }

    /// Secret length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secret.len()
    }

    /// Whether the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }

    /// Number of addressable bits (header + payload).
    #[must_use]
    pub fn total_bits(&self) -> u32 {
        total_bits(self.len)
    }

    /// Resolve the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] for `index >= 16 + 8 * len`.
    pub fn get_bit(&self, index: u32) -> Result<Bit, RangeError> {
        let total = self.total_bits();
        if index >= total {
            return Err(RangeError { index, total });
        }

        if index < HEADER_BITS {
            let header = self.len;
            let shift = HEADER_BITS - 1 - index;
            return Ok(Bit::from((header >> shift) & 1 == 1));
        }

        let offset = index - HEADER_BITS;
        let byte = self.secret[(offset / 8) as usize];
        let shift = 7 - offset % 8;
        Ok(Bit::from((byte >> shift) & 1 == 1))
    }
}

/// Rebuilds a secret from bits received in stream order.
///
/// The first 16 bits fill the length header; after that every eight bits
/// complete one payload byte.
#[derive(Debug, Clone, Default)]
pub struct SecretAssembler {
    header: u16,
    len: Option<u16>,
    payload: Vec<u8>,
    partial: u8,
    received: u32,
}

impl SecretAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the bit at index [`bits_received`](Self::bits_received).
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] if the stream is already complete.
    pub fn push(&mut self, bit: Bit) -> Result<(), RangeError> {
        if let Some(total) = self.total_bits()
            && self.received >= total
        {
            return Err(RangeError {
                index: self.received,
                total,
            });
        }

        let value = bit.value();
        self.received += 1;
        if self.received <= HEADER_BITS {
            self.header = (self.header << 1) | u16::from(value);
            if self.received == HEADER_BITS {
                self.payload.reserve_exact(usize::from(self.header));
                self.len = Some(self.header);
            }
            return Ok(());
        }

        self.partial = (self.partial << 1) | value;
        if (self.received - HEADER_BITS) % 8 == 0 {
            self.payload.push(self.partial);
            self.partial = 0;
        }
        Ok(())
    }

    /// Number of bits received so far.
    #[must_use]
    pub fn bits_received(&self) -> u32 {
        self.received
    }

    /// Secret length, known once the header is complete.
    #[must_use]
    pub fn secret_len(&self) -> Option<usize> {
        self.len.map(usize::from)
    }

    /// Total stream length, known once the header is complete.
    #[must_use]
    pub fn total_bits(&self) -> Option<u32> {
        self.len.map(total_bits)
    }

    /// Whether every bit of the stream has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_bits() == Some(self.received)
    }

    /// Complete payload bytes received so far.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(source: &BitSource, range: std::ops::Range<u32>) -> Vec<u8> {
        range
            .map(|i| source.get_bit(i).unwrap().value())
            .collect()
    }

    #[test]
    fn header_is_big_endian_length() {
        let source = BitSource::new(vec![0u8; 0x0102]).unwrap();
        assert_eq!(
            bits(&source, 0..16),
            vec![0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 1, 0]
        );
    }

    #[test]
    fn payload_is_msb_first() {
        let source = BitSource::new(b"Hi".to_vec()).unwrap();
        assert_eq!(source.total_bits(), 32);
        // 'H' = 0x48, 'i' = 0x69
        assert_eq!(bits(&source, 16..24), vec![0, 1, 0, 0, 1, 0, 0, 0]);
        assert_eq!(bits(&source, 24..32), vec![0, 1, 1, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let source = BitSource::new(b"Hi".to_vec()).unwrap();
        assert_eq!(
            source.get_bit(32),
            Err(RangeError {
                index: 32,
                total: 32
            })
        );

        let empty = BitSource::new(Vec::new()).unwrap();
        assert!(empty.is_empty());
        assert!(bits(&empty, 0..16).iter().all(|b| *b == 0));
        assert!(empty.get_bit(16).is_err());
    }

    #[test]
    fn total_bits_covers_full_header_range() {
        assert_eq!(total_bits(0), 16);
        assert_eq!(total_bits(2), 32);
        assert_eq!(total_bits(u16::MAX), 16 + 8 * 65_535);

        let longest = BitSource::new(vec![0x01; MAX_SECRET_LEN]).unwrap();
        assert_eq!(longest.total_bits(), total_bits(u16::MAX));
        assert!(longest.get_bit(total_bits(u16::MAX) - 1).is_ok());
    }

    #[test]
    fn secret_length_is_bounded() {
        assert!(BitSource::new(vec![0xAA; MAX_SECRET_LEN]).is_ok());
        let err = BitSource::new(vec![0xAA; MAX_SECRET_LEN + 1]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::SecretTooLong {
                len: MAX_SECRET_LEN + 1,
                max: MAX_SECRET_LEN
            }
        );
    }

    #[test]
    fn assembler_rebuilds_source() {
        let source = BitSource::new(b"Hi".to_vec()).unwrap();
        let mut assembler = SecretAssembler::new();

        for index in 0..HEADER_BITS {
            assert_eq!(assembler.secret_len(), None);
            assembler.push(source.get_bit(index).unwrap()).unwrap();
        }
        assert_eq!(assembler.secret_len(), Some(2));
        assert_eq!(assembler.total_bits(), Some(32));
        assert!(assembler.payload().is_empty());

        for index in HEADER_BITS..source.total_bits() {
            assembler.push(source.get_bit(index).unwrap()).unwrap();
            assert_eq!(assembler.payload().len(), ((index - 15) / 8) as usize);
        }
        assert!(assembler.is_complete());
        assert_eq!(assembler.payload(), b"Hi");
        assert_eq!(
            assembler.push(Bit::High),
            Err(RangeError {
                index: 32,
                total: 32
            })
        );
    }

    #[test]
    fn assembler_completes_after_empty_header() {
        let mut assembler = SecretAssembler::new();
        for _ in 0..HEADER_BITS {
            assert!(!assembler.is_complete());
            assembler.push(Bit::Low).unwrap();
        }
        assert!(assembler.is_complete());
        assert_eq!(assembler.secret_len(), Some(0));
        assert!(assembler.payload().is_empty());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let source = BitSource::new(b"password".to_vec()).unwrap();
        let debug = format!("{source:?}");
        assert!(!debug.contains("password"));
        assert!(debug.contains("len: 8"));
    }
}
