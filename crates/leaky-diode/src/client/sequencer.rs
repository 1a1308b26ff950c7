//! Request ordering and secret reassembly.

use crate::bits::{Bit, SecretAssembler};
use crate::error::RangeError;

/// Walks the bit stream in order: the 16 header bits first, then exactly as
/// many payload bits as the header announces.
#[derive(Debug, Clone, Default)]
pub struct BitIndexSequencer {
    assembler: SecretAssembler,
}

impl BitIndexSequencer {
    /// Start at index 0 with nothing decoded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index to request next, or `None` once the secret is complete.
    #[must_use]
    pub fn next_index(&self) -> Option<u32> {
        if self.assembler.is_complete() {
            None
        } else {
            Some(self.assembler.bits_received())
        }
    }

    /// Record the decoded value of [`next_index`](Self::next_index).
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] if the secret is already complete.
    pub fn push(&mut self, bit: Bit) -> Result<(), RangeError> {
        self.assembler.push(bit)
    }

    /// Complete payload bytes decoded so far.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        self.assembler.payload()
    }

    /// Secret length, known once the header is decoded.
    #[must_use]
    pub fn secret_length(&self) -> Option<usize> {
        self.assembler.secret_len()
    }

    /// Number of bits decoded so far.
    #[must_use]
    pub fn bits_decoded(&self) -> u32 {
        self.assembler.bits_received()
    }

    /// Total bits to decode, known once the header is decoded.
    #[must_use]
    pub fn total_bits(&self) -> Option<u32> {
        self.assembler.total_bits()
    }

    /// Whether all `16 + 8 * len` bits are decoded.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.assembler.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitSource;

    /// Run the sequencer against a perfect channel, returning the indices it
    /// asked for.
    fn leak(sequencer: &mut BitIndexSequencer, source: &BitSource) -> Vec<u32> {
        let mut requested = Vec::new();
        while let Some(index) = sequencer.next_index() {
            requested.push(index);
            sequencer.push(source.get_bit(index).unwrap()).unwrap();
        }
        requested
    }

    #[test]
    fn noiseless_channel_reconstructs_secret() {
        let patterned: Vec<u8> = (0..300u32).map(|i| (i * 37 % 256) as u8).collect();
        let longest: Vec<u8> = (0..65_535u32).map(|i| (i % 251) as u8).collect();

        for secret in [Vec::new(), vec![0x00], vec![0xFF], b"Hi".to_vec(), patterned, longest] {
            let source = BitSource::new(secret.clone()).unwrap();
            let mut sequencer = BitIndexSequencer::new();
            let requested = leak(&mut sequencer, &source);

            assert!(requested.iter().copied().eq(0..source.total_bits()));
            assert!(sequencer.finished());
            assert_eq!(sequencer.secret(), secret.as_slice());
            assert_eq!(sequencer.secret_length(), Some(secret.len()));
        }
    }

    #[test]
    fn hi_requests_header_then_payload() {
        let source = BitSource::new(b"Hi".to_vec()).unwrap();
        let mut sequencer = BitIndexSequencer::new();
        assert_eq!(sequencer.total_bits(), None);

        for _ in 0..16 {
            let index = sequencer.next_index().unwrap();
            sequencer.push(source.get_bit(index).unwrap()).unwrap();
        }
        assert_eq!(sequencer.secret_length(), Some(2));
        assert_eq!(sequencer.total_bits(), Some(32));
        assert_eq!(sequencer.next_index(), Some(16));
        assert!(sequencer.secret().is_empty());

        let requested = leak(&mut sequencer, &source);
        assert_eq!(requested, (16..32).collect::<Vec<_>>());
        assert_eq!(sequencer.secret(), &[0x48, 0x69]);
        assert_eq!(sequencer.bits_decoded(), 32);
    }

    #[test]
    fn empty_secret_finishes_after_header() {
        let mut sequencer = BitIndexSequencer::new();
        for index in 0..16 {
            assert!(!sequencer.finished());
            assert_eq!(sequencer.next_index(), Some(index));
            sequencer.push(Bit::Low).unwrap();
        }
        assert!(sequencer.finished());
        assert_eq!(sequencer.next_index(), None);
        assert!(sequencer.secret().is_empty());
        assert!(sequencer.push(Bit::Low).is_err());
    }

    #[test]
    fn partial_secret_holds_only_whole_bytes() {
        let source = BitSource::new(b"ok".to_vec()).unwrap();
        let mut sequencer = BitIndexSequencer::new();
        for _ in 0..(16 + 12) {
            let index = sequencer.next_index().unwrap();
            sequencer.push(source.get_bit(index).unwrap()).unwrap();
        }
        assert_eq!(sequencer.secret(), b"o");
        assert!(!sequencer.finished());
    }
}
