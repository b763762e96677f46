//! Byte-level merge buffer and data synthesis.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::cell::RefCell;

/// Seed for synthesized blob bytes. Thread-local so multi-threaded builds
/// stay reproducible per thread.
const SYNTH_SEED: u64 = 0x9b648;

thread_local! {
    static SYNTH_RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(SYNTH_SEED));
}

/// Pseudo-random blob bytes of the given length.
#[must_use]
pub fn synth_data(size: usize) -> Vec<u8> {
    let mut data = vec![0_u8; size];
    SYNTH_RNG.with(|rng| rng.borrow_mut().fill_bytes(&mut data));
    data
}

/// Accumulates blob bytes and emits the buffer once it reaches the merge
/// size.
pub struct ChunkMerger {
    merge_size: usize,
    buffer: Vec<u8>,
}

impl ChunkMerger {
    #[must_use]
    pub fn new(merge_size: usize) -> Self {
        Self {
            merge_size,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn merge_size(&self) -> usize {
        self.merge_size
    }

    /// Append `input`, returning its offset in the buffer and, when the
    /// buffer filled up, the emitted buffer.
    pub fn merge(&mut self, input: &[u8]) -> (usize, Option<Vec<u8>>) {
        if input.is_empty() {
            return (self.buffer.len(), None);
        }
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(input);
        if self.buffer.len() >= self.merge_size {
            (offset, Some(self.flush()))
        } else {
            (offset, None)
        }
    }

    /// Take the partial buffer. The replacement reserves a little over the
    /// merge size to absorb the blob that crosses the boundary.
    pub fn flush(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.buffer);
        self.buffer.reserve(self.merge_size * 108 / 100);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_when_full() {
        let mut merger = ChunkMerger::new(8);
        let (off, out) = merger.merge(&[1; 5]);
        assert_eq!(off, 0);
        assert!(out.is_none());
        let (off, out) = merger.merge(&[2; 5]);
        assert_eq!(off, 5);
        let out = out.unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(&out[..5], &[1; 5]);
    }

    #[test]
    fn flush_returns_partial() {
        let mut merger = ChunkMerger::new(64);
        merger.merge(&[3; 10]);
        assert_eq!(merger.flush().len(), 10);
        assert_eq!(merger.flush().len(), 0);
    }

    #[test]
    fn synth_data_has_requested_length() {
        assert_eq!(synth_data(100).len(), 100);
        assert_eq!(synth_data(0).len(), 0);
    }
}
