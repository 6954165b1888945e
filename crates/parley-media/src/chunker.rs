//! Re-chunk an arbitrary byte stream into fixed-size frames.

use parley_core::error::{ParleyError, Result};

/// Buffers incoming bytes and emits chunks of exactly `target` bytes.
///
/// [`finish`](Self::finish) flushes whatever remains as one short chunk.
#[derive(Debug)]
pub struct FixedChunker {
    target: usize,
    carry: Vec<u8>,
}

impl FixedChunker {
    pub fn new(target: usize) -> Result<Self> {
        if target == 0 {
            return Err(ParleyError::Config("chunk size must be positive".into()));
        }
        Ok(Self {
            target,
            carry: Vec::with_capacity(target),
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes held back waiting for a full chunk.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Discard held-back bytes without emitting them.
    pub fn clear(&mut self) -> usize {
        let discarded = self.carry.len();
        self.carry.clear();
        discarded
    }

    /// Append input and return every complete chunk now available.
    pub fn push(&mut self, input: &[u8]) -> Vec<Vec<u8>> {
        self.carry.extend_from_slice(input);

        let full = self.carry.len() / self.target;
        if full == 0 {
            return Vec::new();
        }

        let take = full * self.target;
        let chunks = self.carry[..take]
            .chunks_exact(self.target)
            .map(<[u8]>::to_vec)
            .collect();
        self.carry.drain(..take);
        chunks
    }

    /// End of stream: return the short tail, if any.
    pub fn finish(self) -> Option<Vec<u8>> {
        (!self.carry.is_empty()).then_some(self.carry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_250_bytes_target_100() {
        let mut chunker = FixedChunker::new(100).unwrap();
        let mut sizes: Vec<usize> = chunker.push(&[7u8; 250]).iter().map(Vec::len).collect();
        if let Some(tail) = chunker.finish() {
            sizes.push(tail.len());
        }
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn test_carry_across_pushes() {
        let mut chunker = FixedChunker::new(4).unwrap();
        assert!(chunker.push(&[1, 2, 3]).is_empty());
        assert_eq!(chunker.pending(), 3);

        let chunks = chunker.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(chunks, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(chunker.finish(), Some(vec![9]));
    }

    #[test]
    fn test_no_chunk_exceeds_target() {
        let mut chunker = FixedChunker::new(9600).unwrap();
        let mut total = 0;
        for size in [1usize, 4800, 20_000, 37, 9600] {
            for chunk in chunker.push(&vec![0u8; size]) {
                assert_eq!(chunk.len(), 9600);
                total += chunk.len();
            }
        }
        total += chunker.finish().map(|t| t.len()).unwrap_or(0);
        assert_eq!(total, 1 + 4800 + 20_000 + 37 + 9600);
    }

    #[test]
    fn test_finish_empty() {
        let mut chunker = FixedChunker::new(10).unwrap();
        chunker.push(&[0; 20]);
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_zero_target_rejected() {
        let err = FixedChunker::new(0).unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
    }

    #[test]
    fn test_clear_drops_carry() {
        let mut chunker = FixedChunker::new(4).unwrap();
        chunker.push(&[0xEE; 6]);
        assert_eq!(chunker.clear(), 2);
        assert_eq!(chunker.pending(), 0);
        assert_eq!(chunker.push(&[0x11; 4]), vec![vec![0x11; 4]]);
    }
}
