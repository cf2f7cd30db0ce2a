//! Chunked Node Storage
//!
//! The log tree persists only the nodes at levels divisible by four, eight
//! to a chunk. A chunk is the 15-slot in-order array of a height-3 subtree
//! whose even slots are the stored nodes; odd slots are interior hashes
//! recomputed on demand and cached only in memory. Stored slots fill left
//! to right as the log grows, so the serialised form is the non-null prefix
//! of the even slots.

use crate::crypto::{Hash, HASH_SIZE};

use super::LogTreeError;

#[derive(Debug, Clone)]
pub struct Chunk {
    slots: [Option<Hash>; 15],
}

impl Chunk {
    pub fn empty() -> Self {
        Self { slots: [None; 15] }
    }

    pub fn parse(id: u64, data: &[u8]) -> Result<Self, LogTreeError> {
        if data.is_empty() || data.len() % HASH_SIZE != 0 || data.len() / HASH_SIZE > 8 {
            return Err(LogTreeError::Corruption(format!(
                "chunk {id} has invalid length {}",
                data.len()
            )));
        }
        let mut chunk = Self::empty();
        for (i, bytes) in data.chunks_exact(HASH_SIZE).enumerate() {
            chunk.slots[2 * i] = Some(bytes.try_into().expect("exact chunk"));
        }
        Ok(chunk)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut ended = false;
        for i in (0..15).step_by(2) {
            match self.slots[i] {
                Some(hash) => {
                    assert!(!ended, "chunk has a gap at slot {i}");
                    out.extend_from_slice(&hash);
                }
                None => ended = true,
            }
        }
        assert!(!out.is_empty(), "serialising an empty chunk");
        out
    }

    pub fn get(&self, slot: usize) -> Option<Hash> {
        self.slots[slot]
    }

    pub fn set(&mut self, slot: usize, value: Hash) {
        self.slots[slot] = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let mut chunk = Chunk::empty();
        chunk.set(0, [1u8; 32]);
        chunk.set(2, [2u8; 32]);
        chunk.set(4, [3u8; 32]);
        let bytes = chunk.serialize();
        assert_eq!(bytes.len(), 96);

        let parsed = Chunk::parse(7, &bytes).unwrap();
        assert_eq!(parsed.get(0), Some([1u8; 32]));
        assert_eq!(parsed.get(2), Some([2u8; 32]));
        assert_eq!(parsed.get(4), Some([3u8; 32]));
        assert_eq!(parsed.get(6), None);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(Chunk::parse(7, &[0u8; 33]).is_err());
        assert!(Chunk::parse(7, &[]).is_err());
        assert!(Chunk::parse(7, &[0u8; 9 * 32]).is_err());
    }

    #[test]
    #[should_panic(expected = "gap")]
    fn test_serialize_panics_on_gap() {
        let mut chunk = Chunk::empty();
        chunk.set(0, [1u8; 32]);
        chunk.set(4, [3u8; 32]);
        chunk.serialize();
    }
}
