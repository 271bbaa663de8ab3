use crate::types::hash::{BlockHash, Hash256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header of a block as relayed inside a filtered block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,

    /// Hash of the previous block header
    pub previous: BlockHash,

    /// Merkle root of the transactions in this block
    pub merkle_root: Hash256,

    /// Timestamp of the block (seconds since Unix epoch)
    pub timestamp: u64,

    /// Target difficulty bits
    pub bits: u32,

    /// Nonce used for proof of work
    pub nonce: u32,

    /// Height assigned by the chain store; not part of the hash
    pub height: u64,
}

impl BlockHeader {
    pub fn new(previous: BlockHash, merkle_root: Hash256, timestamp: u64, bits: u32) -> Self {
        Self {
            version: 1,
            previous,
            merkle_root,
            timestamp,
            bits,
            nonce: 0,
            height: 0,
        }
    }

    /// Calculate the hash of this block header
    pub fn hash(&self) -> BlockHash {
        Hash256::digest(&self.serialize_for_hash())
    }

    fn serialize_for_hash(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(88);
        buffer.extend_from_slice(&self.version.to_le_bytes());
        buffer.extend_from_slice(self.previous.as_bytes());
        buffer.extend_from_slice(self.merkle_root.as_bytes());
        buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        buffer.extend_from_slice(&self.bits.to_le_bytes());
        buffer.extend_from_slice(&self.nonce.to_le_bytes());
        buffer
    }

    /// Check if the block header hash meets the target difficulty
    pub fn meets_target(&self) -> bool {
        let target = bits_to_target(self.bits);
        if target == [0u8; 32] {
            return false;
        }
        let hash_val = self.hash();

        // Compare as 256-bit little-endian integers, most significant byte first
        for i in (0..32).rev() {
            if hash_val.0[i] < target[i] {
                return true;
            } else if hash_val.0[i] > target[i] {
                return false;
            }
        }
        true
    }

    /// Increment the nonce for mining
    pub fn increment_nonce(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }

    /// Get the target as a 256-bit little-endian value
    pub fn target(&self) -> [u8; 32] {
        bits_to_target(self.bits)
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockHeader {{ hash: {}, previous: {}, height: {}, bits: {:#x}, nonce: {} }}",
            self.hash(),
            self.previous,
            self.height,
            self.bits,
            self.nonce
        )
    }
}

/// Convert compact difficulty bits to a little-endian target.
/// Negative or overflowing encodings yield a zero target, which no hash meets.
fn bits_to_target(bits: u32) -> [u8; 32] {
    let mut target = [0u8; 32];

    let exponent = ((bits >> 24) & 0xFF) as usize;
    let coefficient = bits & 0x007F_FFFF;

    if bits & 0x0080_0000 != 0 || coefficient == 0 {
        return target;
    }

    if exponent <= 3 {
        let value = coefficient >> (8 * (3 - exponent));
        target[..4].copy_from_slice(&value.to_le_bytes());
    } else if exponent <= 32 {
        let start_pos = exponent - 3;
        for (i, byte) in coefficient.to_le_bytes()[..3].iter().enumerate() {
            if start_pos + i < 32 {
                target[start_pos + i] = *byte;
            } else if *byte != 0 {
                return [0u8; 32];
            }
        }
    }

    target
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Easiest target: roughly half of all hashes qualify
    const EASY_BITS: u32 = 0x207f_ffff;

    #[test]
    fn test_hash_ignores_height() {
        let mut header = BlockHeader::new(Hash256::ZERO, Hash256::ZERO, 1, EASY_BITS);
        let before = header.hash();
        header.height = 42;
        assert_eq!(header.hash(), before);
        header.increment_nonce();
        assert_ne!(header.hash(), before);
    }

    #[test]
    fn test_easy_target_is_minable() {
        let mut header = BlockHeader::new(Hash256::ZERO, Hash256::ZERO, 1, EASY_BITS);
        let mut attempts = 0;
        while !header.meets_target() {
            header.increment_nonce();
            attempts += 1;
            assert!(attempts < 1_000);
        }
    }

    #[test]
    fn test_impossible_targets() {
        let header = BlockHeader::new(Hash256::ZERO, Hash256::ZERO, 1, 0x0300_0000);
        assert!(!header.meets_target());

        // Sign bit set
        let header = BlockHeader::new(Hash256::ZERO, Hash256::ZERO, 1, 0x2080_0001);
        assert!(!header.meets_target());
    }

    #[test]
    fn test_bits_to_target_layout() {
        let target = bits_to_target(0x1d00_ffff);
        assert_eq!(target[26], 0xff);
        assert_eq!(target[27], 0xff);
        assert_eq!(target[28], 0x00);
        assert!(target[..26].iter().all(|b| *b == 0));
    }
}
