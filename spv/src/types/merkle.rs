//! Filtered blocks: a header plus a partial merkle tree proving which
//! transactions matched the peer-side bloom filter.

use crate::types::block::BlockHeader;
use crate::types::hash::{BlockHash, Hash256, TxHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when walking a partial merkle tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Filtered block claims no transactions")]
    NoTransactions,

    #[error("More hashes ({hashes}) than transactions ({transactions})")]
    TooManyHashes { hashes: usize, transactions: u32 },

    #[error("Proof ran out of {0}")]
    Exhausted(&'static str),

    #[error("Proof left unused {0}")]
    Unconsumed(&'static str),

    #[error("Duplicate right-hand node in proof")]
    DuplicateNode,

    #[error("Merkle root mismatch: header {expected}, proof {actual}")]
    RootMismatch { expected: Hash256, actual: Hash256 },
}

/// Block header plus the compact membership proof for matched transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    /// Number of transactions in the full block
    pub total_transactions: u32,
    /// Hashes in depth-first order
    pub hashes: Vec<Hash256>,
    /// Flag bits in depth-first order, packed LSB first
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// Build a filtered block for `txids`, proving the entries whose `matched` flag is set.
    /// The header's merkle root is replaced by the root of `txids`.
    pub fn from_txids(mut header: BlockHeader, txids: &[TxHash], matched: &[bool]) -> Self {
        let mut builder = TreeBuilder {
            txids,
            matched,
            bits: Vec::new(),
            hashes: Vec::new(),
        };

        if !txids.is_empty() {
            let height = tree_height(txids.len() as u32);
            header.merkle_root = builder.calc_hash(height, 0);
            builder.build(height, 0);
        }

        let mut flags = vec![0u8; (builder.bits.len() + 7) / 8];
        for (i, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }

        Self {
            header,
            total_transactions: txids.len() as u32,
            hashes: builder.hashes,
            flags,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn previous(&self) -> BlockHash {
        self.header.previous
    }

    /// Walk the proof and return the matched transaction hashes, checking the
    /// recomputed root against the header.
    pub fn extract_matches(&self) -> Result<Vec<TxHash>, MerkleError> {
        if self.total_transactions == 0 {
            return Err(MerkleError::NoTransactions);
        }
        if self.hashes.len() > self.total_transactions as usize {
            return Err(MerkleError::TooManyHashes {
                hashes: self.hashes.len(),
                transactions: self.total_transactions,
            });
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(MerkleError::Exhausted("flag bits"));
        }

        let mut walker = TreeWalker {
            block: self,
            bits_used: 0,
            hashes_used: 0,
            matches: Vec::new(),
        };
        let root = walker.traverse(tree_height(self.total_transactions), 0)?;

        if (walker.bits_used + 7) / 8 != self.flags.len() {
            return Err(MerkleError::Unconsumed("flag bytes"));
        }
        if walker.hashes_used != self.hashes.len() {
            return Err(MerkleError::Unconsumed("hashes"));
        }
        if root != self.header.merkle_root {
            return Err(MerkleError::RootMismatch {
                expected: self.header.merkle_root,
                actual: root,
            });
        }

        Ok(walker.matches)
    }
}

fn tree_width(total: u32, height: u32) -> u32 {
    ((total as u64 + (1u64 << height) - 1) >> height) as u32
}

fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while tree_width(total, height) > 1 {
        height += 1;
    }
    height
}

struct TreeBuilder<'a> {
    txids: &'a [TxHash],
    matched: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Hash256>,
}

impl TreeBuilder<'_> {
    fn total(&self) -> u32 {
        self.txids.len() as u32
    }

    fn calc_hash(&self, height: u32, pos: u32) -> Hash256 {
        if height == 0 {
            return self.txids[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < tree_width(self.total(), height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        Hash256::combine(&left, &right)
    }

    fn build(&mut self, height: u32, pos: u32) {
        let start = (pos as usize) << height;
        let end = (((pos as usize) + 1) << height).min(self.txids.len());
        let parent_of_match = (start..end).any(|i| self.matched.get(i).copied().unwrap_or(false));
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            let hash = self.calc_hash(height, pos);
            self.hashes.push(hash);
        } else {
            self.build(height - 1, pos * 2);
            if pos * 2 + 1 < tree_width(self.total(), height - 1) {
                self.build(height - 1, pos * 2 + 1);
            }
        }
    }
}

struct TreeWalker<'a> {
    block: &'a MerkleBlock,
    bits_used: usize,
    hashes_used: usize,
    matches: Vec<TxHash>,
}

impl TreeWalker<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let index = self.bits_used;
        let byte = self
            .block
            .flags
            .get(index / 8)
            .ok_or(MerkleError::Exhausted("flag bits"))?;
        self.bits_used += 1;
        Ok(byte & (1 << (index % 8)) != 0)
    }

    fn next_hash(&mut self) -> Result<Hash256, MerkleError> {
        let hash = *self
            .block
            .hashes
            .get(self.hashes_used)
            .ok_or(MerkleError::Exhausted("hashes"))?;
        self.hashes_used += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Hash256, MerkleError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matches.push(hash);
            }
            return Ok(hash);
        }

        let total = self.block.total_transactions;
        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                return Err(MerkleError::DuplicateNode);
            }
            right
        } else {
            left
        };
        Ok(Hash256::combine(&left, &right))
    }
}
