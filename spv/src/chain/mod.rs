//! Chain store collaborator: header storage, proof-of-work checks and the
//! commit path for filtered blocks and unconfirmed transactions.

pub mod memory;

pub use memory::MemoryChain;

use crate::types::{BlockHash, BlockHeader, MerkleBlock, Transaction};
use thiserror::Error;

/// Chain store error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Proof of work check failed for block {0}")]
    ProofOfWork(BlockHash),

    #[error("Block {block} does not connect: unknown parent {parent}")]
    UnknownParent { block: BlockHash, parent: BlockHash },

    #[error("Block batch is empty")]
    EmptyBatch,

    #[error("Chain store is closed")]
    Closed,

    #[error("Storage error: {0}")]
    Storage(String),
}

/// A filtered block together with the matched transactions that were fetched for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBlock {
    pub block: MerkleBlock,
    pub transactions: Vec<Transaction>,
}

/// Storage and validation surface the synchronization engine relies on
pub trait ChainStore: Send + Sync {
    fn is_known_block(&self, hash: &BlockHash) -> bool;

    /// Validate the header's proof of work
    fn check_proof_of_work(&self, header: &BlockHeader) -> Result<(), ChainError> {
        if header.meets_target() {
            Ok(())
        } else {
            Err(ChainError::ProofOfWork(header.hash()))
        }
    }

    fn chain_tip(&self) -> BlockHeader;

    fn height(&self) -> u64;

    /// Sparse list of main-chain hashes from the tip back to genesis
    fn block_locator(&self) -> Vec<BlockHash>;

    /// Store a transaction in the unconfirmed pool. Returns `true` when the
    /// transaction turned out to be a bloom filter false positive.
    fn commit_unconfirmed_txn(&self, tx: &Transaction) -> Result<bool, ChainError>;

    /// Atomically connect a batch of blocks, in order, to the chain
    fn commit_blocks(&self, blocks: &[FilteredBlock]) -> Result<(), ChainError>;

    fn close(&self);
}

/// Hooks fired after the chain store commits data
pub trait ChainListener: Send + Sync {
    /// `height` is `None` for transactions entering the unconfirmed pool
    fn on_tx_commit(&self, tx: &Transaction, height: Option<u64>);

    fn on_block_commit(&self, header: &BlockHeader);

    fn on_rollback(&self, header: &BlockHeader);
}
