//! Bookkeeping for the hashes requested in one sync round

use crate::chain::FilteredBlock;
use crate::types::{BlockHash, MerkleBlock, Transaction, TxHash};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct ReceivedBlock {
    block: MerkleBlock,
    matched: Vec<TxHash>,
}

/// Tracks requested blocks and the transactions their proofs claim.
/// The round is finished once every tracked hash has been received.
#[derive(Debug, Default, Clone)]
pub struct RequestTracker {
    /// Requested block hashes, in request order
    requested: Vec<BlockHash>,
    pending_blocks: HashSet<BlockHash>,
    pending_txs: HashSet<TxHash>,
    blocks: HashMap<BlockHash, ReceivedBlock>,
    txs: HashMap<TxHash, Transaction>,
    /// Pending blocks that arrived before their parent. They stay pending
    /// and are held here, outside the evictable orphan pool.
    deferred: HashMap<BlockHash, MerkleBlock>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a fresh set of block hashes, forgetting everything else
    pub fn reset<I>(&mut self, hashes: I)
    where
        I: IntoIterator<Item = BlockHash>,
    {
        *self = Self::default();
        for hash in hashes {
            if self.pending_blocks.insert(hash) {
                self.requested.push(hash);
            }
        }
    }

    /// Add more block hashes to the round. Returns the ones that were not
    /// tracked yet, in the given order.
    pub fn track_blocks<I>(&mut self, hashes: I) -> Vec<BlockHash>
    where
        I: IntoIterator<Item = BlockHash>,
    {
        let mut added = Vec::new();
        for hash in hashes {
            if self.is_tracked_block(&hash) {
                continue;
            }
            self.pending_blocks.insert(hash);
            self.requested.push(hash);
            added.push(hash);
        }
        added
    }

    /// Nothing has been requested yet
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }

    pub fn is_pending_block(&self, hash: &BlockHash) -> bool {
        self.pending_blocks.contains(hash)
    }

    pub fn is_pending_tx(&self, txid: &TxHash) -> bool {
        self.pending_txs.contains(txid)
    }

    pub fn is_pending(&self, hash: &BlockHash) -> bool {
        self.is_pending_block(hash) || self.is_pending_tx(hash)
    }

    pub fn is_received_block(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Requested in this round, whether received yet or not
    pub fn is_tracked_block(&self, hash: &BlockHash) -> bool {
        self.is_pending_block(hash) || self.is_received_block(hash)
    }

    /// Hold a pending block until its parent connects. Returns `false` if
    /// the block is not pending in this round.
    pub fn defer_block(&mut self, block: MerkleBlock) -> bool {
        let hash = block.hash();
        if !self.pending_blocks.contains(&hash) {
            return false;
        }
        self.deferred.insert(hash, block);
        true
    }

    pub fn is_deferred_block(&self, hash: &BlockHash) -> bool {
        self.deferred.contains_key(hash)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Take one deferred block whose parent is now received in the round or
    /// satisfies `is_known`
    pub fn take_ready_deferred<F>(&mut self, is_known: F) -> Option<MerkleBlock>
    where
        F: Fn(&BlockHash) -> bool,
    {
        let ready = self.deferred.iter().find_map(|(hash, block)| {
            let previous = block.previous();
            (self.blocks.contains_key(&previous) || is_known(&previous)).then_some(*hash)
        })?;
        self.deferred.remove(&ready)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_blocks.len() + self.pending_txs.len()
    }

    pub fn received_block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Record a requested block. Returns the matched transactions that still
    /// have to be fetched; they become pending in the round.
    pub fn block_received(&mut self, block: MerkleBlock, matched: Vec<TxHash>) -> Vec<TxHash> {
        let hash = block.hash();
        if !self.pending_blocks.remove(&hash) {
            return Vec::new();
        }
        self.deferred.remove(&hash);

        let mut wanted = Vec::new();
        for txid in &matched {
            if !self.txs.contains_key(txid) && self.pending_txs.insert(*txid) {
                wanted.push(*txid);
            }
        }
        self.blocks.insert(hash, ReceivedBlock { block, matched });
        wanted
    }

    /// Record a requested transaction. Returns `false` if it was not pending.
    pub fn tx_received(&mut self, tx: Transaction) -> bool {
        let txid = tx.txid();
        if !self.pending_txs.remove(&txid) {
            return false;
        }
        self.txs.insert(txid, tx);
        true
    }

    pub fn is_finished(&self) -> bool {
        !self.is_empty() && self.pending_blocks.is_empty() && self.pending_txs.is_empty()
    }

    /// Received blocks with their transactions, parents before children.
    /// Blocks that do not chain onto each other keep request order.
    pub fn filtered_blocks(&self) -> Vec<FilteredBlock> {
        let mut children: HashMap<BlockHash, Vec<BlockHash>> = HashMap::new();
        for hash in &self.requested {
            if let Some(received) = self.blocks.get(hash) {
                children
                    .entry(received.block.previous())
                    .or_default()
                    .push(*hash);
            }
        }

        let mut ordered = Vec::with_capacity(self.blocks.len());
        let mut visited = HashSet::new();
        for hash in &self.requested {
            let Some(received) = self.blocks.get(hash) else { continue };
            if self.blocks.contains_key(&received.block.previous()) {
                continue;
            }
            let mut stack = vec![*hash];
            while let Some(next) = stack.pop() {
                if !visited.insert(next) {
                    continue;
                }
                ordered.push(next);
                if let Some(kids) = children.get(&next) {
                    stack.extend(kids.iter().rev().copied());
                }
            }
        }

        ordered
            .iter()
            .filter_map(|hash| self.blocks.get(hash))
            .map(|received| FilteredBlock {
                block: received.block.clone(),
                transactions: received
                    .matched
                    .iter()
                    .filter_map(|txid| self.txs.get(txid).cloned())
                    .collect(),
            })
            .collect()
    }
}
