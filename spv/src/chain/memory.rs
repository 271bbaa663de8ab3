use crate::chain::{ChainError, ChainListener, ChainStore, FilteredBlock};
use crate::types::{BlockHash, BlockHeader, Transaction, TxHash};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Number of most recent blocks listed one by one in a block locator
const LOCATOR_DENSE_ENTRIES: usize = 10;

enum CommitEvent {
    Tx(Transaction, Option<u64>),
    Block(BlockHeader),
    Rollback(BlockHeader),
}

#[derive(Default)]
struct ChainState {
    headers: HashMap<BlockHash, BlockHeader>,
    /// Main chain hashes indexed by height
    main_chain: Vec<BlockHash>,
    block_txs: HashMap<BlockHash, Vec<TxHash>>,
    confirmed: HashMap<TxHash, Transaction>,
}

/// Simple in-memory chain store
pub struct MemoryChain {
    state: RwLock<ChainState>,
    unconfirmed: DashMap<TxHash, Transaction>,
    watched: RwLock<HashSet<Vec<u8>>>,
    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
    closed: AtomicBool,
}

impl MemoryChain {
    /// Create a chain rooted at `genesis`, which is stored at height 0
    pub fn new(genesis: BlockHeader) -> Self {
        let mut genesis = genesis;
        genesis.height = 0;
        let hash = genesis.hash();

        let mut state = ChainState::default();
        state.headers.insert(hash, genesis);
        state.main_chain.push(hash);

        Self {
            state: RwLock::new(state),
            unconfirmed: DashMap::new(),
            watched: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Treat transactions paying `address` as genuine filter matches
    pub fn watch_address(&self, address: &[u8]) {
        self.watched.write().insert(address.to_vec());
    }

    pub fn add_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.write().push(listener);
    }

    pub fn block_hash_at(&self, height: u64) -> Option<BlockHash> {
        self.state.read().main_chain.get(height as usize).copied()
    }

    /// Confirmed transaction by hash
    pub fn transaction(&self, txid: &TxHash) -> Option<Transaction> {
        self.state.read().confirmed.get(txid).cloned()
    }

    pub fn is_unconfirmed(&self, txid: &TxHash) -> bool {
        self.unconfirmed.contains_key(txid)
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_relevant(&self, tx: &Transaction) -> bool {
        let watched = self.watched.read();
        if tx.output_addresses().any(|address| watched.contains(address)) {
            return true;
        }

        let state = self.state.read();
        tx.inputs.iter().any(|input| {
            let spent = &input.previous_output.txid;
            self.unconfirmed.contains_key(spent) || state.confirmed.contains_key(spent)
        })
    }

    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.is_closed() {
            Err(ChainError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, events: Vec<CommitEvent>) {
        let listeners = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                match event {
                    CommitEvent::Tx(tx, height) => listener.on_tx_commit(tx, *height),
                    CommitEvent::Block(header) => listener.on_block_commit(header),
                    CommitEvent::Rollback(header) => listener.on_rollback(header),
                }
            }
        }
    }
}

impl ChainStore for MemoryChain {
    fn is_known_block(&self, hash: &BlockHash) -> bool {
        self.state.read().headers.contains_key(hash)
    }

    fn chain_tip(&self) -> BlockHeader {
        let state = self.state.read();
        state
            .main_chain
            .last()
            .and_then(|hash| state.headers.get(hash))
            .cloned()
            .unwrap_or_else(|| BlockHeader::new(BlockHash::ZERO, BlockHash::ZERO, 0, 0))
    }

    fn height(&self) -> u64 {
        self.state.read().main_chain.len().saturating_sub(1) as u64
    }

    fn block_locator(&self) -> Vec<BlockHash> {
        let state = self.state.read();
        let chain = &state.main_chain;
        let mut locator = Vec::new();
        if chain.is_empty() {
            return locator;
        }

        let mut step = 1usize;
        let mut index = chain.len() - 1;
        while index > 0 {
            locator.push(chain[index]);
            if locator.len() >= LOCATOR_DENSE_ENTRIES {
                step *= 2;
            }
            index = index.saturating_sub(step);
        }
        locator.push(chain[0]);
        locator
    }

    fn commit_unconfirmed_txn(&self, tx: &Transaction) -> Result<bool, ChainError> {
        self.ensure_open()?;

        if !self.is_relevant(tx) {
            debug!("Transaction {} matches no watched address", tx.txid());
            return Ok(true);
        }

        self.unconfirmed.insert(tx.txid(), tx.clone());
        self.notify(vec![CommitEvent::Tx(tx.clone(), None)]);
        Ok(false)
    }

    fn commit_blocks(&self, blocks: &[FilteredBlock]) -> Result<(), ChainError> {
        self.ensure_open()?;
        let first = blocks.first().ok_or(ChainError::EmptyBatch)?;

        let mut events = Vec::new();
        {
            let mut state = self.state.write();

            // Validate the whole batch before touching anything
            let first_parent = first.block.previous();
            let fork_index = state
                .main_chain
                .iter()
                .rposition(|hash| *hash == first_parent)
                .ok_or(ChainError::UnknownParent {
                    block: first.block.hash(),
                    parent: first_parent,
                })?;
            for pair in blocks.windows(2) {
                if pair[1].block.previous() != pair[0].block.hash() {
                    return Err(ChainError::UnknownParent {
                        block: pair[1].block.hash(),
                        parent: pair[1].block.previous(),
                    });
                }
            }
            if let Some(stored) = blocks
                .iter()
                .find(|filtered| state.headers.contains_key(&filtered.block.hash()))
            {
                return Err(ChainError::Storage(format!(
                    "block {} already stored",
                    stored.block.hash()
                )));
            }

            while state.main_chain.len() > fork_index + 1 {
                let Some(hash) = state.main_chain.pop() else { break };
                let txids = state.block_txs.remove(&hash).unwrap_or_default();
                for txid in txids {
                    state.confirmed.remove(&txid);
                }
                if let Some(header) = state.headers.remove(&hash) {
                    info!("Rolling back block {} at height {}", hash, header.height);
                    events.push(CommitEvent::Rollback(header));
                }
            }

            let mut height = fork_index as u64;
            for filtered in blocks {
                height += 1;
                let mut header = filtered.block.header.clone();
                header.height = height;
                let hash = header.hash();

                let mut txids = Vec::with_capacity(filtered.transactions.len());
                for tx in &filtered.transactions {
                    let txid = tx.txid();
                    self.unconfirmed.remove(&txid);
                    state.confirmed.insert(txid, tx.clone());
                    txids.push(txid);
                    events.push(CommitEvent::Tx(tx.clone(), Some(height)));
                }

                state.block_txs.insert(hash, txids);
                state.headers.insert(hash, header.clone());
                state.main_chain.push(hash);
                events.push(CommitEvent::Block(header));
            }

            debug!("Chain tip now at height {}", height);
        }

        self.notify(events);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
