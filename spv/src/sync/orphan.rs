//! Orphan pool: blocks and transactions that arrived out of causal order
//! (or outside the active round) and wait to be reprocessed.

use crate::network::PeerId;
use crate::types::{BlockHash, Hash256, MerkleBlock, Transaction};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// A deferred block or transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Orphan {
    Block(MerkleBlock),
    Tx(Transaction),
}

impl Orphan {
    /// Parent hash for blocks, `None` for transactions
    pub fn previous(&self) -> Option<BlockHash> {
        match self {
            Orphan::Block(block) => Some(block.previous()),
            Orphan::Tx(_) => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Orphan::Block(_))
    }
}

#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub item: Orphan,
    /// Peer that delivered the item
    pub peer: PeerId,
    pub received: Instant,
}

/// Pool bounded by entry count (oldest evicted first) and entry age
pub struct OrphanPool {
    entries: HashMap<Hash256, OrphanEntry>,
    /// Insertion order, oldest first
    order: VecDeque<Hash256>,
    max_size: usize,
    ttl: Duration,
}

impl OrphanPool {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Add or replace an entry. Returns `false` when the hash was already pooled.
    pub fn insert(&mut self, hash: Hash256, item: Orphan, peer: PeerId) -> bool {
        self.insert_at(hash, item, peer, Instant::now())
    }

    fn insert_at(&mut self, hash: Hash256, item: Orphan, peer: PeerId, now: Instant) -> bool {
        let is_new = self.remove(&hash).is_none();

        while self.entries.len() >= self.max_size {
            let Some(oldest) = self.order.pop_front() else { break };
            if self.entries.remove(&oldest).is_some() {
                debug!("Orphan pool full, evicted {}", oldest);
            }
        }

        self.entries.insert(
            hash,
            OrphanEntry {
                item,
                peer,
                received: now,
            },
        );
        self.order.push_back(hash);
        is_new
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<OrphanEntry> {
        let entry = self.entries.remove(hash)?;
        self.order.retain(|pooled| pooled != hash);
        Some(entry)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&OrphanEntry> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Entries in insertion order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (&Hash256, &OrphanEntry)> {
        self.order
            .iter()
            .filter_map(move |hash| self.entries.get_key_value(hash))
    }

    /// Drop every entry for which `keep` returns false
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Hash256, &OrphanEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|hash, entry| keep(hash, entry));
        let entries = &self.entries;
        self.order.retain(|hash| entries.contains_key(hash));
        before - self.entries.len()
    }

    /// Drop entries older than the pool's TTL
    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(Instant::now())
    }

    fn prune_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let pruned = self.retain(|_, entry| now.saturating_duration_since(entry.received) < ttl);
        if pruned > 0 {
            debug!("Pruned {} expired orphan(s)", pruned);
        }
        pruned
    }
}
