//! The sync state machine. Every inbound block, transaction, inventory and
//! not-found message goes through a `SyncManager` while the caller holds the
//! data lock; outbound effects are queued as `NetworkCommand`s and executed
//! once the lock is released.

use crate::chain::ChainStore;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::filter::FilterSource;
use crate::network::{InvVect, Message, NetworkCommand, PeerId, PeerManager, PeerState};
use crate::sync::false_positive::FalsePositiveMonitor;
use crate::sync::orphan::{Orphan, OrphanEntry, OrphanPool};
use crate::sync::peer_policy::SyncPeerPolicy;
use crate::sync::request::RequestTracker;
use crate::types::{BlockHash, Hash256, MerkleBlock, Transaction, TxHash};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Who a round is bound to and how it was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// Bulk catch-up started by a `getblocks` request to the sync peer
    Bulk { peer: PeerId },
    /// Single block extending the current tip while idle
    Tip { peer: PeerId },
}

/// State of one sync round
#[derive(Debug, Clone)]
pub struct SyncRound {
    pub start_hash: Option<BlockHash>,
    pub stop_hash: Option<BlockHash>,
    pub locator: Vec<BlockHash>,
    pub mode: RoundMode,
    pub tracker: RequestTracker,
    pub started: Instant,
    /// Last time the round requested or received something new
    pub last_progress: Instant,
}

impl SyncRound {
    fn bulk(peer: PeerId, locator: Vec<BlockHash>) -> Self {
        let now = Instant::now();
        Self {
            start_hash: None,
            stop_hash: None,
            locator,
            mode: RoundMode::Bulk { peer },
            tracker: RequestTracker::new(),
            started: now,
            last_progress: now,
        }
    }

    fn tip(hash: BlockHash, peer: PeerId) -> Self {
        let mut tracker = RequestTracker::new();
        tracker.reset([hash]);
        let now = Instant::now();
        Self {
            start_hash: Some(hash),
            stop_hash: Some(hash),
            locator: Vec::new(),
            mode: RoundMode::Tip { peer },
            tracker,
            started: now,
            last_progress: now,
        }
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        match self.mode {
            RoundMode::Bulk { peer } => Some(peer),
            RoundMode::Tip { .. } => None,
        }
    }
}

/// Snapshot of the sync engine for callers and status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub syncing: bool,
    pub sync_peer: Option<PeerId>,
    pub start_hash: Option<BlockHash>,
    pub stop_hash: Option<BlockHash>,
    pub pending_requests: usize,
    pub orphans: usize,
    pub height: u64,
}

pub struct SyncManager {
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    filter: Arc<dyn FilterSource>,
    round: Option<SyncRound>,
    orphans: OrphanPool,
    tx_cache: LruCache<TxHash, ()>,
    false_positives: FalsePositiveMonitor,
    policy: SyncPeerPolicy,
    stall_timeout: Duration,
    commands: Vec<NetworkCommand>,
}

impl SyncManager {
    pub fn new(
        config: &SyncConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        filter: Arc<dyn FilterSource>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.tx_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            chain,
            peers,
            filter,
            round: None,
            orphans: OrphanPool::new(config.max_orphans, config.orphan_ttl),
            tx_cache: LruCache::new(cache_size),
            false_positives: FalsePositiveMonitor::new(
                config.false_positive_threshold,
                config.false_positive_window,
            ),
            policy: SyncPeerPolicy::new(config.peer_fault_cooldown),
            stall_timeout: config.keep_alive_timeout(),
            commands: Vec::new(),
        }
    }

    /// In bulk catch-up against a bound sync peer
    pub fn is_syncing(&self) -> bool {
        self.sync_peer().is_some()
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.round.as_ref().and_then(SyncRound::sync_peer)
    }

    pub fn round(&self) -> Option<&SyncRound> {
        self.round.as_ref()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.contains(hash)
    }

    pub fn is_tx_cached(&self, txid: &TxHash) -> bool {
        self.tx_cache.contains(txid)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            syncing: self.is_syncing(),
            sync_peer: self.sync_peer(),
            start_hash: self.round.as_ref().and_then(|round| round.start_hash),
            stop_hash: self.round.as_ref().and_then(|round| round.stop_hash),
            pending_requests: self
                .round
                .as_ref()
                .map_or(0, |round| round.tracker.pending_count()),
            orphans: self.orphans.len(),
            height: self.chain.height(),
        }
    }

    /// Drain the outbound effects queued by the last operations
    pub fn take_commands(&mut self) -> Vec<NetworkCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn on_merkle_block(&mut self, peer: PeerId, block: MerkleBlock) -> SyncResult<()> {
        let result = self.process_merkle_block(peer, block);
        self.resolve_orphans();
        result
    }

    pub fn on_txn(&mut self, peer: PeerId, tx: Transaction) -> SyncResult<()> {
        let result = self.process_txn(peer, tx);
        self.resolve_orphans();
        result
    }

    /// Block entries of an inventory advertisement; transaction entries are ignored
    pub fn on_block_inventory(&mut self, peer: PeerId, inventory: &[InvVect]) -> SyncResult<()> {
        let hashes: Vec<BlockHash> = inventory
            .iter()
            .filter(|item| item.is_block())
            .map(|item| item.hash)
            .collect();
        if hashes.is_empty() {
            return Ok(());
        }

        let result = self.process_block_inventory(peer, hashes);
        self.resolve_orphans();
        result
    }

    /// The peer does not have data we asked for: drop it and resync elsewhere
    pub fn on_not_found(&mut self, peer: PeerId, items: &[InvVect]) -> SyncResult<()> {
        error!("Receive not found message from {}, disconnect", peer);
        self.change_sync_peer_and_restart(peer);
        self.resolve_orphans();
        Err(SyncError::NotFound {
            peer,
            count: items.len(),
        })
    }

    /// Periodic upkeep: retry a failed commit, rebind a lost sync peer,
    /// expire stale state and start catching up if behind.
    pub fn sync_blocks(&mut self) -> SyncResult<()> {
        self.sync_blocks_at(Instant::now())
    }

    /// `sync_blocks` with stall detection measured at `now`
    pub fn sync_blocks_at(&mut self, now: Instant) -> SyncResult<()> {
        let result = self.finish_if_complete();

        // A finished round is only waiting for its commit to be retried
        let stalled = self
            .round
            .as_ref()
            .filter(|round| {
                !round.tracker.is_finished()
                    && now.saturating_duration_since(round.last_progress) > self.stall_timeout
            })
            .map(|round| round.mode);

        let lost_peer = self.sync_peer().filter(|sync_peer| {
            !self
                .peers
                .connected_peers()
                .iter()
                .any(|peer| peer.id() == *sync_peer && peer.state() == PeerState::Established)
        });

        match (lost_peer, stalled) {
            (Some(sync_peer), _) => {
                warn!("Sync peer {} is gone, restarting sync", sync_peer);
                self.change_sync_peer_and_restart(sync_peer);
            }
            (None, Some(RoundMode::Tip { .. })) => {
                debug!("Abandoning stalled tip block request");
                self.round = None;
            }
            (None, Some(RoundMode::Bulk { peer })) => {
                warn!("Sync round with {} made no progress, restarting sync", peer);
                self.change_sync_peer_and_restart(peer);
            }
            (None, None) => {}
        }

        self.orphans.prune_expired();
        self.policy.prune(now);
        self.start_sync(None);
        self.resolve_orphans();
        result
    }

    fn process_merkle_block(&mut self, peer: PeerId, block: MerkleBlock) -> SyncResult<()> {
        let hash = block.hash();
        trace!("Receive merkle block hash: {}", hash);

        if self.chain.is_known_block(&hash) {
            return Err(SyncError::DuplicateBlock(hash));
        }

        self.chain
            .check_proof_of_work(&block.header)
            .map_err(|source| SyncError::InvalidHeader { hash, source })?;

        let matched = block
            .extract_matches()
            .map_err(|source| SyncError::InvalidMerkleProof { hash, source })?;

        match self.sync_peer() {
            Some(sync_peer) => {
                if !self.is_pending_block(&hash) {
                    self.add_orphan(hash, Orphan::Block(block), peer);
                    return Ok(());
                }
                if peer != sync_peer {
                    return Err(self.reject_non_sync_peer(peer, sync_peer));
                }
                let previous = block.previous();
                if !self.chain.is_known_block(&previous) && !self.is_received_block(&previous) {
                    debug!("Defer block {} until its parent {} arrives", hash, previous);
                    let parent_pending = self.is_pending_block(&previous);
                    if let Some(round) = self.round.as_mut() {
                        round.tracker.defer_block(block);
                    }
                    if !parent_pending {
                        self.request_missing_range(sync_peer);
                    }
                    return Ok(());
                }
            }
            None => {
                if let Some(round) = &self.round {
                    if !round.tracker.is_tracked_block(&hash) {
                        self.add_orphan(hash, Orphan::Block(block), peer);
                    }
                    return Ok(());
                }

                let tip = self.chain.chain_tip().hash();
                if tip == hash {
                    return Ok(());
                }
                if block.previous() != tip {
                    self.add_orphan(hash, Orphan::Block(block), peer);
                    return Ok(());
                }
                self.round = Some(SyncRound::tip(hash, peer));
            }
        }

        let wanted = match self.round.as_mut() {
            Some(round) => {
                round.last_progress = Instant::now();
                round.tracker.block_received(block, matched)
            }
            None => return Ok(()),
        };
        if !wanted.is_empty() {
            debug!("Requesting {} transaction(s) of block {}", wanted.len(), hash);
            self.commands.push(NetworkCommand::SendToPeer {
                peer_id: peer,
                message: Message::GetData(wanted.into_iter().map(InvVect::tx).collect()),
            });
        }

        self.finish_if_complete()
    }

    fn process_txn(&mut self, peer: PeerId, tx: Transaction) -> SyncResult<()> {
        let txid = tx.txid();
        debug!("Receive transaction hash: {}", txid);

        match self.sync_peer() {
            Some(sync_peer) => {
                if !self.is_pending_tx(&txid) {
                    self.add_orphan(txid, Orphan::Tx(tx), peer);
                    return Ok(());
                }
                if peer != sync_peer {
                    return Err(self.reject_non_sync_peer(peer, sync_peer));
                }
            }
            None => {
                let pending = self.is_pending_tx(&txid);
                if self.tx_cache.contains(&txid) {
                    if !pending {
                        return Err(SyncError::AlreadyCached(txid));
                    }
                } else {
                    let false_positive = self.chain.commit_unconfirmed_txn(&tx)?;
                    if false_positive {
                        self.handle_false_positive();
                    }
                    self.tx_cache.put(txid, ());
                }
                if !pending {
                    return Ok(());
                }
            }
        }

        if let Some(round) = self.round.as_mut() {
            if round.tracker.tx_received(tx) {
                round.last_progress = Instant::now();
            }
        }
        self.finish_if_complete()
    }

    fn process_block_inventory(&mut self, peer: PeerId, hashes: Vec<BlockHash>) -> SyncResult<()> {
        match self.sync_peer() {
            Some(sync_peer) => {
                if peer != sync_peer {
                    trace!("Ignore block inventory from non sync peer {}", peer);
                    return Ok(());
                }
                let unknown: Vec<BlockHash> = hashes
                    .into_iter()
                    .filter(|hash| !self.chain.is_known_block(hash))
                    .collect();
                let awaiting_reply = self
                    .round
                    .as_ref()
                    .map_or(false, |round| round.tracker.is_empty());
                if unknown.is_empty() && awaiting_reply {
                    info!("Sync peer {} has no new blocks, sync finished", peer);
                    self.round = None;
                    self.commands.push(NetworkCommand::SetSyncPeer(None));
                    return Ok(());
                }

                // Later announcements extend the round instead of replacing it
                let Some(round) = self.round.as_mut() else {
                    return Ok(());
                };
                let fresh = round.tracker.track_blocks(unknown);
                if fresh.is_empty() {
                    trace!("Block inventory from {} adds nothing to the round", peer);
                    return Ok(());
                }
                if round.start_hash.is_none() {
                    round.start_hash = fresh.first().copied();
                }
                round.stop_hash = fresh.last().copied();
                round.last_progress = Instant::now();

                info!("Requesting {} block(s) from sync peer {}", fresh.len(), peer);
                self.commands.push(NetworkCommand::SendToPeer {
                    peer_id: peer,
                    message: Message::GetData(
                        fresh.into_iter().map(InvVect::filtered_block).collect(),
                    ),
                });
            }
            None => {
                let wanted: Vec<InvVect> = hashes
                    .into_iter()
                    .filter(|hash| !self.chain.is_known_block(hash))
                    .filter(|hash| !self.orphans.contains(hash))
                    .filter(|hash| {
                        self.round
                            .as_ref()
                            .map_or(true, |round| !round.tracker.is_tracked_block(hash))
                    })
                    .map(InvVect::filtered_block)
                    .collect();
                if !wanted.is_empty() {
                    debug!("Requesting {} announced block(s) from {}", wanted.len(), peer);
                    self.commands.push(NetworkCommand::SendToPeer {
                        peer_id: peer,
                        message: Message::GetData(wanted),
                    });
                }
            }
        }
        Ok(())
    }

    /// Commit the round if every tracked hash has arrived. A failed commit
    /// keeps the round so it can be retried.
    fn finish_if_complete(&mut self) -> SyncResult<()> {
        let (blocks, previous_peer) = match &self.round {
            Some(round) if round.tracker.is_finished() => {
                (round.tracker.filtered_blocks(), round.sync_peer())
            }
            _ => return Ok(()),
        };

        if let Err(e) = self.chain.commit_blocks(&blocks) {
            error!("Failed to commit {} block(s): {}", blocks.len(), e);
            return Err(SyncError::CommitFailed(e));
        }

        for filtered in &blocks {
            for tx in &filtered.transactions {
                self.tx_cache.put(tx.txid(), ());
            }
        }
        self.round = None;

        let height = self.chain.height();
        info!("Committed {} block(s), chain height {}", blocks.len(), height);
        self.commands.push(NetworkCommand::SetLocalHeight(height));

        if !self.start_sync(previous_peer) && previous_peer.is_some() {
            info!("Sync finished at height {}", height);
            self.commands.push(NetworkCommand::SetSyncPeer(None));
        }
        Ok(())
    }

    /// Start a bulk round if idle and some peer is ahead of us
    fn start_sync(&mut self, prefer: Option<PeerId>) -> bool {
        if self.round.is_some() {
            return false;
        }

        let peers = self.peers.connected_peers();
        let local_height = self.chain.height();
        match self
            .policy
            .select(&peers, local_height, None, prefer, Instant::now())
        {
            Some(peer) => {
                self.begin_round(peer);
                true
            }
            None => false,
        }
    }

    fn begin_round(&mut self, peer: PeerId) {
        let locator = self.chain.block_locator();
        info!(
            "Start syncing with {}, local height {}",
            peer,
            self.chain.height()
        );
        self.round = Some(SyncRound::bulk(peer, locator.clone()));
        self.commands.push(NetworkCommand::SetSyncPeer(Some(peer)));
        self.commands.push(NetworkCommand::SendToPeer {
            peer_id: peer,
            message: Message::GetBlocks {
                locator,
                stop: BlockHash::ZERO,
            },
        });
    }

    /// Ask the sync peer again for the blocks after our locator; the reply
    /// extends the current round
    fn request_missing_range(&mut self, peer: PeerId) {
        let locator = self.chain.block_locator();
        debug!("Requesting missing blocks from sync peer {}", peer);
        if let Some(round) = self.round.as_mut() {
            round.locator = locator.clone();
        }
        self.commands.push(NetworkCommand::SendToPeer {
            peer_id: peer,
            message: Message::GetBlocks {
                locator,
                stop: BlockHash::ZERO,
            },
        });
    }

    fn reject_non_sync_peer(&mut self, peer: PeerId, sync_peer: PeerId) -> SyncError {
        error!("Receive message from non sync peer {}, disconnect", peer);
        self.change_sync_peer_and_restart(peer);
        SyncError::NonSyncPeer {
            peer,
            expected: Some(sync_peer),
        }
    }

    /// Drop the offender, abandon the round and restart from the chain's
    /// current locator with a different peer. Orphans are left alone.
    fn change_sync_peer_and_restart(&mut self, offender: PeerId) {
        let now = Instant::now();
        let bound = self.sync_peer();

        self.policy.record_fault(offender, now);
        self.commands.push(NetworkCommand::DisconnectPeer(offender));
        if let Some(bound) = bound.filter(|bound| *bound != offender) {
            self.policy.record_fault(bound, now);
        }

        self.round = None;
        self.commands.push(NetworkCommand::SetSyncPeer(None));

        let peers = self.peers.connected_peers();
        match self
            .policy
            .select(&peers, self.chain.height(), Some(offender), None, now)
        {
            Some(peer) => self.begin_round(peer),
            None => warn!("No alternative sync peer available after dropping {}", offender),
        }
    }

    fn handle_false_positive(&mut self) {
        if self.false_positives.record() {
            info!("False positive threshold reached, reloading address filter");
            self.filter.reload_addr_filter();
            self.commands
                .push(NetworkCommand::Broadcast(self.filter.filter_load_message()));
        }
    }

    fn add_orphan(&mut self, hash: Hash256, item: Orphan, peer: PeerId) {
        debug!("Add orphan {} from {}", hash, peer);
        self.orphans.insert(hash, item, peer);
    }

    /// Reprocess pooled items that can now connect. Each pass consumes every
    /// ready entry, so the loop ends once a pass finds nothing ready.
    fn resolve_orphans(&mut self) {
        for _ in 0..=self.orphans.capacity() {
            self.resolve_deferred();

            let chain = &self.chain;
            self.orphans
                .retain(|hash, entry| !(entry.item.is_block() && chain.is_known_block(hash)));

            let ready: Vec<Hash256> = self
                .orphans
                .iter()
                .filter(|(hash, entry)| self.is_orphan_ready(hash, entry))
                .map(|(hash, _)| *hash)
                .collect();
            if ready.is_empty() {
                return;
            }

            for hash in ready {
                let Some(entry) = self.orphans.remove(&hash) else { continue };
                let result = match entry.item {
                    Orphan::Block(block) => self.process_merkle_block(entry.peer, block),
                    Orphan::Tx(tx) => self.process_txn(entry.peer, tx),
                };
                if let Err(e) = result {
                    debug!("Dropped orphan {}: {}", hash, e);
                }
            }
        }
    }

    /// Feed deferred round blocks whose parent has connected back through
    /// block handling. Every step removes one deferred block for good.
    fn resolve_deferred(&mut self) {
        while let Some(sync_peer) = self.sync_peer() {
            let chain = &self.chain;
            let next = self
                .round
                .as_mut()
                .and_then(|round| round.tracker.take_ready_deferred(|hash| chain.is_known_block(hash)));
            let Some(block) = next else { return };

            let hash = block.hash();
            if let Err(e) = self.process_merkle_block(sync_peer, block) {
                debug!("Dropped deferred block {}: {}", hash, e);
            }
        }
    }

    fn is_orphan_ready(&self, hash: &Hash256, entry: &OrphanEntry) -> bool {
        match (&self.round, &entry.item) {
            (Some(round), Orphan::Block(_)) => match round.mode {
                // Block handling defers it if the parent is still missing
                RoundMode::Bulk { peer } => {
                    entry.peer == peer
                        && round.tracker.is_pending_block(hash)
                        && !round.tracker.is_deferred_block(hash)
                }
                RoundMode::Tip { .. } => false,
            },
            (Some(round), Orphan::Tx(_)) => {
                round.tracker.is_pending_tx(hash)
                    && round.sync_peer().map_or(true, |peer| peer == entry.peer)
            }
            (None, Orphan::Block(block)) => block.previous() == self.chain.chain_tip().hash(),
            (None, Orphan::Tx(_)) => true,
        }
    }

    fn is_pending_block(&self, hash: &BlockHash) -> bool {
        self.round
            .as_ref()
            .map_or(false, |round| round.tracker.is_pending_block(hash))
    }

    fn is_received_block(&self, hash: &BlockHash) -> bool {
        self.round
            .as_ref()
            .map_or(false, |round| round.tracker.is_received_block(hash))
    }

    fn is_pending_tx(&self, txid: &TxHash) -> bool {
        self.round
            .as_ref()
            .map_or(false, |round| round.tracker.is_pending_tx(txid))
    }
}
