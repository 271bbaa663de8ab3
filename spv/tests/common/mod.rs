#![allow(dead_code)]

use parking_lot::Mutex;
use spv::chain::{ChainListener, ChainStore, MemoryChain};
use spv::config::SpvConfig;
use spv::filter::{AddrFilter, FilterSource};
use spv::network::{InvVect, Message, NetworkCommand, Peer, PeerId, PeerManager, PeerState};
use spv::service::SpvService;
use spv::sync::SyncManager;
use spv::types::{BlockHash, BlockHeader, Hash256, MerkleBlock, Transaction, TxOutput};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const EASY_BITS: u32 = 0x207f_ffff;
pub const WATCHED: &[u8] = b"wallet-address";

pub struct MockPeer {
    id: PeerId,
    height: Mutex<u64>,
    state: Mutex<PeerState>,
    last_active: Mutex<Instant>,
    sent: Mutex<Vec<Message>>,
}

impl MockPeer {
    pub fn new(id: u64, height: u64) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId(id),
            height: Mutex::new(height),
            state: Mutex::new(PeerState::Established),
            last_active: Mutex::new(Instant::now()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
    }

    pub fn set_last_active(&self, at: Instant) {
        *self.last_active.lock() = at;
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn get_blocks_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|message| matches!(message, Message::GetBlocks { .. }))
            .count()
    }

    /// Every inventory entry requested through getdata, in order
    pub fn requested(&self) -> Vec<InvVect> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::GetData(items) => Some(items.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl Peer for MockPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, message: Message) {
        self.sent.lock().push(message);
    }

    fn height(&self) -> u64 {
        *self.height.lock()
    }

    fn set_height(&self, height: u64) {
        *self.height.lock() = height;
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    fn state(&self) -> PeerState {
        *self.state.lock()
    }
}

#[derive(Default)]
pub struct MockPeerManager {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pub broadcasts: Mutex<Vec<Message>>,
    pub disconnected: Mutex<Vec<PeerId>>,
    pub sync_peer: Mutex<Option<PeerId>>,
    pub local_height: Mutex<u64>,
    pub connect_calls: AtomicUsize,
    pub started: AtomicBool,
}

impl MockPeerManager {
    pub fn add_peer(&self, peer: Arc<MockPeer>) {
        self.peers.lock().push(peer);
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<Arc<MockPeer>> {
        self.peers.lock().iter().find(|peer| peer.id() == peer_id).cloned()
    }
}

impl PeerManager for MockPeerManager {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .lock()
            .iter()
            .map(|peer| Arc::clone(peer) as Arc<dyn Peer>)
            .collect()
    }

    fn connect_peers(&self) {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn broadcast(&self, message: Message) {
        self.broadcasts.lock().push(message);
    }

    fn disconnect_peer(&self, peer_id: PeerId) {
        self.peers.lock().retain(|peer| peer.id() != peer_id);
        self.disconnected.lock().push(peer_id);
    }

    fn set_sync_peer(&self, peer_id: Option<PeerId>) {
        *self.sync_peer.lock() = peer_id;
    }

    fn set_local_height(&self, height: u64) {
        *self.local_height.lock() = height;
    }
}

/// Counts block commit events fired by the chain store
#[derive(Default)]
pub struct CommitCounter {
    pub blocks: Mutex<Vec<BlockHash>>,
    pub rollbacks: AtomicUsize,
}

impl ChainListener for CommitCounter {
    fn on_tx_commit(&self, _tx: &Transaction, _height: Option<u64>) {}

    fn on_block_commit(&self, header: &BlockHeader) {
        self.blocks.lock().push(header.hash());
    }

    fn on_rollback(&self, _header: &BlockHeader) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub chain: Arc<MemoryChain>,
    pub peers: Arc<MockPeerManager>,
    pub filter: Arc<AddrFilter>,
    pub commits: Arc<CommitCounter>,
    pub service: SpvService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SpvConfig) -> Self {
        let chain = Arc::new(MemoryChain::new(genesis()));
        chain.watch_address(WATCHED);
        let commits = Arc::new(CommitCounter::default());
        chain.add_listener(commits.clone());

        let peers = Arc::new(MockPeerManager::default());
        let filter = Arc::new(AddrFilter::with_addresses(0.0001, vec![WATCHED.to_vec()]).unwrap());
        let service = SpvService::new(config, chain.clone(), peers.clone(), filter.clone()).unwrap();

        Self {
            chain,
            peers,
            filter,
            commits,
            service,
        }
    }

    pub fn add_peer(&self, id: u64, height: u64) -> Arc<MockPeer> {
        let peer = MockPeer::new(id, height);
        self.peers.add_peer(peer.clone());
        peer
    }

    /// A standalone engine over the harness collaborators, for driving
    /// `sync_blocks_at` with a chosen clock
    pub fn manager(&self) -> SyncManager {
        SyncManager::new(
            &self.service.config().sync,
            self.chain.clone(),
            self.peers.clone(),
            self.filter.clone(),
        )
    }

    /// Apply the effects a standalone engine queued to the mock transport
    pub fn flush(&self, sync: &mut SyncManager) {
        for command in sync.take_commands() {
            match command {
                NetworkCommand::SendToPeer { peer_id, message } => {
                    if let Some(peer) = self.peers.peer(peer_id) {
                        peer.send(message);
                    }
                }
                NetworkCommand::Broadcast(message) => self.peers.broadcast(message),
                NetworkCommand::DisconnectPeer(peer_id) => self.peers.disconnect_peer(peer_id),
                NetworkCommand::SetSyncPeer(peer_id) => self.peers.set_sync_peer(peer_id),
                NetworkCommand::SetLocalHeight(height) => self.peers.set_local_height(height),
            }
        }
    }

    pub fn filter_load(&self) -> Message {
        self.filter.filter_load_message()
    }

    pub fn deliver(&self, peer: &Arc<MockPeer>, message: Message) -> spv::SyncResult<()> {
        let peer: Arc<dyn Peer> = peer.clone();
        self.service.handle_message(&peer, message)
    }

    /// Bind a bulk round to `peer` and answer its getblocks with `blocks`
    pub fn start_bulk_round(&self, peer: &Arc<MockPeer>, blocks: &[MerkleBlock]) {
        self.service.tick();
        assert_eq!(self.service.sync_status().sync_peer, Some(peer.id()));
        let inventory = blocks.iter().map(|block| InvVect::block(block.hash())).collect();
        self.deliver(peer, Message::Inventory(inventory)).unwrap();
    }
}

pub fn test_config() -> SpvConfig {
    let mut config = SpvConfig::default();
    config.sync.info_update_interval = Duration::from_secs(10);
    config.sync.keep_alive_multiplier = 3;
    config
}

pub fn genesis() -> BlockHeader {
    BlockHeader::new(Hash256::ZERO, Hash256::ZERO, 0, EASY_BITS)
}

pub fn payment(address: &[u8], value: u64) -> Transaction {
    Transaction::new(
        Vec::new(),
        vec![TxOutput {
            value,
            address: address.to_vec(),
        }],
    )
}

/// Mine a filtered block on `previous` whose proof matches `matched`, plus
/// one unmatched filler transaction
pub fn mine(previous: BlockHash, matched: &[&Transaction], timestamp: u64) -> MerkleBlock {
    let mut seed = previous.0.to_vec();
    seed.extend_from_slice(&timestamp.to_le_bytes());

    let mut txids = vec![Hash256::digest(&seed)];
    let mut flags = vec![false];
    for tx in matched {
        txids.push(tx.txid());
        flags.push(true);
    }

    let header = BlockHeader::new(previous, Hash256::ZERO, timestamp, EASY_BITS);
    let mut block = MerkleBlock::from_txids(header, &txids, &flags);
    while !block.header.meets_target() {
        block.header.increment_nonce();
    }
    block
}

/// `count` empty blocks extending `previous`
pub fn mine_chain(previous: BlockHash, count: usize, first_timestamp: u64) -> Vec<MerkleBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut previous = previous;
    for i in 0..count {
        let block = mine(previous, &[], first_timestamp + i as u64);
        previous = block.hash();
        blocks.push(block);
    }
    blocks
}

pub fn tip_hash(chain: &MemoryChain) -> BlockHash {
    chain.chain_tip().hash()
}
