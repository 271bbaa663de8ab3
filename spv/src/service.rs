//! SPV service: owns the sync engine and its collaborators, dispatches peer
//! messages and runs the liveness loop.

use crate::chain::ChainStore;
use crate::config::{SpvConfig, SpvConfigError};
use crate::error::{SyncError, SyncResult};
use crate::filter::FilterSource;
use crate::network::{
    check_version, local_version, Message, NetworkCommand, Peer, PeerManager, PeerState, Version,
};
use crate::sync::{SyncManager, SyncStatus};
use crate::types::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

struct Inner {
    config: SpvConfig,
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    filter: Arc<dyn FilterSource>,
    /// Serializes every round, orphan pool and tracker mutation
    sync: Mutex<SyncManager>,
    liveness: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// Handle to a running SPV client. Cheap to clone.
#[derive(Clone)]
pub struct SpvService {
    inner: Arc<Inner>,
}

impl SpvService {
    pub fn new(
        config: SpvConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        filter: Arc<dyn FilterSource>,
    ) -> Result<Self, SpvConfigError> {
        config.validate()?;
        let sync = SyncManager::new(
            &config.sync,
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&filter),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                chain,
                peers,
                filter,
                sync: Mutex::new(sync),
                liveness: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &SpvConfig {
        &self.inner.config
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.inner.chain
    }

    /// Start the peer manager and the liveness loop. Must be called from
    /// within a tokio runtime.
    pub async fn start(&self) {
        let mut liveness = self.inner.liveness.lock();
        if liveness.is_some() {
            warn!("SPV service is already running");
            return;
        }

        info!(
            "Starting SPV service, seeds {:?}",
            self.inner.config.network.spv_seed_addrs()
        );
        self.inner.peers.set_local_height(self.inner.chain.height());
        self.inner.peers.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(keep_update(
            Arc::downgrade(&self.inner),
            self.inner.config.sync.info_update_interval,
            shutdown_rx,
        ));
        *liveness = Some((shutdown_tx, handle));
        info!("SPV service started");
    }

    /// Stop the liveness loop and close the chain store
    pub async fn stop(&self) {
        let running = self.inner.liveness.lock().take();
        if let Some((shutdown_tx, handle)) = running {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!("Liveness loop ended abnormally: {}", e);
            }
        }

        self.inner.chain.close();
        info!("SPV service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.liveness.lock().is_some()
    }

    /// Version this client announces to new peers
    pub fn local_version(&self) -> Version {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        local_version(&self.inner.config, self.inner.chain.height(), timestamp)
    }

    /// Gate a remote version message before the peer is admitted
    pub fn handle_version(&self, version: &Version) -> SyncResult<()> {
        check_version(version, self.inner.config.network.min_protocol_version)
    }

    /// Load our filter on a peer that just finished the handshake
    pub fn peer_connected(&self, peer: &Arc<dyn Peer>) {
        debug!("Peer {} connected, sending filterload", peer.id());
        peer.send(self.inner.filter.filter_load_message());
    }

    /// Dispatch one decoded message. Peers that have not finished the
    /// handshake are refused before any state is touched.
    pub fn handle_message(&self, peer: &Arc<dyn Peer>, message: Message) -> SyncResult<()> {
        let peer_id = peer.id();
        if peer.state() != PeerState::Established {
            return Err(SyncError::IncompatiblePeer(format!(
                "peer {} sent {} before completing the handshake",
                peer_id,
                message.command()
            )));
        }
        match message {
            Message::Ping { height } => {
                peer.set_height(height);
                peer.send(Message::Pong {
                    height: self.inner.chain.height(),
                });
                Ok(())
            }
            Message::Pong { height } => {
                peer.set_height(height);
                Ok(())
            }
            Message::Inventory(inventory) => {
                if inventory.iter().any(|item| item.is_block()) {
                    info!("SPV receive block inventory from {}", peer_id);
                }
                self.with_sync(|sync| sync.on_block_inventory(peer_id, &inventory))
            }
            Message::MerkleBlock(block) => {
                self.with_sync(|sync| sync.on_merkle_block(peer_id, block))
            }
            Message::Tx(tx) => self.with_sync(|sync| sync.on_txn(peer_id, tx)),
            Message::NotFound(items) => self.with_sync(|sync| sync.on_not_found(peer_id, &items)),
            other => Err(SyncError::UnsupportedMessage(other.command().to_string())),
        }
    }

    /// Watch a new address: reload the filter and push it to every peer
    pub fn notify_new_address(&self, address: &[u8]) {
        self.inner.filter.add_address(address);
        self.inner.filter.reload_addr_filter();
        self.inner
            .peers
            .broadcast(self.inner.filter.filter_load_message());
    }

    pub fn send_transaction(&self, tx: Transaction) {
        debug!("Broadcasting transaction {}", tx.txid());
        self.inner.peers.broadcast(Message::Tx(tx));
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.sync.lock().status()
    }

    pub fn update_local_height(&self) {
        self.inner.peers.set_local_height(self.inner.chain.height());
    }

    /// One liveness pass: probe or drop established peers, refill outbound
    /// connections and keep synchronizing.
    pub fn tick(&self) {
        self.inner.tick();
    }

    fn with_sync<T>(&self, f: impl FnOnce(&mut SyncManager) -> T) -> T {
        self.inner.with_sync(f)
    }
}

impl Inner {
    fn tick(&self) {
        let timeout = self.config.sync.keep_alive_timeout();
        let height = self.chain.height();
        let now = Instant::now();

        for peer in self.peers.connected_peers() {
            if peer.state() != PeerState::Established {
                continue;
            }
            if now.saturating_duration_since(peer.last_active()) > timeout {
                trace!("SPV disconnect inactive peer {}", peer.id());
                self.peers.disconnect_peer(peer.id());
                continue;
            }
            peer.send(Message::Ping { height });
        }

        self.peers.connect_peers();

        if let Err(e) = self.with_sync(|sync| sync.sync_blocks()) {
            warn!("Sync upkeep failed: {}", e);
        }
        self.peers.set_local_height(self.chain.height());
    }

    fn with_sync<T>(&self, f: impl FnOnce(&mut SyncManager) -> T) -> T {
        let (result, commands) = {
            let mut sync = self.sync.lock();
            let result = f(&mut sync);
            (result, sync.take_commands())
        };
        self.execute(commands);
        result
    }

    /// Run queued effects against the transport; the sync lock is not held
    fn execute(&self, commands: Vec<NetworkCommand>) {
        if commands.is_empty() {
            return;
        }

        let mut connected: Option<HashMap<_, Arc<dyn Peer>>> = None;
        for command in commands {
            match command {
                NetworkCommand::SendToPeer { peer_id, message } => {
                    let peers = connected.get_or_insert_with(|| {
                        self.peers
                            .connected_peers()
                            .into_iter()
                            .map(|peer| (peer.id(), peer))
                            .collect()
                    });
                    match peers.get(&peer_id) {
                        Some(peer) => peer.send(message),
                        None => debug!(
                            "Dropping {} for disconnected peer {}",
                            message.command(),
                            peer_id
                        ),
                    }
                }
                NetworkCommand::Broadcast(message) => self.peers.broadcast(message),
                NetworkCommand::DisconnectPeer(peer_id) => {
                    self.peers.disconnect_peer(peer_id);
                    if let Some(peers) = connected.as_mut() {
                        peers.remove(&peer_id);
                    }
                }
                NetworkCommand::SetSyncPeer(peer_id) => self.peers.set_sync_peer(peer_id),
                NetworkCommand::SetLocalHeight(height) => self.peers.set_local_height(height),
            }
        }
    }
}

/// Liveness loop; exits on shutdown or once the service is dropped
async fn keep_update(inner: Weak<Inner>, period: time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.upgrade() {
                    Some(inner) => inner.tick(),
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Liveness loop stopped");
}
