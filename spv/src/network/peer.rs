use crate::network::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Identity a peer announced during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{:016x}", self.0)
    }
}

/// State of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connection opened, nothing exchanged yet
    Init,
    /// Version messages being exchanged
    Handshake,
    /// Handshake complete; normal message flow
    Established,
    /// Connection is being torn down
    Inactive,
}

/// A connected remote node
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    /// Queue a message for delivery. Must not block on the network.
    fn send(&self, message: Message);

    /// Best height the peer reported
    fn height(&self) -> u64;

    fn set_height(&self, height: u64);

    /// Time the peer last delivered any message
    fn last_active(&self) -> Instant;

    fn state(&self) -> PeerState;
}

/// Connection pool owned by the transport layer
pub trait PeerManager: Send + Sync {
    fn start(&self);

    fn connected_peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Top up outbound connections
    fn connect_peers(&self);

    fn broadcast(&self, message: Message);

    fn disconnect_peer(&self, peer_id: PeerId);

    /// Tell the transport which peer the current sync round is bound to
    fn set_sync_peer(&self, peer_id: Option<PeerId>);

    /// Height advertised to peers in our own version/ping messages
    fn set_local_height(&self, height: u64);
}
