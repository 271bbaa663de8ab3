pub mod handshake;
pub mod message;
pub mod peer;

pub use handshake::{check_version, local_version, Version, PROTOCOL_VERSION, SERVICE_SPV};
pub use message::{FilterLoad, InvType, InvVect, Message, MessageKind};
pub use peer::{Peer, PeerId, PeerManager, PeerState};

/// Outbound effects produced while the sync lock is held and executed
/// against the transport after it is released
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCommand {
    /// Send a message to a specific peer
    SendToPeer { peer_id: PeerId, message: Message },
    /// Broadcast a message to all connected peers
    Broadcast(Message),
    /// Disconnect from a peer
    DisconnectPeer(PeerId),
    /// Rebind (or clear) the sync peer
    SetSyncPeer(Option<PeerId>),
    /// Publish a new local chain height
    SetLocalHeight(u64),
}
