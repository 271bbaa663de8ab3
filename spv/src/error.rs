//! Sync engine error types

use crate::chain::ChainError;
use crate::network::PeerId;
use crate::types::{BlockHash, MerkleError, TxHash};
use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// How the caller should treat a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Peer broke the protocol; disconnect it
    Protocol,
    /// Data failed validation; surfaced for peer scoring decisions
    Validation,
    /// Data was already seen; nothing changed
    Duplicate,
    /// Local chain store failure
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Received unsupported message, CMD {0}")]
    UnsupportedMessage(String),

    #[error("Incompatible peer: {0}")]
    IncompatiblePeer(String),

    #[error("Received block that is already known: {0}")]
    DuplicateBlock(BlockHash),

    #[error("Invalid header in block {hash}: {source}")]
    InvalidHeader { hash: BlockHash, source: ChainError },

    #[error("Invalid merkle proof in block {hash}: {source}")]
    InvalidMerkleProof { hash: BlockHash, source: MerkleError },

    #[error("Received transaction that is already cached: {0}")]
    AlreadyCached(TxHash),

    #[error("Received message from non sync peer {peer}, disconnecting")]
    NonSyncPeer { peer: PeerId, expected: Option<PeerId> },

    #[error("Peer {peer} does not have {count} requested item(s)")]
    NotFound { peer: PeerId, count: usize },

    #[error("Failed to commit sync round: {0}")]
    CommitFailed(ChainError),

    #[error("Chain store error: {0}")]
    Chain(#[from] ChainError),
}

impl SyncError {
    pub fn kind(&self) -> FaultKind {
        match self {
            SyncError::UnsupportedMessage(_)
            | SyncError::IncompatiblePeer(_)
            | SyncError::NonSyncPeer { .. }
            | SyncError::NotFound { .. } => FaultKind::Protocol,
            SyncError::DuplicateBlock(_)
            | SyncError::InvalidHeader { .. }
            | SyncError::InvalidMerkleProof { .. } => FaultKind::Validation,
            SyncError::AlreadyCached(_) => FaultKind::Duplicate,
            SyncError::CommitFailed(_) | SyncError::Chain(_) => FaultKind::Internal,
        }
    }

    /// Protocol faults always cost the peer its connection
    pub fn should_disconnect(&self) -> bool {
        self.kind() == FaultKind::Protocol
    }
}
