//! Supernova SPV client
//!
//! Synchronizes block headers, filtered blocks and wallet transactions from
//! full nodes. A single sync round is bound to one peer at a time; data that
//! arrives out of order is parked in an orphan pool until it connects.

pub mod chain;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod network;
pub mod service;
pub mod sync;
pub mod types;

pub use chain::{ChainError, ChainListener, ChainStore, FilteredBlock, MemoryChain};
pub use config::{SpvConfig, SpvConfigError};
pub use error::{FaultKind, SyncError, SyncResult};
pub use filter::{AddrFilter, BloomFilter, FilterSource};
pub use network::{Message, NetworkCommand, Peer, PeerId, PeerManager, PeerState};
pub use service::SpvService;
pub use sync::{SyncManager, SyncStatus};
pub use types::{BlockHash, BlockHeader, Hash256, MerkleBlock, Transaction, TxHash};
