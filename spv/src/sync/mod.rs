//! Block and transaction synchronization

pub mod false_positive;
pub mod manager;
pub mod orphan;
pub mod peer_policy;
pub mod request;

pub use false_positive::FalsePositiveMonitor;
pub use manager::{RoundMode, SyncManager, SyncRound, SyncStatus};
pub use orphan::{Orphan, OrphanEntry, OrphanPool};
pub use peer_policy::SyncPeerPolicy;
pub use request::RequestTracker;
