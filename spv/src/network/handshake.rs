//! Version handshake gating: only peers speaking a recent enough protocol
//! and offering the SPV service are admitted.

use crate::config::SpvConfig;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: u32 = 1;

/// Service bit advertising bloom-filtered block serving
pub const SERVICE_SPV: u64 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub port: u16,
    pub nonce: u64,
    pub height: u64,
    pub relay: bool,
}

/// Build the version this client announces. SPV clients serve nothing and
/// ask peers not to relay unfiltered transactions.
pub fn local_version(config: &SpvConfig, height: u64, timestamp: u64) -> Version {
    Version {
        version: PROTOCOL_VERSION,
        services: 0,
        timestamp,
        port: config.network.spv_client_port,
        nonce: config.network.client_id,
        height,
        relay: false,
    }
}

/// Reject peers that cannot serve filtered blocks
pub fn check_version(remote: &Version, min_version: u32) -> Result<(), SyncError> {
    if remote.version < min_version {
        error!(
            "SPV disconnect peer, peer version {} is below required {}",
            remote.version, min_version
        );
        return Err(SyncError::IncompatiblePeer(format!(
            "peer version {} is below required {}",
            remote.version, min_version
        )));
    }

    if remote.services & SERVICE_SPV == 0 {
        error!("SPV disconnect peer, spv service not enabled on connected peer");
        return Err(SyncError::IncompatiblePeer(
            "SPV service not enabled on connected peer".to_string(),
        ));
    }

    Ok(())
}
