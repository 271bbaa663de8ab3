//! Sync peer selection and fault bookkeeping

use crate::network::{Peer, PeerId, PeerState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Picks the peer a sync round is bound to. Peers that recently faulted a
/// round are only chosen when no other candidate exists.
#[derive(Debug, Clone)]
pub struct SyncPeerPolicy {
    cooldown: Duration,
    faults: HashMap<PeerId, Instant>,
}

impl SyncPeerPolicy {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            faults: HashMap::new(),
        }
    }

    pub fn record_fault(&mut self, peer: PeerId, now: Instant) {
        debug!("Recording sync fault for {}", peer);
        self.faults.insert(peer, now);
    }

    pub fn is_cooling_down(&self, peer: PeerId, now: Instant) -> bool {
        self.faults
            .get(&peer)
            .map_or(false, |at| now.saturating_duration_since(*at) < self.cooldown)
    }

    /// Forget faults whose cooldown has passed
    pub fn prune(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.faults
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
    }

    /// Best established peer ahead of `local_height`, never `exclude`.
    /// `prefer` wins whenever it is an eligible candidate.
    pub fn select(
        &self,
        peers: &[Arc<dyn Peer>],
        local_height: u64,
        exclude: Option<PeerId>,
        prefer: Option<PeerId>,
        now: Instant,
    ) -> Option<PeerId> {
        let candidates: Vec<&Arc<dyn Peer>> = peers
            .iter()
            .filter(|peer| peer.state() == PeerState::Established)
            .filter(|peer| peer.height() > local_height)
            .filter(|peer| Some(peer.id()) != exclude)
            .collect();

        if let Some(preferred) = prefer {
            if candidates
                .iter()
                .any(|peer| peer.id() == preferred && !self.is_cooling_down(preferred, now))
            {
                return Some(preferred);
            }
        }

        best(
            candidates
                .iter()
                .copied()
                .filter(|peer| !self.is_cooling_down(peer.id(), now)),
        )
        .or_else(|| best(candidates.iter().copied()))
    }
}

/// Highest peer; lowest id breaks ties
fn best<'a, I>(peers: I) -> Option<PeerId>
where
    I: Iterator<Item = &'a Arc<dyn Peer>>,
{
    peers
        .max_by(|a, b| {
            a.height()
                .cmp(&b.height())
                .then_with(|| b.id().cmp(&a.id()))
        })
        .map(|peer| peer.id())
}
