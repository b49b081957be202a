//! Discovery sources feeding the per-topic directories.
//!
//! - routing lookup: periodic provider query against the [`Routing`](crate::Routing) substrate
//! - gossip: periodic self-announce plus a continuous subscription
//! - peer exchange: explicit pulls through [`DiscoveryCoordinator::exchange_peers`](crate::DiscoveryCoordinator::exchange_peers)

pub(crate) mod gossip;
pub(crate) mod routing;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::directory::{PeerDirectory, Upsert};
use crate::peer::PeerId;

/// Which source observed a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    /// Provider lookup on the routing substrate.
    Routing,
    /// Gossip announcement.
    Gossip,
    /// Directory pulled from another peer.
    PeerExchange,
}

impl DiscoverySource {
    /// Name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::Gossip => "gossip",
            Self::PeerExchange => "peer-exchange",
        }
    }
}

/// Notification emitted whenever a directory accepts a new or fresher record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer was recorded as providing `topic`.
    PeerDiscovered {
        /// The topic.
        topic: String,
        /// The peer.
        peer: PeerId,
        /// The source that produced the observation.
        source: DiscoverySource,
    },
}

/// Gossip payload announcing that a node provides the topic it is published on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Hex identity of the announcing node.
    pub identity: String,
    /// Unix epoch milliseconds at which the announcement was made.
    pub timestamp: u64,
}

impl Announcement {
    /// Announcement for `peer` made at `at`.
    pub fn new(peer: PeerId, at: SystemTime) -> Self {
        let timestamp = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            identity: peer.to_string(),
            timestamp,
        }
    }

    /// JSON encoding.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a JSON payload.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// The announcing peer, if the identity is well formed.
    pub fn peer(&self) -> Option<PeerId> {
        self.identity.parse().ok()
    }

    /// The claimed announcement time.
    pub fn claimed_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp)
    }
}

/// Upsert into `directory` and emit an event when the directory changed.
pub(crate) fn observe(
    directory: &PeerDirectory,
    events: &broadcast::Sender<DiscoveryEvent>,
    source: DiscoverySource,
    peer: PeerId,
    addresses: Vec<String>,
    seen_at: SystemTime,
) -> Upsert {
    let outcome = directory.upsert(peer, addresses, seen_at);
    trace!(
        topic = directory.topic(),
        peer = %peer.fmt_short(),
        source = source.as_str(),
        ?outcome,
        "observed peer"
    );
    if outcome.changed() {
        // no receivers is fine
        let _ = events.send(DiscoveryEvent::PeerDiscovered {
            topic: directory.topic().to_string(),
            peer,
            source,
        });
    }
    outcome
}

/// Sleep for `period` unless cancelled first. Returns true when cancelled.
pub(crate) async fn pause(
    period: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}
