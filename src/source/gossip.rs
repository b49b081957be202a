//! Gossip announce and subscribe loops.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{observe, pause, Announcement, DiscoveryEvent, DiscoverySource};
use crate::directory::{PeerDirectory, Upsert};
use crate::peer::PeerId;
use crate::substrate::{GossipMessage, GossipStream, GossipTopic, Transport};
use crate::Result;

/// Publishes the local node's announcement on a topic every period.
pub(crate) struct GossipAnnouncer {
    pub(crate) topic: Arc<dyn GossipTopic>,
    pub(crate) local: PeerId,
}

impl GossipAnnouncer {
    /// Publish one announcement stamped `now`.
    pub(crate) async fn announce_once(&self, now: SystemTime) -> Result<()> {
        let payload = Announcement::new(self.local, now)
            .to_bytes()
            .map_err(|e| crate::Error::gossip(format!("encode announcement: {e}")))?;
        self.topic.publish(Bytes::from(payload)).await
    }

    /// Announce every `period` until cancelled, first one period after start.
    pub(crate) async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("gossip announcer shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.announce_once(SystemTime::now()).await {
                        warn!(error = %e, "failed to publish announcement");
                    }
                }
            }
        }
    }
}

/// Consumes announcements from a topic subscription.
pub(crate) struct GossipListener {
    pub(crate) topic: Arc<dyn GossipTopic>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) events: broadcast::Sender<DiscoveryEvent>,
}

impl GossipListener {
    /// Apply one received message. Returns `None` when the message is dropped
    /// before reaching the directory.
    pub(crate) fn handle_message(&self, msg: &GossipMessage, now: SystemTime) -> Option<Upsert> {
        let announcement = match Announcement::from_bytes(&msg.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(from = %msg.origin.fmt_short(), error = %e, "malformed announcement");
                return None;
            }
        };
        let Some(peer) = announcement.peer() else {
            debug!(identity = %announcement.identity, "announcement with invalid identity");
            return None;
        };
        if peer == self.transport.local_id() {
            return None;
        }

        let addresses = self.transport.addresses(&peer);
        if addresses.is_empty() {
            trace!(peer = %peer.fmt_short(), "no known addresses for announcing peer");
            return None;
        }

        let seen_at = announcement.claimed_at().min(now);
        Some(observe(
            &self.directory,
            &self.events,
            DiscoverySource::Gossip,
            peer,
            addresses,
            seen_at,
        ))
    }

    /// Drain `stream`, resubscribing one period after it fails or ends, until
    /// cancelled.
    pub(crate) async fn run(
        self,
        mut stream: GossipStream,
        period: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("gossip listener shutting down");
                        return;
                    }
                    msg = stream.next() => match msg {
                        Some(msg) => {
                            self.handle_message(&msg, SystemTime::now());
                        }
                        None => break,
                    }
                }
            }

            debug!("gossip subscription ended, resubscribing");
            stream = loop {
                if pause(period, &cancel).await {
                    return;
                }
                match self.topic.subscribe().await {
                    Ok(s) => break s,
                    Err(e) => warn!(error = %e, "failed to resubscribe"),
                }
            };
        }
    }
}
