//! Periodic provider lookups on the routing substrate.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{observe, DiscoveryEvent, DiscoverySource};
use crate::directory::PeerDirectory;
use crate::substrate::{Routing, Transport};
use crate::{Error, Result};

/// Routing-lookup source for one topic.
pub(crate) struct RoutingLookup {
    pub(crate) routing: Arc<dyn Routing>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) events: broadcast::Sender<DiscoveryEvent>,
    pub(crate) timeout: Duration,
}

impl RoutingLookup {
    /// Run one lookup and record every provider. Returns how many records changed.
    ///
    /// All results share the lookup completion time as their observation time.
    pub(crate) async fn lookup_once(&self) -> Result<usize> {
        let topic = self.directory.topic();
        let providers = tokio::time::timeout(self.timeout, async {
            let stream = self.routing.find_providers(topic).await?;
            Ok::<_, Error>(stream.collect::<Vec<_>>().await)
        })
        .await
        .map_err(|_| Error::routing(format!("provider lookup for `{topic}` timed out")))??;

        let seen_at = SystemTime::now();
        let mut changed = 0;
        for provider in providers {
            let addresses = if provider.addresses.is_empty() {
                self.transport.addresses(&provider.peer)
            } else {
                provider.addresses
            };
            let outcome = observe(
                &self.directory,
                &self.events,
                DiscoverySource::Routing,
                provider.peer,
                addresses,
                seen_at,
            );
            if outcome.changed() {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Look up providers every `period` until cancelled. The first lookup
    /// happens one period after start.
    pub(crate) async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("routing discovery shutting down");
                    break;
                }
                _ = interval.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("routing discovery cancelled during lookup");
                            break;
                        }
                        res = self.lookup_once() => match res {
                            Ok(changed) => trace!(changed, "provider lookup complete"),
                            Err(e) => debug!(error = %e, "provider lookup failed, retrying next period"),
                        }
                    }
                }
            }
        }
    }
}
