//! The discovery node: per-topic directories, their source loops, and the
//! service registry layered on top.
//!
//! ```
//! use iroh_service_discovery::memory::MemoryNetwork;
//! use iroh_service_discovery::{DiscoveryConfig, DiscoveryCoordinator, Transport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> iroh_service_discovery::Result<()> {
//! let net = MemoryNetwork::new();
//! let transport = net.add_node();
//! let node = DiscoveryCoordinator::builder(transport.clone())
//!     .routing(net.routing(&transport.local_id()))
//!     .gossip(net.gossip(&transport.local_id()))
//!     .config(DiscoveryConfig::default())
//!     .spawn()
//!     .await?;
//!
//! node.register_service("calculator").await?;
//! let peers = node.find_peers("calculator")?;
//! assert!(peers.is_empty());
//! node.close().await?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::DiscoveryConfig;
use crate::directory::{PeerDirectory, PeerRecord};
use crate::peer::PeerId;
use crate::peer_exchange::{
    PeerExchangeClient, PeerExchangeService, MAX_PAGE_SIZE, PEER_EXCHANGE_PROTOCOL,
};
use crate::registry::{ServiceHandler, ServiceRegistry};
use crate::source::gossip::{GossipAnnouncer, GossipListener};
use crate::source::routing::RoutingLookup;
use crate::source::{observe, DiscoveryEvent, DiscoverySource};
use crate::substrate::{Gossip, Routing, Transport};
use crate::{Error, Result};

/// Read-only view of a node's directories.
///
/// Cheap to clone; handed to services (such as peer exchange) that answer
/// queries about the local directory.
#[derive(Clone)]
pub struct ServiceDiscovery {
    directories: Arc<RwLock<HashMap<String, Arc<PeerDirectory>>>>,
    transport: Arc<dyn Transport>,
    ttl: Duration,
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("services", &self.list_services())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ServiceDiscovery {
    pub(crate) fn new(transport: Arc<dyn Transport>, ttl: Duration) -> Self {
        Self {
            directories: Arc::default(),
            transport,
            ttl,
        }
    }

    pub(crate) fn insert_directory(&self, directory: Arc<PeerDirectory>) {
        self.directories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(directory.topic().to_string(), directory);
    }

    /// The directory for `topic`, if registered.
    pub fn directory(&self, topic: &str) -> Option<Arc<PeerDirectory>> {
        self.directories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Whether `topic` is registered on this node.
    pub fn is_registered(&self, topic: &str) -> bool {
        self.directories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn list_services(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .directories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Peer time-to-live applied to queries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live peers providing `topic`, sorted by identity.
    pub fn find_peers(&self, topic: &str) -> Result<Vec<PeerRecord>> {
        self.find_peers_at(topic, SystemTime::now())
    }

    /// [`find_peers`](Self::find_peers) evaluated at `now`.
    pub fn find_peers_at(&self, topic: &str, now: SystemTime) -> Result<Vec<PeerRecord>> {
        let directory = self
            .directory(topic)
            .ok_or_else(|| Error::UnknownService(topic.to_string()))?;
        Ok(directory.query(self.ttl, now, &*self.transport))
    }

    /// Whether `peer` has a live record for `topic`.
    pub fn check_service_provider(&self, peer: &PeerId, topic: &str) -> Result<bool> {
        let directory = self
            .directory(topic)
            .ok_or_else(|| Error::UnknownService(topic.to_string()))?;
        Ok(directory.is_live(peer, self.ttl, SystemTime::now()))
    }
}

async fn advertise(
    routing: Arc<dyn Routing>,
    topic: String,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => debug!("advertise cancelled"),
        res = tokio::time::timeout(timeout, routing.advertise(&topic)) => match res {
            Ok(Ok(())) => debug!("service advertised"),
            Ok(Err(e)) => warn!(error = %e, "failed to advertise service"),
            Err(_) => warn!(?timeout, "advertise timed out"),
        },
    }
}

struct TopicTasks {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// A discovery node.
///
/// Owns one [`PeerDirectory`] per registered topic, the background loops
/// feeding them, and the [`ServiceRegistry`] for RPC handlers and clients.
pub struct DiscoveryCoordinator {
    config: DiscoveryConfig,
    local: PeerId,
    transport: Arc<dyn Transport>,
    routing: Option<Arc<dyn Routing>>,
    gossip: Option<Arc<dyn Gossip>>,
    discovery: ServiceDiscovery,
    registry: Arc<ServiceRegistry>,
    events: broadcast::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
    topics: Mutex<HashMap<String, TopicTasks>>,
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("local", &self.local)
            .field("services", &self.list_services())
            .finish_non_exhaustive()
    }
}

impl DiscoveryCoordinator {
    /// Start building a node on `transport`.
    pub fn builder<T: Transport>(transport: T) -> DiscoveryBuilder {
        DiscoveryBuilder {
            transport: Arc::new(transport),
            routing: None,
            gossip: None,
            config: DiscoveryConfig::default(),
        }
    }

    /// Register `topic`: create its directory, advertise, and start the
    /// enabled sources.
    ///
    /// Fails with [`Error::AlreadyRegistered`] when the topic exists. If a
    /// source cannot start, every loop started for the topic is stopped before
    /// the error is returned and the topic stays unregistered.
    pub async fn register_service(&self, topic: &str) -> Result<()> {
        let mut topics = self.topics.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        if topics.contains_key(topic) || self.discovery.is_registered(topic) {
            return Err(Error::AlreadyRegistered(topic.to_string()));
        }

        let directory = Arc::new(PeerDirectory::new(topic, self.local));
        let cancel = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        let started = tokio::select! {
            res = self.start_sources(&directory, &cancel, &mut tasks) => res,
            _ = cancel.cancelled() => Err(Error::Closed),
        };
        if let Err(e) = started {
            warn!(%topic, error = %e, "service registration failed");
            cancel.cancel();
            tasks.shutdown().await;
            return Err(e);
        }

        self.discovery.insert_directory(directory);
        topics.insert(topic.to_string(), TopicTasks { cancel, tasks });
        info!(%topic, "service registered");
        Ok(())
    }

    async fn start_sources(
        &self,
        directory: &Arc<PeerDirectory>,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let topic = directory.topic();
        let period = self.config.discovery_period;

        if let Some(routing) = &self.routing {
            // fail-open: lookups run whether or not advertising succeeds
            tasks.spawn(
                advertise(
                    Arc::clone(routing),
                    topic.to_string(),
                    self.config.lookup_timeout,
                    cancel.clone(),
                )
                .instrument(tracing::debug_span!("advertise", %topic)),
            );
            let lookup = RoutingLookup {
                routing: Arc::clone(routing),
                transport: Arc::clone(&self.transport),
                directory: Arc::clone(directory),
                events: self.events.clone(),
                timeout: self.config.lookup_timeout,
            };
            tasks.spawn(
                lookup
                    .run(period, cancel.clone())
                    .instrument(tracing::debug_span!("routing_discovery", %topic)),
            );
        }

        if let Some(gossip) = &self.gossip {
            let handle = gossip.join(topic).await?;
            let subscription = handle.subscribe().await?;

            let announcer = GossipAnnouncer {
                topic: Arc::clone(&handle),
                local: self.local,
            };
            let listener = GossipListener {
                topic: handle,
                transport: Arc::clone(&self.transport),
                directory: Arc::clone(directory),
                events: self.events.clone(),
            };
            tasks.spawn(
                announcer
                    .run(period, cancel.clone())
                    .instrument(tracing::debug_span!("gossip_announce", %topic)),
            );
            tasks.spawn(
                listener
                    .run(subscription, period, cancel.clone())
                    .instrument(tracing::debug_span!("gossip_discovery", %topic)),
            );
        }

        Ok(())
    }

    /// Live peers providing `topic`, sorted by identity.
    pub fn find_peers(&self, topic: &str) -> Result<Vec<PeerRecord>> {
        self.discovery.find_peers(topic)
    }

    /// Alias of [`find_peers`](Self::find_peers).
    pub fn list_peers(&self, topic: &str) -> Result<Vec<PeerRecord>> {
        self.find_peers(topic)
    }

    /// Whether `peer` was seen providing `topic` within the TTL.
    ///
    /// Fails with [`Error::UnknownService`] when `topic` is not registered here.
    pub fn check_service_provider(&self, peer: &PeerId, topic: &str) -> Result<bool> {
        self.discovery.check_service_provider(peer, topic)
    }

    /// Registered topics, sorted.
    pub fn list_services(&self) -> Vec<String> {
        self.discovery.list_services()
    }

    /// Register `handler.protocol()` as a topic, then bind the handler.
    pub async fn register_service_handler<H: ServiceHandler>(&self, handler: H) -> Result<()> {
        let handler = Arc::new(handler);
        self.register_service(handler.protocol()).await?;
        self.registry.register_service(handler);
        Ok(())
    }

    /// Dial `peer` and build a client with the constructor bound to `protocol`.
    pub async fn new_service_client_any(
        &self,
        protocol: &str,
        peer: &PeerId,
    ) -> Result<Box<dyn Any + Send>> {
        self.registry.new_client_any(protocol, peer).await
    }

    /// Typed variant of [`new_service_client_any`](Self::new_service_client_any).
    pub async fn new_service_client<C: Any + Send>(
        &self,
        protocol: &str,
        peer: &PeerId,
    ) -> Result<C> {
        self.registry.new_client(protocol, peer).await
    }

    /// Peer-exchange client for `peer`.
    pub async fn peer_exchange_client(&self, peer: &PeerId) -> Result<PeerExchangeClient> {
        self.new_service_client(PEER_EXCHANGE_PROTOCOL, peer).await
    }

    /// Pull `peer`'s directory for `topic` and merge it into the local one.
    ///
    /// Remote ages are converted to local observation times. Addresses are
    /// passed to the transport as hints so the peers can be dialled. Returns
    /// how many records were inserted or refreshed.
    pub async fn exchange_peers(&self, peer: &PeerId, topic: &str) -> Result<usize> {
        let directory = self
            .discovery
            .directory(topic)
            .ok_or_else(|| Error::UnknownService(topic.to_string()))?;

        let client = self.peer_exchange_client(peer).await?;
        let entries = client.fetch_all(topic, MAX_PAGE_SIZE).await;
        client.session().close();
        let entries = entries?;

        let now = SystemTime::now();
        let mut accepted = 0;
        for entry in entries {
            let Some(remote) = entry.peer() else {
                debug!(from = %peer.fmt_short(), "skipping entry with malformed identity");
                continue;
            };
            if remote == self.local {
                continue;
            }
            let seen_at = now.checked_sub(entry.last_seen_ago()).unwrap_or(UNIX_EPOCH);
            self.transport.add_addresses(&remote, &entry.addresses);
            let outcome = observe(
                &directory,
                &self.events,
                DiscoverySource::PeerExchange,
                remote,
                entry.addresses,
                seen_at,
            );
            if outcome.changed() {
                accepted += 1;
            }
        }
        debug!(%topic, from = %peer.fmt_short(), accepted, "peer exchange complete");
        Ok(accepted)
    }

    /// Receive a [`DiscoveryEvent`] for every accepted observation.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Identity of this node.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// The transport the node runs on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Read-only view of the directories.
    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.discovery
    }

    /// The configuration the node was built with.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Stop every loop and session, then release the substrates.
    ///
    /// Substrate shutdown errors are logged, not returned.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let topics: Vec<_> = self.topics.lock().await.drain().collect();
        for (topic, mut state) in topics {
            state.cancel.cancel();
            while let Some(res) = state.tasks.join_next().await {
                if let Err(e) = res {
                    warn!(%topic, error = %e, "discovery task failed");
                }
            }
        }

        if let Some(routing) = &self.routing {
            if let Err(e) = routing.close().await {
                warn!(error = %e, "routing shutdown error");
            }
        }
        if let Some(gossip) = &self.gossip {
            if let Err(e) = gossip.close().await {
                warn!(error = %e, "gossip shutdown error");
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "transport shutdown error");
        }

        info!(node = %self.local.fmt_short(), "discovery coordinator closed");
        Ok(())
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for [`DiscoveryCoordinator`].
pub struct DiscoveryBuilder {
    transport: Arc<dyn Transport>,
    routing: Option<Arc<dyn Routing>>,
    gossip: Option<Arc<dyn Gossip>>,
    config: DiscoveryConfig,
}

impl DiscoveryBuilder {
    /// Routing substrate used for advertising and provider lookups.
    pub fn routing<R: Routing>(mut self, routing: R) -> Self {
        self.routing = Some(Arc::new(routing));
        self
    }

    /// Gossip substrate used for announcements.
    pub fn gossip<G: Gossip>(mut self, gossip: G) -> Self {
        self.gossip = Some(Arc::new(gossip));
        self
    }

    /// Node configuration.
    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the node. With peer exchange enabled this also registers the
    /// peer-exchange handler, making its protocol id a discoverable topic.
    pub async fn spawn(self) -> Result<DiscoveryCoordinator> {
        let config = self.config;
        config.validate()?;

        let routing = match (config.enable_routing_discovery, self.routing) {
            (true, None) => {
                return Err(Error::Config(
                    "routing discovery is enabled but no routing substrate was supplied".into(),
                ))
            }
            (true, routing) => routing,
            (false, _) => None,
        };
        let gossip = match (config.enable_gossip_discovery, self.gossip) {
            (true, None) => {
                return Err(Error::Config(
                    "gossip discovery is enabled but no gossip substrate was supplied".into(),
                ))
            }
            (true, gossip) => gossip,
            (false, _) => None,
        };

        let transport = self.transport;
        let local = transport.local_id();
        let cancel = CancellationToken::new();
        let discovery = ServiceDiscovery::new(Arc::clone(&transport), config.peer_ttl);
        let registry = Arc::new(ServiceRegistry::new(Arc::clone(&transport), cancel.clone()));
        registry.register_client_constructor(PEER_EXCHANGE_PROTOCOL, PeerExchangeClient::new);
        let (events, _) = broadcast::channel(config.event_capacity);

        let enable_peer_exchange = config.enable_peer_exchange;
        let coordinator = DiscoveryCoordinator {
            config,
            local,
            transport,
            routing,
            gossip,
            discovery: discovery.clone(),
            registry,
            events,
            cancel,
            topics: Mutex::new(HashMap::new()),
        };

        if enable_peer_exchange {
            let service = PeerExchangeService::new(discovery);
            if let Err(e) = coordinator.register_service_handler(service).await {
                let _ = coordinator.close().await;
                return Err(e);
            }
        }

        info!(node = %local.fmt_short(), "discovery coordinator started");
        Ok(coordinator)
    }
}
