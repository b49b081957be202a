//! Node configuration.

use std::time::Duration;

use crate::{Error, Result};

/// Configuration for a [`DiscoveryCoordinator`](crate::DiscoveryCoordinator).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Run the routing-lookup source for every registered topic.
    pub enable_routing_discovery: bool,
    /// Run the gossip announce/subscribe sources for every registered topic.
    pub enable_gossip_discovery: bool,
    /// Serve and register the peer-exchange protocol.
    pub enable_peer_exchange: bool,
    /// Age after which a peer record is excluded from results. Default: 3h.
    pub peer_ttl: Duration,
    /// Period shared by the lookup and announce loops. Default: 1 minute.
    pub discovery_period: Duration,
    /// Upper bound for a single provider lookup. Default: 30s.
    pub lookup_timeout: Duration,
    /// Capacity of the discovery event channel. Default: 256.
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable_routing_discovery: true,
            enable_gossip_discovery: true,
            enable_peer_exchange: true,
            peer_ttl: Duration::from_secs(3 * 60 * 60),
            discovery_period: Duration::from_secs(60),
            lookup_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl DiscoveryConfig {
    /// Enable or disable the routing-lookup source.
    pub fn with_routing_discovery(mut self, enable: bool) -> Self {
        self.enable_routing_discovery = enable;
        self
    }

    /// Enable or disable the gossip source.
    pub fn with_gossip_discovery(mut self, enable: bool) -> Self {
        self.enable_gossip_discovery = enable;
        self
    }

    /// Enable or disable the peer-exchange service.
    pub fn with_peer_exchange(mut self, enable: bool) -> Self {
        self.enable_peer_exchange = enable;
        self
    }

    /// Set the peer time-to-live.
    pub fn with_peer_ttl(mut self, ttl: Duration) -> Self {
        self.peer_ttl = ttl;
        self
    }

    /// Set the discovery period.
    pub fn with_discovery_period(mut self, period: Duration) -> Self {
        self.discovery_period = period;
        self
    }

    /// Set the lookup timeout.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Check the configuration for values the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peer_ttl.is_zero() {
            return Err(Error::Config("peer_ttl must be non-zero".into()));
        }
        if self.discovery_period.is_zero() {
            return Err(Error::Config("discovery_period must be non-zero".into()));
        }
        if self.lookup_timeout.is_zero() {
            return Err(Error::Config("lookup_timeout must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be non-zero".into()));
        }
        Ok(())
    }
}
