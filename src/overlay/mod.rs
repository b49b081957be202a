//! Substrates over iroh.
//!
//! - [`IrohTransport`]: one ALPN per protocol id on an iroh [`Endpoint`]
//! - [`IrohGossip`]: announcement topics on iroh-gossip
//! - [`MainlineRouting`]: provider records in the mainline DHT
//!
//! [`IrohOverlay`] wires all three onto one endpoint:
//!
//! ```no_run
//! use iroh_service_discovery::overlay::IrohOverlay;
//!
//! # async fn run() -> iroh_service_discovery::Result<()> {
//! let endpoint = iroh::Endpoint::builder().discovery_n0().bind().await.unwrap();
//! let overlay = IrohOverlay::spawn(endpoint, Vec::new()).await?;
//! let node = overlay.coordinator_builder().spawn().await?;
//! node.register_service("/calculator/1.0").await?;
//! # Ok(())
//! # }
//! ```

pub mod dht;
pub mod gossip;
pub mod stream;
pub mod transport;

use iroh::{Endpoint, NodeId};

pub use dht::{MainlineConfig, MainlineRouting};
pub use gossip::IrohGossip;
pub use stream::{IrohStream, IrohStreamInfo};
pub use transport::IrohTransport;

use crate::coordinator::{DiscoveryBuilder, DiscoveryCoordinator};
use crate::{Error, Result};

/// Transport, gossip and routing sharing one endpoint.
#[derive(Debug, Clone)]
pub struct IrohOverlay {
    transport: IrohTransport,
    gossip: IrohGossip,
    routing: MainlineRouting,
}

impl IrohOverlay {
    /// Spawn gossip and a DHT client on `endpoint`. Gossip topics are joined
    /// through `bootstrap`.
    pub async fn spawn(endpoint: Endpoint, bootstrap: Vec<NodeId>) -> Result<Self> {
        Self::spawn_with(endpoint, bootstrap, MainlineConfig::default()).await
    }

    /// [`spawn`](Self::spawn) with an explicit DHT configuration.
    pub async fn spawn_with(
        endpoint: Endpoint,
        bootstrap: Vec<NodeId>,
        dht: MainlineConfig,
    ) -> Result<Self> {
        let transport = IrohTransport::new(endpoint.clone());
        let gossip = iroh_gossip::net::Gossip::builder()
            .spawn(endpoint.clone())
            .await
            .map_err(|e| Error::gossip(format!("spawn gossip: {e}")))?;
        transport.attach_gossip(gossip.clone());
        let routing = MainlineRouting::new(endpoint, dht)?;
        Ok(Self {
            transport,
            gossip: IrohGossip::new(gossip, bootstrap),
            routing,
        })
    }

    /// The transport.
    pub fn transport(&self) -> &IrohTransport {
        &self.transport
    }

    /// The gossip substrate.
    pub fn gossip(&self) -> &IrohGossip {
        &self.gossip
    }

    /// The routing substrate.
    pub fn routing(&self) -> &MainlineRouting {
        &self.routing
    }

    /// A coordinator builder with all three substrates supplied.
    pub fn coordinator_builder(&self) -> DiscoveryBuilder {
        DiscoveryCoordinator::builder(self.transport.clone())
            .gossip(self.gossip.clone())
            .routing(self.routing.clone())
    }
}
