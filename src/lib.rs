//! Service advertisement and peer discovery for p2p overlays.
//!
//! Nodes register named services, advertise them on a routing substrate and a
//! gossip topic, and keep a TTL-bounded directory of other providers. Handlers
//! bound to a protocol id are served over RPC sessions, and typed clients can
//! be built against any discovered peer. The built-in peer-exchange service
//! lets a node pull another node's directory for second-hop discovery.
//!
//! Substrates are traits ([`Transport`], [`Routing`], [`Gossip`]). The
//! [`memory`] module provides an in-process overlay; the `iroh` feature adds
//! implementations over an iroh endpoint, iroh-gossip and the mainline DHT.

#![deny(missing_docs)]

pub mod alpn;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod memory;
#[cfg(feature = "iroh")]
pub mod overlay;
pub mod peer;
pub mod peer_exchange;
pub mod registry;
pub mod rpc;
mod source;
pub mod substrate;

// Re-export key types
pub use config::DiscoveryConfig;
pub use coordinator::{DiscoveryBuilder, DiscoveryCoordinator, ServiceDiscovery};
pub use directory::{PeerDirectory, PeerRecord, Upsert};
pub use error::{Error, Result};
pub use peer::{ParsePeerIdError, PeerId};
pub use peer_exchange::{PeerExchangeClient, PeerExchangeService, PEER_EXCHANGE_PROTOCOL};
pub use registry::{ClientConstructor, ServiceHandler, ServiceRegistry};
pub use rpc::{RpcPeer, RpcRequest, RpcService};
pub use source::{Announcement, DiscoveryEvent, DiscoverySource};
pub use substrate::{
    AddressBook, BoxedStream, Gossip, GossipMessage, GossipStream, GossipTopic, InboundStream,
    ProviderRecord, ProviderStream, Routing, StreamHandler, Transport,
};
