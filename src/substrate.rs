//! Contracts for the overlay collaborators the discovery engine runs on.
//!
//! - [`Transport`]: identity, address book, protocol-keyed streams
//! - [`Routing`]: provider advertisement and lookup
//! - [`Gossip`]: topic-scoped broadcast
//!
//! The [`memory`](crate::memory) module implements all of them in-process; the
//! `iroh` feature provides implementations over an iroh endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::peer::PeerId;
use crate::Result;

/// A raw bidirectional byte stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed raw stream handed between transports and RPC sessions.
pub type BoxedStream = Box<dyn RawStream>;

/// An inbound stream accepted for a protocol.
pub struct InboundStream {
    /// The dialing peer.
    pub remote: PeerId,
    /// The protocol id the stream was opened for.
    pub protocol: String,
    /// The stream itself.
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Callback invoked by a transport for each accepted stream.
///
/// Called on the transport's accept path; implementations hand the stream off
/// to their own task and return promptly.
pub type StreamHandler = Arc<dyn Fn(InboundStream) + Send + Sync>;

/// Local knowledge of peer addresses.
pub trait AddressBook: Send + Sync {
    /// Known addresses for a peer, best first. Empty when unknown.
    fn addresses(&self, peer: &PeerId) -> Vec<String>;
}

/// Identity and stream transport of the local node.
#[async_trait]
pub trait Transport: AddressBook + 'static {
    /// The long-lived identity of this node.
    fn local_id(&self) -> PeerId;

    /// Open an outbound stream to `peer` speaking `protocol`.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream>;

    /// Route inbound streams for `protocol` to `handler`, replacing any
    /// previous handler for the same protocol.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Address hints for `peer` learned out of band, e.g. from peer exchange.
    fn add_addresses(&self, _peer: &PeerId, _addresses: &[String]) {}

    /// Release transport resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A provider returned by a routing lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// The providing peer.
    pub peer: PeerId,
    /// Addresses the routing layer knows for the peer.
    pub addresses: Vec<String>,
}

/// Finite, non-restartable sequence of lookup results.
pub type ProviderStream = BoxStream<'static, ProviderRecord>;

/// Structured routing substrate (e.g. a DHT).
#[async_trait]
pub trait Routing: Send + Sync + 'static {
    /// Advertise the local node as a provider of `topic`. Idempotent.
    async fn advertise(&self, topic: &str) -> Result<()>;

    /// Look up providers of `topic`.
    async fn find_providers(&self, topic: &str) -> Result<ProviderStream>;

    /// Release routing resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A message received on a gossip topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Raw payload.
    pub payload: Bytes,
    /// The peer the message was received from.
    pub origin: PeerId,
}

/// Subscription stream for a gossip topic. Dropping it cancels the subscription.
pub type GossipStream = BoxStream<'static, GossipMessage>;

/// A joined gossip topic.
#[async_trait]
pub trait GossipTopic: Send + Sync + 'static {
    /// Publish a payload to the topic.
    async fn publish(&self, payload: Bytes) -> Result<()>;

    /// Subscribe to messages on the topic.
    async fn subscribe(&self) -> Result<GossipStream>;
}

/// Topic-scoped broadcast substrate.
#[async_trait]
pub trait Gossip: Send + Sync + 'static {
    /// Join `topic`, returning a handle shared by publishers and subscribers.
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>>;

    /// Release gossip resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
