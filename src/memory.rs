//! In-process overlay: transport, provider table and gossip hub shared by
//! every node created from one [`MemoryNetwork`].
//!
//! Nodes only reach peers whose address they know, either through
//! [`MemoryNetwork::connect`] or through a provider lookup, so the address
//! book behaves like a real overlay's peer store.
//!
//! ```
//! # use iroh_service_discovery::memory::MemoryNetwork;
//! # use iroh_service_discovery::{AddressBook, Transport};
//! let net = MemoryNetwork::new();
//! let a = net.add_node();
//! let b = net.add_node();
//! net.connect(&a.local_id(), &b.local_id());
//! assert_eq!(a.addresses(&b.local_id()), vec![net.address_of(&b.local_id()).unwrap()]);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::peer::PeerId;
use crate::substrate::{
    AddressBook, BoxedStream, Gossip, GossipMessage, GossipStream, GossipTopic, InboundStream,
    ProviderRecord, ProviderStream, Routing, StreamHandler, Transport,
};
use crate::{Error, Result};

const STREAM_BUFFER: usize = 64 * 1024;
const TOPIC_CAPACITY: usize = 256;

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    nodes: HashMap<PeerId, NodeState>,
    providers: HashMap<String, BTreeSet<PeerId>>,
    topics: HashMap<String, broadcast::Sender<GossipMessage>>,
}

struct NodeState {
    address: String,
    book: HashMap<PeerId, Vec<String>>,
    handlers: HashMap<String, StreamHandler>,
    closed: bool,
}

impl NetworkState {
    fn node(&self, id: &PeerId) -> Result<&NodeState> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::connection(format!("unknown node {}", id.fmt_short())))
    }

    fn learn(&mut self, node: &PeerId, peer: &PeerId) {
        let Some(address) = self.nodes.get(peer).map(|n| n.address.clone()) else {
            return;
        };
        if let Some(state) = self.nodes.get_mut(node) {
            let known = state.book.entry(*peer).or_default();
            if !known.contains(&address) {
                known.insert(0, address);
            }
        }
    }
}

/// Shared in-process overlay.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.lock().nodes.len())
            .finish()
    }
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node. Identities increase with creation order.
    pub fn add_node(&self) -> MemoryTransport {
        let mut state = self.lock();
        state.next_id += 1;
        let n = state.next_id;
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        let id = PeerId::from_bytes(bytes);
        state.nodes.insert(
            id,
            NodeState {
                address: format!("/memory/{n}"),
                book: HashMap::new(),
                handlers: HashMap::new(),
                closed: false,
            },
        );
        trace!(node = %id.fmt_short(), "memory node added");
        MemoryTransport {
            id,
            net: self.clone(),
        }
    }

    /// The listening address of `node`.
    pub fn address_of(&self, node: &PeerId) -> Option<String> {
        self.lock().nodes.get(node).map(|n| n.address.clone())
    }

    /// Let `a` and `b` learn each other's address.
    pub fn connect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        state.learn(a, b);
        state.learn(b, a);
    }

    /// Add `addresses` for `peer` to `node`'s address book, ahead of known ones.
    pub fn add_addresses(&self, node: &PeerId, peer: &PeerId, addresses: &[String]) {
        let mut state = self.lock();
        if let Some(state) = state.nodes.get_mut(node) {
            let known = state.book.entry(*peer).or_default();
            for address in addresses.iter().rev() {
                if !known.contains(address) {
                    known.insert(0, address.clone());
                }
            }
        }
    }

    /// Routing substrate acting for `node`.
    pub fn routing(&self, node: &PeerId) -> MemoryRouting {
        MemoryRouting {
            id: *node,
            net: self.clone(),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Gossip substrate acting for `node`.
    pub fn gossip(&self, node: &PeerId) -> MemoryGossip {
        MemoryGossip {
            id: *node,
            net: self.clone(),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Transport of one in-process node.
#[derive(Clone)]
pub struct MemoryTransport {
    id: PeerId,
    net: MemoryNetwork,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .finish()
    }
}

impl MemoryTransport {
    /// The network this node belongs to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.net
    }
}

impl AddressBook for MemoryTransport {
    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        self.net
            .lock()
            .nodes
            .get(&self.id)
            .and_then(|n| n.book.get(peer).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream> {
        let handler = {
            let mut state = self.net.lock();
            let me = state.node(&self.id)?;
            if me.closed {
                return Err(Error::connection("transport closed"));
            }
            let known = me.book.get(peer).cloned().unwrap_or_default();
            let target = state.node(peer)?;
            if !known.contains(&target.address) {
                return Err(Error::connection(format!(
                    "no route to {}",
                    peer.fmt_short()
                )));
            }
            if target.closed {
                return Err(Error::connection(format!(
                    "{} is not accepting streams",
                    peer.fmt_short()
                )));
            }
            let handler = target.handlers.get(protocol).cloned().ok_or_else(|| {
                Error::connection(format!(
                    "{} does not speak {protocol}",
                    peer.fmt_short()
                ))
            })?;
            // accepting side learns the dialer's address
            state.learn(peer, &self.id);
            handler
        };

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        handler(InboundStream {
            remote: self.id,
            protocol: protocol.to_string(),
            stream: Box::new(remote),
        });
        Ok(Box::new(local))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        if let Some(node) = self.net.lock().nodes.get_mut(&self.id) {
            node.handlers.insert(protocol.to_string(), handler);
        }
    }

    fn add_addresses(&self, peer: &PeerId, addresses: &[String]) {
        if *peer != self.id {
            self.net.add_addresses(&self.id, peer, addresses);
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(node) = self.net.lock().nodes.get_mut(&self.id) {
            node.closed = true;
            node.handlers.clear();
        }
        Ok(())
    }
}

/// Provider table view of one node.
#[derive(Clone)]
pub struct MemoryRouting {
    id: PeerId,
    net: MemoryNetwork,
    failing: Arc<AtomicBool>,
}

impl MemoryRouting {
    /// Make every call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::routing("routing unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Routing for MemoryRouting {
    async fn advertise(&self, topic: &str) -> Result<()> {
        self.check()?;
        self.net
            .lock()
            .providers
            .entry(topic.to_string())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn find_providers(&self, topic: &str) -> Result<ProviderStream> {
        self.check()?;
        let mut state = self.net.lock();
        let providers: Vec<PeerId> = state
            .providers
            .get(topic)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(providers.len());
        for peer in providers {
            let Some(address) = state.nodes.get(&peer).map(|n| n.address.clone()) else {
                continue;
            };
            if peer != self.id {
                state.learn(&self.id, &peer);
            }
            records.push(ProviderRecord {
                peer,
                addresses: vec![address],
            });
        }
        Ok(futures_util::stream::iter(records).boxed())
    }
}

/// Gossip hub view of one node.
#[derive(Clone)]
pub struct MemoryGossip {
    id: PeerId,
    net: MemoryNetwork,
    failing: Arc<AtomicBool>,
}

impl MemoryGossip {
    /// Make `join` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gossip for MemoryGossip {
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::gossip(format!("cannot join {topic}")));
        }
        let sender = self
            .net
            .lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        Ok(Arc::new(MemoryTopic {
            origin: self.id,
            sender,
        }))
    }
}

struct MemoryTopic {
    origin: PeerId,
    sender: broadcast::Sender<GossipMessage>,
}

#[async_trait]
impl GossipTopic for MemoryTopic {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        // no subscribers is not an error
        let _ = self.sender.send(GossipMessage {
            payload,
            origin: self.origin,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<GossipStream> {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|msg| futures_util::future::ready(msg.ok()));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn identities_follow_creation_order() {
        let net = MemoryNetwork::new();
        let a = net.add_node().local_id();
        let b = net.add_node().local_id();
        assert!(a < b);
        assert_eq!(net.address_of(&a).as_deref(), Some("/memory/1"));
    }

    #[tokio::test]
    async fn streams_need_a_known_address_and_a_handler() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();

        let Err(err) = a.open_stream(&b.local_id(), "/echo").await else {
            panic!("dial without a known address succeeded");
        };
        assert!(matches!(err, Error::Connection(_)));

        net.connect(&a.local_id(), &b.local_id());
        assert!(a.open_stream(&b.local_id(), "/echo").await.is_err());

        b.set_stream_handler(
            "/echo",
            Arc::new(|inbound: InboundStream| {
                tokio::spawn(async move {
                    let mut stream = inbound.stream;
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                });
            }),
        );
        let mut stream = a.open_stream(&b.local_id(), "/echo").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn lookup_teaches_addresses() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        net.routing(&b.local_id()).advertise("svc").await.unwrap();

        let found: Vec<_> = net
            .routing(&a.local_id())
            .find_providers("svc")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer, b.local_id());
        assert_eq!(a.addresses(&b.local_id()), found[0].addresses);
    }

    #[tokio::test]
    async fn failing_routing_errors() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let routing = net.routing(&a.local_id());
        routing.set_failing(true);
        assert!(routing.advertise("svc").await.is_err());
        assert!(routing.find_providers("svc").await.is_err());
    }

    #[tokio::test]
    async fn gossip_reaches_every_subscriber() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        let topic_a = net.gossip(&a.local_id()).join("svc").await.unwrap();
        let topic_b = net.gossip(&b.local_id()).join("svc").await.unwrap();

        let mut sub = topic_b.subscribe().await.unwrap();
        topic_a.publish(Bytes::from_static(b"hello")).await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        assert_eq!(msg.origin, a.local_id());
    }

    #[tokio::test]
    async fn closed_transport_refuses_streams() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        net.connect(&a.local_id(), &b.local_id());
        b.set_stream_handler("/p", Arc::new(|_inbound: InboundStream| {}));

        b.close().await.unwrap();
        assert!(a.open_stream(&b.local_id(), "/p").await.is_err());
    }
}
