//! [`Transport`] over an iroh endpoint.
//!
//! Every protocol id is negotiated as its own ALPN. The endpoint's ALPN list
//! follows the set of bound handlers; connections for the gossip ALPN are
//! forwarded to the attached iroh-gossip instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::{Endpoint, NodeAddr, NodeId, RelayUrl};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use super::stream::{IrohStream, IrohStreamInfo};
use crate::alpn::{alpn_to_protocol, protocol_to_alpn};
use crate::peer::PeerId;
use crate::substrate::{AddressBook, BoxedStream, InboundStream, StreamHandler, Transport};
use crate::{Error, Result};

pub(crate) fn node_id(peer: &PeerId) -> Result<NodeId> {
    NodeId::from_bytes(peer.as_bytes())
        .map_err(|e| Error::connection(format!("invalid node id {}: {e}", peer.fmt_short())))
}

pub(crate) fn peer_id(node: &NodeId) -> PeerId {
    PeerId::from_bytes(*node.as_bytes())
}

/// Render a node address as address strings: direct addresses, then the relay.
pub(crate) fn addr_strings(addr: &NodeAddr) -> Vec<String> {
    let mut out: Vec<String> = addr.direct_addresses().map(|a| a.to_string()).collect();
    if let Some(relay) = addr.relay_url() {
        out.push(relay.to_string());
    }
    out
}

struct Inner {
    endpoint: Endpoint,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    connections: Mutex<HashMap<(PeerId, String), Connection>>,
    gossip: RwLock<Option<Gossip>>,
    cancel: CancellationToken,
}

impl Inner {
    fn refresh_alpns(&self) {
        let mut alpns: Vec<Vec<u8>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|p| protocol_to_alpn(p))
            .collect();
        if self
            .gossip
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            alpns.push(GOSSIP_ALPN.to_vec());
        }
        if let Err(e) = self.endpoint.set_alpns(alpns) {
            warn!(error = %e, "failed to update endpoint ALPNs");
        }
    }

    fn handler(&self, protocol: &str) -> Option<StreamHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }
}

/// Transport backed by an iroh [`Endpoint`].
#[derive(Clone)]
pub struct IrohTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("node_id", &self.inner.endpoint.node_id())
            .finish_non_exhaustive()
    }
}

impl IrohTransport {
    /// Take over accepting connections on `endpoint`. Must be called within a
    /// tokio runtime.
    pub fn new(endpoint: Endpoint) -> Self {
        let inner = Arc::new(Inner {
            endpoint,
            handlers: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            gossip: RwLock::new(None),
            cancel: CancellationToken::new(),
        });
        let span = tracing::debug_span!("iroh_accept", node = %inner.endpoint.node_id().fmt_short());
        tokio::spawn(accept_loop(Arc::clone(&inner)).instrument(span));
        Self { inner }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Forward gossip connections to `gossip`.
    pub fn attach_gossip(&self, gossip: Gossip) {
        *self
            .inner
            .gossip
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(gossip);
        self.inner.refresh_alpns();
    }

    async fn connection(&self, peer: &PeerId, protocol: &str) -> Result<Connection> {
        let key = (*peer, protocol.to_string());
        let cached = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(conn) = cached {
            if conn.close_reason().is_none() {
                return Ok(conn);
            }
        }

        let addr = NodeAddr::new(node_id(peer)?);
        let conn = self
            .inner
            .endpoint
            .connect(addr, &protocol_to_alpn(protocol))
            .await
            .map_err(|e| Error::connection(format!("connect to {}: {e}", peer.fmt_short())))?;
        debug!(peer = %peer.fmt_short(), %protocol, "connected");
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, conn.clone());
        Ok(conn)
    }
}

impl AddressBook for IrohTransport {
    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        let Ok(node) = node_id(peer) else {
            return Vec::new();
        };
        let Some(info) = self.inner.endpoint.remote_info(node) else {
            return Vec::new();
        };
        let mut out: Vec<String> = info.addrs.iter().map(|a| a.addr.to_string()).collect();
        if let Some(relay) = info.relay_url {
            out.push(relay.relay_url.to_string());
        }
        out
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn local_id(&self) -> PeerId {
        peer_id(&self.inner.endpoint.node_id())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream> {
        let conn = self.connection(peer, protocol).await?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| Error::connection(format!("open stream to {}: {e}", peer.fmt_short())))?;
        Ok(Box::new(IrohStream::new(
            send,
            recv,
            IrohStreamInfo {
                remote: *peer,
                protocol: protocol.to_string(),
                established_at: Instant::now(),
            },
        )))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
        self.inner.refresh_alpns();
    }

    fn add_addresses(&self, peer: &PeerId, addresses: &[String]) {
        let Ok(node) = node_id(peer) else {
            return;
        };
        let mut addr = NodeAddr::new(node);
        let direct: Vec<SocketAddr> = addresses.iter().filter_map(|a| a.parse().ok()).collect();
        if !direct.is_empty() {
            addr = addr.with_direct_addresses(direct);
        }
        if let Some(relay) = addresses.iter().find_map(|a| a.parse::<RelayUrl>().ok()) {
            addr = addr.with_relay_url(relay);
        }
        if let Err(e) = self.inner.endpoint.add_node_addr(addr) {
            trace!(peer = %peer.fmt_short(), error = %e, "ignoring address hint");
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner.endpoint.close().await;
        info!("iroh transport closed");
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>) {
    loop {
        let incoming = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            incoming = inner.endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            debug!("endpoint closed");
            break;
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "incoming connection failed");
                    return;
                }
            };
            handle_connection(inner, conn).await;
        });
    }
}

async fn handle_connection(inner: Arc<Inner>, conn: Connection) {
    let Some(alpn) = conn.alpn() else {
        debug!("connection without ALPN");
        return;
    };

    if alpn.as_slice() == GOSSIP_ALPN {
        let gossip = inner
            .gossip
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gossip) = gossip {
            if let Err(e) = gossip.handle_connection(conn).await {
                debug!(error = %e, "gossip connection ended");
            }
        }
        return;
    }

    let Some(protocol) = alpn_to_protocol(&alpn).map(str::to_string) else {
        debug!("connection with non-UTF-8 ALPN");
        return;
    };
    let remote = match conn.remote_node_id() {
        Ok(node) => peer_id(&node),
        Err(e) => {
            debug!(error = %e, "cannot identify remote node");
            return;
        }
    };
    debug!(remote = %remote.fmt_short(), %protocol, "accepted connection");

    loop {
        let (send, recv) = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            res = conn.accept_bi() => match res {
                Ok(streams) => streams,
                Err(_) => {
                    debug!(remote = %remote.fmt_short(), %protocol, "connection closed");
                    break;
                }
            },
        };
        let Some(handler) = inner.handler(&protocol) else {
            debug!(%protocol, "no handler bound, dropping stream");
            continue;
        };
        handler(InboundStream {
            remote,
            protocol: protocol.clone(),
            stream: Box::new(IrohStream::new(
                send,
                recv,
                IrohStreamInfo {
                    remote,
                    protocol: protocol.clone(),
                    established_at: Instant::now(),
                },
            )),
        });
    }
}
