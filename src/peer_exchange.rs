//! Peer exchange: lets remote peers pull a topic's directory page by page.
//!
//! Served on [`PEER_EXCHANGE_PROTOCOL`]. Two methods:
//! - `FetchPeerList`: a page of the live directory for a topic, sorted by identity
//! - `CheckService`: whether this node has the topic registered

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tonic::Status;
use tracing::{debug, trace, warn};

use crate::coordinator::ServiceDiscovery;
use crate::peer::PeerId;
use crate::registry::ServiceHandler;
use crate::rpc::{RpcPeer, RpcRequest, RpcService};
use crate::{Error, Result};

/// Protocol id of the peer-exchange service.
pub const PEER_EXCHANGE_PROTOCOL: &str = "/peer-exchange/1.0.1";

/// Largest page a single `FetchPeerList` call returns.
pub const MAX_PAGE_SIZE: i32 = 1024;

/// Most entries [`PeerExchangeClient::fetch_all`] collects from one peer.
pub const MAX_EXCHANGE_ENTRIES: usize = 16 * MAX_PAGE_SIZE as usize;

/// Method names.
pub mod method {
    /// Paginated directory fetch.
    pub const FETCH_PEER_LIST: &str = "FetchPeerList";
    /// Topic registration check.
    pub const CHECK_SERVICE: &str = "CheckService";
}

/// `FetchPeerList` request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchPeerListRequest {
    /// Topic whose directory to page through.
    #[prost(string, tag = "1")]
    pub topic: String,
    /// Zero-based page index.
    #[prost(int32, tag = "2")]
    pub page: i32,
    /// Entries per page; capped at [`MAX_PAGE_SIZE`].
    #[prost(int32, tag = "3")]
    pub page_size: i32,
}

/// One directory entry on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerListEntry {
    /// Raw peer identity.
    #[prost(bytes = "vec", tag = "1")]
    pub identity: Vec<u8>,
    /// Addresses, best first.
    #[prost(string, repeated, tag = "2")]
    pub addresses: Vec<String>,
    /// Nanoseconds since the serving node last saw the peer.
    #[prost(int64, tag = "3")]
    pub last_seen_ago: i64,
}

impl PeerListEntry {
    /// The entry's identity, if well formed.
    pub fn peer(&self) -> Option<PeerId> {
        PeerId::try_from_slice(&self.identity).ok()
    }

    /// Age of the entry as reported by the serving node.
    pub fn last_seen_ago(&self) -> Duration {
        Duration::from_nanos(self.last_seen_ago.max(0) as u64)
    }
}

/// `FetchPeerList` response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FetchPeerListResponse {
    /// The requested page, possibly empty.
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<PeerListEntry>,
}

/// `CheckService` request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckServiceRequest {
    /// Topic to check.
    #[prost(string, tag = "1")]
    pub topic: String,
}

/// `CheckService` response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckServiceResponse {
    /// Whether the topic is registered on the serving node.
    #[prost(bool, tag = "1")]
    pub provides_service: bool,
}

/// Server side of the peer-exchange protocol.
#[derive(Clone)]
pub struct PeerExchangeService {
    discovery: ServiceDiscovery,
}

impl PeerExchangeService {
    /// Serve directories from `discovery`.
    pub fn new(discovery: ServiceDiscovery) -> Self {
        Self { discovery }
    }

    /// Answer a `FetchPeerList` call evaluated at `now`.
    pub fn fetch_peer_list(
        &self,
        request: &FetchPeerListRequest,
        now: SystemTime,
    ) -> std::result::Result<FetchPeerListResponse, Status> {
        if request.page < 0 {
            return Err(Status::invalid_argument("page must not be negative"));
        }
        if request.page_size <= 0 {
            return Err(Status::invalid_argument("page_size must be positive"));
        }

        let records = match self.discovery.find_peers_at(&request.topic, now) {
            Ok(records) => records,
            Err(Error::UnknownService(topic)) => {
                return Err(Status::not_found(format!("service not found: {topic}")))
            }
            Err(e) => return Err(Status::internal(e.to_string())),
        };

        let page_size = request.page_size.min(MAX_PAGE_SIZE) as usize;
        let start = (request.page as usize).saturating_mul(page_size);
        let entries = records
            .into_iter()
            .skip(start)
            .take(page_size)
            .map(|record| PeerListEntry {
                identity: record.peer.as_bytes().to_vec(),
                last_seen_ago: i64::try_from(record.age(now).as_nanos()).unwrap_or(i64::MAX),
                addresses: record.addresses,
            })
            .collect();

        Ok(FetchPeerListResponse { entries })
    }

    /// Answer a `CheckService` call.
    pub fn check_service(&self, request: &CheckServiceRequest) -> CheckServiceResponse {
        CheckServiceResponse {
            provides_service: self.discovery.is_registered(&request.topic),
        }
    }
}

#[async_trait]
impl RpcService for PeerExchangeService {
    async fn call(&self, request: RpcRequest) -> std::result::Result<Bytes, Status> {
        trace!(method = %request.method, remote = %request.remote.fmt_short(), "peer exchange call");
        match request.method.as_str() {
            method::FETCH_PEER_LIST => {
                let req: FetchPeerListRequest = request.decode()?;
                let resp = self.fetch_peer_list(&req, SystemTime::now())?;
                Ok(Bytes::from(resp.encode_to_vec()))
            }
            method::CHECK_SERVICE => {
                let req: CheckServiceRequest = request.decode()?;
                Ok(Bytes::from(self.check_service(&req).encode_to_vec()))
            }
            other => Err(Status::unimplemented(format!(
                "unknown peer exchange method: {other}"
            ))),
        }
    }
}

impl ServiceHandler for PeerExchangeService {
    fn protocol(&self) -> &str {
        PEER_EXCHANGE_PROTOCOL
    }
}

/// Client side of the peer-exchange protocol.
#[derive(Debug, Clone)]
pub struct PeerExchangeClient {
    session: RpcPeer,
}

impl PeerExchangeClient {
    /// Wrap an established session.
    pub fn new(session: RpcPeer) -> Self {
        Self { session }
    }

    /// The underlying session.
    pub fn session(&self) -> &RpcPeer {
        &self.session
    }

    /// Fetch one page of the remote directory for `topic`.
    pub async fn fetch_peer_list(
        &self,
        topic: &str,
        page: i32,
        page_size: i32,
    ) -> Result<Vec<PeerListEntry>> {
        let request = FetchPeerListRequest {
            topic: topic.to_string(),
            page,
            page_size,
        };
        let response: FetchPeerListResponse = self
            .session
            .unary(method::FETCH_PEER_LIST, &request)
            .await?;
        Ok(response.entries)
    }

    /// Fetch every page of the remote directory for `topic`.
    ///
    /// Stops at the first short page, when the remote serves the same page
    /// twice in a row, or after [`MAX_EXCHANGE_ENTRIES`] entries.
    pub async fn fetch_all(&self, topic: &str, page_size: i32) -> Result<Vec<PeerListEntry>> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut entries: Vec<PeerListEntry> = Vec::new();
        let mut previous_head: Option<Vec<u8>> = None;
        let mut page: i32 = 0;
        loop {
            let mut batch = self.fetch_peer_list(topic, page, page_size).await?;
            batch.truncate(page_size as usize);
            let full = batch.len() == page_size as usize;

            let head = batch.first().map(|e| e.identity.clone());
            if head.is_some() && head == previous_head {
                debug!(%topic, page, "remote repeated a page");
                return Ok(entries);
            }

            let room = MAX_EXCHANGE_ENTRIES - entries.len();
            if batch.len() >= room {
                batch.truncate(room);
                entries.extend(batch);
                if full {
                    warn!(%topic, limit = MAX_EXCHANGE_ENTRIES, "peer list truncated");
                }
                return Ok(entries);
            }
            entries.extend(batch);

            if !full {
                return Ok(entries);
            }
            let Some(next) = page.checked_add(1) else {
                return Ok(entries);
            };
            page = next;
            previous_head = head;
        }
    }

    /// Whether the remote node has `topic` registered.
    pub async fn check_service(&self, topic: &str) -> Result<bool> {
        let response: CheckServiceResponse = self
            .session
            .unary(
                method::CHECK_SERVICE,
                &CheckServiceRequest {
                    topic: topic.to_string(),
                },
            )
            .await?;
        Ok(response.provides_service)
    }
}
