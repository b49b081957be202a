//! [`Gossip`](crate::Gossip) over iroh-gossip.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use iroh::NodeId;
use iroh_gossip::net::{Event, GossipEvent, GossipReceiver, GossipSender};
use iroh_gossip::proto::TopicId;
use tokio::sync::Mutex;
use tracing::{trace, Instrument};

use super::transport::peer_id;
use crate::substrate::{GossipMessage, GossipStream, GossipTopic};
use crate::{Error, Result};

/// Derive a [`TopicId`] from a discovery topic name.
pub fn topic_id(topic: &str) -> TopicId {
    let path = format!("iroh-service-discovery/{topic}");
    TopicId::from(*blake3::hash(path.as_bytes()).as_bytes())
}

/// Gossip substrate backed by an iroh-gossip instance.
#[derive(Clone, Debug)]
pub struct IrohGossip {
    gossip: iroh_gossip::net::Gossip,
    bootstrap: Vec<NodeId>,
}

impl IrohGossip {
    /// Wrap `gossip`; topics are joined through `bootstrap` peers.
    pub fn new(gossip: iroh_gossip::net::Gossip, bootstrap: Vec<NodeId>) -> Self {
        Self { gossip, bootstrap }
    }

    /// The underlying gossip instance.
    pub fn inner(&self) -> &iroh_gossip::net::Gossip {
        &self.gossip
    }
}

#[async_trait]
impl crate::substrate::Gossip for IrohGossip {
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>> {
        let id = topic_id(topic);
        let handle = self
            .gossip
            .subscribe(id, self.bootstrap.clone())
            .map_err(|e| Error::gossip(format!("join {topic}: {e}")))?;
        let (sender, receiver) = handle.split();
        trace!(%topic, bootstrap = self.bootstrap.len(), "joined gossip topic");
        Ok(Arc::new(IrohTopic {
            gossip: self.gossip.clone(),
            id,
            bootstrap: self.bootstrap.clone(),
            sender,
            first: Mutex::new(Some(receiver)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.gossip
            .shutdown()
            .await
            .map_err(|e| Error::gossip(format!("shutdown: {e}")))
    }
}

struct IrohTopic {
    gossip: iroh_gossip::net::Gossip,
    id: TopicId,
    bootstrap: Vec<NodeId>,
    sender: GossipSender,
    first: Mutex<Option<GossipReceiver>>,
}

#[async_trait]
impl GossipTopic for IrohTopic {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        let span = tracing::trace_span!("gossip_broadcast", bytes = payload.len());
        self.sender
            .broadcast(payload)
            .instrument(span)
            .await
            .map_err(|e| Error::gossip(format!("broadcast: {e}")))
    }

    async fn subscribe(&self) -> Result<GossipStream> {
        let receiver = match self.first.lock().await.take() {
            Some(receiver) => receiver,
            None => {
                let (_, receiver) = self
                    .gossip
                    .subscribe(self.id, self.bootstrap.clone())
                    .map_err(|e| Error::gossip(format!("resubscribe: {e}")))?
                    .split();
                receiver
            }
        };

        let stream = receiver.filter_map(|event| async move {
            match event {
                Ok(Event::Gossip(GossipEvent::Received(msg))) => Some(GossipMessage {
                    payload: msg.content,
                    origin: peer_id(&msg.delivered_from),
                }),
                Ok(Event::Gossip(ev)) => {
                    trace!(?ev, "gossip neighbor event");
                    None
                }
                Ok(Event::Lagged) => {
                    trace!("gossip receiver lagged");
                    None
                }
                Err(e) => {
                    trace!(error = %e, "gossip receive error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
