//! [`Routing`](crate::Routing) over the mainline DHT.
//!
//! Every provider of a topic derives the same signing key from the topic name
//! and the current unix minute, so all of them write to one shared mutable
//! item per minute slot. The item holds a bounded [`ProviderSet`]; each
//! publisher reads it, replaces its own entry and writes it back with
//! compare-and-swap on the sequence number. Lookups read the current and the
//! previous slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use iroh::Endpoint;
use mainline::{Dht, MutableItem, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use super::transport::addr_strings;
use crate::peer::PeerId;
use crate::substrate::{ProviderRecord, ProviderStream, Routing};
use crate::{Error, Result};

/// Most entries kept in one slot; mainline values are limited to 1000 bytes.
pub const MAX_PROVIDERS: usize = 8;
/// Most addresses kept per entry.
pub const MAX_ADDRS: usize = 2;

/// Derive the shared signing key for `topic` in `unix_minute`.
pub fn derive_signing_key(topic: &str, unix_minute: u64) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(b"iroh-service-discovery:v1:");
    hasher.update(topic.as_bytes());
    hasher.update(unix_minute.to_le_bytes());
    SigningKey::from_bytes(&hasher.finalize().into())
}

/// Derive the mutable-item salt for `topic` in `unix_minute`.
pub fn derive_salt(topic: &str, unix_minute: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"iroh-service-discovery:salt:v1:");
    hasher.update(topic.as_bytes());
    hasher.update(unix_minute.to_le_bytes());
    hasher.finalize().to_vec()
}

/// Current unix minute shifted by `offset` minutes.
pub fn unix_minute(offset: i64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((now / 60) as i64 + offset) as u64
}

/// One provider in a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Raw node id.
    pub node_id: [u8; 32],
    /// Direct addresses and relay URL, best first.
    pub addrs: Vec<String>,
    /// Unix seconds at which the entry was written.
    pub published_at: u64,
}

/// Postcard-encoded value of a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSet {
    /// Providers, most recent first.
    pub providers: Vec<ProviderEntry>,
}

impl ProviderSet {
    /// Replace `own`'s entry, keeping the most recent [`MAX_PROVIDERS`].
    pub fn merge(mut self, mut own: ProviderEntry) -> Self {
        own.addrs.truncate(MAX_ADDRS);
        self.providers.retain(|p| p.node_id != own.node_id);
        self.providers.push(own);
        self.providers
            .sort_by(|a, b| b.published_at.cmp(&a.published_at));
        self.providers.truncate(MAX_PROVIDERS);
        self
    }
}

/// Configuration for [`MainlineRouting`].
#[derive(Debug, Clone)]
pub struct MainlineConfig {
    /// How often advertised topics are written to the current slot.
    pub publish_interval: Duration,
}

impl Default for MainlineConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(30),
        }
    }
}

struct Shared {
    dht: Arc<Dht>,
    endpoint: Endpoint,
    topics: RwLock<BTreeSet<String>>,
}

/// Routing substrate publishing provider sets to the mainline DHT.
#[derive(Clone)]
pub struct MainlineRouting {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MainlineRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainlineRouting").finish_non_exhaustive()
    }
}

impl MainlineRouting {
    /// Start a DHT client and the background republisher.
    pub fn new(endpoint: Endpoint, config: MainlineConfig) -> Result<Self> {
        let dht = Dht::client().map_err(|e| Error::routing(format!("DHT client: {e}")))?;
        Ok(Self::with_dht(endpoint, Arc::new(dht), config))
    }

    /// Use an existing DHT client.
    pub fn with_dht(endpoint: Endpoint, dht: Arc<Dht>, config: MainlineConfig) -> Self {
        let shared = Arc::new(Shared {
            dht,
            endpoint,
            topics: RwLock::new(BTreeSet::new()),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(
            republish(Arc::clone(&shared), config, cancel.clone())
                .instrument(tracing::debug_span!("dht_publisher")),
        );
        Self { shared, cancel }
    }

    /// The DHT client.
    pub fn dht(&self) -> &Arc<Dht> {
        &self.shared.dht
    }
}

async fn republish(shared: Arc<Shared>, config: MainlineConfig, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(config.publish_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("DHT publisher shutting down");
                break;
            }
            _ = interval.tick() => {
                let topics: Vec<String> = shared
                    .topics
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect();
                for topic in topics {
                    if let Err(e) = publish(&shared, &topic).await {
                        warn!(%topic, error = %e, "failed to republish provider record");
                    }
                }
            }
        }
    }
}

async fn publish(shared: &Shared, topic: &str) -> Result<()> {
    let minute = unix_minute(0);
    let addr = shared
        .endpoint
        .node_addr()
        .await
        .map_err(|e| Error::routing(format!("local address: {e}")))?;
    let own = ProviderEntry {
        node_id: *shared.endpoint.node_id().as_bytes(),
        addrs: addr_strings(&addr),
        published_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };

    let signing_key = derive_signing_key(topic, minute);
    let salt = derive_salt(topic, minute);
    let public_key = signing_key.verifying_key().to_bytes();

    let dht = Arc::clone(&shared.dht);
    let lookup_salt = salt.clone();
    let current = tokio::task::spawn_blocking(move || {
        dht.get_mutable_most_recent(&public_key, Some(&lookup_salt))
    })
    .await
    .map_err(|e| Error::routing(format!("DHT lookup task: {e}")))?;

    let (existing, cas) = match current {
        Some(item) => (
            postcard::from_bytes::<ProviderSet>(item.value()).unwrap_or_default(),
            Some(item.seq()),
        ),
        None => (ProviderSet::default(), None),
    };
    let set = existing.merge(own);
    let value =
        postcard::to_allocvec(&set).map_err(|e| Error::routing(format!("encode record: {e}")))?;
    let seq = cas.map_or(0, |s| s + 1);
    let item = MutableItem::new(signing_key, &value, seq, Some(&salt));

    let dht = Arc::clone(&shared.dht);
    tokio::task::spawn_blocking(move || dht.put_mutable(item, cas))
        .await
        .map_err(|e| Error::routing(format!("DHT publish task: {e}")))?
        .map_err(|e| Error::routing(format!("publish {topic}: {e}")))?;
    debug!(%topic, minute, seq, providers = set.providers.len(), "published provider record");
    Ok(())
}

async fn query_minute(dht: &Arc<Dht>, topic: &str, minute: u64) -> Option<ProviderSet> {
    let public_key = derive_signing_key(topic, minute).verifying_key().to_bytes();
    let salt = derive_salt(topic, minute);
    let dht = Arc::clone(dht);

    let item = tokio::task::spawn_blocking(move || {
        dht.get_mutable_most_recent(&public_key, Some(&salt))
    })
    .await
    .ok()
    .flatten()?;

    match postcard::from_bytes::<ProviderSet>(item.value()) {
        Ok(set) => Some(set),
        Err(e) => {
            warn!(%topic, minute, error = %e, "failed to deserialize provider record");
            None
        }
    }
}

#[async_trait]
impl Routing for MainlineRouting {
    async fn advertise(&self, topic: &str) -> Result<()> {
        self.shared
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        publish(&self.shared, topic).await
    }

    async fn find_providers(&self, topic: &str) -> Result<ProviderStream> {
        let mut newest: HashMap<[u8; 32], ProviderEntry> = HashMap::new();
        for offset in [0, -1] {
            let minute = unix_minute(offset);
            let Some(set) = query_minute(&self.shared.dht, topic, minute).await else {
                trace!(%topic, minute, "no provider record");
                continue;
            };
            for entry in set.providers {
                match newest.get(&entry.node_id) {
                    Some(known) if known.published_at >= entry.published_at => {}
                    _ => {
                        newest.insert(entry.node_id, entry);
                    }
                }
            }
        }

        let records: Vec<ProviderRecord> = newest
            .into_values()
            .map(|entry| ProviderRecord {
                peer: PeerId::from_bytes(entry.node_id),
                addresses: entry.addrs,
            })
            .collect();
        Ok(futures_util::StreamExt::boxed(futures_util::stream::iter(
            records,
        )))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}
