//! Per-topic peer directory with read-time TTL filtering.
//!
//! Records are replaced wholesale and only by observations that are not older
//! than the stored one. Nothing is evicted: stale records are filtered out of
//! query results and stay around until a fresher observation overwrites them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use crate::peer::PeerId;
use crate::substrate::AddressBook;

/// Last known contact information for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// The peer.
    pub peer: PeerId,
    /// Addresses, best known first.
    pub addresses: Vec<String>,
    /// When the peer was last observed providing the topic.
    pub last_seen: SystemTime,
}

impl PeerRecord {
    /// Age of the record at `now`. Records from the future have age zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or_default()
    }

    /// Whether the record is younger than `ttl` at `now`.
    pub fn is_live(&self, ttl: Duration, now: SystemTime) -> bool {
        self.age(now) < ttl
    }
}

/// Result of [`PeerDirectory::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First record for the peer.
    Inserted,
    /// An existing record was replaced.
    Updated,
    /// The observation matched the stored record exactly.
    Unchanged,
    /// The observation was older than the stored record and was dropped.
    Stale,
    /// The observation was about the local node and was dropped.
    SelfIgnored,
}

impl Upsert {
    /// Whether the directory content changed.
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Peers observed providing one topic.
#[derive(Debug)]
pub struct PeerDirectory {
    topic: String,
    local: PeerId,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerDirectory {
    /// Create an empty directory for `topic` owned by the node `local`.
    pub fn new(topic: impl Into<String>, local: PeerId) -> Self {
        Self {
            topic: topic.into(),
            local,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// The topic this directory tracks.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record an observation of `peer`.
    pub fn upsert(&self, peer: PeerId, addresses: Vec<String>, seen_at: SystemTime) -> Upsert {
        if peer == self.local {
            return Upsert::SelfIgnored;
        }

        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        match peers.get_mut(&peer) {
            Some(existing) if seen_at < existing.last_seen => Upsert::Stale,
            Some(existing) if existing.last_seen == seen_at && existing.addresses == addresses => {
                Upsert::Unchanged
            }
            Some(existing) => {
                existing.addresses = addresses;
                existing.last_seen = seen_at;
                Upsert::Updated
            }
            None => {
                peers.insert(
                    peer,
                    PeerRecord {
                        peer,
                        addresses,
                        last_seen: seen_at,
                    },
                );
                Upsert::Inserted
            }
        }
    }

    /// Live records at `now`, sorted by peer identity.
    ///
    /// Addresses come from `book` when it knows the peer, otherwise from the
    /// stored record.
    pub fn query<B>(&self, ttl: Duration, now: SystemTime, book: &B) -> Vec<PeerRecord>
    where
        B: AddressBook + ?Sized,
    {
        let mut live: Vec<PeerRecord> = {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            peers
                .values()
                .filter(|record| record.is_live(ttl, now))
                .cloned()
                .collect()
        };

        for record in live.iter_mut() {
            let known = book.addresses(&record.peer);
            if !known.is_empty() {
                record.addresses = known;
            }
        }

        live.sort_by(|a, b| a.peer.cmp(&b.peer));
        live
    }

    /// The stored record for `peer`, live or not.
    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.get(peer).cloned()
    }

    /// Whether `peer` has a live record at `now`.
    pub fn is_live(&self, peer: &PeerId, ttl: Duration, now: SystemTime) -> bool {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .get(peer)
            .map(|record| record.is_live(ttl, now))
            .unwrap_or(false)
    }

    /// Number of stored records, including stale ones.
    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    struct NoAddresses;
    impl AddressBook for NoAddresses {
        fn addresses(&self, _peer: &PeerId) -> Vec<String> {
            Vec::new()
        }
    }

    struct FixedBook(PeerId, Vec<String>);
    impl AddressBook for FixedBook {
        fn addresses(&self, peer: &PeerId) -> Vec<String> {
            if *peer == self.0 {
                self.1.clone()
            } else {
                Vec::new()
            }
        }
    }

    fn id(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 32])
    }

    fn addrs(a: &str) -> Vec<String> {
        vec![a.to_string()]
    }

    #[test]
    fn upsert_is_idempotent() {
        let dir = PeerDirectory::new("svc", id(0));
        let t = SystemTime::now();
        assert_eq!(dir.upsert(id(1), addrs("/a"), t), Upsert::Inserted);
        let before = dir.get(&id(1));
        assert_eq!(dir.upsert(id(1), addrs("/a"), t), Upsert::Unchanged);
        assert_eq!(dir.get(&id(1)), before);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn older_observation_is_rejected() {
        let dir = PeerDirectory::new("svc", id(0));
        let t1 = SystemTime::now();
        let t2 = t1 - Duration::from_secs(10);
        dir.upsert(id(1), addrs("/new"), t1);
        assert_eq!(dir.upsert(id(1), addrs("/old"), t2), Upsert::Stale);

        let record = dir.get(&id(1)).unwrap();
        assert_eq!(record.addresses, addrs("/new"));
        assert_eq!(record.last_seen, t1);
    }

    #[test]
    fn equal_timestamp_replaces_addresses() {
        let dir = PeerDirectory::new("svc", id(0));
        let t = SystemTime::now();
        dir.upsert(id(1), addrs("/a"), t);
        assert_eq!(dir.upsert(id(1), addrs("/b"), t), Upsert::Updated);
        assert_eq!(dir.get(&id(1)).unwrap().addresses, addrs("/b"));
    }

    #[test]
    fn address_list_is_replaced_wholesale() {
        let dir = PeerDirectory::new("svc", id(0));
        let t = SystemTime::now();
        dir.upsert(id(1), vec!["/a".into(), "/b".into()], t);
        dir.upsert(id(1), addrs("/c"), t + Duration::from_secs(1));
        assert_eq!(dir.get(&id(1)).unwrap().addresses, addrs("/c"));
    }

    #[test]
    fn query_filters_by_ttl() {
        let dir = PeerDirectory::new("svc", id(0));
        let now = SystemTime::now();
        dir.upsert(id(1), addrs("/a"), now - 2 * HOUR);

        assert!(dir.query(HOUR, now, &NoAddresses).is_empty());
        let live = dir.query(3 * HOUR, now, &NoAddresses);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].peer, id(1));

        // filtered, not evicted
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn self_is_never_stored() {
        let dir = PeerDirectory::new("svc", id(7));
        assert_eq!(
            dir.upsert(id(7), addrs("/me"), SystemTime::now()),
            Upsert::SelfIgnored
        );
        assert!(dir.is_empty());
        assert!(dir.get(&id(7)).is_none());
    }

    #[test]
    fn query_is_sorted_and_prefers_address_book() {
        let dir = PeerDirectory::new("svc", id(0));
        let now = SystemTime::now();
        dir.upsert(id(3), addrs("/three"), now);
        dir.upsert(id(1), addrs("/one-stored"), now);
        dir.upsert(id(2), addrs("/two"), now);

        let book = FixedBook(id(1), addrs("/one-fresh"));
        let live = dir.query(HOUR, now, &book);
        let order: Vec<_> = live.iter().map(|r| r.peer).collect();
        assert_eq!(order, vec![id(1), id(2), id(3)]);
        assert_eq!(live[0].addresses, addrs("/one-fresh"));
        assert_eq!(live[1].addresses, addrs("/two"));
    }

    #[test]
    fn future_records_are_live() {
        let dir = PeerDirectory::new("svc", id(0));
        let now = SystemTime::now();
        dir.upsert(id(1), addrs("/a"), now + HOUR);
        assert!(dir.is_live(&id(1), Duration::from_secs(1), now));
        assert!(!dir.is_live(&id(2), HOUR, now));
    }
}
