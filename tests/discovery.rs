use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use iroh_service_discovery::memory::{MemoryGossip, MemoryNetwork, MemoryRouting, MemoryTransport};
use iroh_service_discovery::peer_exchange::{
    FetchPeerListRequest, FetchPeerListResponse, PeerListEntry, MAX_EXCHANGE_ENTRIES,
};
use iroh_service_discovery::{
    DiscoveryConfig, DiscoveryCoordinator, DiscoveryEvent, Error, ProviderStream, Routing,
    RpcRequest, RpcService, ServiceHandler, Transport, PEER_EXCHANGE_PROTOCOL,
};
use prost::Message;
use tonic::Status;

const PERIOD: Duration = Duration::from_secs(1);
const TOPIC: &str = "calculator";

fn config() -> DiscoveryConfig {
    DiscoveryConfig::default()
        .with_discovery_period(PERIOD)
        .with_lookup_timeout(Duration::from_millis(500))
}

struct Node {
    coordinator: DiscoveryCoordinator,
    transport: MemoryTransport,
    gossip: MemoryGossip,
    routing: MemoryRouting,
}

async fn node(net: &MemoryNetwork, config: DiscoveryConfig) -> Node {
    let transport = net.add_node();
    let id = transport.local_id();
    let gossip = net.gossip(&id);
    let routing = net.routing(&id);
    let coordinator = DiscoveryCoordinator::builder(transport.clone())
        .routing(routing.clone())
        .gossip(gossip.clone())
        .config(config)
        .spawn()
        .await
        .unwrap();
    Node {
        coordinator,
        transport,
        gossip,
        routing,
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn providers_discover_each_other_after_one_period() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;
    let y = node(&net, config()).await;
    let x_id = x.coordinator.local_id();
    let y_id = y.coordinator.local_id();

    x.coordinator.register_service(TOPIC).await.unwrap();
    y.coordinator.register_service(TOPIC).await.unwrap();

    // nothing is looked up before the first period elapses
    assert!(x.coordinator.find_peers(TOPIC).unwrap().is_empty());

    tokio::time::sleep(PERIOD + PERIOD / 2).await;

    let seen_by_x = x.coordinator.find_peers(TOPIC).unwrap();
    assert_eq!(seen_by_x.len(), 1);
    assert_eq!(seen_by_x[0].peer, y_id);
    assert_eq!(seen_by_x[0].addresses, vec![net.address_of(&y_id).unwrap()]);

    let seen_by_y = y.coordinator.find_peers(TOPIC).unwrap();
    assert_eq!(seen_by_y.len(), 1);
    assert_eq!(seen_by_y[0].peer, x_id);
    assert_eq!(seen_by_y[0].addresses, vec![net.address_of(&x_id).unwrap()]);

    assert!(x.coordinator.check_service_provider(&y_id, TOPIC).unwrap());
    assert!(!x.coordinator.check_service_provider(&x_id, TOPIC).unwrap());

    x.coordinator.close().await.unwrap();
    y.coordinator.close().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn gossip_alone_discovers_peers_with_known_addresses() {
    let net = MemoryNetwork::new();
    let gossip_only = config()
        .with_routing_discovery(false)
        .with_peer_exchange(false);
    let x = node(&net, gossip_only.clone()).await;
    let y = node(&net, gossip_only).await;
    let y_id = y.coordinator.local_id();
    net.connect(&x.coordinator.local_id(), &y_id);

    x.coordinator.register_service(TOPIC).await.unwrap();
    y.coordinator.register_service(TOPIC).await.unwrap();
    tokio::time::sleep(PERIOD + PERIOD / 2).await;

    let peers = x.coordinator.find_peers(TOPIC).unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer, y_id);

    x.coordinator.close().await.unwrap();
    y.coordinator.close().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn peer_exchange_reaches_a_second_hop() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;
    let y = node(&net, config()).await;
    // z has no routing or gossip and only knows y
    let z_transport = net.add_node();
    let z = DiscoveryCoordinator::builder(z_transport.clone())
        .config(
            config()
                .with_routing_discovery(false)
                .with_gossip_discovery(false),
        )
        .spawn()
        .await
        .unwrap();
    let x_id = x.coordinator.local_id();
    let y_id = y.coordinator.local_id();
    net.connect(&z.local_id(), &y_id);

    x.coordinator.register_service(TOPIC).await.unwrap();
    y.coordinator.register_service(TOPIC).await.unwrap();
    z.register_service(TOPIC).await.unwrap();
    tokio::time::sleep(PERIOD + PERIOD / 2).await;

    // z cannot reach x before the exchange
    assert!(z.peer_exchange_client(&x_id).await.is_err());

    let pe = z.peer_exchange_client(&y_id).await.unwrap();
    let page = pe.fetch_peer_list(TOPIC, 0, 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].peer(), Some(x_id));
    assert_eq!(page[0].addresses, vec![net.address_of(&x_id).unwrap()]);
    assert!(pe.check_service(TOPIC).await.unwrap());
    assert!(!pe.check_service("unknown").await.unwrap());

    let accepted = z.exchange_peers(&y_id, TOPIC).await.unwrap();
    assert_eq!(accepted, 1);
    assert!(z.check_service_provider(&x_id, TOPIC).unwrap());
    assert!(!z.check_service_provider(&y_id, TOPIC).unwrap());

    // the learned addresses are enough to dial x directly
    let direct = z.peer_exchange_client(&x_id).await.unwrap();
    assert!(direct.check_service(TOPIC).await.unwrap());

    z.close().await.unwrap();
    x.coordinator.close().await.unwrap();
    y.coordinator.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn exchange_for_an_unregistered_topic_fails() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;
    let y = node(&net, config()).await;
    net.connect(&x.coordinator.local_id(), &y.coordinator.local_id());

    let err = x
        .coordinator
        .exchange_peers(&y.coordinator.local_id(), TOPIC)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownService(t) if t == TOPIC));

    // the remote rejects topics it does not serve
    x.coordinator.register_service(TOPIC).await.unwrap();
    let err = x
        .coordinator
        .exchange_peers(&y.coordinator.local_id(), TOPIC)
        .await
        .unwrap_err();
    match err {
        Error::Rpc(status) => assert_eq!(status.code(), tonic::Code::NotFound),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn duplicate_registration_is_rejected() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;

    x.coordinator.register_service(TOPIC).await.unwrap();
    let err = x.coordinator.register_service(TOPIC).await.unwrap_err();
    assert!(err.is_already_registered());
    assert_eq!(
        x.coordinator.list_services(),
        vec![PEER_EXCHANGE_PROTOCOL.to_string(), TOPIC.to_string()]
    );
}

#[test_log::test(tokio::test)]
async fn failed_registration_leaves_no_trace() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;

    x.gossip.set_failing(true);
    let err = x.coordinator.register_service(TOPIC).await.unwrap_err();
    assert!(matches!(err, Error::Gossip(_)));
    assert!(!x.coordinator.list_services().contains(&TOPIC.to_string()));
    assert!(matches!(
        x.coordinator.find_peers(TOPIC),
        Err(Error::UnknownService(_))
    ));

    x.gossip.set_failing(false);
    x.coordinator.register_service(TOPIC).await.unwrap();
    assert!(x.coordinator.find_peers(TOPIC).unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn routing_advertise_failure_does_not_block_registration() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;

    x.routing.set_failing(true);
    x.coordinator.register_service(TOPIC).await.unwrap();
    assert!(x.coordinator.discovery().is_registered(TOPIC));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn events_report_discovered_peers() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;
    let y = node(&net, config()).await;
    let y_id = y.coordinator.local_id();
    let mut events = x.coordinator.subscribe_events();

    x.coordinator.register_service(TOPIC).await.unwrap();
    y.coordinator.register_service(TOPIC).await.unwrap();
    tokio::time::sleep(PERIOD + PERIOD / 2).await;

    let mut found = false;
    while let Ok(event) = events.try_recv() {
        let DiscoveryEvent::PeerDiscovered { topic, peer, .. } = event;
        if topic == TOPIC {
            assert_eq!(peer, y_id);
            found = true;
        }
    }
    assert!(found);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn closed_peers_stop_answering() {
    let net = MemoryNetwork::new();
    let x = node(&net, config()).await;
    let y = node(&net, config()).await;
    let y_id = y.coordinator.local_id();
    net.connect(&x.coordinator.local_id(), &y_id);

    y.coordinator.close().await.unwrap();
    let err = x.coordinator.peer_exchange_client(&y_id).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(y
        .transport
        .open_stream(&x.coordinator.local_id(), PEER_EXCHANGE_PROTOCOL)
        .await
        .is_err());
}

/// Routing stub that counts lookups and can stall advertising.
#[derive(Clone, Default)]
struct CountingRouting {
    lookups: Arc<AtomicUsize>,
    advertise_delay: Option<Duration>,
}

#[async_trait]
impl Routing for CountingRouting {
    async fn advertise(&self, _topic: &str) -> iroh_service_discovery::Result<()> {
        if let Some(delay) = self.advertise_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn find_providers(&self, _topic: &str) -> iroh_service_discovery::Result<ProviderStream> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(futures_util::stream::empty().boxed())
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn failed_registration_stops_the_started_lookup_loop() {
    let net = MemoryNetwork::new();
    let transport = net.add_node();
    let gossip = net.gossip(&transport.local_id());
    let routing = CountingRouting::default();
    let lookups = Arc::clone(&routing.lookups);
    let node = DiscoveryCoordinator::builder(transport)
        .routing(routing)
        .gossip(gossip.clone())
        .config(config().with_peer_exchange(false))
        .spawn()
        .await
        .unwrap();

    // the lookup loop is spawned before the gossip join fails
    gossip.set_failing(true);
    assert!(node.register_service(TOPIC).await.is_err());
    tokio::time::sleep(PERIOD * 5).await;
    assert_eq!(lookups.load(Ordering::SeqCst), 0);

    gossip.set_failing(false);
    node.register_service(TOPIC).await.unwrap();
    tokio::time::sleep(PERIOD + PERIOD / 2).await;
    assert_eq!(lookups.load(Ordering::SeqCst), 1);

    node.close().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn close_does_not_wait_for_a_stalled_advertise() {
    let net = MemoryNetwork::new();
    let routing = CountingRouting {
        advertise_delay: Some(Duration::from_secs(3600)),
        ..Default::default()
    };
    let node = DiscoveryCoordinator::builder(net.add_node())
        .routing(routing)
        .config(
            config()
                .with_gossip_discovery(false)
                .with_peer_exchange(false)
                .with_lookup_timeout(Duration::from_secs(30)),
        )
        .spawn()
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    node.register_service(TOPIC).await.unwrap();
    assert!(node.discovery().is_registered(TOPIC));

    tokio::time::timeout(Duration::from_secs(1), node.close())
        .await
        .expect("close waited on advertise")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        node.register_service("other").await,
        Err(Error::Closed)
    ));
}

/// Peer-exchange handler whose directory never ends.
struct EndlessPeers;

#[async_trait]
impl RpcService for EndlessPeers {
    async fn call(&self, request: RpcRequest) -> Result<Bytes, Status> {
        let req: FetchPeerListRequest = request.decode()?;
        let entries = (0..req.page_size)
            .map(|i| {
                let mut identity = [0xffu8; 32];
                identity[1..5].copy_from_slice(&req.page.to_be_bytes());
                identity[5..9].copy_from_slice(&i.to_be_bytes());
                PeerListEntry {
                    identity: identity.to_vec(),
                    addresses: vec![],
                    last_seen_ago: 0,
                }
            })
            .collect();
        Ok(Bytes::from(
            FetchPeerListResponse { entries }.encode_to_vec(),
        ))
    }
}

impl ServiceHandler for EndlessPeers {
    fn protocol(&self) -> &str {
        PEER_EXCHANGE_PROTOCOL
    }
}

#[test_log::test(tokio::test)]
async fn exchange_with_an_endless_directory_is_bounded() {
    let net = MemoryNetwork::new();
    let quiet = config()
        .with_routing_discovery(false)
        .with_gossip_discovery(false);
    let server = DiscoveryCoordinator::builder(net.add_node())
        .config(quiet.clone().with_peer_exchange(false))
        .spawn()
        .await
        .unwrap();
    server.registry().register_service(Arc::new(EndlessPeers));
    let client = DiscoveryCoordinator::builder(net.add_node())
        .config(quiet)
        .spawn()
        .await
        .unwrap();
    net.connect(&server.local_id(), &client.local_id());
    client.register_service(TOPIC).await.unwrap();

    let accepted = tokio::time::timeout(
        Duration::from_secs(60),
        client.exchange_peers(&server.local_id(), TOPIC),
    )
    .await
    .expect("exchange did not terminate")
    .unwrap();
    assert_eq!(accepted, MAX_EXCHANGE_ENTRIES);
}
