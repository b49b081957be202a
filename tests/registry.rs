use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iroh_service_discovery::alpn::protocol_for;
use iroh_service_discovery::memory::MemoryNetwork;
use iroh_service_discovery::{
    DiscoveryConfig, DiscoveryCoordinator, Error, RpcPeer, RpcRequest, RpcService,
    ServiceHandler, Transport,
};
use prost::Message;
use tonic::Status;

#[derive(Clone, PartialEq, prost::Message)]
struct AddRequest {
    #[prost(int64, tag = "1")]
    a: i64,
    #[prost(int64, tag = "2")]
    b: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AddResponse {
    #[prost(int64, tag = "1")]
    sum: i64,
}

struct CalculatorName;
impl tonic::server::NamedService for CalculatorName {
    const NAME: &'static str = "calc.Calculator";
}

struct Calculator {
    protocol: String,
    offset: i64,
    calls: Arc<AtomicUsize>,
}

impl Calculator {
    fn new(offset: i64) -> Self {
        Self {
            protocol: protocol_for::<CalculatorName>(),
            offset,
            calls: Arc::default(),
        }
    }
}

#[async_trait]
impl RpcService for Calculator {
    async fn call(&self, request: RpcRequest) -> Result<Bytes, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.method.as_str() {
            "Add" => {
                let req: AddRequest = request.decode()?;
                let resp = AddResponse {
                    sum: req.a + req.b + self.offset,
                };
                Ok(Bytes::from(resp.encode_to_vec()))
            }
            other => Err(Status::unimplemented(other.to_string())),
        }
    }
}

impl ServiceHandler for Calculator {
    fn protocol(&self) -> &str {
        &self.protocol
    }
}

struct CalculatorClient {
    session: RpcPeer,
}

impl CalculatorClient {
    async fn add(&self, a: i64, b: i64) -> iroh_service_discovery::Result<i64> {
        let resp: AddResponse = self.session.unary("Add", &AddRequest { a, b }).await?;
        Ok(resp.sum)
    }
}

fn quiet() -> DiscoveryConfig {
    DiscoveryConfig::default()
        .with_routing_discovery(false)
        .with_gossip_discovery(false)
}

async fn pair(net: &MemoryNetwork) -> (DiscoveryCoordinator, DiscoveryCoordinator) {
    let server = DiscoveryCoordinator::builder(net.add_node())
        .config(quiet())
        .spawn()
        .await
        .unwrap();
    let client = DiscoveryCoordinator::builder(net.add_node())
        .config(quiet())
        .spawn()
        .await
        .unwrap();
    net.connect(&server.local_id(), &client.local_id());
    (server, client)
}

#[test_log::test(tokio::test)]
async fn typed_client_calls_a_registered_handler() {
    let net = MemoryNetwork::new();
    let (server, client) = pair(&net).await;
    let protocol = protocol_for::<CalculatorName>();
    assert_eq!(protocol, "/calc.Calculator/1.0");

    let calculator = Calculator::new(0);
    let calls = Arc::clone(&calculator.calls);
    server.register_service_handler(calculator).await.unwrap();
    assert!(server.list_services().contains(&protocol));
    assert!(server.registry().is_bound(&protocol));

    client
        .registry()
        .register_client_constructor(protocol.clone(), |session| CalculatorClient { session });
    let calc: CalculatorClient = client
        .new_service_client(&protocol, &server.local_id())
        .await
        .unwrap();
    assert_eq!(calc.session.remote(), server.local_id());
    assert_eq!(calc.add(2, 3).await.unwrap(), 5);
    assert_eq!(calc.add(-7, 7).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = calc.session.call("Divide", Bytes::new()).await.unwrap_err();
    match err {
        Error::Rpc(status) => assert_eq!(status.code(), tonic::Code::Unimplemented),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn unbound_protocol_is_reported() {
    let net = MemoryNetwork::new();
    let (server, client) = pair(&net).await;

    let err = client
        .new_service_client_any("/calc.Calculator/1.0", &server.local_id())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnboundProtocol(p) if p == "/calc.Calculator/1.0"));
}

#[test_log::test(tokio::test)]
async fn wrong_client_type_is_reported() {
    let net = MemoryNetwork::new();
    let (server, client) = pair(&net).await;
    let protocol = protocol_for::<CalculatorName>();
    server
        .register_service_handler(Calculator::new(0))
        .await
        .unwrap();
    client
        .registry()
        .register_client_constructor(protocol.clone(), |session| CalculatorClient { session });

    let err = client
        .new_service_client::<String>(&protocol, &server.local_id())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientType { protocol: p, .. } if p == protocol));
}

#[test_log::test(tokio::test)]
async fn rebinding_a_protocol_routes_new_sessions_to_the_new_handler() {
    let net = MemoryNetwork::new();
    let (server, client) = pair(&net).await;
    let protocol = protocol_for::<CalculatorName>();
    client
        .registry()
        .register_client_constructor(protocol.clone(), |session| CalculatorClient { session });

    server.registry().register_service(Arc::new(Calculator::new(0)));
    let first: CalculatorClient = client
        .new_service_client(&protocol, &server.local_id())
        .await
        .unwrap();
    assert_eq!(first.add(1, 1).await.unwrap(), 2);

    server.registry().register_service(Arc::new(Calculator::new(100)));
    let second: CalculatorClient = client
        .new_service_client(&protocol, &server.local_id())
        .await
        .unwrap();
    assert_eq!(second.add(1, 1).await.unwrap(), 102);
    assert_eq!(server.registry().protocols().len(), 2);
}

#[test_log::test(tokio::test)]
async fn handler_registration_claims_the_topic() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let (server, _client) = pair(&net).await;

    server.register_service_handler(Calculator::new(0)).await?;
    let err = server
        .register_service_handler(Calculator::new(1))
        .await
        .unwrap_err();
    assert!(err.is_already_registered());
    server.close().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn closing_the_server_ends_client_sessions() {
    let net = MemoryNetwork::new();
    let (server, client) = pair(&net).await;
    let protocol = protocol_for::<CalculatorName>();
    server
        .register_service_handler(Calculator::new(0))
        .await
        .unwrap();
    client
        .registry()
        .register_client_constructor(protocol.clone(), |session| CalculatorClient { session });
    let calc: CalculatorClient = client
        .new_service_client(&protocol, &server.local_id())
        .await
        .unwrap();
    assert_eq!(calc.add(1, 2).await.unwrap(), 3);

    server.close().await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), calc.session.closed())
        .await
        .unwrap();
    assert!(matches!(calc.add(1, 2).await, Err(Error::SessionClosed)));
    assert!(client
        .transport()
        .open_stream(&server.local_id(), &protocol)
        .await
        .is_err());
}
