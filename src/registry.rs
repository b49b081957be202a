//! Protocol-id bindings for inbound handlers and outbound client constructors.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::peer::PeerId;
use crate::rpc::{RpcPeer, RpcService};
use crate::substrate::{InboundStream, Transport};
use crate::{Error, Result};

/// An [`RpcService`] bound to a protocol id.
///
/// The protocol id doubles as the service's discovery topic when registered
/// through [`DiscoveryCoordinator::register_service_handler`](crate::DiscoveryCoordinator::register_service_handler).
pub trait ServiceHandler: RpcService {
    /// Protocol id inbound streams are routed by.
    fn protocol(&self) -> &str;
}

/// Factory building a client handle from an established session.
pub type ClientConstructor = Arc<dyn Fn(RpcPeer) -> Box<dyn Any + Send> + Send + Sync>;

/// Binds protocol ids to inbound handlers and outbound client constructors.
pub struct ServiceRegistry {
    transport: Arc<dyn Transport>,
    bindings: RwLock<HashMap<String, Arc<dyn RpcService>>>,
    constructors: RwLock<HashMap<String, ClientConstructor>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("protocols", &self.protocols())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Create a registry dispatching through `transport`. Sessions are closed
    /// when `cancel` fires.
    pub fn new(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            transport,
            bindings: RwLock::new(HashMap::new()),
            constructors: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Route inbound streams for `handler.protocol()` to `handler`.
    ///
    /// Each stream gets its own session; the session task lives until the
    /// remote closes or the registry's token is cancelled. Registering the
    /// same protocol again replaces the previous handler.
    pub fn register_service<H: ServiceHandler>(&self, handler: Arc<H>) {
        let protocol = handler.protocol().to_string();
        let service: Arc<dyn RpcService> = handler;

        let replaced = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.clone(), Arc::clone(&service))
            .is_some();
        if replaced {
            warn!(%protocol, "replacing service handler");
        }

        let cancel = self.cancel.clone();
        self.transport.set_stream_handler(
            &protocol,
            Arc::new(move |inbound: InboundStream| {
                serve_stream(inbound, Arc::clone(&service), cancel.clone());
            }),
        );
        debug!(%protocol, "service handler bound");
    }

    /// Store `constructor` as the client factory for `protocol`.
    pub fn register_client_constructor<C, F>(&self, protocol: impl Into<String>, constructor: F)
    where
        C: Any + Send,
        F: Fn(RpcPeer) -> C + Send + Sync + 'static,
    {
        let erased: ClientConstructor =
            Arc::new(move |session| Box::new(constructor(session)) as Box<dyn Any + Send>);
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.into(), erased);
    }

    /// Whether a handler is bound to `protocol`.
    pub fn is_bound(&self, protocol: &str) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(protocol)
    }

    /// Protocol ids with a bound handler, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<_> = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        protocols.sort();
        protocols
    }

    fn constructor(&self, protocol: &str) -> Result<ClientConstructor> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
            .ok_or_else(|| Error::UnboundProtocol(protocol.to_string()))
    }

    /// Open a session to `peer` for `protocol` without wrapping it in a client.
    pub async fn connect(&self, protocol: &str, peer: &PeerId) -> Result<RpcPeer> {
        let stream = self.transport.open_stream(peer, protocol).await?;
        Ok(RpcPeer::new(stream, *peer, protocol, &self.cancel))
    }

    /// Dial `peer` and build a client with the constructor bound to `protocol`.
    pub async fn new_client_any(
        &self,
        protocol: &str,
        peer: &PeerId,
    ) -> Result<Box<dyn Any + Send>> {
        let constructor = self.constructor(protocol)?;
        let session = self.connect(protocol, peer).await?;
        Ok(constructor(session))
    }

    /// Typed variant of [`new_client_any`](Self::new_client_any).
    ///
    /// Fails with [`Error::ClientType`] when the constructor builds another type.
    pub async fn new_client<C: Any + Send>(&self, protocol: &str, peer: &PeerId) -> Result<C> {
        let client = self.new_client_any(protocol, peer).await?;
        client
            .downcast::<C>()
            .map(|client| *client)
            .map_err(|_| Error::ClientType {
                protocol: protocol.to_string(),
                expected: std::any::type_name::<C>(),
            })
    }
}

fn serve_stream(inbound: InboundStream, service: Arc<dyn RpcService>, cancel: CancellationToken) {
    let span = tracing::debug_span!(
        "inbound_stream",
        protocol = %inbound.protocol,
        remote = %inbound.remote.fmt_short()
    );
    tokio::spawn(
        async move {
            let session = RpcPeer::with_service(
                inbound.stream,
                inbound.remote,
                inbound.protocol,
                service,
                &cancel,
            );
            tokio::select! {
                _ = session.closed() => debug!("inbound session closed"),
                _ = cancel.cancelled() => debug!("inbound session cancelled"),
            }
        }
        .instrument(span),
    );
}
