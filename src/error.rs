//! Error types for iroh-service-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The topic (or handler protocol) was registered before.
    #[error("service `{0}` is already registered")]
    AlreadyRegistered(String),

    /// The topic has not been registered on this node.
    #[error("service not found: {0}")]
    UnknownService(String),

    /// No client constructor is bound to the protocol.
    #[error("no client constructor registered for protocol: {0}")]
    UnboundProtocol(String),

    /// A client constructor produced a handle of another type.
    #[error("client for protocol `{protocol}` is not a `{expected}`")]
    ClientType {
        /// Protocol the client was built for.
        protocol: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Routing substrate error.
    #[error("routing error: {0}")]
    Routing(String),

    /// Gossip substrate error.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// The remote side answered with a non-OK status.
    #[error("rpc error: {0}")]
    Rpc(Box<tonic::Status>),

    /// The coordinator was closed.
    #[error("discovery coordinator is closed")]
    Closed,

    /// The RPC session closed before a response arrived.
    #[error("rpc session closed")]
    SessionClosed,

    /// Failed to decode a protobuf message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a routing error.
    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Self::Routing(msg.into())
    }

    /// Create a gossip error.
    pub fn gossip<S: Into<String>>(msg: S) -> Self {
        Self::Gossip(msg.into())
    }

    /// Whether this error means the caller registered the same name twice.
    pub fn is_already_registered(&self) -> bool {
        matches!(self, Self::AlreadyRegistered(_))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc(Box::new(status))
    }
}
