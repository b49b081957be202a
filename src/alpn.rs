//! Protocol-id helpers shared by the registry and the iroh overlay.
//!
//! A protocol id doubles as a service's discovery topic and, on the iroh
//! overlay, as the ALPN its streams are negotiated with.

/// Protocol id for a tonic service name.
///
/// Converts `echo.Echo` -> `/echo.Echo/1.0`.
/// Converts `p2p_chat.P2PChatService` -> `/p2p_chat.P2PChatService/1.0`.
pub fn protocol_for<T: tonic::server::NamedService>() -> String {
    versioned_protocol(T::NAME, "1.0")
}

/// Protocol id `/{name}/{version}`.
pub fn versioned_protocol(name: &str, version: &str) -> String {
    format!("/{name}/{version}")
}

/// ALPN bytes for a protocol id.
pub fn protocol_to_alpn(protocol: &str) -> Vec<u8> {
    protocol.as_bytes().to_vec()
}

/// Protocol id carried by an ALPN, if it is valid UTF-8.
pub fn alpn_to_protocol(alpn: &[u8]) -> Option<&str> {
    std::str::from_utf8(alpn).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_service_name() {
        struct EchoService;
        impl tonic::server::NamedService for EchoService {
            const NAME: &'static str = "echo.Echo";
        }

        struct ChatService;
        impl tonic::server::NamedService for ChatService {
            const NAME: &'static str = "p2p_chat.P2PChatService";
        }

        assert_eq!(protocol_for::<EchoService>(), "/echo.Echo/1.0");
        assert_eq!(
            protocol_for::<ChatService>(),
            "/p2p_chat.P2PChatService/1.0"
        );
    }

    #[test]
    fn peer_exchange_id_is_versioned() {
        assert_eq!(
            versioned_protocol("peer-exchange", "1.0.1"),
            crate::PEER_EXCHANGE_PROTOCOL
        );
    }

    #[test]
    fn alpn_conversion() {
        let alpn = protocol_to_alpn("/calc/1.0");
        assert_eq!(alpn, b"/calc/1.0");
        assert_eq!(alpn_to_protocol(&alpn), Some("/calc/1.0"));
        assert_eq!(alpn_to_protocol(&[0xff, 0xfe]), None);
    }
}
