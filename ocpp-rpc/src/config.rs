//! Endpoint configuration
//!
//! Only what the protocol engine itself consumes. URLs, TLS and reconnect
//! policy belong to whoever builds the transport.

use std::time::Duration;

use crate::ids::{ChargeBoxId, ProtocolVersion};

/// Default deadline for outbound requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of one OCPP-J endpoint
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Identity attached to every parsed request and reply
    pub charge_box_id: ChargeBoxId,

    /// Dialect negotiated for the connection
    pub protocol: ProtocolVersion,

    /// Deadline for outbound requests, counted from send time
    pub request_timeout: Duration,
}

impl EndpointConfig {
    /// Create config with defaults for everything but the identity
    pub fn new(charge_box_id: ChargeBoxId) -> Self {
        Self {
            charge_box_id,
            protocol: ProtocolVersion::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::new(ChargeBoxId::new("CS001").unwrap());
        assert_eq!(config.protocol, ProtocolVersion::Ocpp16);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builders() {
        let config = EndpointConfig::new(ChargeBoxId::new("CS001").unwrap())
            .with_protocol(ProtocolVersion::Ocpp201)
            .with_request_timeout(Duration::from_millis(250));
        assert_eq!(config.protocol, ProtocolVersion::Ocpp201);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }
}
