//! Connection and transfer configuration.
//!
//! All values are plain data handed to the state machines at construction and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ConnectionError;
use crate::protocol::{FilterPolicy, TransferMode};
use crate::record::checked_wire_len;

/// Default port of the connection manager.
pub const DEFAULT_PORT: u16 = 7471;

/// Queue pair sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpCapabilities {
    /// Send queue depth.
    pub max_send_wr: u32,
    /// Receive queue depth.
    pub max_recv_wr: u32,
    /// Scatter/gather elements per send request.
    pub max_send_sge: u32,
    /// Scatter/gather elements per receive request.
    pub max_recv_sge: u32,
    /// Largest payload that may take the inline path.
    pub max_inline_data: u32,
}

impl Default for QpCapabilities {
    fn default() -> Self {
        Self {
            max_send_wr: 32,
            max_recv_wr: 32,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 64,
        }
    }
}

/// Parameters negotiated by connect and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnParams {
    /// Outstanding one-sided reads this side may issue.
    pub initiator_depth: u8,
    /// Outstanding one-sided reads this side will serve.
    pub responder_resources: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
        }
    }
}

/// Client role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Listener to connect to.
    pub peer_addr: SocketAddr,
    /// Bound on address and on route resolution, each.
    pub resolve_timeout_ms: u64,
    /// Bound on the wait for the established event.
    pub connect_timeout_ms: u64,
    /// Completion queue depth.
    pub cq_depth: usize,
    /// Queue pair sizing.
    pub qp: QpCapabilities,
    /// Connection parameters.
    pub conn: ConnParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            resolve_timeout_ms: 2000,
            connect_timeout_ms: 5000,
            cq_depth: 32,
            qp: QpCapabilities::default(),
            conn: ConnParams::default(),
        }
    }
}

impl ClientConfig {
    /// Resolution bound as a duration.
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Connect bound as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Rejects sizes the transport cannot honour.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        validate_sizing(self.cq_depth, &self.qp)
    }
}

/// Server role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port bound on the wildcard address.
    pub port: u16,
    /// Pending connect requests queued before new ones are rejected.
    pub backlog: u32,
    /// Bound on the wait for a connect request; unbounded when absent.
    pub accept_timeout_ms: Option<u64>,
    /// Bound on the wait for the established event.
    pub connect_timeout_ms: u64,
    /// Bound on the wait for the peer's disconnect; unbounded when absent.
    pub disconnect_timeout_ms: Option<u64>,
    /// Completion queue depth.
    pub cq_depth: usize,
    /// Queue pair sizing.
    pub qp: QpCapabilities,
    /// Connection parameters.
    pub conn: ConnParams,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: 6,
            accept_timeout_ms: None,
            connect_timeout_ms: 5000,
            disconnect_timeout_ms: None,
            cq_depth: 32,
            qp: QpCapabilities::default(),
            conn: ConnParams::default(),
        }
    }
}

impl ServerConfig {
    /// Wildcard address the listener binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    /// Rejects sizes the transport cannot honour.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.backlog == 0 {
            return Err(ConnectionError::InvalidConfig("backlog must be non-zero".to_string()));
        }
        validate_sizing(self.cq_depth, &self.qp)
    }
}

fn validate_sizing(cq_depth: usize, qp: &QpCapabilities) -> Result<(), ConnectionError> {
    if cq_depth == 0 {
        return Err(ConnectionError::InvalidConfig(
            "completion queue depth must be non-zero".to_string(),
        ));
    }
    if qp.max_send_wr == 0 || qp.max_recv_wr == 0 {
        return Err(ConnectionError::InvalidConfig(
            "queue pair depths must be non-zero".to_string(),
        ));
    }
    if qp.max_send_sge == 0 || qp.max_recv_sge == 0 {
        return Err(ConnectionError::InvalidConfig(
            "queue pair needs at least one scatter/gather element".to_string(),
        ));
    }
    Ok(())
}

/// What a session transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfer protocol.
    pub mode: TransferMode,
    /// Where filtering happens, if anywhere.
    pub filter: FilterPolicy,
    /// Records the server generates; also sizes the client's buffers.
    pub entries: usize,
    /// Keys are drawn from `0..key_space`.
    pub key_space: u32,
    /// Seed of the record generator.
    pub seed: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::Send,
            filter: FilterPolicy::Unfiltered,
            entries: 1024,
            key_space: 3,
            seed: 42,
        }
    }
}

impl TransferConfig {
    /// Rejects record counts whose payload exceeds one transport operation.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if checked_wire_len(self.entries).is_none() {
            return Err(ConnectionError::InvalidConfig(format!(
                "{} entries exceed the largest single transfer",
                self.entries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection_parameters() {
        let caps = QpCapabilities::default();
        assert_eq!(caps.max_send_wr, 32);
        assert_eq!(caps.max_recv_wr, 32);
        assert_eq!(caps.max_send_sge, 1);
        assert_eq!(caps.max_recv_sge, 1);
        assert_eq!(caps.max_inline_data, 64);

        let conn = ConnParams::default();
        assert_eq!(conn.initiator_depth, 1);
        assert_eq!(conn.responder_resources, 1);
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.backlog, 6);
        assert_eq!(config.cq_depth, 32);
        assert!(config.accept_timeout_ms.is_none());
        assert!(config.bind_addr().ip().is_unspecified());
        assert_eq!(config.bind_addr().port(), DEFAULT_PORT);
        config.validate().unwrap();
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.resolve_timeout(), Duration::from_secs(2));
        assert!(config.peer_addr.ip().is_loopback());
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        let config = ClientConfig {
            cq_depth: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            qp: QpCapabilities {
                max_recv_sge: 0,
                ..QpCapabilities::default()
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            backlog: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_entries_bounded() {
        let max = u32::MAX as usize / crate::record::RECORD_SIZE;
        let config = TransferConfig {
            entries: max,
            ..TransferConfig::default()
        };
        config.validate().unwrap();

        let config = TransferConfig {
            entries: max + 1,
            ..TransferConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConnectionError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"peer_addr": "10.0.1.37:7471"}"#).unwrap();
        assert_eq!(config.peer_addr.port(), 7471);
        assert_eq!(config.resolve_timeout_ms, 2000);
        assert_eq!(config.qp, QpCapabilities::default());
    }
}
