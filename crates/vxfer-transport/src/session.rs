//! One role's whole lifetime: establish, run one protocol, tear down.

use std::time::Duration;

use crate::config::{ClientConfig, ServerConfig};
use crate::connection::{ClientConnector, ServerListener};
use crate::error::TransferError;
use crate::fabric::Fabric;
use crate::protocol::TransferProtocol;

/// Client role composed with a transfer protocol.
#[derive(Debug)]
pub struct ClientSession<P> {
    fabric: Fabric,
    config: ClientConfig,
    protocol: P,
}

impl<P: TransferProtocol> ClientSession<P> {
    /// Creates the session.
    pub fn new(fabric: Fabric, config: ClientConfig, protocol: P) -> Self {
        Self {
            fabric,
            config,
            protocol,
        }
    }

    /// Connects, runs the protocol, and disconnects.
    pub fn run(mut self) -> Result<P::Output, TransferError> {
        let mut conn = ClientConnector::new(self.fabric, self.config).establish(&mut self.protocol)?;
        let output = self.protocol.run(&mut conn);
        if let Err(e) = conn.disconnect() {
            tracing::warn!(error = %e, "disconnect failed");
        }
        output
    }
}

/// Server role composed with a transfer protocol.
#[derive(Debug)]
pub struct ServerSession<P> {
    fabric: Fabric,
    config: ServerConfig,
    protocol: P,
}

impl<P: TransferProtocol> ServerSession<P> {
    /// Creates the session.
    pub fn new(fabric: Fabric, config: ServerConfig, protocol: P) -> Self {
        Self {
            fabric,
            config,
            protocol,
        }
    }

    /// Accepts one connection, runs the protocol, and waits for the peer to
    /// disconnect before tearing down.
    pub fn run(mut self) -> Result<P::Output, TransferError> {
        let disconnect_timeout = self.config.disconnect_timeout_ms.map(Duration::from_millis);
        let mut conn = ServerListener::new(self.fabric, self.config).establish(&mut self.protocol)?;
        let output = self.protocol.run(&mut conn)?;
        conn.await_disconnect(disconnect_timeout)?;
        Ok(output)
    }
}
