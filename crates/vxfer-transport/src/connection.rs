//! Connection lifecycle state machines for the client and server roles.
//!
//! Each state is its own type. A state waits for the next connection manager
//! event with `next_event` and consumes itself in `on_event`, yielding the
//! next state or a typed error. Events that the state does not expect are
//! acknowledged and reported as `ConnectionError::UnexpectedEvent`.
//!
//! ```text
//! client: Init -> AddressResolving -> RouteResolving -> QueuePairReady -> Connecting -> Established
//! server: Init -> Listening -> ConnectRequested -> Accepting -> Established
//! ```
//!
//! Both chains end in a [`Connection`], which releases its resources in
//! reverse creation order when dropped.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::cm::{CmEvent, CmEventKind, CmId, EventChannel};
use crate::completion::{CompletionQueue, WorkCompletion};
use crate::config::{ClientConfig, QpCapabilities, ServerConfig};
use crate::error::{ConnectionError, TransferError, VerbsError};
use crate::fabric::{DeviceContext, Fabric};
use crate::memory::{AccessFlags, MemoryRegion, MemoryRegistry, ProtectionDomain};
use crate::protocol::TransferProtocol;
use crate::queue_pair::QueuePair;
use crate::work_request::WorkRequest;

/// Which side of the connection an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Actively connects.
    Client,
    /// Listens and accepts.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// States of the client role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Waiting for address resolution.
    AddressResolving,
    /// Waiting for route resolution.
    RouteResolving,
    /// Resources allocated, not yet connecting.
    QueuePairReady,
    /// Waiting for the connection to come up.
    Connecting,
}

impl ClientPhase {
    /// State name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientPhase::AddressResolving => "AddressResolving",
            ClientPhase::RouteResolving => "RouteResolving",
            ClientPhase::QueuePairReady => "QueuePairReady",
            ClientPhase::Connecting => "Connecting",
        }
    }
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the server role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Waiting for a connect request.
    Listening,
    /// Request received and resources allocated, not yet accepted.
    ConnectRequested,
    /// Waiting for the connection to come up.
    Accepting,
    /// Transfer done, waiting for the peer to disconnect.
    Established,
}

impl ServerPhase {
    /// State name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerPhase::Listening => "Listening",
            ServerPhase::ConnectRequested => "ConnectRequested",
            ServerPhase::Accepting => "Accepting",
            ServerPhase::Established => "Established",
        }
    }
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unexpected(event: CmEvent, state: &'static str, expected: CmEventKind) -> ConnectionError {
    let got = event.kind();
    event.ack();
    tracing::warn!(state, ?expected, ?got, "unexpected CM event");
    ConnectionError::UnexpectedEvent { state, expected, got }
}

/// An established (or establishing) connection and everything it owns.
///
/// Fields drop in declaration order after `Drop::drop` has destroyed the
/// queue pair: memory regions, completion queue, protection domain, endpoint
/// identities, event channel.
pub struct Connection {
    registry: MemoryRegistry,
    cq: CompletionQueue,
    pd: ProtectionDomain,
    qp: QueuePair,
    id: CmId,
    listener: Option<CmId>,
    channel: EventChannel,
    role: Role,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("id", &self.id)
            .field("qp", &self.qp)
            .field("regions", &self.registry.len())
            .finish()
    }
}

impl Connection {
    fn build(
        role: Role,
        id: CmId,
        listener: Option<CmId>,
        channel: EventChannel,
        device: &DeviceContext,
        cq_depth: usize,
        caps: QpCapabilities,
    ) -> Result<Self, ConnectionError> {
        let pd = ProtectionDomain::alloc(device);
        let cq = CompletionQueue::new(cq_depth)?;
        let qp = id.create_qp(&pd, &cq, caps)?;
        tracing::debug!(%role, id = id.id(), qp_num = qp.qp_num(), device = device.name(), "queue pair ready");
        Ok(Self {
            registry: MemoryRegistry::new(pd.clone()),
            cq,
            pd,
            qp,
            id,
            listener,
            channel,
            role,
        })
    }

    /// Role of this endpoint.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Endpoint identity.
    pub fn id(&self) -> &CmId {
        &self.id
    }

    /// Queue pair.
    pub fn qp(&self) -> &QueuePair {
        &self.qp
    }

    /// Completion queue.
    pub fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    /// Protection domain.
    pub fn pd(&self) -> &ProtectionDomain {
        &self.pd
    }

    /// Queue pair sizing.
    pub fn caps(&self) -> &QpCapabilities {
        self.qp.caps()
    }

    /// Registrations owned by the connection.
    pub fn registry_mut(&mut self) -> &mut MemoryRegistry {
        &mut self.registry
    }

    /// Registers `buffer`; the registration lives until deregistered or the
    /// connection is dropped.
    pub fn register(&mut self, buffer: Vec<u8>, access: AccessFlags) -> Result<MemoryRegion, VerbsError> {
        self.registry.register(buffer, access)
    }

    /// Deregisters `mr`.
    pub fn deregister(&mut self, mr: &MemoryRegion) -> Result<(), VerbsError> {
        self.registry.deregister(mr)
    }

    /// Posts a work request, returning its identifier.
    pub fn post(&self, wr: WorkRequest) -> Result<u64, VerbsError> {
        wr.post(&self.qp)
    }

    /// Blocks for one completion and fails on a non-success status.
    pub fn wait_completion(&self) -> Result<WorkCompletion, VerbsError> {
        self.cq.wait_one()
    }

    /// Blocks for the peer's disconnect. The event is not acknowledged.
    pub fn await_disconnect(&mut self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let event = self.channel.get_event(timeout)?;
        if event.kind() != CmEventKind::Disconnected {
            return Err(unexpected(event, ServerPhase::Established.as_str(), CmEventKind::Disconnected));
        }
        tracing::debug!(role = %self.role, id = self.id.id(), "peer disconnected");
        Ok(())
    }

    /// Disconnects from the peer.
    pub fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.id.disconnect()?;
        tracing::debug!(role = %self.role, id = self.id.id(), "disconnect issued");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.id.destroy_qp();
    }
}

/// Entry point of the client role.
#[derive(Debug)]
pub struct ClientConnector {
    fabric: Fabric,
    config: ClientConfig,
}

struct ClientContext {
    config: ClientConfig,
    id: CmId,
    channel: EventChannel,
}

impl ClientContext {
    fn next_event(&mut self, timeout: Duration) -> Result<CmEvent, ConnectionError> {
        Ok(self.channel.get_event(Some(timeout))?)
    }
}

impl ClientConnector {
    /// Creates the client role for `config.peer_addr`.
    pub fn new(fabric: Fabric, config: ClientConfig) -> Self {
        Self { fabric, config }
    }

    /// Creates the event channel and identity and starts address resolution.
    pub fn start(self) -> Result<AddressResolving, ConnectionError> {
        self.config.validate()?;
        let channel = EventChannel::new();
        let id = CmId::create(&self.fabric, &channel);
        id.resolve_addr(self.config.peer_addr)?;
        tracing::debug!(peer = %self.config.peer_addr, id = id.id(), "resolving address");
        Ok(AddressResolving {
            ctx: ClientContext {
                config: self.config,
                id,
                channel,
            },
        })
    }

    /// Drives every state through to an established connection.
    pub fn establish<P: TransferProtocol>(self, protocol: &mut P) -> Result<Connection, TransferError> {
        let mut state = self.start()?;
        let event = state.next_event()?;
        let mut state = state.on_event(event)?;
        let event = state.next_event()?;
        let state = state.on_event(event)?;
        let mut state = state.connect(protocol)?;
        let event = state.next_event()?;
        Ok(state.on_event(event)?)
    }
}

/// Client waiting for address resolution.
pub struct AddressResolving {
    ctx: ClientContext,
}

impl AddressResolving {
    /// State name.
    pub fn phase(&self) -> ClientPhase {
        ClientPhase::AddressResolving
    }

    /// Waits for the next event, bounded by the resolution timeout.
    pub fn next_event(&mut self) -> Result<CmEvent, ConnectionError> {
        let timeout = self.ctx.config.resolve_timeout();
        self.ctx.next_event(timeout)
    }

    /// Address resolved: start route resolution.
    pub fn on_event(self, event: CmEvent) -> Result<RouteResolving, ConnectionError> {
        let peer = self.ctx.config.peer_addr;
        match event.kind() {
            CmEventKind::AddrResolved => {
                event.ack();
                self.ctx.id.resolve_route()?;
                tracing::debug!(%peer, "address resolved");
                Ok(RouteResolving { ctx: self.ctx })
            }
            CmEventKind::AddrError => {
                event.ack();
                Err(ConnectionError::AddressResolution { addr: peer })
            }
            _ => Err(unexpected(event, self.phase().as_str(), CmEventKind::AddrResolved)),
        }
    }
}

/// Client waiting for route resolution.
pub struct RouteResolving {
    ctx: ClientContext,
}

impl RouteResolving {
    /// State name.
    pub fn phase(&self) -> ClientPhase {
        ClientPhase::RouteResolving
    }

    /// Waits for the next event, bounded by the resolution timeout.
    pub fn next_event(&mut self) -> Result<CmEvent, ConnectionError> {
        let timeout = self.ctx.config.resolve_timeout();
        self.ctx.next_event(timeout)
    }

    /// Route resolved: allocate protection domain, completion queue and
    /// queue pair on the resolved device.
    pub fn on_event(self, event: CmEvent) -> Result<QueuePairReady, ConnectionError> {
        let peer = self.ctx.config.peer_addr;
        match event.kind() {
            CmEventKind::RouteResolved => {
                event.ack();
                let ClientContext { config, id, channel } = self.ctx;
                let device = id.device().ok_or(VerbsError::NoDevice { id: id.id() })?;
                let conn = Connection::build(Role::Client, id, None, channel, &device, config.cq_depth, config.qp)?;
                Ok(QueuePairReady { conn, config })
            }
            CmEventKind::RouteError => {
                event.ack();
                Err(ConnectionError::RouteResolution { addr: peer })
            }
            _ => Err(unexpected(event, self.phase().as_str(), CmEventKind::RouteResolved)),
        }
    }
}

/// Client with resources allocated, ready to connect.
pub struct QueuePairReady {
    conn: Connection,
    config: ClientConfig,
}

impl QueuePairReady {
    /// State name.
    pub fn phase(&self) -> ClientPhase {
        ClientPhase::QueuePairReady
    }

    /// The connection-to-be, for posting receives by hand.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Lets `protocol` post its receives, then sends the connect request.
    pub fn connect<P: TransferProtocol>(mut self, protocol: &mut P) -> Result<Connecting, TransferError> {
        protocol.prepare(&mut self.conn)?;
        self.conn.id.connect(self.config.conn)?;
        tracing::debug!(peer = %self.config.peer_addr, "connecting");
        Ok(Connecting {
            conn: self.conn,
            config: self.config,
        })
    }
}

/// Client waiting for the connection to come up.
pub struct Connecting {
    conn: Connection,
    config: ClientConfig,
}

impl Connecting {
    /// State name.
    pub fn phase(&self) -> ClientPhase {
        ClientPhase::Connecting
    }

    /// Waits for the next event, bounded by the connect timeout.
    pub fn next_event(&mut self) -> Result<CmEvent, ConnectionError> {
        Ok(self.conn.channel.get_event(Some(self.config.connect_timeout()))?)
    }

    /// Established: the connection is handed over.
    pub fn on_event(self, event: CmEvent) -> Result<Connection, ConnectionError> {
        let addr: SocketAddr = self.config.peer_addr;
        match event.kind() {
            CmEventKind::Established => {
                event.ack();
                tracing::debug!(%addr, qp_num = self.conn.qp.qp_num(), "connection established");
                Ok(self.conn)
            }
            CmEventKind::Unreachable => {
                event.ack();
                Err(ConnectionError::Unreachable { addr })
            }
            CmEventKind::Rejected => {
                event.ack();
                Err(ConnectionError::Rejected { addr })
            }
            _ => Err(unexpected(event, self.phase().as_str(), CmEventKind::Established)),
        }
    }
}

/// Entry point of the server role.
#[derive(Debug)]
pub struct ServerListener {
    fabric: Fabric,
    config: ServerConfig,
}

impl ServerListener {
    /// Creates the server role.
    pub fn new(fabric: Fabric, config: ServerConfig) -> Self {
        Self { fabric, config }
    }

    /// Binds the configured port on the wildcard address and listens.
    pub fn start(self) -> Result<Listening, ConnectionError> {
        self.config.validate()?;
        let channel = EventChannel::new();
        let listener = CmId::create(&self.fabric, &channel);
        let addr = self.config.bind_addr();
        listener.bind_addr(addr)?;
        listener.listen(self.config.backlog)?;
        tracing::info!(%addr, backlog = self.config.backlog, "listening");
        Ok(Listening {
            listener,
            channel,
            config: self.config,
        })
    }

    /// Drives every state through to an established connection.
    pub fn establish<P: TransferProtocol>(self, protocol: &mut P) -> Result<Connection, TransferError> {
        let mut state = self.start()?;
        let event = state.next_event()?;
        let state = state.on_event(event)?;
        let mut state = state.accept(protocol)?;
        let event = state.next_event()?;
        Ok(state.on_event(event)?)
    }
}

/// Server waiting for a connect request.
pub struct Listening {
    listener: CmId,
    channel: EventChannel,
    config: ServerConfig,
}

impl Listening {
    /// State name.
    pub fn phase(&self) -> ServerPhase {
        ServerPhase::Listening
    }

    /// Local address of the listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next event, bounded by the accept timeout if any.
    pub fn next_event(&mut self) -> Result<CmEvent, ConnectionError> {
        let timeout = self.config.accept_timeout_ms.map(Duration::from_millis);
        Ok(self.channel.get_event(timeout)?)
    }

    /// Connect request: allocate resources in the requesting peer's device
    /// context. The request stays unacknowledged until accepted.
    pub fn on_event(self, mut event: CmEvent) -> Result<ConnectRequested, ConnectionError> {
        if event.kind() != CmEventKind::ConnectRequest {
            return Err(unexpected(event, self.phase().as_str(), CmEventKind::ConnectRequest));
        }
        let Some(id) = event.take_id() else {
            event.ack();
            return Err(VerbsError::InvalidEndpointState {
                id: self.listener.id(),
                reason: "connect request without identity",
            }
            .into());
        };
        let Some(device) = id.device() else {
            event.ack();
            return Err(VerbsError::NoDevice { id: id.id() }.into());
        };
        tracing::debug!(peer = ?id.peer_addr(), id = id.id(), "connect request");
        let Self {
            listener,
            channel,
            config,
        } = self;
        match Connection::build(Role::Server, id, Some(listener), channel, &device, config.cq_depth, config.qp) {
            Ok(conn) => Ok(ConnectRequested { conn, event, config }),
            Err(e) => {
                event.ack();
                Err(e)
            }
        }
    }
}

/// Server holding a connect request it has not answered yet.
pub struct ConnectRequested {
    conn: Connection,
    event: CmEvent,
    config: ServerConfig,
}

impl ConnectRequested {
    /// State name.
    pub fn phase(&self) -> ServerPhase {
        ServerPhase::ConnectRequested
    }

    /// The connection-to-be, for posting receives by hand.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Lets `protocol` post its receives, accepts, and acknowledges the
    /// request. The request is acknowledged on failure too.
    pub fn accept<P: TransferProtocol>(self, protocol: &mut P) -> Result<Accepting, TransferError> {
        let Self {
            mut conn,
            event,
            config,
        } = self;
        let result = protocol
            .prepare(&mut conn)
            .and_then(|()| conn.id.accept(config.conn).map_err(TransferError::from));
        event.ack();
        result?;
        Ok(Accepting { conn, config })
    }

    /// Refuses the request.
    pub fn reject(self) {
        self.conn.id.reject();
        self.event.ack();
    }
}

/// Server waiting for the connection to come up.
pub struct Accepting {
    conn: Connection,
    config: ServerConfig,
}

impl Accepting {
    /// State name.
    pub fn phase(&self) -> ServerPhase {
        ServerPhase::Accepting
    }

    /// Waits for the next event, bounded by the connect timeout.
    pub fn next_event(&mut self) -> Result<CmEvent, ConnectionError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        Ok(self.conn.channel.get_event(Some(timeout))?)
    }

    /// Established: the connection is handed over.
    pub fn on_event(self, event: CmEvent) -> Result<Connection, ConnectionError> {
        if event.kind() != CmEventKind::Established {
            return Err(unexpected(event, self.phase().as_str(), CmEventKind::Established));
        }
        event.ack();
        tracing::info!(peer = ?self.conn.id.peer_addr(), qp_num = self.conn.qp.qp_num(), "connection established");
        Ok(self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;
    use std::net::{IpAddr, Ipv4Addr};

    struct Nothing;

    impl TransferProtocol for Nothing {
        type Output = ();

        fn run(&mut self, _conn: &mut Connection) -> Result<(), TransferError> {
            Ok(())
        }
    }

    fn client_config(port: u16) -> ClientConfig {
        ClientConfig {
            peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            resolve_timeout_ms: 100,
            connect_timeout_ms: 100,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(ClientPhase::RouteResolving.to_string(), "RouteResolving");
        assert_eq!(ServerPhase::ConnectRequested.to_string(), "ConnectRequested");
        assert_eq!(Role::Server.to_string(), "server");
    }

    #[test]
    fn test_client_reaches_queue_pair_ready() {
        let fabric = Fabric::default();
        let mut state = ClientConnector::new(fabric, client_config(DEFAULT_PORT)).start().unwrap();
        assert_eq!(state.phase(), ClientPhase::AddressResolving);
        let event = state.next_event().unwrap();
        let mut state = state.on_event(event).unwrap();
        assert_eq!(state.phase(), ClientPhase::RouteResolving);
        let event = state.next_event().unwrap();
        let mut state = state.on_event(event).unwrap();
        assert_eq!(state.phase(), ClientPhase::QueuePairReady);
        let conn = state.conn_mut();
        assert_eq!(conn.role(), Role::Client);
        assert_eq!(conn.cq().capacity(), 32);
        assert_eq!(conn.caps().max_inline_data, 64);
    }

    #[test]
    fn test_client_address_error() {
        let fabric = Fabric::default();
        let config = ClientConfig {
            peer_addr: "10.0.1.37:7471".parse().unwrap(),
            ..client_config(DEFAULT_PORT)
        };
        let mut state = ClientConnector::new(fabric, config).start().unwrap();
        let event = state.next_event().unwrap();
        assert!(matches!(
            state.on_event(event),
            Err(ConnectionError::AddressResolution { .. })
        ));
    }

    #[test]
    fn test_client_unreachable_without_listener() {
        let fabric = Fabric::default();
        let err = ClientConnector::new(fabric, client_config(9999))
            .establish(&mut Nothing)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Connection(ConnectionError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_unexpected_event_is_reported() {
        let fabric = Fabric::default();
        let mut state = ClientConnector::new(fabric, client_config(DEFAULT_PORT)).start().unwrap();
        let event = state.next_event().unwrap();
        let mut route = state.on_event(event).unwrap();
        let event = route.next_event().unwrap();
        // Feed the route event to a fresh address-resolving state.
        let mut other = ClientConnector::new(Fabric::default(), client_config(DEFAULT_PORT))
            .start()
            .unwrap();
        let own = other.next_event().unwrap();
        own.ack();
        match other.on_event(event) {
            Err(ConnectionError::UnexpectedEvent { state, expected, got }) => {
                assert_eq!(state, "AddressResolving");
                assert_eq!(expected, CmEventKind::AddrResolved);
                assert_eq!(got, CmEventKind::RouteResolved);
            }
            other => panic!("expected unexpected-event error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_server_accept_timeout() {
        let fabric = Fabric::default();
        let config = ServerConfig {
            port: 7600,
            accept_timeout_ms: Some(10),
            ..ServerConfig::default()
        };
        let mut state = ServerListener::new(fabric.clone(), config).start().unwrap();
        assert!(fabric.is_listening(7600));
        assert_eq!(state.phase(), ServerPhase::Listening);
        assert_eq!(state.local_addr().map(|a| a.port()), Some(7600));
        assert!(matches!(
            state.next_event(),
            Err(ConnectionError::Verbs(VerbsError::EventTimeout { timeout_ms: 10 }))
        ));
    }

    #[test]
    fn test_server_port_in_use() {
        let fabric = Fabric::default();
        let config = ServerConfig {
            port: 7601,
            ..ServerConfig::default()
        };
        let _first = ServerListener::new(fabric.clone(), config.clone()).start().unwrap();
        assert!(matches!(
            ServerListener::new(fabric, config).start(),
            Err(ConnectionError::Verbs(VerbsError::AddressInUse { port: 7601 }))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            cq_depth: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            ClientConnector::new(Fabric::default(), config).start(),
            Err(ConnectionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_establish_both_roles() {
        let fabric = Fabric::default();
        let server_config = ServerConfig {
            port: 7602,
            accept_timeout_ms: Some(2000),
            disconnect_timeout_ms: Some(2000),
            ..ServerConfig::default()
        };
        let server_fabric = fabric.clone();
        let server = std::thread::spawn(move || {
            let mut conn = ServerListener::new(server_fabric, server_config)
                .establish(&mut Nothing)
                .unwrap();
            assert_eq!(conn.role(), Role::Server);
            conn.await_disconnect(Some(Duration::from_secs(2))).unwrap();
        });

        assert!(fabric.wait_for_listener(7602, Duration::from_secs(2)));
        let mut conn = ClientConnector::new(fabric.clone(), client_config(7602))
            .establish(&mut Nothing)
            .unwrap();
        assert!(conn.id().is_connected());
        assert_eq!(conn.qp().state(), crate::queue_pair::QpState::ReadyToSend);
        conn.disconnect().unwrap();
        server.join().unwrap();
        drop(conn);
        assert!(!fabric.is_listening(7602));
    }
}
