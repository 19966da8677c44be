//! Connection manager: endpoint identities and their event channels.
//!
//! A `CmId` is the transport-level identity of one endpoint. Address and route
//! resolution, listening, connecting, accepting and disconnecting all report
//! their outcome asynchronously as events on the identity's `EventChannel`.
//! Every event must be acknowledged before the next one is requested.
//!
//! Lock discipline: an identity's state lock is never held while another
//! identity's lock or a channel lock is taken.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::completion::CompletionQueue;
use crate::config::{ConnParams, QpCapabilities};
use crate::error::{Result, VerbsError};
use crate::fabric::{ConnectRoute, DeviceContext, Fabric};
use crate::memory::ProtectionDomain;
use crate::queue_pair::QueuePair;

static CM_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Kind of a connection manager event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    /// Address resolution finished; the identity is bound to a device.
    AddrResolved,
    /// Address resolution failed.
    AddrError,
    /// Route resolution finished.
    RouteResolved,
    /// Route resolution failed.
    RouteError,
    /// A peer asked a listener to connect. Carries the new identity.
    ConnectRequest,
    /// No listener answered the connect request.
    Unreachable,
    /// The listener refused the connect request.
    Rejected,
    /// The connection is up.
    Established,
    /// The connection went down.
    Disconnected,
}

struct QueuedEvent {
    kind: CmEventKind,
    id: Option<CmId>,
}

struct ChannelState {
    events: VecDeque<QueuedEvent>,
    unacked: bool,
}

pub(crate) struct ChannelInner {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

impl ChannelInner {
    fn push(&self, kind: CmEventKind, id: Option<CmId>) {
        self.state.lock().events.push_back(QueuedEvent { kind, id });
        self.ready.notify_one();
    }
}

/// Ordered source of connection manager events.
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventChannel")
            .field("pending", &state.events.len())
            .field("unacked", &state.unacked)
            .finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    events: VecDeque::new(),
                    unacked: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Blocks for the next event, at most `timeout` when one is given.
    ///
    /// Fails with `EventNotAcknowledged` while the previously returned event
    /// has not been acknowledged.
    pub fn get_event(&mut self, timeout: Option<Duration>) -> Result<CmEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        if state.unacked {
            return Err(VerbsError::EventNotAcknowledged);
        }
        loop {
            if let Some(event) = state.events.pop_front() {
                state.unacked = true;
                tracing::trace!(kind = ?event.kind, "cm event");
                return Ok(CmEvent {
                    kind: event.kind,
                    id: event.id,
                    channel: self.inner.clone(),
                });
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.ready.wait_until(&mut state, deadline).timed_out() && state.events.is_empty() {
                        return Err(VerbsError::EventTimeout {
                            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                        });
                    }
                }
                None => self.inner.ready.wait(&mut state),
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        // Queued events may hold identities that refer back to this channel.
        let drained: Vec<QueuedEvent> = self.inner.state.lock().events.drain(..).collect();
        drop(drained);
    }
}

/// One event taken from an `EventChannel`.
pub struct CmEvent {
    kind: CmEventKind,
    id: Option<CmId>,
    channel: Arc<ChannelInner>,
}

impl std::fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("id", &self.id.as_ref().map(CmId::id))
            .finish()
    }
}

impl CmEvent {
    /// Event kind.
    pub fn kind(&self) -> CmEventKind {
        self.kind
    }

    /// Takes the identity created for a connect request.
    pub fn take_id(&mut self) -> Option<CmId> {
        self.id.take()
    }

    /// Acknowledges the event, allowing the next one to be requested.
    pub fn ack(self) {
        self.channel.state.lock().unacked = false;
    }
}

#[derive(Default)]
struct CmIdState {
    device: Option<DeviceContext>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    route_resolved: bool,
    bound_port: Option<u16>,
    listening: bool,
    qp: Option<QueuePair>,
    remote: Option<Weak<CmIdInner>>,
    connected: bool,
    requested: Option<ConnParams>,
    pending_request_port: Option<u16>,
}

pub(crate) struct CmIdInner {
    id: u32,
    fabric: Fabric,
    channel: Arc<ChannelInner>,
    state: Mutex<CmIdState>,
}

impl CmIdInner {
    fn notify(&self, kind: CmEventKind, id: Option<CmId>) {
        self.channel.push(kind, id);
    }

    /// Breaks the connection on this side and on the peer's side, flushing
    /// both queue pairs. Returns false when there was nothing to break.
    fn break_connection(&self) -> bool {
        let (qp, remote) = {
            let mut state = self.state.lock();
            if !state.connected {
                return false;
            }
            state.connected = false;
            (state.qp.clone(), state.remote.take())
        };
        if let Some(qp) = qp {
            qp.enter_error(true);
        }
        self.notify(CmEventKind::Disconnected, None);

        if let Some(peer) = remote.and_then(|w| w.upgrade()) {
            let peer_qp = {
                let mut state = peer.state.lock();
                if state.connected {
                    state.connected = false;
                    state.remote = None;
                    Some(state.qp.clone())
                } else {
                    None
                }
            };
            if let Some(peer_qp) = peer_qp {
                if let Some(qp) = peer_qp {
                    qp.enter_error(true);
                }
                peer.notify(CmEventKind::Disconnected, None);
            }
        }
        tracing::debug!(id = self.id, "disconnected");
        true
    }

    fn reject_pending(&self) {
        let (port, remote) = {
            let mut state = self.state.lock();
            (state.pending_request_port.take(), state.remote.take())
        };
        if let Some(port) = port {
            self.fabric.request_settled(port);
            if let Some(client) = remote.and_then(|w| w.upgrade()) {
                client.notify(CmEventKind::Rejected, None);
            }
            tracing::debug!(id = self.id, port, "connect request rejected");
        }
    }
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        self.break_connection();
        self.reject_pending();
        let state = self.state.get_mut();
        if let Some(qp) = state.qp.take() {
            qp.enter_error(false);
        }
        if let Some(port) = state.bound_port.take() {
            self.fabric.release_port(port);
        }
    }
}

/// Transport-level identity of one endpoint.
///
/// Clones refer to the same identity; the identity is destroyed when the last
/// handle goes away, breaking any connection it still holds.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl std::fmt::Debug for CmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CmId")
            .field("id", &self.inner.id)
            .field("local_addr", &state.local_addr)
            .field("peer_addr", &state.peer_addr)
            .field("connected", &state.connected)
            .finish()
    }
}

impl CmId {
    /// Creates an identity reporting to `channel`.
    pub fn create(fabric: &Fabric, channel: &EventChannel) -> Self {
        Self::with_state(fabric, channel.inner.clone(), CmIdState::default())
    }

    fn with_state(fabric: &Fabric, channel: Arc<ChannelInner>, state: CmIdState) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                id: CM_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                fabric: fabric.clone(),
                channel,
                state: Mutex::new(state),
            }),
        }
    }

    /// Identity number.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Device the identity is bound to, once resolved, bound or requested.
    pub fn device(&self) -> Option<DeviceContext> {
        self.inner.state.lock().device.clone()
    }

    /// Local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().local_addr
    }

    /// Peer address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().peer_addr
    }

    /// Queue pair owned by the identity.
    pub fn qp(&self) -> Option<QueuePair> {
        self.inner.state.lock().qp.clone()
    }

    /// Parameters the peer asked for in its connect request.
    pub fn requested_params(&self) -> Option<ConnParams> {
        self.inner.state.lock().requested
    }

    /// Returns whether the connection is up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    fn invalid(&self, reason: &'static str) -> VerbsError {
        VerbsError::InvalidEndpointState {
            id: self.inner.id,
            reason,
        }
    }

    /// Starts resolving `dst`. Reports `AddrResolved` or `AddrError`.
    pub fn resolve_addr(&self, dst: SocketAddr) -> Result<()> {
        let fabric = &self.inner.fabric;
        let kind = {
            let mut state = self.inner.state.lock();
            if state.device.is_some() {
                return Err(self.invalid("address already resolved"));
            }
            state.peer_addr = Some(dst);
            if fabric.is_reachable(dst.ip()) {
                state.device = Some(fabric.device());
                state.local_addr = Some(fabric.ephemeral_addr());
                CmEventKind::AddrResolved
            } else {
                CmEventKind::AddrError
            }
        };
        tracing::debug!(id = self.inner.id, %dst, ?kind, "address resolution");
        self.inner.notify(kind, None);
        Ok(())
    }

    /// Starts resolving the route to the resolved address. Reports
    /// `RouteResolved` or `RouteError`.
    pub fn resolve_route(&self) -> Result<()> {
        let kind = {
            let mut state = self.inner.state.lock();
            if state.device.is_none() {
                return Err(self.invalid("address not resolved"));
            }
            match state.peer_addr {
                Some(peer) if peer.port() != 0 => {
                    state.route_resolved = true;
                    CmEventKind::RouteResolved
                }
                _ => CmEventKind::RouteError,
            }
        };
        self.inner.notify(kind, None);
        Ok(())
    }

    /// Binds `addr` on the fabric.
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        {
            let state = self.inner.state.lock();
            if state.bound_port.is_some() || state.device.is_some() {
                return Err(self.invalid("already bound"));
            }
        }
        self.inner.fabric.bind_port(addr.port(), Arc::downgrade(&self.inner))?;
        let mut state = self.inner.state.lock();
        state.bound_port = Some(addr.port());
        state.local_addr = Some(addr);
        state.device = Some(self.inner.fabric.device());
        Ok(())
    }

    /// Starts accepting connect requests on the bound port.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        let port = {
            let mut state = self.inner.state.lock();
            let Some(port) = state.bound_port else {
                return Err(self.invalid("listen before bind"));
            };
            state.listening = true;
            port
        };
        if !self.inner.fabric.set_listening(port, backlog) {
            return Err(self.invalid("binding lost"));
        }
        tracing::debug!(id = self.inner.id, port, backlog, "listening");
        Ok(())
    }

    /// Creates the identity's queue pair in `pd`, reporting to `cq`.
    pub fn create_qp(&self, pd: &ProtectionDomain, cq: &CompletionQueue, caps: QpCapabilities) -> Result<QueuePair> {
        let mut state = self.inner.state.lock();
        if state.device.is_none() {
            return Err(VerbsError::NoDevice { id: self.inner.id });
        }
        if state.listening {
            return Err(self.invalid("listening identities carry no queue pair"));
        }
        if state.qp.is_some() {
            return Err(VerbsError::QueuePairExists { id: self.inner.id });
        }
        let qp = QueuePair::create(pd, cq, caps)?;
        state.qp = Some(qp.clone());
        Ok(qp)
    }

    /// Destroys the queue pair, discarding any outstanding receives.
    pub fn destroy_qp(&self) {
        let qp = self.inner.state.lock().qp.take();
        if let Some(qp) = qp {
            qp.enter_error(false);
            tracing::debug!(id = self.inner.id, qp_num = qp.qp_num(), "destroyed queue pair");
        }
    }

    /// Sends a connect request to the resolved peer. Reports `Established`,
    /// `Unreachable` or `Rejected`.
    pub fn connect(&self, params: ConnParams) -> Result<()> {
        let (peer, local) = {
            let state = self.inner.state.lock();
            if !state.route_resolved {
                return Err(self.invalid("route not resolved"));
            }
            if state.qp.is_none() {
                return Err(VerbsError::NoQueuePair { id: self.inner.id });
            }
            if state.connected || state.remote.is_some() {
                return Err(self.invalid("connect already issued"));
            }
            match state.peer_addr {
                Some(peer) => (peer, state.local_addr),
                None => return Err(self.invalid("no peer address")),
            }
        };
        let fabric = &self.inner.fabric;
        let listener = match fabric.route_connect(peer.port()) {
            ConnectRoute::NoListener => {
                tracing::debug!(id = self.inner.id, %peer, "no listener");
                self.inner.notify(CmEventKind::Unreachable, None);
                return Ok(());
            }
            ConnectRoute::BacklogFull => {
                tracing::debug!(id = self.inner.id, %peer, "listener backlog full");
                self.inner.notify(CmEventKind::Rejected, None);
                return Ok(());
            }
            ConnectRoute::Listener(listener) => listener,
        };
        let listener_addr = listener.state.lock().local_addr;
        let request = Self::with_state(
            fabric,
            listener.channel.clone(),
            CmIdState {
                device: Some(fabric.device()),
                local_addr: listener_addr,
                peer_addr: local,
                remote: Some(Arc::downgrade(&self.inner)),
                requested: Some(params),
                pending_request_port: Some(peer.port()),
                ..CmIdState::default()
            },
        );
        self.inner.state.lock().remote = Some(Arc::downgrade(&request.inner));
        tracing::debug!(id = self.inner.id, request = request.id(), %peer, "connect request sent");
        listener.notify(CmEventKind::ConnectRequest, Some(request));
        Ok(())
    }

    /// Accepts the connect request this identity was created for.
    pub fn accept(&self, params: ConnParams) -> Result<()> {
        let (qp, remote, port) = {
            let state = self.inner.state.lock();
            let Some(port) = state.pending_request_port else {
                return Err(self.invalid("no pending connect request"));
            };
            let Some(qp) = state.qp.clone() else {
                return Err(VerbsError::NoQueuePair { id: self.inner.id });
            };
            (qp, state.remote.clone(), port)
        };
        let Some(client) = remote.and_then(|w| w.upgrade()) else {
            self.inner.state.lock().pending_request_port = None;
            self.inner.fabric.request_settled(port);
            return Err(self.invalid("peer went away"));
        };
        let Some(client_qp) = client.state.lock().qp.clone() else {
            return Err(VerbsError::NoQueuePair { id: client.id });
        };
        QueuePair::connect_pair(&qp, &client_qp)?;
        {
            let mut state = self.inner.state.lock();
            state.pending_request_port = None;
            state.connected = true;
        }
        client.state.lock().connected = true;
        self.inner.fabric.request_settled(port);
        tracing::debug!(
            id = self.inner.id,
            peer = client.id,
            initiator_depth = params.initiator_depth,
            responder_resources = params.responder_resources,
            "connection accepted"
        );
        self.inner.notify(CmEventKind::Established, None);
        client.notify(CmEventKind::Established, None);
        Ok(())
    }

    /// Refuses the connect request this identity was created for.
    pub fn reject(&self) {
        self.inner.reject_pending();
    }

    /// Breaks the connection. Both sides observe `Disconnected` and their
    /// outstanding receives are flushed.
    pub fn disconnect(&self) -> Result<()> {
        if self.inner.break_connection() {
            Ok(())
        } else {
            Err(self.invalid("not connected"))
        }
    }
}
