//! Error types for the verbs layer, the connection state machine and the
//! transfer protocols.

use thiserror::Error;

use crate::completion::{WcOpcode, WcStatus};
use crate::queue_pair::QpState;

/// Errors raised by the simulated verbs layer.
#[derive(Debug, Error)]
pub enum VerbsError {
    /// The requested local port is already bound on the fabric.
    #[error("address in use: port {port}")]
    AddressInUse {
        /// The contested port.
        port: u16,
    },

    /// The endpoint has not been bound to a device context yet.
    #[error("endpoint {id} is not bound to a device")]
    NoDevice {
        /// Endpoint number.
        id: u32,
    },

    /// The endpoint does not own a queue pair.
    #[error("endpoint {id} has no queue pair")]
    NoQueuePair {
        /// Endpoint number.
        id: u32,
    },

    /// The endpoint already owns a queue pair.
    #[error("endpoint {id} already owns a queue pair")]
    QueuePairExists {
        /// Endpoint number.
        id: u32,
    },

    /// The endpoint is in the wrong lifecycle stage for the call.
    #[error("endpoint {id}: {reason}")]
    InvalidEndpointState {
        /// Endpoint number.
        id: u32,
        /// What was wrong.
        reason: &'static str,
    },

    /// A local key does not name a region registered in the protection domain.
    #[error("invalid local key 0x{lkey:08X}")]
    InvalidLocalKey {
        /// The rejected key.
        lkey: u32,
    },

    /// A scatter/gather element reaches outside its memory region.
    #[error("scatter/gather element [{addr:#x}, +{length}) is outside region 0x{lkey:08X}")]
    SgeOutOfBounds {
        /// Start address of the element.
        addr: u64,
        /// Length of the element.
        length: u32,
        /// Local key of the region.
        lkey: u32,
    },

    /// Deregistration attempted while work requests still reference the region.
    #[error("memory region 0x{lkey:08X} has {outstanding} outstanding work requests")]
    RegionBusy {
        /// Local key of the region.
        lkey: u32,
        /// Number of outstanding references.
        outstanding: usize,
    },

    /// The region is not (or no longer) registered.
    #[error("memory region 0x{lkey:08X} is not registered")]
    RegionNotRegistered {
        /// Local key of the region.
        lkey: u32,
    },

    /// CPU-side access outside the region's buffer.
    #[error("access [{offset}, +{len}) exceeds region length {region_len}")]
    OutOfRange {
        /// Byte offset of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Length of the region.
        region_len: usize,
    },

    /// A byte length does not fit the 32-bit length fields of the transport.
    #[error("length of {len} bytes exceeds the 32-bit transport limit")]
    LengthOverflow {
        /// Offending length.
        len: usize,
    },

    /// A work queue has no room for another request.
    #[error("{queue} queue full (depth {depth})")]
    QueueFull {
        /// Which queue overflowed.
        queue: &'static str,
        /// Configured depth.
        depth: u32,
    },

    /// The queue pair cannot accept the request in its current state.
    #[error("queue pair {qp_num} is in state {state:?}")]
    InvalidQpState {
        /// Queue pair number.
        qp_num: u32,
        /// Current state.
        state: QpState,
    },

    /// Invalid queue state transition.
    #[error("queue pair {qp_num} cannot move from {from:?} to {to:?}")]
    InvalidQpTransition {
        /// Queue pair number.
        qp_num: u32,
        /// Current state.
        from: QpState,
        /// Requested state.
        to: QpState,
    },

    /// Inline payload larger than the queue pair's inline threshold.
    #[error("inline payload of {len} bytes exceeds threshold of {max} bytes")]
    InlineTooLarge {
        /// Payload length.
        len: u32,
        /// Configured threshold.
        max: u32,
    },

    /// Work request shape is not valid for the queue it was posted to.
    #[error("malformed work request: {0}")]
    MalformedRequest(&'static str),

    /// Queue pair or completion queue sizing rejected.
    #[error("invalid capability: {0}")]
    InvalidCapability(String),

    /// No CM event arrived within the bounded wait.
    #[error("timed out after {timeout_ms}ms waiting for a CM event")]
    EventTimeout {
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// A new event was requested before the previous one was acknowledged.
    #[error("previous CM event has not been acknowledged")]
    EventNotAcknowledged,

    /// A completion entry reported a non-success status.
    #[error("work request {wr_id} ({opcode:?}) completed with {status:?}")]
    CompletionFailed {
        /// Work request identifier.
        wr_id: u64,
        /// Opcode reported by the completion.
        opcode: WcOpcode,
        /// Failure status.
        status: WcStatus,
    },
}

/// Result alias for verbs-layer operations.
pub type Result<T> = std::result::Result<T, VerbsError>;

/// Errors raised while establishing or tearing down a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection manager could not resolve the peer address.
    #[error("address resolution failed for {addr}")]
    AddressResolution {
        /// Peer address.
        addr: std::net::SocketAddr,
    },

    /// The connection manager could not resolve a route to the peer.
    #[error("route resolution failed for {addr}")]
    RouteResolution {
        /// Peer address.
        addr: std::net::SocketAddr,
    },

    /// No listener answered the connect request.
    #[error("peer {addr} unreachable")]
    Unreachable {
        /// Peer address.
        addr: std::net::SocketAddr,
    },

    /// The listener refused the connect request.
    #[error("connection rejected by {addr}")]
    Rejected {
        /// Peer address.
        addr: std::net::SocketAddr,
    },

    /// An event arrived that the current state does not allow.
    #[error("unexpected CM event {got:?} in state {state}, expected {expected:?}")]
    UnexpectedEvent {
        /// State that received the event.
        state: &'static str,
        /// The event the state was waiting for.
        expected: crate::cm::CmEventKind,
        /// The event that arrived.
        got: crate::cm::CmEventKind,
    },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying verbs failure.
    #[error(transparent)]
    Verbs(#[from] VerbsError),
}

/// Errors raised by the transfer protocols.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection establishment or teardown failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A verbs call or completion failed.
    #[error(transparent)]
    Verbs(#[from] VerbsError),

    /// Record or descriptor (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A received descriptor has the wrong size.
    #[error("remote region descriptor must be {expected} bytes, got {got}")]
    DescriptorSize {
        /// Wire size of a descriptor.
        expected: usize,
        /// Received byte count.
        got: usize,
    },

    /// A record payload is not a whole number of records.
    #[error("payload of {len} bytes is not a multiple of the {record_size}-byte record size")]
    MisalignedPayload {
        /// Payload length.
        len: usize,
        /// Record wire size.
        record_size: usize,
    },

    /// The payload does not fit the destination region.
    #[error("payload of {needed} bytes does not fit a {available}-byte region")]
    RegionTooSmall {
        /// Bytes to transfer.
        needed: usize,
        /// Bytes available at the destination.
        available: usize,
    },

    /// The protocol was run without its receives having been prepared.
    #[error("{0} transfer was run before being prepared")]
    NotPrepared(crate::protocol::TransferMode),

    /// A completion of an unexpected kind arrived.
    #[error("unexpected completion {got:?}, expected {expected:?}")]
    UnexpectedCompletion {
        /// Opcode the protocol was waiting for.
        expected: WcOpcode,
        /// Opcode that arrived.
        got: WcOpcode,
    },
}
