#![warn(missing_docs)]

//! vxfer transport: zero-copy record transfer over a queue-pair based RDMA
//! transport.
//!
//! The crate layers a connection lifecycle state machine and four transfer
//! protocols (two-sided send, remote write, remote read, each optionally
//! filtered) over a verbs-style API: protection domains, memory regions,
//! completion queues, queue pairs and a connection manager. The verbs layer
//! runs on an in-process simulated fabric so both roles can share one process.

pub mod cm;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod metrics;
pub mod protocol;
pub mod queue_pair;
pub mod record;
pub mod session;
pub mod transfer;
pub mod work_request;

pub use cm::{CmEvent, CmEventKind, CmId, EventChannel};
pub use completion::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
pub use config::{ClientConfig, ConnParams, QpCapabilities, ServerConfig, TransferConfig, DEFAULT_PORT};
pub use connection::{ClientConnector, ClientPhase, Connection, Role, ServerListener, ServerPhase};
pub use error::{ConnectionError, TransferError, VerbsError};
pub use fabric::{DeviceContext, Fabric, FabricConfig, FabricStats};
pub use memory::{AccessFlags, MemoryRegion, MemoryRegistry, ProtectionDomain};
pub use metrics::TransferStats;
pub use protocol::{
    FilterPolicy, RemoteRegionDescriptor, TransferMode, TransferProtocol, WriteRequest, DESCRIPTOR_WIRE_SIZE,
    WRITE_REQUEST_MAX_WIRE_SIZE,
};
pub use queue_pair::{QpState, QueuePair};
pub use record::{Record, RECORD_SIZE};
pub use session::{ClientSession, ServerSession};
pub use transfer::{ClientOutcome, ClientTransfer, ServerTransfer};
pub use work_request::{RemoteTarget, Sge, WorkRequest, WrOpcode};
