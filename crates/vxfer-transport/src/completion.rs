//! Completion queues and the blocking wait-for-one-completion primitive.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, VerbsError};

static CQ_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Status carried by a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    /// The work request finished successfully.
    Success,
    /// Incoming payload larger than the posted receive buffer.
    LocalLengthError,
    /// Local region missing the access right the operation needs.
    LocalProtectionError,
    /// Peer rejected the remote key, address range or access right.
    RemoteAccessError,
    /// Peer could not process the request (e.g. its receive overflowed).
    RemoteOperationError,
    /// Send arrived while the peer had no receive posted.
    ReceiverNotReady,
    /// Transport gave up delivering the request.
    RetryExceeded,
    /// Request flushed because the queue pair entered the error state.
    WrFlushError,
}

impl Default for WcStatus {
    fn default() -> Self {
        Self::Success
    }
}

/// Operation reported by a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    /// Two-sided send.
    Send,
    /// One-sided write, with or without immediate data.
    RdmaWrite,
    /// One-sided read.
    RdmaRead,
    /// Receive matched by a two-sided send.
    Recv,
    /// Receive consumed by a write-with-immediate.
    RecvRdmaWithImm,
}

/// One completion entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Identifier of the completed work request.
    pub wr_id: u64,
    /// Result status.
    pub status: WcStatus,
    /// Completed operation.
    pub opcode: WcOpcode,
    /// Bytes moved by the operation.
    pub byte_len: u32,
    /// Immediate data delivered with the operation.
    pub imm_data: Option<u32>,
    /// Queue pair that produced the entry.
    pub qp_num: u32,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            imm_data: None,
            qp_num,
        }
    }

    pub(crate) fn with_imm(mut self, imm: Option<u32>) -> Self {
        self.imm_data = imm;
        self
    }

    /// Returns whether the entry reports success.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// Converts a failed entry into an error.
    pub fn check(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(VerbsError::CompletionFailed {
                wr_id: self.wr_id,
                opcode: self.opcode,
                status: self.status,
            })
        }
    }
}

struct CqInner {
    id: u64,
    capacity: usize,
    entries: Mutex<VecDeque<WorkCompletion>>,
}

/// Completion queue shared by a queue pair's send and receive sides.
///
/// Handles are cheap clones of one queue.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<CqInner>,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.len())
            .finish()
    }
}

impl CompletionQueue {
    /// Creates a completion queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VerbsError::InvalidCapability(
                "completion queue depth must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(CqInner {
                id: CQ_COUNTER.fetch_add(1, Ordering::Relaxed),
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
        })
    }

    /// Queue identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of entries waiting to be consumed.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns whether no entries are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an entry. Returns false on overrun.
    pub(crate) fn push(&self, entry: WorkCompletion) -> bool {
        let mut entries = self.inner.entries.lock();
        if entries.len() >= self.inner.capacity {
            tracing::error!(cq = self.inner.id, wr_id = entry.wr_id, "completion queue overrun");
            return false;
        }
        entries.push_back(entry);
        true
    }

    /// Removes and returns one entry, if any.
    pub fn poll(&self) -> Option<WorkCompletion> {
        self.inner.entries.lock().pop_front()
    }

    /// Removes up to `max` entries.
    pub fn poll_batch(&self, max: usize) -> Vec<WorkCompletion> {
        let mut entries = self.inner.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Spins until one entry is available and returns it, failing if the
    /// entry reports a non-success status.
    ///
    /// There is no timeout: a posted request always produces an entry, either
    /// on completion or when its queue pair is flushed.
    pub fn wait_one(&self) -> Result<WorkCompletion> {
        let mut spins: u32 = 0;
        loop {
            if let Some(wc) = self.poll() {
                tracing::trace!(cq = self.inner.id, wr_id = wc.wr_id, opcode = ?wc.opcode, status = ?wc.status, spins, "completion");
                return wc.check();
            }
            spins = spins.wrapping_add(1);
            std::thread::yield_now();
        }
    }
}
