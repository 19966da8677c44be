//! Reliable-connected queue pairs and work request execution.
//!
//! Send-side requests execute synchronously at post time against the connected
//! peer's queue pair: two-sided sends consume the peer's oldest posted receive,
//! one-sided requests resolve the remote key on the fabric. Completions land on
//! the completion queues of whichever sides the operation reports to.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::completion::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
use crate::config::QpCapabilities;
use crate::error::{Result, VerbsError};
use crate::fabric::Fabric;
use crate::memory::{AccessFlags, ProtectionDomain, RegionInner};
use crate::work_request::{WorkRequest, WrOpcode};

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    /// Freshly created.
    Reset,
    /// Receives may be posted.
    Init,
    /// Connected; receives are matched.
    ReadyToReceive,
    /// Connected; sends may be posted.
    ReadyToSend,
    /// Disconnected or destroyed; outstanding receives were flushed.
    Error,
}

impl Default for QpState {
    fn default() -> Self {
        Self::Reset
    }
}

struct PostedRecv {
    wr_id: u64,
    target: Option<(Arc<RegionInner>, usize, u32)>,
}

impl PostedRecv {
    fn capacity(&self) -> u32 {
        self.target.as_ref().map(|(_, _, len)| *len).unwrap_or(0)
    }

    fn finish(self) {
        if let Some((region, _, _)) = self.target {
            region.release();
        }
    }
}

struct QpShared {
    state: QpState,
    recv_queue: VecDeque<PostedRecv>,
    peer: Option<Weak<QpInner>>,
}

pub(crate) struct QpInner {
    qp_num: u32,
    pd: ProtectionDomain,
    cq: CompletionQueue,
    caps: QpCapabilities,
    fabric: Fabric,
    shared: Mutex<QpShared>,
}

/// Handle to a queue pair. Clones refer to the same queue pair.
#[derive(Clone)]
pub struct QueuePair {
    inner: Arc<QpInner>,
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.inner.qp_num)
            .field("state", &self.state())
            .field("cq", &self.inner.cq.id())
            .finish()
    }
}

/// Outcome of executing a send-side request: (sender status, bytes moved).
type Outcome = (WcStatus, u32);

impl QueuePair {
    /// Creates a queue pair in `pd` reporting to `cq`, and moves it to `Init`.
    pub fn create(pd: &ProtectionDomain, cq: &CompletionQueue, caps: QpCapabilities) -> Result<Self> {
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(VerbsError::InvalidCapability("work queue depth must be non-zero".to_string()));
        }
        if caps.max_send_sge == 0 || caps.max_recv_sge == 0 {
            return Err(VerbsError::InvalidCapability(
                "at least one scatter/gather element is required".to_string(),
            ));
        }
        let fabric = pd.device().fabric().clone();
        let qp = Self {
            inner: Arc::new(QpInner {
                qp_num: fabric.next_qp_num(),
                pd: pd.clone(),
                cq: cq.clone(),
                caps,
                fabric,
                shared: Mutex::new(QpShared {
                    state: QpState::Reset,
                    recv_queue: VecDeque::new(),
                    peer: None,
                }),
            }),
        };
        qp.modify(QpState::Reset, QpState::Init)?;
        tracing::debug!(qp_num = qp.inner.qp_num, pd = pd.id(), cq = cq.id(), "created queue pair");
        Ok(qp)
    }

    /// Queue pair number.
    pub fn qp_num(&self) -> u32 {
        self.inner.qp_num
    }

    /// Current state.
    pub fn state(&self) -> QpState {
        self.inner.shared.lock().state
    }

    /// Sizing the queue pair was created with.
    pub fn caps(&self) -> &QpCapabilities {
        &self.inner.caps
    }

    /// Completion queue of both work queues.
    pub fn cq(&self) -> &CompletionQueue {
        &self.inner.cq
    }

    /// Number of receives waiting to be matched.
    pub fn posted_receives(&self) -> usize {
        self.inner.shared.lock().recv_queue.len()
    }

    fn modify(&self, from: QpState, to: QpState) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        if shared.state != from {
            return Err(VerbsError::InvalidQpTransition {
                qp_num: self.inner.qp_num,
                from: shared.state,
                to,
            });
        }
        shared.state = to;
        Ok(())
    }

    /// Pairs two queue pairs and moves both through RTR to RTS.
    pub(crate) fn connect_pair(a: &QueuePair, b: &QueuePair) -> Result<()> {
        for (local, remote) in [(a, b), (b, a)] {
            local.modify(QpState::Init, QpState::ReadyToReceive)?;
            local.inner.shared.lock().peer = Some(Arc::downgrade(&remote.inner));
        }
        a.modify(QpState::ReadyToReceive, QpState::ReadyToSend)?;
        b.modify(QpState::ReadyToReceive, QpState::ReadyToSend)?;
        tracing::debug!(a = a.inner.qp_num, b = b.inner.qp_num, "queue pairs connected");
        Ok(())
    }

    /// Moves to `Error`, flushing every posted receive with `WrFlushError`
    /// when `report` is set and discarding them otherwise.
    pub(crate) fn enter_error(&self, report: bool) {
        let drained: Vec<PostedRecv> = {
            let mut shared = self.inner.shared.lock();
            shared.state = QpState::Error;
            shared.peer = None;
            shared.recv_queue.drain(..).collect()
        };
        for recv in drained {
            if report {
                self.inner.cq.push(WorkCompletion::new(
                    recv.wr_id,
                    WcStatus::WrFlushError,
                    WcOpcode::Recv,
                    0,
                    self.inner.qp_num,
                ));
            }
            recv.finish();
        }
    }

    /// Posts a receive. Allowed from `Init` on, so receives can precede the
    /// connection.
    pub fn post_recv(&self, wr: WorkRequest) -> Result<()> {
        if wr.opcode != WrOpcode::Recv {
            return Err(VerbsError::MalformedRequest("only receives go to the receive queue"));
        }
        if wr.remote.is_some() || wr.imm_data.is_some() {
            return Err(VerbsError::MalformedRequest("receive cannot carry a remote target"));
        }
        let target = match wr.sge {
            Some(sge) => {
                let (region, offset) = self.inner.pd.resolve(&sge)?;
                Some((region, offset, sge.length))
            }
            None => None,
        };
        let mut shared = self.inner.shared.lock();
        match shared.state {
            QpState::Init | QpState::ReadyToReceive | QpState::ReadyToSend => {}
            state => {
                return Err(VerbsError::InvalidQpState {
                    qp_num: self.inner.qp_num,
                    state,
                })
            }
        }
        if shared.recv_queue.len() >= self.inner.caps.max_recv_wr as usize {
            return Err(VerbsError::QueueFull {
                queue: "receive",
                depth: self.inner.caps.max_recv_wr,
            });
        }
        if let Some((region, _, _)) = &target {
            region.acquire();
        }
        shared.recv_queue.push_back(PostedRecv {
            wr_id: wr.wr_id,
            target,
        });
        Ok(())
    }

    /// Posts a send, write or read and executes it against the peer.
    pub fn post_send(&self, wr: WorkRequest) -> Result<()> {
        if wr.opcode == WrOpcode::Recv {
            return Err(VerbsError::MalformedRequest("receives go to the receive queue"));
        }
        let one_sided = matches!(
            wr.opcode,
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm | WrOpcode::RdmaRead
        );
        if one_sided && wr.remote.is_none() {
            return Err(VerbsError::MalformedRequest("one-sided request without remote target"));
        }
        if wr.opcode == WrOpcode::RdmaRead && wr.inline {
            return Err(VerbsError::MalformedRequest("reads cannot be inline"));
        }
        if wr.inline && wr.len() > self.inner.caps.max_inline_data {
            return Err(VerbsError::InlineTooLarge {
                len: wr.len(),
                max: self.inner.caps.max_inline_data,
            });
        }
        let state = self.state();
        if state != QpState::ReadyToSend {
            return Err(VerbsError::InvalidQpState {
                qp_num: self.inner.qp_num,
                state,
            });
        }
        let local = match wr.sge {
            Some(sge) => Some(self.inner.pd.resolve(&sge)?),
            None => None,
        };

        if let Some((region, _)) = &local {
            region.acquire();
        }
        let (status, byte_len) = self.execute(&wr, local.as_ref());
        if let Some((region, _)) = &local {
            region.release();
        }

        let opcode = match wr.opcode {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::Recv => WcOpcode::Recv,
        };
        if status == WcStatus::Success {
            let (sent, received) = match opcode {
                WcOpcode::RdmaRead => (0, byte_len as u64),
                _ => (byte_len as u64, 0),
            };
            self.inner.fabric.record_completed(sent, received);
        } else {
            self.inner.fabric.record_failed();
            tracing::debug!(qp_num = self.inner.qp_num, wr_id = wr.wr_id, ?status, "send-side request failed");
        }
        if wr.signaled || status != WcStatus::Success {
            let wc = WorkCompletion::new(wr.wr_id, status, opcode, byte_len, self.inner.qp_num);
            if !self.inner.cq.push(wc) {
                self.enter_error(false);
            }
        }
        Ok(())
    }

    fn peer(&self) -> Option<QueuePair> {
        let shared = self.inner.shared.lock();
        shared
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| QueuePair { inner })
    }

    fn take_recv(&self) -> std::result::Result<PostedRecv, WcStatus> {
        let mut shared = self.inner.shared.lock();
        match shared.state {
            QpState::ReadyToReceive | QpState::ReadyToSend => {}
            _ => return Err(WcStatus::RetryExceeded),
        }
        shared.recv_queue.pop_front().ok_or(WcStatus::ReceiverNotReady)
    }

    fn complete_recv(&self, recv: PostedRecv, status: WcStatus, opcode: WcOpcode, byte_len: u32, imm: Option<u32>) {
        let wc = WorkCompletion::new(recv.wr_id, status, opcode, byte_len, self.inner.qp_num).with_imm(imm);
        recv.finish();
        if !self.inner.cq.push(wc) {
            self.enter_error(false);
        }
    }

    fn execute(&self, wr: &WorkRequest, local: Option<&(Arc<RegionInner>, usize)>) -> Outcome {
        let len = wr.len();
        if self.inner.fabric.should_fail() {
            return (WcStatus::RetryExceeded, 0);
        }
        let Some(peer) = self.peer() else {
            return (WcStatus::RetryExceeded, 0);
        };
        match wr.opcode {
            WrOpcode::Send => {
                let data = read_local(local, len);
                self.execute_send(&peer, &data)
            }
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => {
                let data = read_local(local, len);
                self.execute_write(&peer, wr, &data)
            }
            WrOpcode::RdmaRead => self.execute_read(&peer, wr, local),
            WrOpcode::Recv => (WcStatus::RemoteOperationError, 0),
        }
    }

    fn execute_send(&self, peer: &QueuePair, data: &[u8]) -> Outcome {
        let recv = match peer.take_recv() {
            Ok(recv) => recv,
            Err(status) => return (status, 0),
        };
        // Gathered through one SGE, so it fits in u32.
        let len = data.len() as u32;
        if len > recv.capacity() {
            peer.complete_recv(recv, WcStatus::LocalLengthError, WcOpcode::Recv, 0, None);
            return (WcStatus::RemoteOperationError, 0);
        }
        if let Some((region, offset, _)) = &recv.target {
            if !region.access.contains(AccessFlags::LOCAL_WRITE) {
                peer.complete_recv(recv, WcStatus::LocalProtectionError, WcOpcode::Recv, 0, None);
                return (WcStatus::RemoteOperationError, 0);
            }
            region.write(*offset, data);
        }
        peer.complete_recv(recv, WcStatus::Success, WcOpcode::Recv, len, None);
        (WcStatus::Success, len)
    }

    fn execute_write(&self, peer: &QueuePair, wr: &WorkRequest, data: &[u8]) -> Outcome {
        let Some(remote) = wr.remote else {
            return (WcStatus::RemoteOperationError, 0);
        };
        let len = data.len() as u32;
        let Some((dst, offset)) = self.resolve_remote(peer, remote.rkey, remote.addr, len, AccessFlags::REMOTE_WRITE)
        else {
            return (WcStatus::RemoteAccessError, 0);
        };
        let notify = if wr.opcode == WrOpcode::RdmaWriteWithImm {
            match peer.take_recv() {
                Ok(recv) => Some(recv),
                Err(status) => return (status, 0),
            }
        } else {
            None
        };
        dst.write(offset, data);
        if let Some(recv) = notify {
            peer.complete_recv(recv, WcStatus::Success, WcOpcode::RecvRdmaWithImm, len, wr.imm_data);
        }
        (WcStatus::Success, len)
    }

    fn execute_read(&self, peer: &QueuePair, wr: &WorkRequest, local: Option<&(Arc<RegionInner>, usize)>) -> Outcome {
        let Some(remote) = wr.remote else {
            return (WcStatus::RemoteOperationError, 0);
        };
        let len = wr.len();
        if let Some((region, _)) = local {
            if !region.access.contains(AccessFlags::LOCAL_WRITE) {
                return (WcStatus::LocalProtectionError, 0);
            }
        }
        let Some((src, offset)) = self.resolve_remote(peer, remote.rkey, remote.addr, len, AccessFlags::REMOTE_READ)
        else {
            return (WcStatus::RemoteAccessError, 0);
        };
        let data = src.read(offset, len as usize);
        if let Some((region, local_offset)) = local {
            region.write(*local_offset, &data);
        }
        (WcStatus::Success, len)
    }

    /// Validates a remote key against the peer's protection domain, the
    /// required right and the addressed range.
    fn resolve_remote(
        &self,
        peer: &QueuePair,
        rkey: u32,
        addr: u64,
        len: u32,
        required: AccessFlags,
    ) -> Option<(Arc<RegionInner>, usize)> {
        let region = self.inner.fabric.lookup_remote(rkey)?;
        if !region.is_registered() || region.pd_id != peer.inner.pd.id() || !region.access.contains(required) {
            return None;
        }
        let offset = region.offset_of(addr, len as u64)?;
        Some((region, offset))
    }
}

fn read_local(local: Option<&(Arc<RegionInner>, usize)>, len: u32) -> Vec<u8> {
    match local {
        Some((region, offset)) => region.read(*offset, len as usize),
        None => Vec::new(),
    }
}
