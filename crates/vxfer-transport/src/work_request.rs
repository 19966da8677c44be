//! Work request construction and posting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::queue_pair::QueuePair;

static WR_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Scatter/gather element: one contiguous slice of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sge {
    /// Start address inside the region.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the region.
    pub lkey: u32,
}

/// Peer memory targeted by a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Remote virtual address.
    pub addr: u64,
    /// Remote key authorizing the access.
    pub rkey: u32,
}

/// Operation of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    /// Two-sided send.
    Send,
    /// Receive buffer for a two-sided send or a write-with-immediate.
    Recv,
    /// One-sided write.
    RdmaWrite,
    /// One-sided write that also consumes a receive at the peer.
    RdmaWriteWithImm,
    /// One-sided read.
    RdmaRead,
}

/// A request to post to a queue pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Identifier echoed by the completion.
    pub wr_id: u64,
    /// Operation.
    pub opcode: WrOpcode,
    /// Local buffer; absent for zero-length requests.
    pub sge: Option<Sge>,
    /// Target of a one-sided request.
    pub remote: Option<RemoteTarget>,
    /// Immediate data of a write-with-immediate.
    pub imm_data: Option<u32>,
    /// Whether a successful completion is reported to the local queue.
    pub signaled: bool,
    /// Whether the payload is copied at post time.
    pub inline: bool,
}

impl WorkRequest {
    fn new(opcode: WrOpcode, sge: Option<Sge>) -> Self {
        Self {
            wr_id: WR_COUNTER.fetch_add(1, Ordering::Relaxed),
            opcode,
            sge,
            remote: None,
            imm_data: None,
            signaled: true,
            inline: false,
        }
    }

    /// Receive into `sge`.
    pub fn recv(sge: Sge) -> Self {
        Self::new(WrOpcode::Recv, Some(sge))
    }

    /// Zero-length receive, consumed only by a write-with-immediate or an
    /// empty send.
    pub fn recv_notification() -> Self {
        Self::new(WrOpcode::Recv, None)
    }

    /// Send the bytes described by `sge`.
    pub fn send(sge: Sge) -> Self {
        Self::new(WrOpcode::Send, Some(sge))
    }

    /// Write the bytes described by `sge` to `remote`.
    pub fn write(sge: Sge, remote: RemoteTarget) -> Self {
        let mut wr = Self::new(WrOpcode::RdmaWrite, Some(sge));
        wr.remote = Some(remote);
        wr
    }

    /// Write to `remote` and deliver `imm` with a completion at the peer.
    pub fn write_with_imm(sge: Sge, remote: RemoteTarget, imm: u32) -> Self {
        let mut wr = Self::new(WrOpcode::RdmaWriteWithImm, Some(sge));
        wr.remote = Some(remote);
        wr.imm_data = Some(imm);
        wr
    }

    /// Read `sge.length` bytes from `remote` into `sge`.
    pub fn read(sge: Sge, remote: RemoteTarget) -> Self {
        let mut wr = Self::new(WrOpcode::RdmaRead, Some(sge));
        wr.remote = Some(remote);
        wr
    }

    /// Overrides the generated identifier.
    pub fn with_wr_id(mut self, wr_id: u64) -> Self {
        self.wr_id = wr_id;
        self
    }

    /// Sets whether success is reported locally.
    pub fn signaled(mut self, signaled: bool) -> Self {
        self.signaled = signaled;
        self
    }

    /// Requests the inline payload path.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    /// Payload length.
    pub fn len(&self) -> u32 {
        self.sge.map(|s| s.length).unwrap_or(0)
    }

    /// Returns whether the request carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Posts to the receive queue for `Recv`, to the send queue otherwise.
    /// Returns the work request identifier.
    pub fn post(self, qp: &QueuePair) -> Result<u64> {
        let wr_id = self.wr_id;
        match self.opcode {
            WrOpcode::Recv => qp.post_recv(self)?,
            _ => qp.post_send(self)?,
        }
        Ok(wr_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sge() -> Sge {
        Sge {
            addr: 0x1000,
            length: 64,
            lkey: 0x4000_0001,
        }
    }

    #[test]
    fn test_work_request_id_unique() {
        let wr1 = WorkRequest::send(sge());
        let wr2 = WorkRequest::recv(sge());
        let wr3 = WorkRequest::recv_notification();
        assert_ne!(wr1.wr_id, wr2.wr_id);
        assert_ne!(wr2.wr_id, wr3.wr_id);
    }

    #[test]
    fn test_builders() {
        let remote = RemoteTarget {
            addr: 0x2000,
            rkey: 0x8000_0002,
        };
        let wr = WorkRequest::write_with_imm(sge(), remote, 48)
            .with_wr_id(99)
            .signaled(false);
        assert_eq!(wr.opcode, WrOpcode::RdmaWriteWithImm);
        assert_eq!(wr.remote, Some(remote));
        assert_eq!(wr.imm_data, Some(48));
        assert_eq!(wr.wr_id, 99);
        assert!(!wr.signaled);

        let rd = WorkRequest::read(sge(), remote);
        assert_eq!(rd.opcode, WrOpcode::RdmaRead);
        assert!(rd.signaled);
        assert!(rd.imm_data.is_none());
    }

    #[test]
    fn test_notification_receive_is_empty() {
        let wr = WorkRequest::recv_notification();
        assert!(wr.is_empty());
        assert_eq!(wr.len(), 0);
        assert!(wr.sge.is_none());
        assert_eq!(WorkRequest::send(sge()).inline(true).len(), 64);
    }
}
