//! The record transfer protocols.
//!
//! The server always holds the record set. Depending on the mode it sends the
//! records, writes them into a region the client advertised, or advertises
//! its own region for the client to read. Filtering happens at whichever side
//! the [`FilterPolicy`] names.

use crate::completion::{WcOpcode, WorkCompletion};
use crate::connection::{Connection, Role};
use crate::error::{TransferError, VerbsError};
use crate::memory::{AccessFlags, MemoryRegion};
use crate::metrics::{TransferStats, TransferTimer};
use crate::protocol::{
    FilterPolicy, RemoteRegionDescriptor, TransferMode, TransferProtocol, WriteRequest, DESCRIPTOR_WIRE_SIZE,
    WRITE_REQUEST_MAX_WIRE_SIZE,
};
use crate::record::{self, Record, RECORD_SIZE};
use crate::work_request::WorkRequest;

/// Smallest receive buffer of the send mode.
pub const MIN_RECV_BUFFER: usize = 256;

fn expect_completion(conn: &Connection, expected: WcOpcode) -> Result<WorkCompletion, TransferError> {
    let wc = conn.wait_completion()?;
    if wc.opcode != expected {
        return Err(TransferError::UnexpectedCompletion {
            expected,
            got: wc.opcode,
        });
    }
    Ok(wc)
}

/// Posts a send of `payload`, inline when it fits the threshold.
fn send_bytes(conn: &mut Connection, payload: Vec<u8>) -> Result<(), TransferError> {
    let inline = payload.len() <= conn.caps().max_inline_data as usize;
    let mr = conn.register(payload, AccessFlags::LOCAL_READ)?;
    conn.post(WorkRequest::send(mr.sge()).inline(inline))?;
    expect_completion(conn, WcOpcode::Send)?;
    conn.deregister(&mr)?;
    Ok(())
}

/// Server side: holds the records and moves them per the configured mode.
#[derive(Debug)]
pub struct ServerTransfer {
    mode: TransferMode,
    filter: FilterPolicy,
    records: Vec<Record>,
    request: Option<MemoryRegion>,
}

impl ServerTransfer {
    /// Creates the server protocol over `records`.
    pub fn new(mode: TransferMode, filter: FilterPolicy, records: Vec<Record>) -> Self {
        Self {
            mode,
            filter,
            records,
            request: None,
        }
    }

    fn outgoing(&self, key: Option<u32>) -> Vec<Record> {
        match key {
            Some(key) => record::filter(&self.records, key),
            None => self.records.clone(),
        }
    }

    fn send_records(&mut self, conn: &mut Connection) -> Result<usize, TransferError> {
        let outgoing = self.outgoing(self.filter.server_key());
        send_bytes(conn, record::encode(&outgoing)?)?;
        Ok(outgoing.len())
    }

    fn write_records(&mut self, conn: &mut Connection) -> Result<usize, TransferError> {
        let request_mr = self.request.take().ok_or(TransferError::NotPrepared(self.mode))?;
        let wc = expect_completion(conn, WcOpcode::Recv)?;
        let request = WriteRequest::decode(&request_mr.read_at(0, wc.byte_len as usize)?)?;
        conn.deregister(&request_mr)?;
        let desc = request.region;
        tracing::debug!(
            addr = format_args!("{:#x}", desc.addr),
            rkey = desc.rkey,
            len = desc.len,
            key = ?request.key,
            "write request received"
        );

        // A key requested by the client replaces the configured one.
        let key = self.filter.server_key().map(|configured| request.key.unwrap_or(configured));
        let outgoing = self.outgoing(key);
        let payload = record::encode(&outgoing)?;
        if payload.len() > desc.len as usize {
            return Err(TransferError::RegionTooSmall {
                needed: payload.len(),
                available: desc.len as usize,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| VerbsError::LengthOverflow { len: payload.len() })?;
        let mr = conn.register(payload, AccessFlags::LOCAL_READ)?;
        conn.post(WorkRequest::write_with_imm(mr.sge(), desc.target(), len))?;
        expect_completion(conn, WcOpcode::RdmaWrite)?;
        conn.deregister(&mr)?;
        Ok(outgoing.len())
    }

    fn publish_records(&mut self, conn: &mut Connection) -> Result<usize, TransferError> {
        let outgoing = self.outgoing(self.filter.server_key());
        let payload = record::encode(&outgoing)?;
        let len = payload.len();
        // Stays registered until the connection is dropped, after the peer's read.
        let source = conn.register(payload, AccessFlags::LOCAL_READ | AccessFlags::REMOTE_READ)?;
        let desc = RemoteRegionDescriptor::for_region(&source, len)?;
        tracing::debug!(addr = format_args!("{:#x}", desc.addr), rkey = desc.rkey, len, "publishing descriptor");
        send_bytes(conn, desc.encode()?)?;
        Ok(outgoing.len())
    }
}

impl TransferProtocol for ServerTransfer {
    type Output = TransferStats;

    fn prepare(&mut self, conn: &mut Connection) -> Result<(), TransferError> {
        if self.mode == TransferMode::Write {
            let mr = conn.register(vec![0u8; WRITE_REQUEST_MAX_WIRE_SIZE], AccessFlags::LOCAL_WRITE)?;
            conn.post(WorkRequest::recv(mr.sge()))?;
            self.request = Some(mr);
        }
        Ok(())
    }

    fn run(&mut self, conn: &mut Connection) -> Result<TransferStats, TransferError> {
        let timer = TransferTimer::start(Role::Server, self.mode, self.filter);
        let moved = match self.mode {
            TransferMode::Send => self.send_records(conn)?,
            TransferMode::Write => self.write_records(conn)?,
            TransferMode::Read => self.publish_records(conn)?,
        };
        tracing::debug!(mode = %self.mode, records = moved, "server transfer");
        Ok(timer.finish(self.records.len(), moved, moved))
    }
}

/// What the client ended up with.
#[derive(Debug, Clone)]
pub struct ClientOutcome {
    /// Records after any client-side filtering.
    pub records: Vec<Record>,
    /// Transfer statistics.
    pub stats: TransferStats,
}

/// Client side: receives the records per the configured mode.
#[derive(Debug)]
pub struct ClientTransfer {
    mode: TransferMode,
    filter: FilterPolicy,
    capacity: usize,
    destination: Option<MemoryRegion>,
    descriptor: Option<MemoryRegion>,
}

impl ClientTransfer {
    /// Creates the client protocol, sized for at most `capacity` records.
    pub fn new(mode: TransferMode, filter: FilterPolicy, capacity: usize) -> Self {
        Self {
            mode,
            filter,
            capacity,
            destination: None,
            descriptor: None,
        }
    }

    fn destination(&self) -> Result<&MemoryRegion, TransferError> {
        self.destination.as_ref().ok_or(TransferError::NotPrepared(self.mode))
    }

    fn receive_sent(&mut self, conn: &mut Connection) -> Result<Vec<u8>, TransferError> {
        let wc = expect_completion(conn, WcOpcode::Recv)?;
        Ok(self.destination()?.read_at(0, wc.byte_len as usize)?)
    }

    fn receive_written(&mut self, conn: &mut Connection) -> Result<Vec<u8>, TransferError> {
        let destination = self.destination()?.clone();
        let request = WriteRequest {
            region: RemoteRegionDescriptor::for_region(&destination, destination.len())?,
            key: self.filter.server_key(),
        };
        let bytes = request.encode()?;
        let inline = bytes.len() <= conn.caps().max_inline_data as usize;
        let mr = conn.register(bytes, AccessFlags::LOCAL_READ)?;
        conn.post(WorkRequest::send(mr.sge()).inline(inline))?;

        // The send completion and the write notification may arrive in
        // either order.
        let mut sent = false;
        let mut written = None;
        while !sent || written.is_none() {
            let wc = conn.wait_completion()?;
            match wc.opcode {
                WcOpcode::Send => sent = true,
                WcOpcode::RecvRdmaWithImm => written = Some(wc.imm_data.unwrap_or(wc.byte_len)),
                got => {
                    return Err(TransferError::UnexpectedCompletion {
                        expected: WcOpcode::RecvRdmaWithImm,
                        got,
                    })
                }
            }
        }
        conn.deregister(&mr)?;
        let len = written.unwrap_or(0) as usize;
        if len > destination.len() {
            return Err(TransferError::RegionTooSmall {
                needed: len,
                available: destination.len(),
            });
        }
        Ok(destination.read_at(0, len)?)
    }

    fn read_published(&mut self, conn: &mut Connection) -> Result<Vec<u8>, TransferError> {
        let descriptor_mr = self.descriptor.take().ok_or(TransferError::NotPrepared(self.mode))?;
        let wc = expect_completion(conn, WcOpcode::Recv)?;
        if wc.byte_len as usize != DESCRIPTOR_WIRE_SIZE {
            return Err(TransferError::DescriptorSize {
                expected: DESCRIPTOR_WIRE_SIZE,
                got: wc.byte_len as usize,
            });
        }
        let desc = RemoteRegionDescriptor::decode(&descriptor_mr.read_at(0, DESCRIPTOR_WIRE_SIZE)?)?;
        conn.deregister(&descriptor_mr)?;

        let destination = self.destination()?.clone();
        let len = desc.len as usize;
        if len > destination.len() {
            return Err(TransferError::RegionTooSmall {
                needed: len,
                available: destination.len(),
            });
        }
        conn.post(WorkRequest::read(destination.sge_range(0, len)?, desc.target()))?;
        expect_completion(conn, WcOpcode::RdmaRead)?;
        Ok(destination.read_at(0, len)?)
    }
}

impl TransferProtocol for ClientTransfer {
    type Output = ClientOutcome;

    fn prepare(&mut self, conn: &mut Connection) -> Result<(), TransferError> {
        let wire = record::checked_wire_len(self.capacity).ok_or(VerbsError::LengthOverflow {
            len: self.capacity.saturating_mul(RECORD_SIZE),
        })?;
        match self.mode {
            TransferMode::Send => {
                let mr = conn.register(vec![0u8; wire.max(MIN_RECV_BUFFER)], AccessFlags::LOCAL_WRITE)?;
                conn.post(WorkRequest::recv(mr.sge()))?;
                self.destination = Some(mr);
            }
            TransferMode::Write => {
                let mr = conn.register(vec![0u8; wire], AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)?;
                conn.post(WorkRequest::recv_notification())?;
                self.destination = Some(mr);
            }
            TransferMode::Read => {
                self.destination = Some(conn.register(vec![0u8; wire], AccessFlags::LOCAL_WRITE)?);
                let desc = conn.register(vec![0u8; DESCRIPTOR_WIRE_SIZE], AccessFlags::LOCAL_WRITE)?;
                conn.post(WorkRequest::recv(desc.sge()))?;
                self.descriptor = Some(desc);
            }
        }
        Ok(())
    }

    fn run(&mut self, conn: &mut Connection) -> Result<ClientOutcome, TransferError> {
        let timer = TransferTimer::start(Role::Client, self.mode, self.filter);
        let bytes = match self.mode {
            TransferMode::Send => self.receive_sent(conn)?,
            TransferMode::Write => self.receive_written(conn)?,
            TransferMode::Read => self.read_published(conn)?,
        };
        let moved = record::decode(&bytes)?;
        tracing::debug!(mode = %self.mode, records = moved.len(), bytes = bytes.len(), "client transfer");
        let records = match self.filter.client_key() {
            Some(key) => record::filter(&moved, key),
            None => moved.clone(),
        };
        let stats = timer.finish(moved.len(), moved.len(), records.len());
        Ok(ClientOutcome { records, stats })
    }
}
