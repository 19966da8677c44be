//! Shared fixtures: run a server role and a client role on two threads over
//! one simulated fabric.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use vxfer_transport::{
    ClientConfig, ClientOutcome, ClientSession, ClientTransfer, Fabric, FilterPolicy, Record, ServerConfig,
    ServerSession, ServerTransfer, TransferError, TransferMode, TransferProtocol, TransferStats,
};

pub const PORT: u16 = 7471;

/// Server settings with bounded waits so a broken peer fails the test
/// instead of hanging it.
pub fn server_config() -> ServerConfig {
    ServerConfig {
        port: PORT,
        accept_timeout_ms: Some(5_000),
        connect_timeout_ms: 5_000,
        disconnect_timeout_ms: Some(5_000),
        ..ServerConfig::default()
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PORT),
        resolve_timeout_ms: 2_000,
        connect_timeout_ms: 5_000,
        ..ClientConfig::default()
    }
}

/// Records with the given keys and sequence numbers starting at 1.
pub fn keyed(keys: &[u32]) -> Vec<Record> {
    keys.iter()
        .enumerate()
        .map(|(i, &key)| Record::new(key, i as u32 + 1, 0xA000 + i as u64))
        .collect()
}

/// Runs `server` and `client` protocols against each other.
pub fn run_protocols<S, C>(fabric: &Fabric, server: S, client: C) -> (Result<S::Output, TransferError>, Result<C::Output, TransferError>)
where
    S: TransferProtocol + Send + 'static,
    S::Output: Send + 'static,
    C: TransferProtocol,
{
    let server_fabric = fabric.clone();
    let handle = thread::spawn(move || ServerSession::new(server_fabric, server_config(), server).run());
    assert!(
        fabric.wait_for_listener(PORT, Duration::from_secs(5)),
        "server never started listening"
    );
    let client_result = ClientSession::new(fabric.clone(), client_config(), client).run();
    let server_result = handle.join().expect("server thread panicked");
    (server_result, client_result)
}

/// Runs one record transfer with the client sized for `capacity` records.
pub fn run_transfer(
    mode: TransferMode,
    filter: FilterPolicy,
    records: Vec<Record>,
    capacity: usize,
) -> (Result<TransferStats, TransferError>, Result<ClientOutcome, TransferError>) {
    let fabric = Fabric::default();
    run_transfer_on(&fabric, mode, filter, records, capacity)
}

pub fn run_transfer_on(
    fabric: &Fabric,
    mode: TransferMode,
    filter: FilterPolicy,
    records: Vec<Record>,
    capacity: usize,
) -> (Result<TransferStats, TransferError>, Result<ClientOutcome, TransferError>) {
    run_protocols(
        fabric,
        ServerTransfer::new(mode, filter, records),
        ClientTransfer::new(mode, filter, capacity),
    )
}
