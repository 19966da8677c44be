//! Runs both roles of one transfer over a shared fabric.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use vxfer_transport::record::generate;
use vxfer_transport::{
    ClientConfig, ClientSession, ClientTransfer, Fabric, FabricStats, Record, ServerSession, ServerTransfer,
    TransferStats,
};

use crate::config::VxferConfig;

const LISTENER_WAIT: Duration = Duration::from_secs(5);

/// Outcome of a run, printed by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Server-side statistics.
    pub server: TransferStats,
    /// Client-side statistics.
    pub client: TransferStats,
    /// Fabric counters after the run.
    pub fabric: FabricStats,
    /// First records the client ended up with.
    pub sample: Vec<Record>,
}

impl Report {
    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = format!("{}\n{}\n", self.server, self.client);
        out.push_str(&format!(
            "fabric: completed={} failed={} sent={}B received={}B\n",
            self.fabric.operations_completed,
            self.fabric.operations_failed,
            self.fabric.bytes_sent,
            self.fabric.bytes_received
        ));
        for record in &self.sample {
            out.push_str(&format!("  key={} seq={} value={:#018x}\n", record.key, record.seq, record.value));
        }
        out
    }
}

/// Averages over several runs of the same transfer.
#[derive(Debug, Clone, Serialize)]
pub struct RepeatedReport {
    /// Number of runs averaged.
    pub runs: usize,
    /// Mean server transfer time in microseconds.
    pub mean_server_elapsed_us: u64,
    /// Mean client transfer time in microseconds.
    pub mean_client_elapsed_us: u64,
    /// Report of the final run.
    pub last: Report,
}

impl RepeatedReport {
    /// Human-readable summary: the final run, then the means.
    pub fn summary(&self) -> String {
        let mut out = self.last.summary();
        out.push_str(&format!(
            "mean over {} runs: server={}us client={}us\n",
            self.runs, self.mean_server_elapsed_us, self.mean_client_elapsed_us
        ));
        out
    }
}

/// Longest the server waits for the client: both resolution steps plus the
/// connect handshake.
fn accept_budget(client: &ClientConfig) -> u64 {
    client
        .resolve_timeout_ms
        .saturating_mul(2)
        .saturating_add(client.connect_timeout_ms)
}

/// Runs the same transfer `repeat` times, each on a fresh fabric, and
/// averages the elapsed times.
pub async fn run_repeated(config: VxferConfig, sample: usize, repeat: usize) -> Result<RepeatedReport> {
    anyhow::ensure!(repeat > 0, "repeat must be at least 1");
    let mut server_total: u128 = 0;
    let mut client_total: u128 = 0;
    let mut last = None;
    for run_index in 0..repeat {
        let report = run(config.clone(), sample)
            .await
            .with_context(|| format!("run {} of {}", run_index + 1, repeat))?;
        server_total += u128::from(report.server.elapsed_us);
        client_total += u128::from(report.client.elapsed_us);
        last = Some(report);
    }
    let last = last.context("no run completed")?;
    let runs = repeat as u128;
    Ok(RepeatedReport {
        runs: repeat,
        mean_server_elapsed_us: (server_total / runs) as u64,
        mean_client_elapsed_us: (client_total / runs) as u64,
        last,
    })
}

/// Runs the server role and the client role on blocking worker threads.
pub async fn run(config: VxferConfig, sample: usize) -> Result<Report> {
    config.validate()?;
    let fabric = Fabric::new(config.fabric.clone());
    let transfer = config.transfer;
    let records = generate(transfer.entries, transfer.key_space, transfer.seed);
    tracing::info!(
        mode = %transfer.mode,
        filter = %transfer.filter,
        entries = records.len(),
        port = config.server.port,
        "starting transfer"
    );

    let server_fabric = fabric.clone();
    let mut server_config = config.server.clone();
    // Bound the accept wait so a client that never connects cannot strand the
    // server thread.
    server_config.accept_timeout_ms.get_or_insert(accept_budget(&config.client));
    let server = tokio::task::spawn_blocking(move || {
        let protocol = ServerTransfer::new(transfer.mode, transfer.filter, records);
        ServerSession::new(server_fabric, server_config, protocol).run()
    });

    let client_fabric = fabric.clone();
    let client_config = config.client.clone();
    let port = config.server.port;
    let client = tokio::task::spawn_blocking(move || {
        if !client_fabric.wait_for_listener(port, LISTENER_WAIT) {
            tracing::warn!(port, "no listener yet, connecting anyway");
        }
        let protocol = ClientTransfer::new(transfer.mode, transfer.filter, transfer.entries);
        ClientSession::new(client_fabric, client_config, protocol).run()
    });

    let client = client.await.context("client task failed")?;
    let server = server.await.context("server task failed")?;
    let outcome = client.context("client role failed")?;
    let server_stats = server.context("server role failed")?;

    Ok(Report {
        server: server_stats,
        client: outcome.stats,
        fabric: fabric.stats(),
        sample: outcome.records.into_iter().take(sample).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxfer_transport::{FilterPolicy, TransferMode};

    fn config(mode: TransferMode, filter: FilterPolicy) -> VxferConfig {
        let mut config = VxferConfig::default();
        config.transfer.mode = mode;
        config.transfer.filter = filter;
        config.transfer.entries = 32;
        config.server.accept_timeout_ms = Some(5_000);
        config.server.disconnect_timeout_ms = Some(5_000);
        config
    }

    #[tokio::test]
    async fn test_run_read_filtered() {
        let report = run(config(TransferMode::Read, FilterPolicy::AtServer { key: 1 }), 4)
            .await
            .unwrap();
        assert_eq!(report.server.records_available, 32);
        assert_eq!(report.client.records_moved, report.server.records_moved);
        assert!(report.sample.len() <= 4);
        assert!(report.sample.iter().all(|r| r.key == 1));
        assert_eq!(report.fabric.bytes_received, report.client.bytes_moved);
    }

    #[tokio::test]
    async fn test_run_send_unfiltered() {
        let report = run(config(TransferMode::Send, FilterPolicy::Unfiltered), 0).await.unwrap();
        assert_eq!(report.client.records_delivered, 32);
        assert_eq!(report.client.bytes_moved, 512);
        assert!(report.sample.is_empty());
        assert!(report.summary().contains("client send"));
    }

    #[tokio::test]
    async fn test_run_unreachable_peer() {
        let mut config = config(TransferMode::Write, FilterPolicy::Unfiltered);
        config.server.accept_timeout_ms = Some(200);
        config.client.peer_addr = "10.0.1.37:7471".parse().unwrap();
        let err = run(config, 0).await.unwrap_err();
        assert!(format!("{:#}", err).contains("client role failed"));
    }

    #[test]
    fn test_accept_budget_saturates() {
        let client = ClientConfig {
            resolve_timeout_ms: 100,
            connect_timeout_ms: 50,
            ..ClientConfig::default()
        };
        assert_eq!(accept_budget(&client), 250);
        let client = ClientConfig {
            resolve_timeout_ms: u64::MAX,
            connect_timeout_ms: u64::MAX,
            ..ClientConfig::default()
        };
        assert_eq!(accept_budget(&client), u64::MAX);
    }

    #[tokio::test]
    async fn test_run_repeated_averages() {
        let report = run_repeated(config(TransferMode::Write, FilterPolicy::AtClient { key: 2 }), 2, 3)
            .await
            .unwrap();
        assert_eq!(report.runs, 3);
        assert_eq!(report.last.server.records_available, 32);
        assert!(report.last.sample.iter().all(|r| r.key == 2));
        assert!(report.summary().contains("mean over 3 runs"));
    }

    #[tokio::test]
    async fn test_run_repeated_rejects_zero() {
        let err = run_repeated(config(TransferMode::Send, FilterPolicy::Unfiltered), 0, 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }
}
