//! Transfer statistics.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

use crate::connection::Role;
use crate::protocol::{FilterPolicy, TransferMode};
use crate::record::wire_len;

/// Snapshot of one completed transfer, as seen by one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Role that produced the snapshot.
    pub role: Role,
    /// Transfer mode.
    pub mode: TransferMode,
    /// Filter policy.
    pub filter: FilterPolicy,
    /// Records on hand before any filtering by this role.
    pub records_available: usize,
    /// Records that crossed the wire.
    pub records_moved: usize,
    /// Records left after this role's filtering.
    pub records_delivered: usize,
    /// Payload bytes that crossed the wire.
    pub bytes_moved: u64,
    /// Wall-clock duration of the transfer phase in microseconds.
    pub elapsed_us: u64,
}

impl TransferStats {
    /// Elapsed time as a duration.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us)
    }

    /// Payload throughput in MiB/s, zero when nothing was timed.
    pub fn throughput_mib_s(&self) -> f64 {
        if self.elapsed_us == 0 {
            return 0.0;
        }
        (self.bytes_moved as f64 / (1024.0 * 1024.0)) / (self.elapsed_us as f64 / 1_000_000.0)
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} filter={} available={} moved={} delivered={} bytes={} elapsed={}us",
            self.role,
            self.mode,
            self.filter,
            self.records_available,
            self.records_moved,
            self.records_delivered,
            self.bytes_moved,
            self.elapsed_us
        )
    }
}

/// Times the transfer phase and builds the snapshot.
#[derive(Debug)]
pub(crate) struct TransferTimer {
    role: Role,
    mode: TransferMode,
    filter: FilterPolicy,
    started: Instant,
}

impl TransferTimer {
    pub(crate) fn start(role: Role, mode: TransferMode, filter: FilterPolicy) -> Self {
        Self {
            role,
            mode,
            filter,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, available: usize, moved: usize, delivered: usize) -> TransferStats {
        let elapsed = self.started.elapsed();
        let stats = TransferStats {
            role: self.role,
            mode: self.mode,
            filter: self.filter,
            records_available: available,
            records_moved: moved,
            records_delivered: delivered,
            bytes_moved: wire_len(moved) as u64,
            elapsed_us: elapsed.as_micros() as u64,
        };
        tracing::debug!(
            role = %stats.role,
            mode = %stats.mode,
            records = moved,
            bytes = stats.bytes_moved,
            elapsed_us = stats.elapsed_us,
            "transfer finished"
        );
        stats
    }
}
