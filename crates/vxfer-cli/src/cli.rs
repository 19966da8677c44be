//! Command-line arguments and their mapping onto the configuration.

use crate::config::VxferConfig;
use crate::runner;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use vxfer_transport::{FilterPolicy, TransferMode};

/// Key filtered on when `--filter` is given without `--key`.
pub const DEFAULT_FILTER_KEY: u32 = 1;

/// Command-line arguments. Every flag overrides the configuration file.
#[derive(Parser, Debug)]
#[command(name = "vxfer")]
#[command(about = "Zero-copy record transfer over an RDMA queue pair", long_about = None)]
pub struct Cli {
    /// TOML or JSON configuration file
    #[arg(short, long, env = "VXFER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transfer protocol
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Where records are filtered by key
    #[arg(short, long, value_enum)]
    pub filter: Option<FilterArg>,

    /// Key kept by the filter
    #[arg(short, long)]
    pub key: Option<u32>,

    /// Number of records the server generates
    #[arg(short, long)]
    pub entries: Option<usize>,

    /// Keys are drawn from 0..KEY_SPACE
    #[arg(long)]
    pub key_space: Option<u32>,

    /// Server port (the client connects to the same port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address the client connects to
    #[arg(long)]
    pub peer: Option<IpAddr>,

    /// Record generator seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Records of the result to print
    #[arg(long, default_value = "8")]
    pub show: usize,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Run the transfer this many times and report mean elapsed times
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,
}

/// `--mode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Two-sided send and receive
    Send,
    /// Server writes into the client's region
    Write,
    /// Client reads the server's region
    Read,
}

impl From<ModeArg> for TransferMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Send => TransferMode::Send,
            ModeArg::Write => TransferMode::Write,
            ModeArg::Read => TransferMode::Read,
        }
    }
}

/// `--filter` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    /// Move every record
    None,
    /// Filter before the transfer
    Server,
    /// Filter after the transfer
    Client,
}

impl Cli {
    /// Builds the effective configuration: defaults, then the file, then flags.
    pub fn load_config(&self) -> Result<VxferConfig> {
        let mut config = match &self.config {
            Some(path) => VxferConfig::from_file(path)?,
            None => VxferConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Overrides `config` with every flag that was given.
    pub fn apply(&self, config: &mut VxferConfig) {
        let transfer = &mut config.transfer;
        if let Some(mode) = self.mode {
            transfer.mode = mode.into();
        }
        let current_key = match transfer.filter {
            FilterPolicy::AtServer { key } | FilterPolicy::AtClient { key } => Some(key),
            FilterPolicy::Unfiltered => None,
        };
        let key = self.key.or(current_key).unwrap_or(DEFAULT_FILTER_KEY);
        transfer.filter = match (self.filter, transfer.filter) {
            (Some(FilterArg::None), _) => FilterPolicy::Unfiltered,
            (Some(FilterArg::Server), _) | (None, FilterPolicy::AtServer { .. }) => FilterPolicy::AtServer { key },
            (Some(FilterArg::Client), _) | (None, FilterPolicy::AtClient { .. }) => FilterPolicy::AtClient { key },
            (None, FilterPolicy::Unfiltered) => FilterPolicy::Unfiltered,
        };
        if let Some(entries) = self.entries {
            transfer.entries = entries;
        }
        if let Some(key_space) = self.key_space {
            transfer.key_space = key_space;
        }
        if let Some(seed) = self.seed {
            transfer.seed = seed;
        }
        if let Some(port) = self.port {
            config.server.port = port;
            config.client.peer_addr.set_port(port);
        }
        if let Some(peer) = self.peer {
            config.client.peer_addr = SocketAddr::new(peer, config.client.peer_addr.port());
        }
    }

    /// Runs the transfer and prints the report.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        if self.repeat > 1 {
            let report = runner::run_repeated(config, self.show, self.repeat as usize).await?;
            self.print(&report, report.summary())
        } else {
            let report = runner::run(config, self.show).await?;
            self.print(&report, report.summary())
        }
    }

    fn print<R: serde::Serialize>(&self, report: &R, summary: String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            print!("{}", summary);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["vxfer"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_no_flags_keeps_defaults() {
        let config = parse(&[]).load_config().unwrap();
        assert_eq!(config.transfer.mode, TransferMode::Send);
        assert_eq!(config.transfer.filter, FilterPolicy::Unfiltered);
        assert_eq!(config.transfer.entries, 1024);
    }

    #[test]
    fn test_flags_override() {
        let cli = parse(&[
            "--mode", "write", "--filter", "server", "--entries", "5", "--seed", "9", "--port", "9100",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.transfer.mode, TransferMode::Write);
        assert_eq!(config.transfer.filter, FilterPolicy::AtServer { key: DEFAULT_FILTER_KEY });
        assert_eq!(config.transfer.entries, 5);
        assert_eq!(config.transfer.seed, 9);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.client.peer_addr.port(), 9100);
    }

    #[test]
    fn test_key_updates_configured_filter() {
        let mut config = VxferConfig::default();
        config.transfer.filter = FilterPolicy::AtClient { key: 1 };
        parse(&["--key", "2"]).apply(&mut config);
        assert_eq!(config.transfer.filter, FilterPolicy::AtClient { key: 2 });

        parse(&["--filter", "none"]).apply(&mut config);
        assert_eq!(config.transfer.filter, FilterPolicy::Unfiltered);

        parse(&["--filter", "server"]).apply(&mut config);
        assert_eq!(config.transfer.filter, FilterPolicy::AtServer { key: DEFAULT_FILTER_KEY });
    }

    #[test]
    fn test_peer_keeps_port() {
        let mut config = VxferConfig::default();
        parse(&["--peer", "10.0.1.37"]).apply(&mut config);
        assert_eq!(config.client.peer_addr, "10.0.1.37:7471".parse().unwrap());
    }

    #[test]
    fn test_repeat_flag() {
        assert_eq!(parse(&[]).repeat, 1);
        assert_eq!(parse(&["--repeat", "5"]).repeat, 5);
        assert!(Cli::try_parse_from(["vxfer", "--repeat", "0"]).is_err());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(Cli::try_parse_from(["vxfer", "--mode", "atomic"]).is_err());
    }
}
