//! Layered driver configuration loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use vxfer_transport::{ClientConfig, FabricConfig, ServerConfig, TransferConfig};

/// Complete driver configuration: fabric, both roles, and the transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VxferConfig {
    /// Simulated fabric.
    pub fabric: FabricConfig,
    /// Server role.
    pub server: ServerConfig,
    /// Client role.
    pub client: ClientConfig,
    /// What to transfer.
    pub transfer: TransferConfig,
}

impl VxferConfig {
    /// Loads a TOML or JSON file, chosen by extension. Missing keys take
    /// their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: VxferConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: VxferConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Checks both roles' settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        self.client.validate()?;
        self.transfer.validate()?;
        if !(0.0..=1.0).contains(&self.fabric.failure_rate) {
            anyhow::bail!("failure_rate must be within [0, 1], got {}", self.fabric.failure_rate);
        }
        if self.client.peer_addr.port() != self.server.port {
            tracing::warn!(
                peer = %self.client.peer_addr,
                port = self.server.port,
                "client peer port differs from the server port"
            );
        }
        Ok(())
    }
}
