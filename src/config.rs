//! Client-side defaults cache at `$HOME/.hermes/config.json`, read at
//! startup and written only when the user passes `--save`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Persisted client defaults. Any field missing from the file falls back to
/// [`ClientConfig::default`] rather than failing to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host to connect to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Server control port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether to use TLS for the control connection.
    #[serde(default)]
    pub tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: default_host(),
            port: default_port(),
            tls: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    crate::protocol::CONTROL_PORT
}

impl ClientConfig {
    /// Load the config from `$HOME/.hermes/config.json`, falling back to
    /// defaults if the file is absent. A present-but-corrupt file is treated
    /// as an error rather than silently discarded, so a user notices a
    /// mangled config instead of quietly losing their saved settings.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(ClientConfig::default());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write this config to `$HOME/.hermes/config.json`, creating the parent
    /// directory if needed.
    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let encoded = serde_json::to_string_pretty(self).context("encoding config")?;
        std::fs::write(&path, encoded).with_context(|| format!("writing {}", path.display()))
    }
}

fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".hermes").join("config.json"))
}
