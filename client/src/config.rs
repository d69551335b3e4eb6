//! Configuration file parser for the Mirrorgate client
//!
//! Supports mirrorgate-client.yml with the relay endpoint, the obfuscation
//! key and headers added to every tunnelled request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mirrorgate_shared::obfuscate::DEFAULT_KEY;
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel endpoint of the relay
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Byte key shared with the relay
    #[serde(default = "default_key")]
    pub obfuscation_key: u8,

    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// How long to wait for each result
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            obfuscation_key: default_key(),
            headers: BTreeMap::new(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_relay() -> String {
    "ws://localhost:5000/tunnel".to_string()
}

fn default_key() -> u8 {
    DEFAULT_KEY
}

fn default_timeout() -> u64 {
    30
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            anyhow::bail!("Relay must be a ws:// or wss:// URL, got '{}'", self.relay);
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        for name in self.headers.keys() {
            if name.is_empty() || name.contains(|c: char| c == ':' || c.is_whitespace()) {
                anyhow::bail!("Invalid header name '{}'", name);
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "mirrorgate-client.yml",
            "mirrorgate-client.yaml",
            ".mirrorgate-client.yml",
            ".mirrorgate-client.yaml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
