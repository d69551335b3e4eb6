//! Configuration file parser for the relay
//!
//! Supports mirrorgate.yml with target, timeout, inlining and outbound
//! header settings. Environment variables and command-line flags override
//! the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::headers::{HeaderRule, OutboundPolicy, DEFAULT_USER_AGENT};
use crate::inline::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RESOURCES};
use crate::rewrite::RewriteContext;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Origin being mirrored
    #[serde(default = "default_target")]
    pub target: String,

    /// Externally visible origin of this relay. Derived per request from
    /// `Host` / `X-Forwarded-Proto` when unset.
    #[serde(default)]
    pub public_origin: Option<String>,

    /// Path prefix serving the target in page mode
    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default)]
    pub inline: InlineConfig,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Forward cookies and authorization in page mode
    #[serde(default)]
    pub forward_session: bool,

    /// Present the target origin as Referer upstream
    #[serde(default = "default_true")]
    pub spoof_referer: bool,

    /// Tunnel obfuscation key
    #[serde(default = "default_obfuscation_key")]
    pub obfuscation_key: u8,

    /// Custom rules applied to every outbound request, written as
    /// `- set: [name, value]` maps
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub header_rules: Vec<HeaderRule>,
}

/// Upstream timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_page_secs")]
    pub page_secs: u64,
    #[serde(default = "default_resource_secs")]
    pub resource_secs: u64,
    #[serde(default = "default_media_secs")]
    pub media_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            page_secs: default_page_secs(),
            resource_secs: default_resource_secs(),
            media_secs: default_media_secs(),
        }
    }
}

/// Page assembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineConfig {
    /// Fetches in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Unique resources embedded per page
    #[serde(default = "default_max_resources")]
    pub max_resources: usize,
}

impl Default for InlineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_resources: DEFAULT_MAX_RESOURCES,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_target() -> String {
    "https://example.com/".to_string()
}

fn default_mount() -> String {
    "/site".to_string()
}

fn default_max_redirects() -> usize {
    10
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_obfuscation_key() -> u8 {
    mirrorgate_shared::obfuscate::DEFAULT_KEY
}

fn default_page_secs() -> u64 {
    15
}

fn default_resource_secs() -> u64 {
    10
}

fn default_media_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_resources() -> usize {
    DEFAULT_MAX_RESOURCES
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            target: default_target(),
            public_origin: None,
            mount: default_mount(),
            timeouts: TimeoutConfig::default(),
            max_redirects: default_max_redirects(),
            inline: InlineConfig::default(),
            user_agent: default_user_agent(),
            forward_session: false,
            spoof_referer: true,
            obfuscation_key: default_obfuscation_key(),
            header_rules: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "mirrorgate.yml",
            "mirrorgate.yaml",
            ".mirrorgate.yml",
            ".mirrorgate.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
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

    /// Apply `PORT`, `MIRRORGATE_TARGET` and `MIRRORGATE_PUBLIC_ORIGIN`
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT '{}'", port))?;
            let mut addr = self.listen_addr()?;
            addr.set_port(port);
            self.listen = addr.to_string();
        }
        if let Some(target) = var("MIRRORGATE_TARGET") {
            self.target = target;
        }
        if let Some(origin) = var("MIRRORGATE_PUBLIC_ORIGIN") {
            self.public_origin = Some(origin);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        let target = self.target_url()?;
        if !matches!(target.scheme(), "http" | "https") {
            anyhow::bail!("Target must be an http(s) URL, got '{}'", self.target);
        }
        if target.host_str().is_none() {
            anyhow::bail!("Target '{}' has no host", self.target);
        }
        let mount = self.mount_path();
        if !mount.starts_with('/') || mount.len() < 2 {
            anyhow::bail!("mount must be a path below '/', got '{}'", self.mount);
        }
        if let Some(origin) = self.public_origin_url()? {
            RewriteContext::new(&origin, &target, mount)
                .context("public_origin must differ from the target origin")?;
        }
        if self.inline.concurrency == 0 {
            anyhow::bail!("inline.concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))
    }

    pub fn target_url(&self) -> Result<Url> {
        Url::parse(&self.target).with_context(|| format!("Invalid target URL '{}'", self.target))
    }

    pub fn public_origin_url(&self) -> Result<Option<Url>> {
        self.public_origin
            .as_deref()
            .map(|o| Url::parse(o).with_context(|| format!("Invalid public_origin '{}'", o)))
            .transpose()
    }

    /// Mount path without a trailing slash
    pub fn mount_path(&self) -> &str {
        self.mount.trim_end_matches('/')
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.page_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.resource_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.media_secs)
    }

    /// Outbound identity for the fetcher
    pub fn outbound_policy(&self) -> OutboundPolicy {
        OutboundPolicy {
            user_agent: self.user_agent.clone(),
            referer: if self.spoof_referer {
                Some(self.target.clone())
            } else {
                None
            },
            rules: self.header_rules.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listen: 127.0.0.1:8080
target: https://news.example.org/
public_origin: https://mirror.example.net
mount: /mirror/
timeouts:
  media_secs: 60
inline:
  concurrency: 4
obfuscation_key: 33
header_rules:
  - set: ["X-Requested-With", "XMLHttpRequest"]
  - remove: Accept-Language
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
        assert_eq!(config.mount_path(), "/mirror");
        assert_eq!(config.media_timeout(), Duration::from_secs(60));
        assert_eq!(config.page_timeout(), Duration::from_secs(15));
        assert_eq!(config.inline.concurrency, 4);
        assert_eq!(config.inline.max_resources, DEFAULT_MAX_RESOURCES);
        assert_eq!(config.obfuscation_key, 33);
        assert_eq!(config.header_rules.len(), 2);
        assert_eq!(
            config.header_rules[0],
            HeaderRule::Set("X-Requested-With".into(), "XMLHttpRequest".into())
        );
        assert_eq!(config.header_rules[1], HeaderRule::Remove("Accept-Language".into()));
    }

    #[test]
    fn test_header_rules_survive_a_round_trip() {
        let config = RelayConfig {
            header_rules: vec![HeaderRule::Add("X-A".into(), "1".into())],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("- add:"), "{}", yaml);
        let back: RelayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.header_rules, config.header_rules);
    }

    #[test]
    fn test_defaults() {
        let config: RelayConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.mount, "/site");
        assert_eq!(config.obfuscation_key, 0x5A);
        assert!(config.spoof_referer);
        assert!(!config.forward_session);
        assert_eq!(config.outbound_policy().referer.as_deref(), Some("https://example.com/"));
    }

    #[test]
    fn test_validation_rejects() {
        let bad = [
            "target: ftp://example.com/",
            "target: https://example.com/\npublic_origin: https://example.com:443",
            "target: https://example.com/\npublic_origin: http://www.example.com",
            "target: https://example.com/\npublic_origin: http://example.com:443",
            "mount: site",
            "mount: /",
            "mount: //",
            "inline:\n  concurrency: 0",
            "listen: nowhere",
        ];
        for yaml in bad {
            let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
            assert!(config.validate().is_err(), "accepted {:?}", yaml);
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config
            .apply_overrides(|key| match key {
                "PORT" => Some("8081".to_string()),
                "MIRRORGATE_TARGET" => Some("https://other.test/".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.listen, "0.0.0.0:8081");
        assert_eq!(config.target, "https://other.test/");
        assert!(config.public_origin.is_none());

        let mut config = RelayConfig::default();
        assert!(config.apply_overrides(|_| Some("x".to_string())).is_err());
    }
}
