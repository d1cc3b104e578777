use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_DOMAIN;
use shared::types::InterfaceId;
use crate::browser::BrowserOptions;
use crate::connection::ConnectionSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browse: Vec<BrowseConfig>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub backend: Vec<BackendConfig>,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowseConfig {
    pub service_type: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// 0 means all interfaces
    #[serde(default)]
    pub interface: u32,
    #[serde(default = "default_true")]
    pub require_addresses: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_poll_ceiling")]
    pub poll_ceiling_ms: u64,
    #[serde(default = "default_more_coming_grace")]
    pub more_coming_grace_ms: u64,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Interfaces the default backend chain binds first
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_removal")]
    pub removal_ms: u64,
    #[serde(default = "default_refresh")]
    pub refresh_ms: u64,
    #[serde(default = "default_refresh_settle")]
    pub refresh_settle_ms: u64,
    #[serde(default = "default_true")]
    pub retain_on_timeout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Interface names to bind; empty binds all interfaces
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_poll_ceiling() -> u64 {
    5000
}

fn default_more_coming_grace() -> u64 {
    100
}

fn default_flush_threshold() -> usize {
    50
}

fn default_removal() -> u64 {
    1000
}

fn default_refresh() -> u64 {
    5000
}

fn default_refresh_settle() -> u64 {
    500
}

fn default_max_errors() -> u32 {
    3
}

fn default_listen() -> String {
    "[::]:8053".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            poll_ceiling_ms: default_poll_ceiling(),
            more_coming_grace_ms: default_more_coming_grace(),
            flush_threshold: default_flush_threshold(),
            interfaces: Vec::new(),
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            removal_ms: default_removal(),
            refresh_ms: default_refresh(),
            refresh_settle_ms: default_refresh_settle(),
            retain_on_timeout: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if let Some(entry) = config.browse.iter().find(|b| b.service_type.trim().is_empty()) {
            anyhow::bail!("browse entry with empty service_type (domain {})", entry.domain);
        }
        Ok(config)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_consecutive_errors: self.connection.max_consecutive_errors,
            poll_ceiling: Duration::from_millis(self.connection.poll_ceiling_ms),
            more_coming_grace: Duration::from_millis(self.connection.more_coming_grace_ms),
            flush_threshold: self.connection.flush_threshold,
            ..Default::default()
        }
    }

    pub fn browser_options(&self, browse: &BrowseConfig) -> BrowserOptions {
        BrowserOptions {
            require_addresses: browse.require_addresses,
            removal_debounce: Duration::from_millis(self.debounce.removal_ms),
            refresh_debounce: Duration::from_millis(self.debounce.refresh_ms),
            refresh_settle: Duration::from_millis(self.debounce.refresh_settle_ms),
            retain_on_timeout: self.debounce.retain_on_timeout,
            ..Default::default()
        }
    }

    /// Configured backend chain, or the default one: mDNS on the configured
    /// interfaces, then mDNS on all interfaces.
    pub fn backend_chain(&self) -> Vec<BackendConfig> {
        if !self.backend.is_empty() {
            return self.backend.clone();
        }
        let interface_names = &self.connection.interfaces;
        let mut chain = Vec::new();
        if !interface_names.is_empty() {
            chain.push(BackendConfig {
                name: format!("mdns-sd ({})", interface_names.join(", ")),
                interfaces: interface_names.to_vec(),
                max_errors: default_max_errors(),
            });
        }
        chain.push(BackendConfig {
            name: "mdns-sd (all interfaces)".to_string(),
            interfaces: Vec::new(),
            max_errors: default_max_errors(),
        });
        chain
    }
}

impl BrowseConfig {
    pub fn interface(&self) -> InterfaceId {
        InterfaceId(self.interface)
    }
}
