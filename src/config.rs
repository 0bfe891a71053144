use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridges: Vec<KnownBridge>,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub commands: CommandConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownBridge {
    pub hostname: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Outstanding probes at any one time.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Networks wider than this are narrowed around the interface address.
    #[serde(default = "default_min_prefix")]
    pub min_prefix: u8,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Accesses served from a name map before it is rebuilt.
    #[serde(default = "default_reuse")]
    pub reuse: u32,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cpu_interval_ms")]
    pub cpu_interval_ms: u64,
    #[serde(default = "default_scan_idle_secs")]
    pub scan_idle_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_in_flight() -> usize {
    25
}

fn default_dial_timeout_ms() -> u64 {
    2000
}

fn default_http_timeout_ms() -> u64 {
    2000
}

fn default_min_prefix() -> u8 {
    16
}

fn default_probe_port() -> u16 {
    80
}

fn default_reuse() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_cpu_interval_ms() -> u64 {
    750
}

fn default_scan_idle_secs() -> u64 {
    5
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            dial_timeout_ms: default_dial_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            min_prefix: default_min_prefix(),
            port: default_probe_port(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reuse: default_reuse(),
            ttl_secs: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            cpu_interval_ms: default_cpu_interval_ms(),
            scan_idle_secs: default_scan_idle_secs(),
        }
    }
}

impl DiscoveryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cpu_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_interval_ms)
    }

    pub fn scan_idle(&self) -> Duration {
        Duration::from_secs(self.scan_idle_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist yet.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, &toml_str)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Insert or replace the entry for `bridge.hostname`.
    pub fn upsert_bridge(&mut self, bridge: KnownBridge) {
        match self.bridges.iter_mut().find(|b| b.hostname == bridge.hostname) {
            Some(existing) => *existing = bridge,
            None => self.bridges.push(bridge),
        }
    }

    /// Check for duplicate hostnames and unusable discovery settings.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for b in &self.bridges {
            if !seen.insert(b.hostname.as_str()) {
                return Err(format!("Duplicate bridge hostname {}", b.hostname));
            }
            if b.username.is_empty() {
                return Err(format!("Bridge {} has an empty username", b.hostname));
            }
        }
        if self.discovery.max_in_flight == 0 {
            return Err("discovery.max_in_flight must be at least 1".into());
        }
        if self.discovery.min_prefix > 30 {
            return Err(format!(
                "discovery.min_prefix {} leaves no hosts to scan",
                self.discovery.min_prefix
            ));
        }
        Ok(())
    }
}

/// `<config dir>/huesh/config.toml`, or `config.toml` when no home is known.
pub fn default_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "huesh")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Record a bridge in the config file at `path`, creating the file if needed.
pub fn persist_bridge(path: &Path, bridge: KnownBridge) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(path)?;
    config.upsert_bridge(bridge);
    config.save(path)
}
