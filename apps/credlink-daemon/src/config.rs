//! Daemon configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/credlink/daemon.toml`
//! - Windows: `%APPDATA%/credlink/daemon.toml`

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use credlink_pairing::{ConcurrencyMode, PairingConfig, ReconnectConfig};

/// Environment variable that overrides [`DaemonConfig::port`].
pub const PORT_ENV: &str = "CREDLINK_PORT";

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Port of the observer/operator WebSocket server.
    pub port: u16,
    pub bind_address: IpAddr,

    /// WebSocket URL of the linking sidecar.
    pub bridge_url: String,

    /// Staging directory for credential material. Empty selects the
    /// platform default.
    pub store_dir: String,

    pub concurrency: ConcurrencyMode,

    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,

    pub capture_recheck_ms: u64,
    pub code_request_delay_ms: u64,
    pub retain_after_delivery: bool,
    pub liveness_echo: bool,
    pub subscriber_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let pairing = PairingConfig::default();
        Self {
            port: 9480,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bridge_url: "ws://127.0.0.1:9400/link".into(),
            store_dir: String::new(),
            concurrency: pairing.concurrency,
            base_delay_ms: millis(pairing.reconnect.base_delay),
            max_delay_ms: millis(pairing.reconnect.max_delay),
            backoff_factor: pairing.reconnect.backoff_factor,
            capture_recheck_ms: millis(pairing.capture_recheck),
            code_request_delay_ms: millis(pairing.code_request_delay),
            retain_after_delivery: pairing.retain_after_delivery,
            liveness_echo: pairing.liveness_echo,
            subscriber_buffer: pairing.subscriber_buffer,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl DaemonConfig {
    /// Loads configuration from the platform path, creating it with
    /// defaults if not found, then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Loads configuration from `path`, or writes the defaults there.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: DaemonConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = DaemonConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Applies `CREDLINK_PORT`. `lookup` stands in for `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(raw) = lookup(PORT_ENV) {
            self.port = raw
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV}={raw:?} is not a port"))?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.bridge_url.is_empty(), "bridge_url must be set");
        anyhow::ensure!(
            self.backoff_factor >= 1.0,
            "backoff_factor must be at least 1.0, got {}",
            self.backoff_factor
        );
        anyhow::ensure!(
            self.base_delay_ms <= self.max_delay_ms,
            "base_delay_ms ({}) exceeds max_delay_ms ({})",
            self.base_delay_ms,
            self.max_delay_ms
        );
        Ok(())
    }

    /// Staging directory, resolving the empty default.
    pub fn store_dir(&self) -> anyhow::Result<PathBuf> {
        if !self.store_dir.is_empty() {
            return Ok(PathBuf::from(&self.store_dir));
        }
        credlink_pairing::default_store_dir().context("no config directory for the session store")
    }

    pub fn to_pairing_config(&self) -> PairingConfig {
        PairingConfig {
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                backoff_factor: self.backoff_factor,
            },
            concurrency: self.concurrency,
            capture_recheck: Duration::from_millis(self.capture_recheck_ms),
            code_request_delay: Duration::from_millis(self.code_request_delay_ms),
            retain_after_delivery: self.retain_after_delivery,
            liveness_echo: self.liveness_echo,
            subscriber_buffer: self.subscriber_buffer,
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    credlink_pairing::store::config_dir()
        .map(|dir| dir.join("credlink").join("daemon.toml"))
        .context("no config directory (HOME/APPDATA unset)")
}
