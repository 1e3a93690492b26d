//! Server configuration management

use anyhow::{Context, Result, anyhow};
use common::logging::{LOG_LEVELS, is_valid_level};
use common::sysfs::{DEFAULT_SYSFS_ROOT, SysfsLayout};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::DaemonOptions;
use crate::usb::MonitorOptions;

/// Default USB/IP port
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3240";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub usbipd: UsbipdSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub sysfs: SysfsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub log_level: String,
    /// Running under systemd: send readiness notifications
    #[serde(default)]
    pub service_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            log_level: "info".to_string(),
            service_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbipdSettings {
    pub max_connections: usize,
    pub graceful_shutdown_timeout_secs: u64,
    /// Accept export/unexport requests from peer daemons
    #[serde(default)]
    pub export_enabled: bool,
}

impl Default for UsbipdSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            graceful_shutdown_timeout_secs: 30,
            export_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub resync_period_secs: u64,
    pub debounce_ms: u64,
    pub settle_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            resync_period_secs: 300,
            debounce_ms: 200,
            settle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysfsSettings {
    pub root: PathBuf,
}

impl Default for SysfsSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-passthrough/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-passthrough").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-passthrough/server.toml")
        }
    }

    /// Sysfs layout with `~` expanded in the configured root
    pub fn sysfs_layout(&self) -> SysfsLayout {
        let root = self.sysfs.root.to_string_lossy();
        SysfsLayout::new(shellexpand::tilde(&root).as_ref())
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            max_connections: self.usbipd.max_connections,
            graceful_shutdown_timeout: Duration::from_secs(
                self.usbipd.graceful_shutdown_timeout_secs,
            ),
            export_enabled: self.usbipd.export_enabled,
        }
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            resync_period: Duration::from_secs(self.monitor.resync_period_secs),
            debounce: Duration::from_millis(self.monitor.debounce_ms),
            settle: Duration::from_millis(self.monitor.settle_ms),
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !is_valid_level(&self.server.log_level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.usbipd.max_connections == 0 {
            return Err(anyhow!("usbipd.max_connections must be greater than 0"));
        }

        if self.monitor.debounce_ms == 0 {
            return Err(anyhow!("monitor.debounce_ms must be greater than 0"));
        }

        if self.monitor.resync_period_secs == 0 {
            return Err(anyhow!("monitor.resync_period_secs must be greater than 0"));
        }

        if !self.sysfs_layout().root().is_absolute() {
            return Err(anyhow!(
                "sysfs.root '{}' must be an absolute path",
                self.sysfs.root.display()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.bind_addr, "0.0.0.0:3240");
        assert_eq!(config.usbipd.max_connections, 100);
        assert!(!config.usbipd.export_enabled);
        assert_eq!(config.monitor_options(), MonitorOptions::default());
        assert_eq!(config.sysfs_layout(), SysfsLayout::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.bind_addr, parsed.server.bind_addr);
        assert_eq!(config.monitor.debounce_ms, parsed.monitor.debounce_ms);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: ServerConfig = toml::from_str(
            r#"
            [usbipd]
            max_connections = 4
            graceful_shutdown_timeout_secs = 5
            export_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.bind_addr, DEFAULT_BIND_ADDR);
        let options = parsed.daemon_options();
        assert_eq!(options.max_connections, 4);
        assert_eq!(options.graceful_shutdown_timeout, Duration::from_secs(5));
        assert!(options.export_enabled);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ServerConfig::default();
        config.server.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.server.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = ServerConfig::default();
        config.usbipd.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.monitor.debounce_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.sysfs.root = PathBuf::from("relative/sys");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/server.toml");

        let mut config = ServerConfig::default();
        config.monitor.debounce_ms = 500;
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.monitor.debounce_ms, 500);
    }
}
