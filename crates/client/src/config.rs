//! Client configuration management

use anyhow::{Context, Result, anyhow};
use common::logging::{LOG_LEVELS, is_valid_level};
use common::sysfs::{DEFAULT_SYSFS_ROOT, SysfsLayout};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attacher::DEFAULT_STATE_DIR;

/// Port `usbipd` listens on unless told otherwise
pub const DEFAULT_USBIP_PORT: u16 = 3240;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub vhci: VhciSettings,
    #[serde(default)]
    pub sysfs: SysfsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
    pub connect_timeout_secs: u64,
    pub default_port: u16,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connect_timeout_secs: 10,
            default_port: DEFAULT_USBIP_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhciSettings {
    /// Directory holding one connection record per attached port
    pub state_dir: PathBuf,
}

impl Default for VhciSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
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

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-passthrough/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
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
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
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
            config_dir.join("usbip-passthrough").join("client.toml")
        } else {
            PathBuf::from(".config/usbip-passthrough/client.toml")
        }
    }

    pub fn sysfs_layout(&self) -> SysfsLayout {
        SysfsLayout::new(expand(&self.sysfs.root))
    }

    pub fn state_dir(&self) -> PathBuf {
        expand(&self.vhci.state_dir)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.client.connect_timeout_secs)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !is_valid_level(&self.client.log_level) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.client.connect_timeout_secs == 0 {
            return Err(anyhow!("client.connect_timeout_secs must be greater than 0"));
        }

        if self.client.default_port == 0 {
            return Err(anyhow!("client.default_port must not be 0"));
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

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "info");
        assert_eq!(config.client.default_port, 3240);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.state_dir(), PathBuf::from("/var/run/vhci_hcd"));
        assert_eq!(config.sysfs_layout(), SysfsLayout::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: ClientConfig = toml::from_str(
            r#"
            [vhci]
            state_dir = "/tmp/vhci-state"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.state_dir(), PathBuf::from("/tmp/vhci-state"));
        assert_eq!(parsed.client.default_port, DEFAULT_USBIP_PORT);
    }

    #[test]
    fn test_tilde_expansion() {
        let mut config = ClientConfig::default();
        config.vhci.state_dir = PathBuf::from("~/vhci");
        assert!(!config.state_dir().starts_with("~"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.client.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.client.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.sysfs.root = PathBuf::from("sys");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.toml");

        let mut config = ClientConfig::default();
        config.client.default_port = 4000;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.default_port, 4000);
    }
}
