//! Host configuration management

use crate::bridge::BridgeSettings;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    pub usb: UsbSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub service_mode: bool,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Id table of bridges to bind (VID:PID, `*` matches anything)
    pub devices: Vec<String>,
    /// Interface carrying the bridge endpoints
    #[serde(default)]
    pub interface: u8,
}

/// Request pool sizes and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "TransportSettings::default_out_urbs")]
    pub out_urbs: usize,
    #[serde(default = "TransportSettings::default_in_urbs")]
    pub in_urbs: usize,
    /// Outbound requests allocated on demand once the pool is empty
    #[serde(default = "TransportSettings::default_max_overflow_urbs")]
    pub max_overflow_urbs: usize,
    #[serde(default = "TransportSettings::default_svc_timeout_ms")]
    pub svc_timeout_ms: u64,
    /// Bulk-out write timeout (0 = bus default)
    #[serde(default)]
    pub bulk_out_timeout_ms: u64,
    /// Completion queue depth (0 = sized from the pools)
    #[serde(default)]
    pub completion_queue_depth: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            out_urbs: Self::default_out_urbs(),
            in_urbs: Self::default_in_urbs(),
            max_overflow_urbs: Self::default_max_overflow_urbs(),
            svc_timeout_ms: Self::default_svc_timeout_ms(),
            bulk_out_timeout_ms: 0,
            completion_queue_depth: 0,
        }
    }
}

impl TransportSettings {
    fn default_out_urbs() -> usize {
        crate::bridge::NUM_CPORT_OUT_URB
    }

    fn default_in_urbs() -> usize {
        crate::bridge::NUM_CPORT_IN_URB
    }

    fn default_max_overflow_urbs() -> usize {
        64
    }

    fn default_svc_timeout_ms() -> u64 {
        500
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            out_urbs: self.out_urbs,
            in_urbs: self.in_urbs,
            max_overflow_urbs: self.max_overflow_urbs,
            svc_timeout: Duration::from_millis(self.svc_timeout_ms),
        }
    }

    /// Completion queue depth, never smaller than what the pools can post
    pub fn queue_depth(&self) -> usize {
        self.completion_queue_depth
            .max(self.bridge_settings().completion_queue_depth())
    }

    pub fn bulk_out_timeout(&self) -> Option<Duration> {
        match self.bulk_out_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                service_mode: false,
                log_level: "info".to_string(),
            },
            usb: UsbSettings {
                devices: vec!["0xffff:0x0002".to_string()],
                interface: 0,
            },
            transport: TransportSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gb-bridge/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
            config_dir.join("gb-bridge").join("host.toml")
        } else {
            PathBuf::from(".config/gb-bridge/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.devices.is_empty() {
            return Err(anyhow!("Device id table is empty, nothing would ever bind"));
        }
        for filter in &self.usb.devices {
            Self::validate_filter(filter)?;
        }

        let transport = &self.transport;
        if transport.out_urbs == 0 || transport.out_urbs > u16::MAX as usize {
            return Err(anyhow!(
                "transport.out_urbs must be between 1 and {}",
                u16::MAX
            ));
        }
        if transport.in_urbs == 0 || transport.in_urbs > 256 {
            return Err(anyhow!("transport.in_urbs must be between 1 and 256"));
        }
        if transport.svc_timeout_ms == 0 {
            return Err(anyhow!("transport.svc_timeout_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub(crate) fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid device id '{}', expected VID:PID (e.g., '0xffff:0x0002' or '0xffff:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0xffff')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.usb.devices, vec!["0xffff:0x0002".to_string()]);
        assert_eq!(config.transport.out_urbs, 8);
        assert_eq!(config.transport.in_urbs, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(HostConfig::validate_filter("0xffff:0x0002").is_ok());
        assert!(HostConfig::validate_filter("0xffff:*").is_ok());
        assert!(HostConfig::validate_filter("*:0x0002").is_ok());
        assert!(HostConfig::validate_filter("*:*").is_ok());
        assert!(HostConfig::validate_filter("0XABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(HostConfig::validate_filter("ffff:0002").is_err());
        assert!(HostConfig::validate_filter("0xffff").is_err());
        assert!(HostConfig::validate_filter("0x1:0x2:0x3").is_err());
        assert!(HostConfig::validate_filter("0xGHIJ:0x0002").is_err());
        assert!(HostConfig::validate_filter("0x12345:0x0002").is_err());
    }

    #[test]
    fn test_validate_transport() {
        let mut config = HostConfig::default();
        config.transport.out_urbs = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.transport.in_urbs = 257;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.usb.devices.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HostConfig::default();
        config.host.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.host.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_section_optional() {
        let toml_str = r#"
            [host]
            service_mode = false
            log_level = "warn"

            [usb]
            devices = ["0xffff:*"]
        "#;
        let config: HostConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.usb.interface, 0);
        assert_eq!(config.transport.max_overflow_urbs, 64);
        assert_eq!(config.transport.svc_timeout_ms, 500);
        assert!(config.transport.bulk_out_timeout().is_none());
    }

    #[test]
    fn test_queue_depth_covers_pools() {
        let mut transport = TransportSettings::default();
        assert_eq!(transport.queue_depth(), 8 + 64 + 4 + 1);

        transport.completion_queue_depth = 4;
        assert_eq!(transport.queue_depth(), 8 + 64 + 4 + 1);

        transport.completion_queue_depth = 1024;
        assert_eq!(transport.queue_depth(), 1024);
    }

    #[test]
    fn test_bridge_settings() {
        let transport = TransportSettings {
            svc_timeout_ms: 250,
            ..Default::default()
        };
        let settings = transport.bridge_settings();
        assert_eq!(settings.svc_timeout, Duration::from_millis(250));
        assert_eq!(settings.out_urbs, 8);
    }
}
