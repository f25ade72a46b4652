//! Engine configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::loopback::LoopbackConfig;
use crate::ring::DEFAULT_CAPACITY;

/// Default flush interval `K`.
pub const DEFAULT_FLUSH_INTERVAL: u32 = 16;

/// Port used when a bind address omits one.
pub const DEFAULT_SERVER_PORT: u16 = 2998;

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring size for each direction, in bytes.
    pub buffer_capacity: usize,
    /// DATA messages per FLUSH acknowledgment (`K`).
    pub flush_interval: u32,
    /// Largest DATA message (`M`); `K * M` must fit in `buffer_capacity`.
    pub max_message_size: usize,
    /// Whether new channels start in blocking mode.
    pub blocking: bool,
    /// Port used by `bind` when the address has none.
    pub default_port: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_message_size: DEFAULT_CAPACITY / DEFAULT_FLUSH_INTERVAL as usize,
            blocking: true,
            default_port: DEFAULT_SERVER_PORT,
        }
    }
}

impl ChannelConfig {
    /// Builds a config for the given ring size, deriving `M` from `K`.
    pub fn with_capacity(buffer_capacity: usize, flush_interval: u32) -> Self {
        Self {
            buffer_capacity,
            flush_interval,
            max_message_size: buffer_capacity / flush_interval.max(1) as usize,
            ..Self::default()
        }
    }

    /// Checks the flow-control safety inequality and basic bounds.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(ChannelError::InvalidConfig { reason });
        if self.buffer_capacity == 0 {
            return invalid("buffer_capacity must be non-zero".to_string());
        }
        if self.flush_interval == 0 {
            return invalid("flush_interval must be at least 1".to_string());
        }
        if self.max_message_size == 0 {
            return invalid("max_message_size must be at least 1".to_string());
        }
        let window = (self.flush_interval as usize).checked_mul(self.max_message_size);
        match window {
            Some(window) if window <= self.buffer_capacity => Ok(()),
            _ => invalid(format!(
                "flush_interval ({}) * max_message_size ({}) exceeds buffer_capacity ({})",
                self.flush_interval, self.max_message_size, self.buffer_capacity
            )),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Settings applied to every channel.
    pub channel: ChannelConfig,
    /// Settings for the in-process fabric.
    pub loopback: LoopbackConfig,
}

impl EngineConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents)?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ChannelError::ConfigParse(e.to_string()))?,
            _ => {
                return Err(ChannelError::ConfigParse(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.channel.validate()?;
        Ok(config)
    }

    /// Parses TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ChannelError::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ChannelConfig::default();
        assert_eq!(config.buffer_capacity, 1024 * 1024);
        assert_eq!(config.flush_interval, 16);
        assert_eq!(config.max_message_size, 64 * 1024);
        assert!(config.blocking);
        assert_eq!(config.default_port, 2998);
        config.validate().unwrap();
    }

    #[test]
    fn test_with_capacity_derives_message_size() {
        let config = ChannelConfig::with_capacity(1000, 3);
        assert_eq!(config.max_message_size, 333);
        config.validate().unwrap();
    }

    #[test]
    fn test_window_exceeding_capacity_rejected() {
        let config = ChannelConfig {
            buffer_capacity: 100,
            flush_interval: 4,
            max_message_size: 26,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ChannelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_zero_fields_rejected() {
        for config in [
            ChannelConfig { buffer_capacity: 0, ..Default::default() },
            ChannelConfig { flush_interval: 0, ..Default::default() },
            ChannelConfig { max_message_size: 0, ..Default::default() },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_overflowing_window_rejected() {
        let config = ChannelConfig {
            flush_interval: u32::MAX,
            max_message_size: usize::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [channel]
            buffer_capacity = 4096
            flush_interval = 4
            max_message_size = 1024
            blocking = false

            [loopback]
            event_wait_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.channel.buffer_capacity, 4096);
        assert!(!config.channel.blocking);
        assert_eq!(config.channel.default_port, DEFAULT_SERVER_PORT);
        assert_eq!(config.loopback.event_wait_ms, 5);
        assert_eq!(config.loopback.backlog_limit, 128);
    }

    #[test]
    fn test_from_file_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("engine.toml");
        std::fs::write(&toml_path, "[channel]\nflush_interval = 8\nmax_message_size = 1024\n").unwrap();
        let config = EngineConfig::from_file(&toml_path).unwrap();
        assert_eq!(config.channel.flush_interval, 8);

        let json_path = dir.path().join("engine.json");
        let json = serde_json::to_string(&EngineConfig::default()).unwrap();
        std::fs::write(&json_path, json).unwrap();
        assert_eq!(EngineConfig::from_file(&json_path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "channel: {}").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ChannelError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[channel]\nbuffer_capacity = 10\nflush_interval = 2\nmax_message_size = 6\n").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ChannelError::InvalidConfig { .. })
        ));
    }
}
