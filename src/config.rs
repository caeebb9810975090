//! Engine configuration
//!
//! Loaded from TOML. Every field has a default matching the stock driver, so
//! an empty file is a valid configuration:
//!
//! ```toml
//! debug_level = "errors"
//!
//! [bus]
//! buf_size = 128
//! max_speed_hz = 500000
//!
//! [retry]
//! max_attempts = 10
//!
//! [timing]
//! plate_chill_us = 80
//! ack_timeout_us = 10000
//! stall_ceiling_us = 1300
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::MAX_ID_LEN;

/// Default response buffer capacity
pub const DEFAULT_BUF_SIZE: usize = 128;

/// Default SPI clock (500 kHz)
pub const DEFAULT_MAX_SPEED_HZ: u32 = 500_000;

/// Default number of attempts per exchange
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Upper bound for `ack_timeout_us` and `stall_ceiling_us` (one second)
pub const MAX_TIMEOUT_US: u64 = 1_000_000;

/// BCM line driving FRAME
pub const DEFAULT_FRAME_PIN: u8 = 25;

/// BCM line reading ACK
pub const DEFAULT_ACK_PIN: u8 = 23;

/// How much the engine logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    /// Log nothing
    None,
    /// Log errors only
    #[default]
    Errors,
    /// Log errors and per-exchange detail
    All,
}

impl DebugLevel {
    /// Log filter for this level
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            DebugLevel::None => log::LevelFilter::Off,
            DebugLevel::Errors => log::LevelFilter::Error,
            DebugLevel::All => log::LevelFilter::Debug,
        }
    }
}

/// Bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Response buffer capacity in bytes
    pub buf_size: usize,
    /// SPI clock in Hz
    pub max_speed_hz: u32,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            max_speed_hz: DEFAULT_MAX_SPEED_HZ,
        }
    }
}

/// Control line assignments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinSettings {
    pub frame: u8,
    pub ack: u8,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            frame: DEFAULT_FRAME_PIN,
            ack: DEFAULT_ACK_PIN,
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per exchange, including the first
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Protocol timing, all in microseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Plate reset time after FRAME drops
    pub plate_chill_us: u64,
    /// Bound on every ACK poll
    pub ack_timeout_us: u64,
    /// Longest acceptable command transfer
    pub stall_ceiling_us: u64,
    /// Delay attached to the command transfer
    pub command_byte_delay_us: u32,
    /// Wait before the first response byte without ACK
    pub first_byte_delay_us: u64,
    /// Delay attached to each response byte without ACK
    pub rx_settle_us: u32,
    /// Wait after each response byte without ACK
    pub byte_gap_us: u64,
    /// Delay attached to each response byte with ACK
    pub ack_byte_delay_us: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            plate_chill_us: 80,
            ack_timeout_us: 10_000,
            stall_ceiling_us: 1_300,
            command_byte_delay_us: 40,
            first_byte_delay_us: 85,
            rx_settle_us: 3,
            byte_gap_us: 75,
            ack_byte_delay_us: 20,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub debug_level: DebugLevel,
    pub bus: BusSettings,
    pub pins: PinSettings,
    pub retry: RetrySettings,
    pub timing: TimingSettings,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the configuration is usable by the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.buf_size < MAX_ID_LEN + 1 {
            return Err(ConfigError::Invalid(format!(
                "bus.buf_size must hold an identity string ({} bytes), got {}",
                MAX_ID_LEN + 1,
                self.bus.buf_size
            )));
        }
        if self.bus.max_speed_hz == 0 {
            return Err(ConfigError::Invalid("bus.max_speed_hz must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.timing.ack_timeout_us == 0 || self.timing.ack_timeout_us > MAX_TIMEOUT_US {
            return Err(ConfigError::Invalid(format!(
                "timing.ack_timeout_us must be between 1 and {}, got {}",
                MAX_TIMEOUT_US, self.timing.ack_timeout_us
            )));
        }
        if self.timing.stall_ceiling_us == 0 || self.timing.stall_ceiling_us > MAX_TIMEOUT_US {
            return Err(ConfigError::Invalid(format!(
                "timing.stall_ceiling_us must be between 1 and {}, got {}",
                MAX_TIMEOUT_US, self.timing.stall_ceiling_us
            )));
        }
        Ok(())
    }

    /// Set the response buffer capacity
    pub fn with_buf_size(mut self, buf_size: usize) -> Self {
        self.bus.buf_size = buf_size;
        self
    }

    /// Set the SPI clock
    pub fn with_speed(mut self, max_speed_hz: u32) -> Self {
        self.bus.max_speed_hz = max_speed_hz;
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Set the ACK poll bound
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.timing.ack_timeout_us = timeout.as_micros() as u64;
        self
    }

    /// Set the stall ceiling
    pub fn with_stall_ceiling(mut self, ceiling: Duration) -> Self {
        self.timing.stall_ceiling_us = ceiling.as_micros() as u64;
        self
    }

    pub fn plate_chill(&self) -> Duration {
        Duration::from_micros(self.timing.plate_chill_us)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_micros(self.timing.ack_timeout_us)
    }

    pub fn stall_ceiling(&self) -> Duration {
        Duration::from_micros(self.timing.stall_ceiling_us)
    }

    pub fn first_byte_delay(&self) -> Duration {
        Duration::from_micros(self.timing.first_byte_delay_us)
    }

    pub fn byte_gap(&self) -> Duration {
        Duration::from_micros(self.timing.byte_gap_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.bus.buf_size, 128);
        assert_eq!(config.bus.max_speed_hz, 500_000);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.plate_chill(), Duration::from_micros(80));
        assert_eq!(config.ack_timeout(), Duration::from_millis(10));
        assert_eq!(config.stall_ceiling(), Duration::from_micros(1300));
        assert_eq!(config.pins.frame, 25);
        assert_eq!(config.pins.ack, 23);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            debug_level = "all"

            [bus]
            buf_size = 4096
            max_speed_hz = 5000000

            [timing]
            plate_chill_us = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.debug_level, DebugLevel::All);
        assert_eq!(config.bus.buf_size, 4096);
        assert_eq!(config.bus.max_speed_hz, 5_000_000);
        assert_eq!(config.plate_chill(), Duration::from_micros(100));
        assert_eq!(config.timing.ack_timeout_us, 10_000);
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn test_rejects_small_buffer() {
        let err = EngineConfig::from_toml_str("[bus]\nbuf_size = 16\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = EngineConfig::default().with_max_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_timeouts() {
        let err = EngineConfig::from_toml_str("[timing]\nack_timeout_us = 5000000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = EngineConfig::default().with_stall_ceiling(Duration::from_secs(2));
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_ack_timeout(Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_debug_level() {
        let err = EngineConfig::from_toml_str("debug_level = \"chatty\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config = EngineConfig::default()
            .with_buf_size(1024)
            .with_speed(400_000)
            .with_ack_timeout(Duration::from_millis(5));
        write!(file, "{}", config.to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/piplate.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_debug_level_filter() {
        assert_eq!(DebugLevel::None.level_filter(), log::LevelFilter::Off);
        assert_eq!(DebugLevel::Errors.level_filter(), log::LevelFilter::Error);
        assert_eq!(DebugLevel::All.level_filter(), log::LevelFilter::Debug);
    }
}
