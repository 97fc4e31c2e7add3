//! TOML-backed configuration for devices and coordinated sets.
//!
//! Configs are validated before anything touches hardware; an invalid file
//! is a startup error, never a runtime surprise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::{SpectrometerSet, TriggerMode, PER_DEVICE_OVERHEAD, TRIGGER_PULSE_WIDTH};
use crate::device::capabilities::LogicalSpectrometer;

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_pixel_count() -> u16 {
    1024
}

/// Per-device configuration.
///
/// `pixel_count`, `model`, and `serial_number` only matter for transports
/// without an addressable EEPROM, where the calibration record is synthesized
/// instead of read. Pixel count is configuration, never probed from data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpectrometerConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default = "default_pixel_count")]
    pub pixel_count: u16,
    /// Control-command round-trip timeout.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for SpectrometerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            serial_number: String::new(),
            pixel_count: default_pixel_count(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl SpectrometerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pixel_count == 0 {
            bail!("pixel_count must be nonzero");
        }
        if self.command_timeout_ms == 0 {
            bail!("command_timeout_ms must be nonzero");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_scan_averaging() -> u32 {
    1
}

fn default_trigger_pulse_ms() -> u64 {
    TRIGGER_PULSE_WIDTH.as_millis() as u64
}

fn default_overhead_ms() -> u64 {
    PER_DEVICE_OVERHEAD.as_millis() as u64
}

/// Configuration for a coordinated set of spectrometers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    #[serde(default = "default_scan_averaging")]
    pub scan_averaging: u32,
    #[serde(default = "default_trigger_pulse_ms")]
    pub trigger_pulse_ms: u64,
    #[serde(default = "default_overhead_ms")]
    pub per_device_overhead_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_averaging: default_scan_averaging(),
            trigger_pulse_ms: default_trigger_pulse_ms(),
            per_device_overhead_ms: default_overhead_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_averaging == 0 {
            bail!("scan_averaging must be at least 1");
        }
        if self.trigger_pulse_ms == 0 {
            bail!("trigger_pulse_ms must be nonzero");
        }
        if self.per_device_overhead_ms == 0 {
            bail!("per_device_overhead_ms must be nonzero");
        }
        Ok(())
    }

    /// Build a [`SpectrometerSet`] with these settings and switch it to the
    /// given trigger mode.
    pub async fn build(
        &self,
        devices: Vec<Arc<dyn LogicalSpectrometer>>,
        mode: TriggerMode,
    ) -> Result<SpectrometerSet> {
        self.validate()?;
        let mut set = SpectrometerSet::new(devices)
            .with_trigger_pulse(Duration::from_millis(self.trigger_pulse_ms))
            .with_overhead(Duration::from_millis(self.per_device_overhead_ms));
        set.set_trigger_mode(mode).await?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_defaults() {
        let config = SpectrometerConfig::from_toml("").unwrap();
        assert_eq!(config.pixel_count, 1024);
        assert_eq!(config.command_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn device_config_round_trip() {
        let text = r#"
            model = "WP-785X"
            serial_number = "WP-00031"
            pixel_count = 2048
            command_timeout_ms = 500
        "#;
        let config = SpectrometerConfig::from_toml(text).unwrap();
        assert_eq!(config.model, "WP-785X");
        assert_eq!(config.pixel_count, 2048);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        std::fs::write(&path, "serial_number = \"WP-9\"\npixel_count = 512\n").unwrap();
        let config = SpectrometerConfig::load(&path).unwrap();
        assert_eq!(config.serial_number, "WP-9");
        assert_eq!(config.pixel_count, 512);
    }

    #[test]
    fn zero_pixel_count_rejected() {
        assert!(SpectrometerConfig::from_toml("pixel_count = 0").is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(SpectrometerConfig::from_toml("pixle_count = 10").is_err());
    }

    #[test]
    fn coordinator_config_defaults() {
        let config = CoordinatorConfig::from_toml("").unwrap();
        assert_eq!(config.scan_averaging, 1);
        assert_eq!(config.trigger_pulse_ms, 5);
        assert_eq!(config.per_device_overhead_ms, 100);
    }

    #[test]
    fn coordinator_zero_averaging_rejected() {
        assert!(CoordinatorConfig::from_toml("scan_averaging = 0").is_err());
    }
}
