//! Capability traits for spectrometer-like devices.
//!
//! The pipeline, optimizer, and coordinator consume these traits, never the
//! concrete [`Spectrometer`](super::Spectrometer), so a synthetic device can
//! stand in during tests and a future transport adapter needs no changes
//! upstream. Fixed interface per capability; transport variation stays below
//! the device core.
//!
//! All methods return `anyhow::Result` at this seam; typed errors live in
//! [`crate::error`] underneath.

use anyhow::Result;
use async_trait::async_trait;

/// Trigger routing for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Device integrates on the software acquire command.
    #[default]
    Internal,
    /// Device waits for an external hardware pulse.
    External,
}

impl TriggerSource {
    pub fn wire_value(self) -> u16 {
        match self {
            TriggerSource::Internal => 0,
            TriggerSource::External => 1,
        }
    }
}

/// Produces spectra.
#[async_trait]
pub trait SpectrumSource: Send + Sync {
    /// Trigger (if internally triggered), wait out the integration, and read
    /// one raw spectrum.
    async fn acquire_raw(&self) -> Result<Vec<f64>>;

    /// Wait and read only; the caller has already triggered the device
    /// (hardware pulse or explicit [`TriggerControl::software_trigger`]).
    async fn read_spectrum(&self) -> Result<Vec<f64>>;

    /// Pixels per spectrum. Calibration/configuration data, never probed.
    fn pixel_count(&self) -> usize;
}

/// Integration-time control with device-specific bounds.
#[async_trait]
pub trait IntegrationControl: Send + Sync {
    /// Request an integration time; returns the value actually applied after
    /// clamping to the device's calibrated bounds.
    async fn set_integration_time_ms(&self, ms: u32) -> Result<u32>;

    /// Currently applied integration time.
    fn integration_time_ms(&self) -> u32;

    /// Calibrated `(min, max)` bounds in milliseconds.
    fn integration_limits_ms(&self) -> (u32, u32);
}

/// Trigger-source selection and software triggering.
#[async_trait]
pub trait TriggerControl: Send + Sync {
    async fn set_trigger_source(&self, source: TriggerSource) -> Result<()>;

    fn trigger_source(&self) -> TriggerSource;

    /// Start an integration without reading it back.
    async fn software_trigger(&self) -> Result<()>;
}

/// Laser enable line. The coordinator also drives this line as a
/// hardware-trigger pulse generator and as a fan GPIO on designated units.
#[async_trait]
pub trait LaserControl: Send + Sync {
    async fn set_laser_enable(&self, on: bool) -> Result<()>;

    async fn laser_enabled(&self) -> Result<bool>;
}

/// Detector thermoelectric cooler control and temperature readout.
#[async_trait]
pub trait ThermalControl: Send + Sync {
    async fn set_tec_enable(&self, on: bool) -> Result<()>;

    /// Setpoint in degC, converted to DAC counts via the calibration record.
    async fn set_tec_setpoint_degc(&self, degc: f64) -> Result<()>;

    /// Current detector temperature in degC via the ADC polynomial.
    async fn detector_temperature_degc(&self) -> Result<f64>;
}

/// Read-only view of the calibration record.
pub trait CalibrationAccess: Send + Sync {
    fn serial_number(&self) -> String;

    /// Wavelength axis, one entry per active pixel.
    fn wavelengths(&self) -> Vec<f64>;

    /// Sorted, deduplicated bad-pixel indices.
    fn bad_pixel_set(&self) -> Vec<usize>;

    /// Free-form user text block (coordinator position/feature keys).
    fn user_text(&self) -> String;
}

/// Everything the acquisition layers need from one device, as a single
/// trait object. Blanket-implemented for any type with the parts.
pub trait LogicalSpectrometer:
    SpectrumSource + IntegrationControl + TriggerControl + LaserControl + CalibrationAccess
{
}

impl<T> LogicalSpectrometer for T where
    T: SpectrumSource + IntegrationControl + TriggerControl + LaserControl + CalibrationAccess
{
}
