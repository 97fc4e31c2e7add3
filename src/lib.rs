//! Transport-agnostic driver core for a family of fiber-coupled
//! spectrometers.
//!
//! The same logical device ships behind USB, SPI, raw TCP, and vendor-SDK
//! transports; this crate contains everything above the transport seam:
//!
//! - the opcode request/response protocol, including per-board quirks
//!   ([`protocol`]),
//! - the paged, versioned calibration record ([`eeprom`]),
//! - the device core with cached settings and the sticky communication-error
//!   latch ([`device`]),
//! - spectrum processing ([`pipeline`]), integration-time auto-convergence
//!   ([`optimizer`]), and multi-device trigger/timeout coordination
//!   ([`coordinator`]).
//!
//! Concrete transport adapters live outside the crate and implement
//! [`transport::Transport`]; the in-crate [`transport::mock::MockTransport`]
//! backs the test suite.
//!
//! ```no_run
//! use std::sync::Arc;
//! use spectro_daq::device::Spectrometer;
//! use spectro_daq::device::capabilities::SpectrumSource;
//! use spectro_daq::transport::mock::MockTransport;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport = Arc::new(MockTransport::fx2());
//! let device = Spectrometer::open(transport).await?;
//! let spectrum = device.acquire_raw().await?;
//! println!("{} pixels", spectrum.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod device;
pub mod eeprom;
pub mod error;
pub mod optimizer;
pub mod pipeline;
pub mod protocol;
pub mod transport;

pub use config::{CoordinatorConfig, SpectrometerConfig};
pub use coordinator::{SpectrometerSet, TriggerMode};
pub use device::capabilities::{LogicalSpectrometer, TriggerSource};
pub use device::Spectrometer;
pub use eeprom::Eeprom;
pub use error::{DeviceError, EepromError, ProtocolError, TransportError};
pub use optimizer::{IntegrationOptimizer, OptimizeOutcome};
pub use pipeline::PipelineConfig;
