//! Device core: one spectrometer behind one transport.
//!
//! [`Spectrometer`] owns a [`CommandLink`] and the parsed calibration record
//! for its whole lifetime. Settings with a completed round trip are cached
//! locally (integration time, trigger source, TEC state, laser enable); the
//! cache is authoritative only after the device acknowledged the write.
//!
//! Two invariants this module enforces:
//! - the acquisition mutex is held across trigger, wait, and bulk read, so
//!   concurrent callers can never interleave a half-finished acquisition;
//! - on session-oriented transports a command timeout latches a sticky
//!   communication-error flag and every further operation short-circuits
//!   until [`Spectrometer::clear_communication_error`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SpectrometerConfig;
use crate::eeprom::{Eeprom, RecordChanged};
use crate::error::{DeviceError, ProtocolError};
use crate::protocol::opcodes::Opcode;
use crate::protocol::CommandLink;
use crate::transport::Transport;

pub mod capabilities;

use capabilities::{
    CalibrationAccess, IntegrationControl, LaserControl, SpectrumSource, ThermalControl,
    TriggerControl, TriggerSource,
};

/// Fixed margin added to the integration time before the bulk read.
const ACQUISITION_MARGIN: Duration = Duration::from_millis(100);

/// Subscriber invoked synchronously on calibration-record mutation.
pub type RecordSubscriber = Box<dyn Fn(RecordChanged) + Send>;

#[derive(Debug, Clone)]
struct CachedState {
    integration_ms: u32,
    trigger_source: TriggerSource,
    tec_enabled: bool,
    tec_setpoint_degc: Option<f64>,
    laser_on: bool,
}

/// One spectrometer device.
pub struct Spectrometer {
    link: CommandLink,
    eeprom: RwLock<Eeprom>,
    state: Mutex<CachedState>,
    acquisition: tokio::sync::Mutex<()>,
    comm_error: AtomicBool,
    subscribers: Mutex<Vec<RecordSubscriber>>,
}

impl Spectrometer {
    /// Open a device with default configuration.
    pub async fn open(transport: Arc<dyn Transport>) -> Result<Arc<Self>, DeviceError> {
        Self::open_with_config(transport, &SpectrometerConfig::default()).await
    }

    /// Open a device: read (or synthesize) the calibration record, then apply
    /// the startup settings from page 0. A blank or unreadable record never
    /// fails the open; a dead control channel does.
    pub async fn open_with_config(
        transport: Arc<dyn Transport>,
        config: &SpectrometerConfig,
    ) -> Result<Arc<Self>, DeviceError> {
        let link = CommandLink::with_timeout(transport, config.command_timeout());

        let mut eeprom = if link.has_addressable_eeprom() {
            Eeprom::read(&link).await
        } else {
            Eeprom::read_synthetic(config.pixel_count, &config.model, &config.serial_number)
        };
        eeprom.enforce_reasonable_defaults();

        info!(
            serial = %eeprom.serial_number,
            model = %eeprom.model,
            format = eeprom.format,
            defaults = eeprom.default_values,
            "opened spectrometer"
        );

        let startup_integration = u32::from(eeprom.startup_integration_ms).max(1);
        let startup_trigger = match eeprom.startup_trigger_mode {
            1 => TriggerSource::External,
            _ => TriggerSource::Internal,
        };
        let startup_temp = f64::from(eeprom.startup_temp_degc);
        let has_cooling = eeprom.has_cooling;

        let device = Arc::new(Self {
            link,
            eeprom: RwLock::new(eeprom),
            state: Mutex::new(CachedState {
                integration_ms: startup_integration,
                trigger_source: TriggerSource::Internal,
                tec_enabled: false,
                tec_setpoint_degc: None,
                laser_on: false,
            }),
            acquisition: tokio::sync::Mutex::new(()),
            comm_error: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });

        device.apply_integration_time(startup_integration).await?;
        device.apply_trigger_source(startup_trigger).await?;
        if has_cooling {
            device.apply_tec_enable(true).await?;
            device.apply_tec_setpoint(startup_temp).await?;
        }

        Ok(device)
    }

    pub fn serial(&self) -> String {
        self.eeprom.read().serial_number.clone()
    }

    /// Snapshot of the calibration record.
    pub fn eeprom(&self) -> Eeprom {
        self.eeprom.read().clone()
    }

    /// Register a synchronous record-mutation subscriber.
    pub fn subscribe(&self, subscriber: RecordSubscriber) {
        self.subscribers.lock().push(subscriber);
    }

    fn notify(&self, change: RecordChanged) {
        for sub in self.subscribers.lock().iter() {
            sub(change);
        }
    }

    /// Mutate the record's user text and notify subscribers.
    pub fn set_user_text(&self, text: &str) {
        let change = self.eeprom.write().set_user_text(text);
        self.notify(change);
    }

    /// Mutate the record's bad-pixel list and notify subscribers.
    pub fn set_bad_pixels(&self, pixels: &[usize]) {
        let change = self.eeprom.write().set_bad_pixels(pixels);
        self.notify(change);
    }

    /// Commit the (possibly mutated) calibration record to the device.
    /// Holds the acquisition lock for the whole page-commit sequence: page
    /// writes interleaved with a trigger/bulk-read window would corrupt the
    /// record on the shared transport.
    pub async fn write_eeprom(&self) -> Result<(), DeviceError> {
        self.check_latch()?;
        let _guard = self.acquisition.lock().await;
        let mut record = self.eeprom.read().clone();
        let result = record.write(&self.link).await;
        if result.is_ok() {
            *self.eeprom.write() = record;
        }
        result.map_err(DeviceError::from)
    }

    /// Last acknowledged TEC enable state.
    pub fn tec_enabled(&self) -> bool {
        self.state.lock().tec_enabled
    }

    /// Last acknowledged TEC setpoint, if one was applied.
    pub fn tec_setpoint_degc(&self) -> Option<f64> {
        self.state.lock().tec_setpoint_degc
    }

    /// Last acknowledged laser state. A cache, not a device query; see
    /// [`LaserControl::laser_enabled`] for the round trip.
    pub fn laser_on_cached(&self) -> bool {
        self.state.lock().laser_on
    }

    pub fn communication_error(&self) -> bool {
        self.comm_error.load(Ordering::SeqCst)
    }

    /// Clear the sticky communication-error latch after the caller has
    /// re-established the session.
    pub fn clear_communication_error(&self) {
        if self.comm_error.swap(false, Ordering::SeqCst) {
            info!(serial = %self.serial(), "communication-error latch cleared");
        }
    }

    fn check_latch(&self) -> Result<(), DeviceError> {
        if self.communication_error() {
            Err(DeviceError::CommunicationLatched)
        } else {
            Ok(())
        }
    }

    /// Latch on timeout for session-oriented transports; a one-off bus error
    /// does not poison the session.
    fn note_failure(&self, err: &ProtocolError) {
        if err.is_timeout() && self.link.transport_kind().is_session_oriented() {
            warn!(
                serial = %self.serial(),
                kind = ?self.link.transport_kind(),
                "timeout on session-oriented transport, latching communication error"
            );
            self.comm_error.store(true, Ordering::SeqCst);
        }
    }

    async fn send(&self, opcode: Opcode, value: u16, index: u16) -> Result<(), DeviceError> {
        self.check_latch()?;
        self.link
            .send(opcode, value, index, &[])
            .await
            .map_err(|err| {
                self.note_failure(&err);
                DeviceError::from(err)
            })
    }

    async fn read(
        &self,
        opcode: Opcode,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        self.check_latch()?;
        self.link.read(opcode, index, len).await.map_err(|err| {
            self.note_failure(&err);
            DeviceError::from(err)
        })
    }

    async fn apply_integration_time(&self, ms: u32) -> Result<u32, DeviceError> {
        let (min, max) = self.integration_limits();
        let clamped = ms.clamp(min, max);
        if clamped != ms {
            warn!(
                serial = %self.serial(),
                requested = ms,
                applied = clamped,
                min,
                max,
                "integration time clamped to calibrated bounds"
            );
        }
        self.send(
            Opcode::SetIntegrationTime,
            (clamped & 0xFFFF) as u16,
            (clamped >> 16) as u16,
        )
        .await?;
        self.state.lock().integration_ms = clamped;
        debug!(serial = %self.serial(), ms = clamped, "integration time applied");
        Ok(clamped)
    }

    fn integration_limits(&self) -> (u32, u32) {
        let rec = self.eeprom.read();
        (rec.min_integration_ms, rec.max_integration_ms)
    }

    /// Ask the device for its current integration time (6-byte response,
    /// milliseconds in the first 4 little-endian bytes).
    pub async fn query_integration_time_ms(&self) -> Result<u32, DeviceError> {
        let bytes = self.read(Opcode::GetIntegrationTime, 0, 6).await?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn apply_trigger_source(&self, source: TriggerSource) -> Result<(), DeviceError> {
        self.send(Opcode::SetTriggerSource, source.wire_value(), 0)
            .await?;
        self.state.lock().trigger_source = source;
        Ok(())
    }

    async fn apply_tec_enable(&self, on: bool) -> Result<(), DeviceError> {
        self.send(Opcode::SetTecEnable, u16::from(on), 0).await?;
        self.state.lock().tec_enabled = on;
        Ok(())
    }

    async fn apply_tec_setpoint(&self, degc: f64) -> Result<(), DeviceError> {
        let (coeffs, min, max) = {
            let rec = self.eeprom.read();
            (
                rec.degc_to_dac_coeffs,
                f64::from(rec.detector_temp_min),
                f64::from(rec.detector_temp_max),
            )
        };
        let clamped = degc.clamp(min, max);
        if (clamped - degc).abs() > f64::EPSILON {
            warn!(
                serial = %self.serial(),
                requested = degc,
                applied = clamped,
                "TEC setpoint clamped to calibrated range"
            );
        }
        let dac = f64::from(coeffs[0])
            + f64::from(coeffs[1]) * clamped
            + f64::from(coeffs[2]) * clamped * clamped;
        let dac = dac.round().clamp(0.0, 65_535.0) as u16;
        self.send(Opcode::SetTecSetpoint, dac, 0).await?;
        self.state.lock().tec_setpoint_degc = Some(clamped);
        Ok(())
    }

    /// Firmware revision as dotted quad (little-endian on the wire).
    pub async fn firmware_version(&self) -> Result<String, DeviceError> {
        let b = self.read(Opcode::GetFirmwareVersion, 0, 4).await?;
        Ok(format!("{}.{}.{}.{}", b[3], b[2], b[1], b[0]))
    }

    /// FPGA revision string (7 ASCII bytes).
    pub async fn fpga_version(&self) -> Result<String, DeviceError> {
        let b = self.read(Opcode::GetFpgaVersion, 0, 7).await?;
        Ok(String::from_utf8_lossy(&b).trim_matches(char::from(0)).trim().to_string())
    }

    async fn read_temperature_degc(&self) -> Result<f64, DeviceError> {
        let bytes = self.read(Opcode::GetDetectorTemperature, 0, 2).await?;
        // Big-endian ADC value, unlike every other scalar on this wire.
        let adc = f64::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let c = self.eeprom.read().adc_to_degc_coeffs;
        Ok(f64::from(c[0]) + f64::from(c[1]) * adc + f64::from(c[2]) * adc * adc)
    }

    /// Trigger (when internally triggered), wait, bulk-read, decode.
    async fn acquire_inner(&self, trigger: bool) -> Result<Vec<f64>, DeviceError> {
        self.check_latch()?;
        let _guard = self.acquisition.lock().await;

        let (integration_ms, source) = {
            let s = self.state.lock();
            (s.integration_ms, s.trigger_source)
        };

        if trigger && source == TriggerSource::Internal {
            self.send(Opcode::AcquireSpectrum, 0, 0).await?;
        }

        tokio::time::sleep(Duration::from_millis(u64::from(integration_ms)) + ACQUISITION_MARGIN)
            .await;

        let pixels = usize::from(self.eeprom.read().active_pixels_horizontal);
        let bulk_timeout =
            Duration::from_millis(2 * u64::from(integration_ms)) + 5 * ACQUISITION_MARGIN;
        let bytes = self
            .link
            .read_bulk(pixels * 2, bulk_timeout)
            .await
            .map_err(|err| {
                self.note_failure(&err);
                DeviceError::from(err)
            })?;

        if bytes.is_empty() || pixels == 0 {
            return Err(DeviceError::NoData);
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])))
            .collect())
    }
}

#[async_trait]
impl SpectrumSource for Spectrometer {
    async fn acquire_raw(&self) -> Result<Vec<f64>> {
        Ok(self.acquire_inner(true).await?)
    }

    async fn read_spectrum(&self) -> Result<Vec<f64>> {
        Ok(self.acquire_inner(false).await?)
    }

    fn pixel_count(&self) -> usize {
        usize::from(self.eeprom.read().active_pixels_horizontal)
    }
}

#[async_trait]
impl IntegrationControl for Spectrometer {
    async fn set_integration_time_ms(&self, ms: u32) -> Result<u32> {
        Ok(self.apply_integration_time(ms).await?)
    }

    fn integration_time_ms(&self) -> u32 {
        self.state.lock().integration_ms
    }

    fn integration_limits_ms(&self) -> (u32, u32) {
        self.integration_limits()
    }
}

#[async_trait]
impl TriggerControl for Spectrometer {
    async fn set_trigger_source(&self, source: TriggerSource) -> Result<()> {
        Ok(self.apply_trigger_source(source).await?)
    }

    fn trigger_source(&self) -> TriggerSource {
        self.state.lock().trigger_source
    }

    async fn software_trigger(&self) -> Result<()> {
        Ok(self.send(Opcode::AcquireSpectrum, 0, 0).await?)
    }
}

#[async_trait]
impl LaserControl for Spectrometer {
    async fn set_laser_enable(&self, on: bool) -> Result<()> {
        self.send(Opcode::SetLaserEnable, u16::from(on), 0).await?;
        self.state.lock().laser_on = on;
        Ok(())
    }

    async fn laser_enabled(&self) -> Result<bool> {
        let b = self.read(Opcode::GetLaserEnable, 0, 1).await?;
        Ok(b[0] != 0)
    }
}

#[async_trait]
impl ThermalControl for Spectrometer {
    async fn set_tec_enable(&self, on: bool) -> Result<()> {
        Ok(self.apply_tec_enable(on).await?)
    }

    async fn set_tec_setpoint_degc(&self, degc: f64) -> Result<()> {
        Ok(self.apply_tec_setpoint(degc).await?)
    }

    async fn detector_temperature_degc(&self) -> Result<f64> {
        Ok(self.read_temperature_degc().await?)
    }
}

impl CalibrationAccess for Spectrometer {
    fn serial_number(&self) -> String {
        self.serial()
    }

    fn wavelengths(&self) -> Vec<f64> {
        self.eeprom.read().wavelengths().to_vec()
    }

    fn bad_pixel_set(&self) -> Vec<usize> {
        self.eeprom.read().bad_pixel_set().to_vec()
    }

    fn user_text(&self) -> String {
        self.eeprom.read().user_text()
    }
}
