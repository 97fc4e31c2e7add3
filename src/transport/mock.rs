//! Simulated transport for tests and benches.
//!
//! Behaves like a real board at the wire level: it holds 8 EEPROM pages,
//! models detector counts as a function of integration time, honors the
//! trigger-source setting, and (when configured as an ARM board) reproduces
//! the inverted ack quirk so the protocol layer's correction is exercised
//! end to end. Failure injection covers per-opcode timeouts and per-page
//! EEPROM fetch faults.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::eeprom::layout::{Page, PAGE_COUNT, PAGE_SIZE};
use crate::eeprom::Eeprom;
use crate::error::TransportError;
use crate::protocol::opcodes::{retval_inverted, Opcode, ARM_INVERTED_RETVAL};

use super::{BoardFamily, CommandPacket, Transport, TransportKind};

/// Synthetic detector response model.
#[derive(Debug, Clone, Copy)]
pub enum DetectorModel {
    /// Peak grows linearly with integration time, clipped at full scale.
    /// This is what a well-behaved detector staring at a stable source does.
    Linear { base: f64, counts_per_ms: f64 },
    /// Peak independent of integration time (blocked input, dead detector).
    Flat { peak: f64 },
}

impl DetectorModel {
    fn peak(&self, integration_ms: u32) -> f64 {
        match *self {
            DetectorModel::Linear {
                base,
                counts_per_ms,
            } => (base + counts_per_ms * f64::from(integration_ms)).min(65_535.0),
            DetectorModel::Flat { peak } => peak.min(65_535.0),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    integration_ms: u32,
    trigger_source: u16,
    laser_on: bool,
    tec_enabled: bool,
    tec_dac: u16,
    /// Every SetLaserEnable transition, in order. Trigger pulses and fan
    /// switching show up here.
    laser_events: Vec<bool>,
    /// Software-trigger (AcquireSpectrum) count.
    trigger_count: u32,
    staged_pages: Vec<Option<Page>>,
    committed_pages: Vec<Page>,
    commit_count: u32,
    fail_pages: HashSet<usize>,
    timeout_opcodes: HashSet<u8>,
}

/// In-memory transport used by every test layer.
pub struct MockTransport {
    kind: TransportKind,
    family: BoardFamily,
    addressable_eeprom: bool,
    temperature_adc: u16,
    noise_counts: f64,
    model: Mutex<DetectorModel>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(family: BoardFamily) -> Self {
        Self {
            kind: TransportKind::Usb,
            family,
            addressable_eeprom: true,
            temperature_adc: 0x0800,
            noise_counts: 0.0,
            model: Mutex::new(DetectorModel::Linear {
                base: 800.0,
                counts_per_ms: 100.0,
            }),
            state: Mutex::new(MockState {
                integration_ms: 10,
                staged_pages: vec![None; PAGE_COUNT],
                committed_pages: vec![[0xFF; PAGE_SIZE]; PAGE_COUNT],
                ..MockState::default()
            }),
        }
    }

    pub fn fx2() -> Self {
        Self::new(BoardFamily::Fx2)
    }

    pub fn arm() -> Self {
        Self::new(BoardFamily::Arm)
    }

    /// Seed the simulated EEPROM from a calibration record.
    pub fn with_record(self, record: &Eeprom) -> Self {
        self.state.lock().committed_pages = record.render_pages();
        self
    }

    /// Seed raw pages directly.
    pub fn with_pages(self, pages: Vec<Page>) -> Self {
        self.state.lock().committed_pages = pages;
        self
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Simulate a transport whose calibration area cannot be addressed
    /// (vendor SDK shims); the device core synthesizes a record instead.
    pub fn without_addressable_eeprom(mut self) -> Self {
        self.addressable_eeprom = false;
        self
    }

    /// Uniform per-pixel noise amplitude in counts.
    pub fn with_noise(mut self, counts: f64) -> Self {
        self.noise_counts = counts;
        self
    }

    pub fn set_detector_model(&self, model: DetectorModel) {
        *self.model.lock() = model;
    }

    /// Make the given EEPROM page fail to fetch.
    pub fn inject_page_failure(&self, page: usize) {
        self.state.lock().fail_pages.insert(page);
    }

    /// Make the given opcode time out from now on.
    pub fn inject_timeout(&self, opcode: Opcode) {
        self.state.lock().timeout_opcodes.insert(opcode.code());
    }

    pub fn clear_timeouts(&self) {
        self.state.lock().timeout_opcodes.clear();
    }

    pub fn integration_ms(&self) -> u32 {
        self.state.lock().integration_ms
    }

    pub fn trigger_source(&self) -> u16 {
        self.state.lock().trigger_source
    }

    pub fn trigger_count(&self) -> u32 {
        self.state.lock().trigger_count
    }

    pub fn laser_events(&self) -> Vec<bool> {
        self.state.lock().laser_events.clone()
    }

    pub fn tec_enabled(&self) -> bool {
        self.state.lock().tec_enabled
    }

    pub fn tec_dac(&self) -> u16 {
        self.state.lock().tec_dac
    }

    /// Explicit commit sequences seen (buffered transports only).
    pub fn commit_count(&self) -> u32 {
        self.state.lock().commit_count
    }

    pub fn committed_pages(&self) -> Vec<Page> {
        self.state.lock().committed_pages.clone()
    }

    fn check_timeout(&self, code: u8, timeout: Duration) -> Result<(), TransportError> {
        if self.state.lock().timeout_opcodes.contains(&code) {
            Err(TransportError::Timeout(timeout))
        } else {
            Ok(())
        }
    }

    /// Raw ack for a logically successful command, with the ARM quirk.
    fn raw_ack(&self, opcode: Opcode) -> bool {
        !retval_inverted(self.family, opcode)
    }

    fn opcode_for(code: u8) -> Option<Opcode> {
        [
            Opcode::AcquireSpectrum,
            Opcode::SetIntegrationTime,
            Opcode::GetIntegrationTime,
            Opcode::SetTriggerSource,
            Opcode::SetLaserEnable,
            Opcode::GetLaserEnable,
            Opcode::SetTecEnable,
            Opcode::SetTecSetpoint,
            Opcode::GetDetectorTemperature,
            Opcode::ReadEeprom,
            Opcode::WriteEeprom,
            Opcode::GetFirmwareVersion,
            Opcode::GetFpgaVersion,
            Opcode::SecondTierCommand,
        ]
        .into_iter()
        .find(|op| op.code() == code)
    }

    fn spectrum_bytes(&self, len: usize) -> Vec<u8> {
        let pixels = len / 2;
        let peak = {
            let state = self.state.lock();
            self.model.lock().peak(state.integration_ms)
        };
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(len);
        let center = pixels as f64 / 2.0;
        let width = (pixels as f64 / 10.0).max(1.0);
        for px in 0..pixels {
            let x = (px as f64 - center) / width;
            let mut counts = 800.0 + (peak - 800.0).max(0.0) * (-x * x).exp();
            if self.noise_counts > 0.0 {
                counts += rng.gen_range(-self.noise_counts..=self.noise_counts);
            }
            let counts = counts.clamp(0.0, 65_535.0) as u16;
            out.extend_from_slice(&counts.to_le_bytes());
        }
        out
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn board_family(&self) -> BoardFamily {
        self.family
    }

    fn has_addressable_eeprom(&self) -> bool {
        self.addressable_eeprom
    }

    fn requires_buffered_eeprom_commit(&self) -> bool {
        self.kind == TransportKind::Spi
    }

    async fn send_command(
        &self,
        packet: &CommandPacket,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        self.check_timeout(packet.opcode, timeout)?;
        let Some(opcode) = Self::opcode_for(packet.opcode) else {
            return Ok(false);
        };

        let mut state = self.state.lock();
        match opcode {
            Opcode::AcquireSpectrum => state.trigger_count += 1,
            Opcode::SetIntegrationTime => {
                state.integration_ms =
                    u32::from(packet.value) | (u32::from(packet.index) << 16);
            }
            Opcode::SetTriggerSource => state.trigger_source = packet.value,
            Opcode::SetLaserEnable => {
                let on = packet.value != 0;
                state.laser_on = on;
                state.laser_events.push(on);
            }
            Opcode::SetTecEnable => state.tec_enabled = packet.value != 0,
            Opcode::SetTecSetpoint => state.tec_dac = packet.value,
            Opcode::WriteEeprom => {
                let page = usize::from(packet.index);
                if page >= PAGE_COUNT {
                    return Ok(!self.raw_ack(opcode));
                }
                if self.requires_buffered_eeprom_commit() {
                    if packet.value == 1 {
                        // Commit sequence: move the staged page into place.
                        if let Some(staged) = state.staged_pages[page].take() {
                            state.committed_pages[page] = staged;
                        }
                        state.commit_count += 1;
                    } else if packet.payload.len() == PAGE_SIZE {
                        let mut buf = [0u8; PAGE_SIZE];
                        buf.copy_from_slice(&packet.payload);
                        state.staged_pages[page] = Some(buf);
                    }
                } else if packet.payload.len() == PAGE_SIZE {
                    state.committed_pages[page].copy_from_slice(&packet.payload);
                }
            }
            _ => {}
        }
        Ok(self.raw_ack(opcode))
    }

    async fn read_response(
        &self,
        packet: &CommandPacket,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_timeout(packet.opcode, timeout)?;

        // Second-tier reads carry the sub-opcode in `value`.
        if packet.opcode == Opcode::SecondTierCommand.code()
            && packet.value == u16::from(Opcode::ReadEeprom.code())
        {
            let page = usize::from(packet.index);
            let state = self.state.lock();
            if state.fail_pages.contains(&page) || page >= state.committed_pages.len() {
                return Err(TransportError::Bus(format!("page {page} fetch fault")));
            }
            return Ok(state.committed_pages[page][..len.min(PAGE_SIZE)].to_vec());
        }

        let state = self.state.lock();
        let bytes = match Self::opcode_for(packet.opcode) {
            Some(Opcode::GetIntegrationTime) => {
                let mut b = state.integration_ms.to_le_bytes().to_vec();
                b.extend_from_slice(&[0, 0]);
                b
            }
            Some(Opcode::GetLaserEnable) => vec![u8::from(state.laser_on)],
            Some(Opcode::GetDetectorTemperature) => self.temperature_adc.to_be_bytes().to_vec(),
            Some(Opcode::GetFirmwareVersion) => vec![7, 0, 2, 1],
            Some(Opcode::GetFpgaVersion) => b"008-007".to_vec(),
            _ => vec![0; len],
        };
        Ok(bytes)
    }

    async fn read_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check_timeout(Opcode::AcquireSpectrum.code(), timeout)?;
        Ok(self.spectrum_bytes(len))
    }
}

// The quirk table is data; keep the mock honest against it.
const _: () = assert!(ARM_INVERTED_RETVAL.len() == 6);
