//! Multi-device trigger and timeout coordination.
//!
//! A [`SpectrometerSet`] drives several units off one trigger event and reads
//! them back serially, shortest integration time first, so the fast units are
//! drained while the slow ones are still integrating. Each read gets a fair
//! timeout that accounts for time already spent on earlier devices.
//!
//! Position and role assignment comes from the `pos=` / `feature=` keys in
//! each unit's calibration user text. One unit may be designated
//! `feature=trigger` (its laser line doubles as the hardware trigger pulse
//! generator) and one `feature=fan` (its laser line switches an enclosure
//! fan).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::capabilities::{LogicalSpectrometer, TriggerSource};

/// Hardware-trigger pulse width.
pub const TRIGGER_PULSE_WIDTH: Duration = Duration::from_millis(5);

/// Per-device bookkeeping overhead assumed by the fair-timeout formula.
pub const PER_DEVICE_OVERHEAD: Duration = Duration::from_millis(100);

/// How acquisitions are started across the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Each device is triggered by its own acquire command.
    #[default]
    Software,
    /// All devices wait for one electrical pulse from the trigger unit.
    Hardware,
}

/// Tags parsed from a unit's calibration user text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTags {
    pub position: Option<u8>,
    pub features: Vec<String>,
}

impl DeviceTags {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// Parse the `;`-separated `key=value` user-text mini-format. Keys are
/// case-insensitive; malformed pairs are logged and ignored, never fatal —
/// the user text is free-form and end users write anything into it.
pub fn parse_user_text(text: &str) -> DeviceTags {
    let mut tags = DeviceTags::default();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            debug!(pair, "user-text entry without '=', ignoring");
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "pos" => match value.parse::<u8>() {
                Ok(pos) => tags.position = Some(pos),
                Err(_) => warn!(value, "unparseable pos= in user text, ignoring"),
            },
            "feature" => tags.features.push(value.to_ascii_lowercase()),
            other => debug!(key = other, value, "unrecognized user-text key"),
        }
    }
    tags
}

/// Fair per-device read timeout.
///
/// Budget is twice the device's integration time plus the whole set's
/// bookkeeping overhead, less what earlier reads already consumed, but never
/// below the overhead floor: a device that happens to be read last still
/// gets enough slack to answer.
pub fn fair_timeout(
    integration_ms: u32,
    device_count: usize,
    overhead: Duration,
    elapsed: Duration,
) -> Duration {
    let floor = overhead * device_count as u32;
    let budget = Duration::from_millis(2 * u64::from(integration_ms)) + floor;
    budget.saturating_sub(elapsed).max(floor)
}

/// Per-position spectra from one coordinated acquisition. A `None` entry is
/// a device that timed out or faulted on this round.
pub type SpectraByPosition = BTreeMap<u8, Option<Vec<f64>>>;

/// A coordinated group of spectrometers.
pub struct SpectrometerSet {
    devices: BTreeMap<u8, Arc<dyn LogicalSpectrometer>>,
    trigger_position: Option<u8>,
    fan_position: Option<u8>,
    trigger_mode: TriggerMode,
    trigger_pulse: Duration,
    per_device_overhead: Duration,
    darks: Mutex<BTreeMap<u8, Vec<f64>>>,
    references: Mutex<BTreeMap<u8, Vec<f64>>>,
}

impl SpectrometerSet {
    /// Build the set. Positions come from each unit's `pos=` tag; a missing
    /// or colliding position takes the next free slot upward.
    pub fn new(devices: Vec<Arc<dyn LogicalSpectrometer>>) -> Self {
        let mut by_position: BTreeMap<u8, Arc<dyn LogicalSpectrometer>> = BTreeMap::new();
        let mut trigger_position = None;
        let mut fan_position = None;

        for device in devices {
            let tags = parse_user_text(&device.user_text());
            let requested = tags.position.unwrap_or(0);
            // Climb upward from the requested slot; the search is bounded so
            // an exhausted position space skips the device instead of
            // spinning.
            let Some(position) = (requested..=u8::MAX).find(|p| !by_position.contains_key(p))
            else {
                warn!(
                    serial = %device.serial_number(),
                    requested,
                    "no free position at or above the requested slot, skipping device"
                );
                continue;
            };
            if position != requested {
                warn!(
                    serial = %device.serial_number(),
                    requested,
                    position,
                    "position collision, taking next free slot"
                );
            }
            if tags.has_feature("trigger") && trigger_position.is_none() {
                trigger_position = Some(position);
            }
            if tags.has_feature("fan") && fan_position.is_none() {
                fan_position = Some(position);
            }
            info!(
                serial = %device.serial_number(),
                position,
                features = ?tags.features,
                "registered spectrometer"
            );
            by_position.insert(position, device);
        }

        Self {
            devices: by_position,
            trigger_position,
            fan_position,
            trigger_mode: TriggerMode::Software,
            trigger_pulse: TRIGGER_PULSE_WIDTH,
            per_device_overhead: PER_DEVICE_OVERHEAD,
            darks: Mutex::new(BTreeMap::new()),
            references: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_overhead(mut self, overhead: Duration) -> Self {
        self.per_device_overhead = overhead;
        self
    }

    pub fn with_trigger_pulse(mut self, pulse: Duration) -> Self {
        self.trigger_pulse = pulse;
        self
    }

    pub fn positions(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, position: u8) -> Option<&Arc<dyn LogicalSpectrometer>> {
        self.devices.get(&position)
    }

    pub fn trigger_position(&self) -> Option<u8> {
        self.trigger_position
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger_mode
    }

    /// Switch every device's trigger source to match the mode. Hardware mode
    /// requires a designated trigger unit.
    pub async fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        if mode == TriggerMode::Hardware && self.trigger_position.is_none() {
            bail!("hardware trigger mode requires a unit tagged feature=trigger");
        }
        let source = match mode {
            TriggerMode::Software => TriggerSource::Internal,
            TriggerMode::Hardware => TriggerSource::External,
        };
        for (position, device) in &self.devices {
            device.set_trigger_source(source).await?;
            debug!(position, ?source, "trigger source set");
        }
        self.trigger_mode = mode;
        Ok(())
    }

    /// Start one acquisition across the whole set. Returns the instant the
    /// trigger completed, which anchors the fair-timeout clock.
    pub async fn start_acquisition(&self) -> Result<Instant> {
        match self.trigger_mode {
            TriggerMode::Hardware => {
                let position = self
                    .trigger_position
                    .and_then(|p| self.devices.get_key_value(&p));
                let Some((position, trigger)) = position else {
                    bail!("hardware trigger mode with no trigger unit");
                };
                debug!(position, "emitting hardware trigger pulse");
                trigger.set_laser_enable(true).await?;
                tokio::time::sleep(self.trigger_pulse).await;
                trigger.set_laser_enable(false).await?;
            }
            TriggerMode::Software => {
                for (position, device) in &self.devices {
                    debug!(position, "software trigger");
                    device.software_trigger().await?;
                }
            }
        }
        Ok(Instant::now())
    }

    /// Read every device serially, shortest integration time first, under
    /// fair timeouts anchored at `started`. A timeout or fault skips that
    /// device for this round; it never stalls the rest of the set.
    pub async fn read_all(&self, started: Instant) -> SpectraByPosition {
        let mut order: Vec<(u8, u32)> = self
            .devices
            .iter()
            .map(|(pos, dev)| (*pos, dev.integration_time_ms()))
            .collect();
        order.sort_by_key(|&(pos, ms)| (ms, pos));

        let count = order.len();
        let mut results = SpectraByPosition::new();
        for (position, integration_ms) in order {
            let device = &self.devices[&position];
            let elapsed = started.elapsed();
            let timeout = fair_timeout(integration_ms, count, self.per_device_overhead, elapsed);
            debug!(position, integration_ms, ?timeout, "reading device");
            let spectrum = match tokio::time::timeout(timeout, device.read_spectrum()).await {
                Ok(Ok(spectrum)) => Some(spectrum),
                Ok(Err(err)) => {
                    warn!(position, error = %err, "device fault during coordinated read");
                    None
                }
                Err(_) => {
                    warn!(position, ?timeout, "device timed out during coordinated read");
                    None
                }
            };
            results.insert(position, spectrum);
        }
        results
    }

    /// One full coordinated acquisition with coordinator-level scan
    /// averaging: every repetition is a fresh trigger across the set.
    pub async fn acquire_all(&self, scan_averaging: u32) -> Result<SpectraByPosition> {
        let reps = scan_averaging.max(1);
        let mut sums: BTreeMap<u8, Option<Vec<f64>>> = BTreeMap::new();

        for rep in 0..reps {
            let started = self.start_acquisition().await?;
            let round = self.read_all(started).await;
            debug!(rep, "coordinated round complete");
            for (position, spectrum) in round {
                let slot = sums.entry(position).or_insert_with(|| Some(Vec::new()));
                let Some(data) = spectrum else {
                    // A missed round poisons this device's average.
                    *slot = None;
                    continue;
                };
                match slot {
                    Some(acc) if acc.is_empty() => *acc = data,
                    Some(acc) if acc.len() == data.len() => {
                        for (a, v) in acc.iter_mut().zip(data.iter()) {
                            *a += v;
                        }
                    }
                    Some(_) => {
                        warn!(position, "spectrum length changed mid-averaging");
                        *slot = None;
                    }
                    None => {}
                }
            }
        }

        if reps > 1 {
            let n = f64::from(reps);
            for spectrum in sums.values_mut().flatten() {
                for v in spectrum.iter_mut() {
                    *v /= n;
                }
            }
        }
        Ok(sums)
    }

    /// Acquire and store per-device dark spectra.
    pub async fn take_dark(&self, scan_averaging: u32) -> Result<()> {
        let spectra = self.acquire_all(scan_averaging).await?;
        let mut darks = self.darks.lock();
        for (position, spectrum) in spectra {
            if let Some(dark) = spectrum {
                darks.insert(position, dark);
            } else {
                warn!(position, "no dark captured for device");
            }
        }
        Ok(())
    }

    /// Acquire and store per-device reference spectra.
    pub async fn take_reference(&self, scan_averaging: u32) -> Result<()> {
        let spectra = self.acquire_all(scan_averaging).await?;
        let mut references = self.references.lock();
        for (position, spectrum) in spectra {
            if let Some(reference) = spectrum {
                references.insert(position, reference);
            } else {
                warn!(position, "no reference captured for device");
            }
        }
        Ok(())
    }

    pub fn dark(&self, position: u8) -> Option<Vec<f64>> {
        self.darks.lock().get(&position).cloned()
    }

    pub fn reference(&self, position: u8) -> Option<Vec<f64>> {
        self.references.lock().get(&position).cloned()
    }

    /// Reflectance of a sample spectrum against the stored dark and
    /// reference: `(sample - dark) / (reference - dark)`. Pixels whose
    /// dark-corrected reference is zero yield zero rather than infinity.
    pub fn reflectance(&self, position: u8, sample: &[f64]) -> Option<Vec<f64>> {
        let reference = self.reference(position)?;
        if reference.len() != sample.len() {
            warn!(position, "reference length mismatch, no reflectance");
            return None;
        }
        let dark = self
            .dark(position)
            .unwrap_or_else(|| vec![0.0; sample.len()]);
        if dark.len() != sample.len() {
            warn!(position, "dark length mismatch, no reflectance");
            return None;
        }
        Some(
            sample
                .iter()
                .zip(reference.iter())
                .zip(dark.iter())
                .map(|((s, r), d)| {
                    let denom = r - d;
                    if denom == 0.0 {
                        0.0
                    } else {
                        (s - d) / denom
                    }
                })
                .collect(),
        )
    }

    /// Drive the fan GPIO on the designated unit.
    pub async fn set_fan(&self, on: bool) -> Result<()> {
        let position = self
            .fan_position
            .and_then(|p| self.devices.get_key_value(&p));
        let Some((position, device)) = position else {
            bail!("no unit tagged feature=fan");
        };
        info!(position, on, "switching fan");
        device.set_laser_enable(on).await
    }
}
