//! Versioned, paged calibration record ("EEPROM").
//!
//! The record is 8 fixed 64-byte pages holding everything needed to interpret
//! raw detector samples: wavelength calibration, detector geometry, thermal
//! coefficients, laser power calibration, bad pixels, and free-form user
//! text. Offsets have accumulated across eight format revisions and two
//! page-6 subformats; [`layout`] holds the offset table and `from_pages`
//! applies the format gating.
//!
//! Reading never aborts device initialization: a blank or unreadable record
//! substitutes documented defaults flagged `default_values`. Writing always
//! re-stamps the latest format (forward migration on write) and deliberately
//! minimizes page commits on the wear-limited medium.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EepromError;
use crate::protocol::opcodes::Opcode;
use crate::protocol::CommandLink;

pub mod export;
pub mod layout;

use layout::*;

/// Page-6 content selector, present at format >= 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subformat {
    #[default]
    UserData,
    IntensityCalibration,
}

impl Subformat {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => Subformat::IntensityCalibration,
            0 => Subformat::UserData,
            other => {
                debug!(value = other, "unknown subformat byte, assuming user data");
                Subformat::UserData
            }
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Subformat::UserData => 0,
            Subformat::IntensityCalibration => 1,
        }
    }
}

/// Synchronous field-mutation notification (no implicit event bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordChanged {
    pub field: &'static str,
}

/// Parsed calibration record plus derived caches.
#[derive(Debug, Clone, PartialEq)]
pub struct Eeprom {
    pub format: u8,

    // Page 0
    pub model: String,
    pub serial_number: String,
    pub baud_rate: u32,
    pub has_cooling: bool,
    pub has_battery: bool,
    pub has_laser: bool,
    pub slit_size_um: u16,
    pub startup_integration_ms: u16,
    pub startup_temp_degc: i16,
    pub startup_trigger_mode: u8,
    pub detector_gain: f32,
    pub detector_offset: i16,
    pub detector_gain_odd: f32,
    pub detector_offset_odd: i16,

    // Page 1
    pub wavecal_coeffs: [f32; 5],
    pub degc_to_dac_coeffs: [f32; 3],
    pub detector_temp_max: i16,
    pub detector_temp_min: i16,
    pub adc_to_degc_coeffs: [f32; 3],
    pub thermistor_resistance_298k: i16,
    pub thermistor_beta: i16,
    pub calibration_date: String,
    pub calibrated_by: String,

    // Page 2
    pub detector_name: String,
    pub active_pixels_horizontal: u16,
    pub actual_pixels_horizontal: u16,
    pub roi_horizontal_start: u16,
    pub roi_horizontal_end: u16,
    pub roi_vertical_regions: [(u16, u16); 3],
    pub linearity_coeffs: [f32; 5],

    // Page 3
    pub laser_power_coeffs: [f32; 4],
    pub max_laser_power_mw: f32,
    pub min_laser_power_mw: f32,
    pub excitation_nm: f32,
    pub min_integration_ms: u32,
    pub max_integration_ms: u32,
    pub avg_resolution: f32,

    // Page 5/6
    pub bad_pixels: [i16; MAX_BAD_PIXELS],
    pub product_configuration: String,
    pub subformat: Subformat,
    pub intensity_correction_order: u8,
    pub intensity_correction_coeffs: Vec<f32>,

    // Pages 4 (+6, 7 under the UserData subformat)
    pub user_data: Vec<u8>,

    /// Set when the record came back blank/corrupt and documented defaults
    /// were substituted; such a record is usable but not trustworthy.
    pub default_values: bool,

    pages: Option<Vec<Page>>,
    bad_pixel_set: Vec<usize>,
    wavelengths: Vec<f64>,
}

impl Default for Eeprom {
    fn default() -> Self {
        Self::default_record()
    }
}

impl Eeprom {
    /// Documented all-defaults record used when the calibration area is
    /// blank, unreadable, or carries an unknown format.
    pub fn default_record() -> Self {
        let mut rec = Self {
            format: FORMAT_UNWRITTEN,
            model: String::new(),
            serial_number: String::new(),
            baud_rate: 9600,
            has_cooling: false,
            has_battery: false,
            has_laser: false,
            slit_size_um: 0,
            startup_integration_ms: 10,
            startup_temp_degc: 15,
            startup_trigger_mode: 0,
            detector_gain: 1.0,
            detector_offset: 0,
            detector_gain_odd: 1.0,
            detector_offset_odd: 0,
            wavecal_coeffs: [0.0, 1.0, 0.0, 0.0, 0.0],
            degc_to_dac_coeffs: [0.0; 3],
            detector_temp_max: 40,
            detector_temp_min: 10,
            adc_to_degc_coeffs: [0.0; 3],
            thermistor_resistance_298k: 10,
            thermistor_beta: 3450,
            calibration_date: String::new(),
            calibrated_by: String::new(),
            detector_name: String::new(),
            active_pixels_horizontal: 1024,
            actual_pixels_horizontal: 1024,
            roi_horizontal_start: 0,
            roi_horizontal_end: 0,
            roi_vertical_regions: [(0, 0); 3],
            linearity_coeffs: [0.0; 5],
            laser_power_coeffs: [0.0; 4],
            max_laser_power_mw: 0.0,
            min_laser_power_mw: 0.0,
            excitation_nm: 0.0,
            min_integration_ms: 1,
            max_integration_ms: 60_000,
            avg_resolution: 0.0,
            bad_pixels: [-1; MAX_BAD_PIXELS],
            product_configuration: String::new(),
            subformat: Subformat::UserData,
            intensity_correction_order: 0,
            intensity_correction_coeffs: Vec::new(),
            user_data: vec![0; PAGE_SIZE],
            default_values: true,
            pages: None,
            bad_pixel_set: Vec::new(),
            wavelengths: Vec::new(),
        };
        rec.rebuild_derived();
        rec
    }

    /// Synthetic record for transports without an addressable EEPROM
    /// (vendor SDK shims, line-scan cameras). Everything not queryable live
    /// gets the documented defaults.
    pub fn read_synthetic(pixel_count: u16, model: &str, serial: &str) -> Self {
        let mut rec = Self::default_record();
        rec.format = FORMAT_SYNTHETIC;
        rec.model = model.to_string();
        rec.serial_number = serial.to_string();
        rec.active_pixels_horizontal = pixel_count;
        rec.actual_pixels_horizontal = pixel_count;
        rec.rebuild_derived();
        rec
    }

    /// Fetch and parse the record. Never fails: the first failed page fetch
    /// or an unknown format substitutes the default record so an otherwise
    /// working device still initializes.
    pub async fn read(link: &CommandLink) -> Self {
        let mut pages = Vec::with_capacity(PAGE_COUNT);
        for page_idx in 0..PAGE_COUNT {
            match link
                .read_second_tier(Opcode::ReadEeprom, page_idx as u16, PAGE_SIZE)
                .await
            {
                Ok(bytes) => {
                    let mut page = [0u8; PAGE_SIZE];
                    page.copy_from_slice(&bytes[..PAGE_SIZE]);
                    pages.push(page);
                }
                Err(err) => {
                    warn!(
                        page = page_idx,
                        error = %err,
                        "EEPROM page fetch failed, substituting default record"
                    );
                    return Self::default_record();
                }
            }
        }
        Self::from_pages(&pages)
    }

    /// Parse raw pages, honoring the format-gated offset table.
    pub fn from_pages(pages: &[Page]) -> Self {
        let mut rec = Self::default_record();
        if pages.len() < PAGE_COUNT {
            warn!(pages = pages.len(), "truncated page set, using defaults");
            return rec;
        }

        // FORMAT_SYNTHETIC is an in-memory sentinel and never legitimate on
        // the wire; anything above FORMAT_LATEST is unknown.
        let format = get_u8(&pages[FORMAT_PAGE], FORMAT_OFFSET);
        if format == FORMAT_UNWRITTEN || format > FORMAT_LATEST {
            info!(format, "unrecognized record format, substituting defaults");
            rec.pages = Some(pages.to_vec());
            return rec;
        }

        rec.format = format;
        rec.default_values = false;

        let p0 = &pages[0];
        rec.model = get_string(p0, P0_MODEL, 16);
        rec.serial_number = get_string(p0, P0_SERIAL, 16);
        rec.baud_rate = get_u32(p0, P0_BAUD);
        rec.has_cooling = get_u8(p0, P0_HAS_COOLING) != 0;
        rec.has_battery = get_u8(p0, P0_HAS_BATTERY) != 0;
        rec.has_laser = get_u8(p0, P0_HAS_LASER) != 0;
        rec.excitation_nm = f32::from(get_u16(p0, P0_EXCITATION_NM));
        rec.slit_size_um = get_u16(p0, P0_SLIT_UM);
        rec.startup_integration_ms = get_u16(p0, P0_STARTUP_INTEGRATION_MS);
        rec.startup_temp_degc = get_i16(p0, P0_STARTUP_TEMP_DEGC);
        rec.startup_trigger_mode = get_u8(p0, P0_STARTUP_TRIGGER);
        rec.detector_gain = get_f32(p0, P0_GAIN_EVEN);
        rec.detector_offset = get_i16(p0, P0_OFFSET_EVEN);
        rec.detector_gain_odd = get_f32(p0, P0_GAIN_ODD);
        rec.detector_offset_odd = get_i16(p0, P0_OFFSET_ODD);

        let p1 = &pages[1];
        for (i, c) in rec.wavecal_coeffs.iter_mut().take(4).enumerate() {
            *c = get_f32(p1, P1_WAVECAL_C0 + 4 * i);
        }
        for (i, c) in rec.degc_to_dac_coeffs.iter_mut().enumerate() {
            *c = get_f32(p1, P1_DEGC_TO_DAC_C0 + 4 * i);
        }
        rec.detector_temp_max = get_i16(p1, P1_TEMP_MAX);
        rec.detector_temp_min = get_i16(p1, P1_TEMP_MIN);
        for (i, c) in rec.adc_to_degc_coeffs.iter_mut().enumerate() {
            *c = get_f32(p1, P1_ADC_TO_DEGC_C0 + 4 * i);
        }
        rec.thermistor_resistance_298k = get_i16(p1, P1_THERMISTOR_R298);
        rec.thermistor_beta = get_i16(p1, P1_THERMISTOR_BETA);
        rec.calibration_date = get_string(p1, P1_CALIBRATION_DATE, 12);
        rec.calibrated_by = get_string(p1, P1_CALIBRATED_BY, 3);

        let p2 = &pages[2];
        rec.detector_name = get_string(p2, P2_DETECTOR_NAME, 16);
        rec.active_pixels_horizontal = get_u16(p2, P2_ACTIVE_PIXELS);
        rec.actual_pixels_horizontal = get_u16(p2, P2_ACTUAL_PIXELS);
        rec.roi_horizontal_start = get_u16(p2, P2_ROI_H_START);
        rec.roi_horizontal_end = get_u16(p2, P2_ROI_H_END);
        for (i, region) in rec.roi_vertical_regions.iter_mut().enumerate() {
            region.0 = get_u16(p2, P2_ROI_V_REGIONS + 4 * i);
            region.1 = get_u16(p2, P2_ROI_V_REGIONS + 4 * i + 2);
        }
        for (i, c) in rec.linearity_coeffs.iter_mut().enumerate() {
            *c = get_f32(p2, P2_LINEARITY_C0 + 4 * i);
        }
        rec.wavecal_coeffs[4] = if format >= 8 {
            get_f32(p2, P2_WAVECAL_C4)
        } else {
            0.0
        };

        let p3 = &pages[3];
        for (i, c) in rec.laser_power_coeffs.iter_mut().enumerate() {
            *c = get_f32(p3, P3_LASER_POWER_C0 + 4 * i);
        }
        rec.max_laser_power_mw = get_f32(p3, P3_MAX_LASER_MW);
        rec.min_laser_power_mw = get_f32(p3, P3_MIN_LASER_MW);
        if format >= 4 {
            let excitation = get_f32(p3, P3_EXCITATION_NM_FLOAT);
            if excitation.is_finite() && excitation > 0.0 {
                rec.excitation_nm = excitation;
            }
        }
        if format >= 5 {
            rec.min_integration_ms = get_u32(p3, P3_MIN_INTEGRATION);
            rec.max_integration_ms = get_u32(p3, P3_MAX_INTEGRATION);
        } else {
            rec.min_integration_ms = u32::from(get_u16(p2, P2_MIN_INTEGRATION_LEGACY));
            rec.max_integration_ms = u32::from(get_u16(p2, P2_MAX_INTEGRATION_LEGACY));
        }
        rec.avg_resolution = if format >= 7 {
            get_f32(p3, P3_AVG_RESOLUTION)
        } else {
            0.0
        };

        let p5 = &pages[5];
        for (i, bp) in rec.bad_pixels.iter_mut().enumerate() {
            *bp = get_i16(p5, P5_BAD_PIXELS + 2 * i);
        }
        rec.product_configuration = get_string(p5, P5_PRODUCT_CONFIG, 16);
        rec.subformat = if format >= 8 {
            Subformat::from_byte(get_u8(p5, P5_SUBFORMAT))
        } else {
            Subformat::UserData
        };

        rec.intensity_correction_order = 0;
        rec.intensity_correction_coeffs.clear();
        if format >= 8 && rec.subformat == Subformat::IntensityCalibration {
            let p6 = &pages[6];
            let order = get_u8(p6, P6_INTENSITY_ORDER).min(MAX_INTENSITY_COEFFS as u8 - 1);
            rec.intensity_correction_order = order;
            rec.intensity_correction_coeffs = (0..=usize::from(order))
                .map(|i| get_f32(p6, P6_INTENSITY_C0 + 4 * i))
                .collect();
        }

        rec.user_data = pages[4].to_vec();
        if format >= 8 && rec.subformat == Subformat::UserData {
            rec.user_data.extend_from_slice(&pages[6]);
            rec.user_data.extend_from_slice(&pages[7][..FORMAT_OFFSET]);
        }

        rec.pages = Some(pages.to_vec());
        rec.enforce_reasonable_defaults();
        rec.rebuild_derived();
        rec
    }

    /// Clamp hostile field values so a bad record cannot poison processing.
    /// A NaN wavelength coefficient invalidates the whole calibration, which
    /// reverts to the identity polynomial and flags the record.
    pub fn enforce_reasonable_defaults(&mut self) {
        if self.wavecal_coeffs.iter().any(|c| c.is_nan()) {
            warn!(
                serial = %self.serial_number,
                "NaN wavelength coefficient, reverting to identity calibration"
            );
            self.wavecal_coeffs = [0.0, 1.0, 0.0, 0.0, 0.0];
            self.default_values = true;
        }
        for c in &mut self.linearity_coeffs {
            if c.is_nan() {
                *c = 0.0;
            }
        }
        for c in &mut self.laser_power_coeffs {
            if c.is_nan() {
                *c = 0.0;
            }
        }
        if self.min_integration_ms < 1 {
            self.min_integration_ms = 1;
        }
        if self.max_integration_ms < self.min_integration_ms {
            self.max_integration_ms = self.min_integration_ms.max(60_000);
        }
    }

    /// Commit the record. Fails fast without a prior successful page fetch.
    /// Register-addressed transports commit page by page, aborting on the
    /// first failure; SPI transports stage all pages first and then issue an
    /// explicit commit per page because the bus is unreliable under
    /// back-to-back writes. The format stamp is unconditionally migrated to
    /// [`FORMAT_LATEST`].
    pub async fn write(&mut self, link: &CommandLink) -> Result<(), EepromError> {
        if !link.has_addressable_eeprom() {
            return Err(EepromError::NotWritable);
        }
        let mut pages = self.pages.clone().ok_or(EepromError::NotRead)?;
        self.render_into(&mut pages);

        if link.requires_buffered_eeprom_commit() {
            // Stage every page host-side, then commit one at a time.
            for (idx, page) in pages.iter().enumerate() {
                link.send(Opcode::WriteEeprom, 0, idx as u16, page)
                    .await
                    .map_err(|source| EepromError::PageCommit { page: idx, source })?;
            }
            for idx in 0..pages.len() {
                link.send(Opcode::WriteEeprom, 1, idx as u16, &[])
                    .await
                    .map_err(|source| EepromError::PageCommit { page: idx, source })?;
            }
        } else {
            for (idx, page) in pages.iter().enumerate() {
                link.send(Opcode::WriteEeprom, 0, idx as u16, page)
                    .await
                    .map_err(|source| EepromError::PageCommit { page: idx, source })?;
            }
        }

        self.format = FORMAT_LATEST;
        self.pages = Some(pages);
        info!(serial = %self.serial_number, "calibration record committed");
        Ok(())
    }

    /// Render every field into its latest-format slot. Fields the device
    /// firmware owns but this revision does not expose stay untouched in the
    /// page cache.
    pub fn render_pages(&self) -> Vec<Page> {
        let mut pages = self.pages.clone().unwrap_or_else(blank_pages);
        self.render_into(&mut pages);
        pages
    }

    fn render_into(&self, pages: &mut [Page]) {
        let p0 = &mut pages[0];
        put_string(p0, P0_MODEL, 16, &self.model);
        put_string(p0, P0_SERIAL, 16, &self.serial_number);
        put_u32(p0, P0_BAUD, self.baud_rate);
        put_u8(p0, P0_HAS_COOLING, u8::from(self.has_cooling));
        put_u8(p0, P0_HAS_BATTERY, u8::from(self.has_battery));
        put_u8(p0, P0_HAS_LASER, u8::from(self.has_laser));
        put_u16(
            p0,
            P0_EXCITATION_NM,
            self.excitation_nm.round().clamp(0.0, 65_535.0) as u16,
        );
        put_u16(p0, P0_SLIT_UM, self.slit_size_um);
        put_u16(p0, P0_STARTUP_INTEGRATION_MS, self.startup_integration_ms);
        put_i16(p0, P0_STARTUP_TEMP_DEGC, self.startup_temp_degc);
        put_u8(p0, P0_STARTUP_TRIGGER, self.startup_trigger_mode);
        put_f32(p0, P0_GAIN_EVEN, self.detector_gain);
        put_i16(p0, P0_OFFSET_EVEN, self.detector_offset);
        put_f32(p0, P0_GAIN_ODD, self.detector_gain_odd);
        put_i16(p0, P0_OFFSET_ODD, self.detector_offset_odd);

        let p1 = &mut pages[1];
        for i in 0..4 {
            put_f32(p1, P1_WAVECAL_C0 + 4 * i, self.wavecal_coeffs[i]);
        }
        for (i, c) in self.degc_to_dac_coeffs.iter().enumerate() {
            put_f32(p1, P1_DEGC_TO_DAC_C0 + 4 * i, *c);
        }
        put_i16(p1, P1_TEMP_MAX, self.detector_temp_max);
        put_i16(p1, P1_TEMP_MIN, self.detector_temp_min);
        for (i, c) in self.adc_to_degc_coeffs.iter().enumerate() {
            put_f32(p1, P1_ADC_TO_DEGC_C0 + 4 * i, *c);
        }
        put_i16(p1, P1_THERMISTOR_R298, self.thermistor_resistance_298k);
        put_i16(p1, P1_THERMISTOR_BETA, self.thermistor_beta);
        put_string(p1, P1_CALIBRATION_DATE, 12, &self.calibration_date);
        put_string(p1, P1_CALIBRATED_BY, 3, &self.calibrated_by);

        let p2 = &mut pages[2];
        put_string(p2, P2_DETECTOR_NAME, 16, &self.detector_name);
        put_u16(p2, P2_ACTIVE_PIXELS, self.active_pixels_horizontal);
        put_u16(p2, P2_ACTUAL_PIXELS, self.actual_pixels_horizontal);
        // Legacy 16-bit bounds kept in sync for pre-format-5 tooling.
        put_u16(
            p2,
            P2_MIN_INTEGRATION_LEGACY,
            self.min_integration_ms.min(u32::from(u16::MAX)) as u16,
        );
        put_u16(
            p2,
            P2_MAX_INTEGRATION_LEGACY,
            self.max_integration_ms.min(u32::from(u16::MAX)) as u16,
        );
        put_u16(p2, P2_ROI_H_START, self.roi_horizontal_start);
        put_u16(p2, P2_ROI_H_END, self.roi_horizontal_end);
        for (i, region) in self.roi_vertical_regions.iter().enumerate() {
            put_u16(p2, P2_ROI_V_REGIONS + 4 * i, region.0);
            put_u16(p2, P2_ROI_V_REGIONS + 4 * i + 2, region.1);
        }
        for (i, c) in self.linearity_coeffs.iter().enumerate() {
            put_f32(p2, P2_LINEARITY_C0 + 4 * i, *c);
        }
        put_f32(p2, P2_WAVECAL_C4, self.wavecal_coeffs[4]);

        let p3 = &mut pages[3];
        for (i, c) in self.laser_power_coeffs.iter().enumerate() {
            put_f32(p3, P3_LASER_POWER_C0 + 4 * i, *c);
        }
        put_f32(p3, P3_MAX_LASER_MW, self.max_laser_power_mw);
        put_f32(p3, P3_MIN_LASER_MW, self.min_laser_power_mw);
        put_f32(p3, P3_EXCITATION_NM_FLOAT, self.excitation_nm);
        put_u32(p3, P3_MIN_INTEGRATION, self.min_integration_ms);
        put_u32(p3, P3_MAX_INTEGRATION, self.max_integration_ms);
        put_f32(p3, P3_AVG_RESOLUTION, self.avg_resolution);

        let user = self.user_data_padded();
        pages[4].copy_from_slice(&user[..PAGE_SIZE]);

        let p5 = &mut pages[5];
        for (i, bp) in self.bad_pixels.iter().enumerate() {
            put_i16(p5, P5_BAD_PIXELS + 2 * i, *bp);
        }
        put_string(p5, P5_PRODUCT_CONFIG, 16, &self.product_configuration);
        put_u8(p5, P5_SUBFORMAT, self.subformat.to_byte());

        match self.subformat {
            Subformat::IntensityCalibration => {
                let p6 = &mut pages[6];
                put_u8(p6, P6_INTENSITY_ORDER, self.intensity_correction_order);
                for i in 0..MAX_INTENSITY_COEFFS {
                    let c = self
                        .intensity_correction_coeffs
                        .get(i)
                        .copied()
                        .unwrap_or(0.0);
                    put_f32(p6, P6_INTENSITY_C0 + 4 * i, c);
                }
            }
            Subformat::UserData => {
                pages[6].copy_from_slice(&user[PAGE_SIZE..2 * PAGE_SIZE]);
                pages[7][..FORMAT_OFFSET]
                    .copy_from_slice(&user[2 * PAGE_SIZE..2 * PAGE_SIZE + FORMAT_OFFSET]);
            }
        }

        put_u8(&mut pages[FORMAT_PAGE], FORMAT_OFFSET, FORMAT_LATEST);
    }

    /// User-data capacity after migration to the latest format.
    pub fn user_data_capacity(&self) -> usize {
        match self.subformat {
            Subformat::UserData => 2 * PAGE_SIZE + FORMAT_OFFSET,
            Subformat::IntensityCalibration => PAGE_SIZE,
        }
    }

    fn user_data_padded(&self) -> Vec<u8> {
        let mut user = self.user_data.clone();
        user.resize(2 * PAGE_SIZE + FORMAT_OFFSET, 0);
        user
    }

    /// NUL-clipped string projection of the raw user-data block.
    pub fn user_text(&self) -> String {
        let end = self
            .user_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.user_data.len());
        String::from_utf8_lossy(&self.user_data[..end])
            .trim()
            .to_string()
    }

    /// Replace the user text; the remainder of the block is zero-padded.
    pub fn set_user_text(&mut self, text: &str) -> RecordChanged {
        let cap = self.user_data_capacity();
        let bytes = text.as_bytes();
        let n = bytes.len().min(cap);
        self.user_data = vec![0; cap];
        self.user_data[..n].copy_from_slice(&bytes[..n]);
        RecordChanged { field: "user_text" }
    }

    /// Replace the bad-pixel list. The raw positional array (with -1
    /// sentinels) is what gets written back; the derived set is rebuilt.
    pub fn set_bad_pixels(&mut self, pixels: &[usize]) -> RecordChanged {
        self.bad_pixels = [-1; MAX_BAD_PIXELS];
        for (slot, px) in self.bad_pixels.iter_mut().zip(pixels.iter()) {
            *slot = (*px).min(i16::MAX as usize) as i16;
        }
        self.rebuild_derived();
        RecordChanged {
            field: "bad_pixels",
        }
    }

    pub fn set_startup_integration_ms(&mut self, ms: u16) -> RecordChanged {
        self.startup_integration_ms = ms;
        RecordChanged {
            field: "startup_integration_ms",
        }
    }

    /// Sorted, deduplicated bad-pixel indices (derived cache).
    pub fn bad_pixel_set(&self) -> &[usize] {
        &self.bad_pixel_set
    }

    /// Wavelength axis (derived cache): `sum(c[i] * pixel^i)` per pixel.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Laser output power (mW) for a given setpoint, from the page-3
    /// polynomial.
    pub fn laser_power_mw(&self, setpoint: f64) -> f64 {
        self.laser_power_coeffs
            .iter()
            .enumerate()
            .map(|(i, c)| f64::from(*c) * setpoint.powi(i as i32))
            .sum()
    }

    /// Rebuild the derived caches after any field mutation.
    pub fn rebuild_derived(&mut self) {
        let mut set: Vec<usize> = self
            .bad_pixels
            .iter()
            .filter(|&&p| p >= 0)
            .map(|&p| p as usize)
            .collect();
        set.sort_unstable();
        set.dedup();
        self.bad_pixel_set = set;

        let n = usize::from(self.active_pixels_horizontal);
        self.wavelengths = (0..n)
            .map(|px| {
                self.wavecal_coeffs
                    .iter()
                    .enumerate()
                    .map(|(i, c)| f64::from(*c) * (px as f64).powi(i as i32))
                    .sum()
            })
            .collect();
    }

    /// Whether a prior read populated the page cache (required by `write`).
    pub fn has_page_cache(&self) -> bool {
        self.pages.is_some()
    }

    /// Seed the page cache directly (mock transports, import paths).
    pub fn with_page_cache(mut self) -> Self {
        if self.pages.is_none() {
            let mut pages = blank_pages();
            self.render_into(&mut pages);
            self.pages = Some(pages);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped_pages(format: u8) -> Vec<Page> {
        let mut pages = blank_pages();
        put_u8(&mut pages[FORMAT_PAGE], FORMAT_OFFSET, format);
        pages
    }

    #[test]
    fn unwritten_format_substitutes_defaults() {
        let pages = stamped_pages(FORMAT_UNWRITTEN);
        let rec = Eeprom::from_pages(&pages);
        assert!(rec.default_values);
        assert_eq!(rec.wavecal_coeffs, [0.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(rec.min_integration_ms, 1);
        // Page cache survives so a factory write can provision the blank part.
        assert!(rec.has_page_cache());
    }

    #[test]
    fn synthetic_sentinel_on_the_wire_is_not_trusted() {
        // 0xFE only ever marks records synthesized in memory; from the wire
        // it is just another unknown format.
        let pages = stamped_pages(FORMAT_SYNTHETIC);
        let rec = Eeprom::from_pages(&pages);
        assert!(rec.default_values);
        assert_eq!(rec.format, FORMAT_UNWRITTEN);
        assert_eq!(rec.wavecal_coeffs, [0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn nan_wavecal_reverts_to_identity() {
        let mut pages = stamped_pages(8);
        put_f32(&mut pages[1], P1_WAVECAL_C0, f32::NAN);
        put_u16(&mut pages[2], P2_ACTIVE_PIXELS, 16);
        put_u32(&mut pages[3], P3_MIN_INTEGRATION, 1);
        put_u32(&mut pages[3], P3_MAX_INTEGRATION, 1000);
        let rec = Eeprom::from_pages(&pages);
        assert!(rec.default_values);
        assert_eq!(rec.wavecal_coeffs, [0.0, 1.0, 0.0, 0.0, 0.0]);
        // Identity polynomial: wavelength == pixel index.
        assert_eq!(rec.wavelengths()[5], 5.0);
    }

    #[test]
    fn nan_linearity_is_zeroed_not_propagated() {
        let mut rec = Eeprom::default_record();
        rec.linearity_coeffs[2] = f32::NAN;
        rec.laser_power_coeffs[0] = f32::NAN;
        rec.enforce_reasonable_defaults();
        assert_eq!(rec.linearity_coeffs[2], 0.0);
        assert_eq!(rec.laser_power_coeffs[0], 0.0);
        // Wavecal untouched by linearity repair.
        assert_eq!(rec.wavecal_coeffs, [0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn bad_pixel_set_is_sorted_and_unique() {
        let mut rec = Eeprom::default_record();
        rec.bad_pixels[0] = 90;
        rec.bad_pixels[1] = 5;
        rec.bad_pixels[2] = 90;
        rec.bad_pixels[3] = -1;
        rec.bad_pixels[4] = 12;
        rec.rebuild_derived();
        assert_eq!(rec.bad_pixel_set(), &[5, 12, 90]);
    }

    #[test]
    fn set_bad_pixels_writes_raw_slots() {
        let mut rec = Eeprom::default_record();
        rec.set_bad_pixels(&[100, 3]);
        assert_eq!(rec.bad_pixels[0], 100);
        assert_eq!(rec.bad_pixels[1], 3);
        assert_eq!(rec.bad_pixels[2], -1);
        assert_eq!(rec.bad_pixel_set(), &[3, 100]);
    }

    #[test]
    fn user_text_round_trip_zero_pads() {
        let mut rec = Eeprom::default_record();
        let change = rec.set_user_text("pos=2; feature=trigger");
        assert_eq!(change.field, "user_text");
        assert_eq!(rec.user_text(), "pos=2; feature=trigger");
        assert_eq!(rec.user_data.len(), rec.user_data_capacity());
        assert!(rec.user_data[22..].iter().all(|&b| b == 0));
    }

    #[test]
    fn legacy_format_reads_16_bit_integration_bounds() {
        let mut pages = stamped_pages(3);
        put_u16(&mut pages[2], P2_MIN_INTEGRATION_LEGACY, 5);
        put_u16(&mut pages[2], P2_MAX_INTEGRATION_LEGACY, 30_000);
        put_u16(&mut pages[2], P2_ACTIVE_PIXELS, 512);
        let rec = Eeprom::from_pages(&pages);
        assert_eq!(rec.min_integration_ms, 5);
        assert_eq!(rec.max_integration_ms, 30_000);
        // format < 8 has no fifth wavelength coefficient.
        assert_eq!(rec.wavecal_coeffs[4], 0.0);
    }

    #[test]
    fn intensity_calibration_subformat_parses_page_6_coeffs() {
        let mut pages = stamped_pages(8);
        put_u16(&mut pages[2], P2_ACTIVE_PIXELS, 64);
        put_u32(&mut pages[3], P3_MIN_INTEGRATION, 1);
        put_u32(&mut pages[3], P3_MAX_INTEGRATION, 1000);
        put_u8(&mut pages[5], P5_SUBFORMAT, 1);
        put_u8(&mut pages[6], P6_INTENSITY_ORDER, 2);
        put_f32(&mut pages[6], P6_INTENSITY_C0, 1.0);
        put_f32(&mut pages[6], P6_INTENSITY_C0 + 4, 0.5);
        put_f32(&mut pages[6], P6_INTENSITY_C0 + 8, 0.25);
        let rec = Eeprom::from_pages(&pages);
        assert_eq!(rec.subformat, Subformat::IntensityCalibration);
        assert_eq!(rec.intensity_correction_coeffs, vec![1.0, 0.5, 0.25]);
        // User data stays single-page under this subformat.
        assert_eq!(rec.user_data.len(), PAGE_SIZE);
    }

    #[test]
    fn render_stamps_latest_format() {
        let rec = Eeprom::default_record().with_page_cache();
        let pages = rec.render_pages();
        assert_eq!(get_u8(&pages[FORMAT_PAGE], FORMAT_OFFSET), FORMAT_LATEST);
    }

    #[test]
    fn laser_power_polynomial() {
        let mut rec = Eeprom::default_record();
        rec.laser_power_coeffs = [1.0, 2.0, 0.0, 0.0];
        assert!((rec.laser_power_mw(3.0) - 7.0).abs() < 1e-9);
    }
}
