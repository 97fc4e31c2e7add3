//! JSON projection of the calibration record.
//!
//! A flat serde struct of every logical field, plus named measurement
//! vectors. Exports archive a unit's calibration; imports seed
//! [`MockTransport`](crate::transport::mock::MockTransport) so a failed unit
//! can be replayed on the bench.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::layout::MAX_BAD_PIXELS;
use super::{Eeprom, Subformat};

/// Flat, versioned snapshot of an [`Eeprom`] record.
///
/// Measurement vectors (reference spectra, dark frames) are keyed
/// `"{source}@{integration_ms}ms"`, e.g. `"reference@100ms"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EepromExport {
    pub format: u8,
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
    pub wavecal_coeffs: [f32; 5],
    pub degc_to_dac_coeffs: [f32; 3],
    pub detector_temp_max: i16,
    pub detector_temp_min: i16,
    pub adc_to_degc_coeffs: [f32; 3],
    pub thermistor_resistance_298k: i16,
    pub thermistor_beta: i16,
    pub calibration_date: String,
    pub calibrated_by: String,
    pub detector_name: String,
    pub active_pixels_horizontal: u16,
    pub actual_pixels_horizontal: u16,
    pub roi_horizontal_start: u16,
    pub roi_horizontal_end: u16,
    pub roi_vertical_regions: [(u16, u16); 3],
    pub linearity_coeffs: [f32; 5],
    pub laser_power_coeffs: [f32; 4],
    pub max_laser_power_mw: f32,
    pub min_laser_power_mw: f32,
    pub excitation_nm: f32,
    pub min_integration_ms: u32,
    pub max_integration_ms: u32,
    pub avg_resolution: f32,
    pub bad_pixels: Vec<i16>,
    pub product_configuration: String,
    pub subformat: Subformat,
    pub intensity_correction_order: u8,
    pub intensity_correction_coeffs: Vec<f32>,
    pub user_text: String,
    pub default_values: bool,
    #[serde(default)]
    pub measurements: BTreeMap<String, Vec<f64>>,
}

impl EepromExport {
    pub fn from_record(rec: &Eeprom) -> Self {
        Self {
            format: rec.format,
            model: rec.model.clone(),
            serial_number: rec.serial_number.clone(),
            baud_rate: rec.baud_rate,
            has_cooling: rec.has_cooling,
            has_battery: rec.has_battery,
            has_laser: rec.has_laser,
            slit_size_um: rec.slit_size_um,
            startup_integration_ms: rec.startup_integration_ms,
            startup_temp_degc: rec.startup_temp_degc,
            startup_trigger_mode: rec.startup_trigger_mode,
            detector_gain: rec.detector_gain,
            detector_offset: rec.detector_offset,
            detector_gain_odd: rec.detector_gain_odd,
            detector_offset_odd: rec.detector_offset_odd,
            wavecal_coeffs: rec.wavecal_coeffs,
            degc_to_dac_coeffs: rec.degc_to_dac_coeffs,
            detector_temp_max: rec.detector_temp_max,
            detector_temp_min: rec.detector_temp_min,
            adc_to_degc_coeffs: rec.adc_to_degc_coeffs,
            thermistor_resistance_298k: rec.thermistor_resistance_298k,
            thermistor_beta: rec.thermistor_beta,
            calibration_date: rec.calibration_date.clone(),
            calibrated_by: rec.calibrated_by.clone(),
            detector_name: rec.detector_name.clone(),
            active_pixels_horizontal: rec.active_pixels_horizontal,
            actual_pixels_horizontal: rec.actual_pixels_horizontal,
            roi_horizontal_start: rec.roi_horizontal_start,
            roi_horizontal_end: rec.roi_horizontal_end,
            roi_vertical_regions: rec.roi_vertical_regions,
            linearity_coeffs: rec.linearity_coeffs,
            laser_power_coeffs: rec.laser_power_coeffs,
            max_laser_power_mw: rec.max_laser_power_mw,
            min_laser_power_mw: rec.min_laser_power_mw,
            excitation_nm: rec.excitation_nm,
            min_integration_ms: rec.min_integration_ms,
            max_integration_ms: rec.max_integration_ms,
            avg_resolution: rec.avg_resolution,
            bad_pixels: rec.bad_pixels.to_vec(),
            product_configuration: rec.product_configuration.clone(),
            subformat: rec.subformat,
            intensity_correction_order: rec.intensity_correction_order,
            intensity_correction_coeffs: rec.intensity_correction_coeffs.clone(),
            user_text: rec.user_text(),
            default_values: rec.default_values,
            measurements: BTreeMap::new(),
        }
    }

    /// Attach a named measurement vector under the canonical key.
    pub fn add_measurement(&mut self, source: &str, integration_ms: u32, data: Vec<f64>) {
        self.measurements
            .insert(measurement_key(source, integration_ms), data);
    }

    pub fn measurement(&self, source: &str, integration_ms: u32) -> Option<&[f64]> {
        self.measurements
            .get(&measurement_key(source, integration_ms))
            .map(Vec::as_slice)
    }

    /// Rebuild a record from the export. The page cache is re-rendered at
    /// the latest format, so the result is immediately writable.
    pub fn into_record(self) -> Eeprom {
        let mut rec = Eeprom::default_record();
        rec.format = self.format;
        rec.model = self.model;
        rec.serial_number = self.serial_number;
        rec.baud_rate = self.baud_rate;
        rec.has_cooling = self.has_cooling;
        rec.has_battery = self.has_battery;
        rec.has_laser = self.has_laser;
        rec.slit_size_um = self.slit_size_um;
        rec.startup_integration_ms = self.startup_integration_ms;
        rec.startup_temp_degc = self.startup_temp_degc;
        rec.startup_trigger_mode = self.startup_trigger_mode;
        rec.detector_gain = self.detector_gain;
        rec.detector_offset = self.detector_offset;
        rec.detector_gain_odd = self.detector_gain_odd;
        rec.detector_offset_odd = self.detector_offset_odd;
        rec.wavecal_coeffs = self.wavecal_coeffs;
        rec.degc_to_dac_coeffs = self.degc_to_dac_coeffs;
        rec.detector_temp_max = self.detector_temp_max;
        rec.detector_temp_min = self.detector_temp_min;
        rec.adc_to_degc_coeffs = self.adc_to_degc_coeffs;
        rec.thermistor_resistance_298k = self.thermistor_resistance_298k;
        rec.thermistor_beta = self.thermistor_beta;
        rec.calibration_date = self.calibration_date;
        rec.calibrated_by = self.calibrated_by;
        rec.detector_name = self.detector_name;
        rec.active_pixels_horizontal = self.active_pixels_horizontal;
        rec.actual_pixels_horizontal = self.actual_pixels_horizontal;
        rec.roi_horizontal_start = self.roi_horizontal_start;
        rec.roi_horizontal_end = self.roi_horizontal_end;
        rec.roi_vertical_regions = self.roi_vertical_regions;
        rec.linearity_coeffs = self.linearity_coeffs;
        rec.laser_power_coeffs = self.laser_power_coeffs;
        rec.max_laser_power_mw = self.max_laser_power_mw;
        rec.min_laser_power_mw = self.min_laser_power_mw;
        rec.excitation_nm = self.excitation_nm;
        rec.min_integration_ms = self.min_integration_ms;
        rec.max_integration_ms = self.max_integration_ms;
        rec.avg_resolution = self.avg_resolution;
        rec.bad_pixels = [-1; MAX_BAD_PIXELS];
        for (slot, px) in rec.bad_pixels.iter_mut().zip(self.bad_pixels.iter()) {
            *slot = *px;
        }
        rec.product_configuration = self.product_configuration;
        rec.subformat = self.subformat;
        rec.intensity_correction_order = self.intensity_correction_order;
        rec.intensity_correction_coeffs = self.intensity_correction_coeffs;
        rec.default_values = self.default_values;
        rec.set_user_text(&self.user_text);
        rec.enforce_reasonable_defaults();
        rec.rebuild_derived();
        rec.with_page_cache()
    }
}

fn measurement_key(source: &str, integration_ms: u32) -> String {
    format!("{source}@{integration_ms}ms")
}
