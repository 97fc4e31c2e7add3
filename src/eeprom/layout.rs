//! Byte layout of the calibration record.
//!
//! The record is 8 fixed 64-byte pages. Scalars are little-endian; strings
//! are NUL-padded ASCII. Which offsets are valid depends on the `format`
//! revision stamped at page 7 byte 63. This module is the single source of
//! truth for offsets and the low-level page accessors; field gating lives in
//! the parser (`eeprom::Eeprom::from_pages`).

/// Bytes per page.
pub const PAGE_SIZE: usize = 64;
/// Pages in the record.
pub const PAGE_COUNT: usize = 8;
/// Latest known format revision; `write()` re-stamps this unconditionally.
pub const FORMAT_LATEST: u8 = 8;
/// Factory-blank sentinel: the record was never written.
pub const FORMAT_UNWRITTEN: u8 = 0xFF;
/// Record synthesized from live device queries (no addressable EEPROM).
pub const FORMAT_SYNTHETIC: u8 = 0xFE;
/// Bad-pixel slots on page 5.
pub const MAX_BAD_PIXELS: usize = 15;
/// Intensity-correction coefficient slots on page 6.
pub const MAX_INTENSITY_COEFFS: usize = 8;

/// Page index and byte offset of the format stamp.
pub const FORMAT_PAGE: usize = 7;
pub const FORMAT_OFFSET: usize = 63;

// Page 0
pub const P0_MODEL: usize = 0; // 16 chars
pub const P0_SERIAL: usize = 16; // 16 chars
pub const P0_BAUD: usize = 32; // u32
pub const P0_HAS_COOLING: usize = 36;
pub const P0_HAS_BATTERY: usize = 37;
pub const P0_HAS_LASER: usize = 38;
pub const P0_EXCITATION_NM: usize = 39; // u16
pub const P0_SLIT_UM: usize = 41; // u16
pub const P0_STARTUP_INTEGRATION_MS: usize = 43; // u16
pub const P0_STARTUP_TEMP_DEGC: usize = 45; // i16
pub const P0_STARTUP_TRIGGER: usize = 47; // u8
pub const P0_GAIN_EVEN: usize = 48; // f32
pub const P0_OFFSET_EVEN: usize = 52; // i16
pub const P0_GAIN_ODD: usize = 54; // f32
pub const P0_OFFSET_ODD: usize = 58; // i16

// Page 1
pub const P1_WAVECAL_C0: usize = 0; // f32 x4 through byte 16
pub const P1_DEGC_TO_DAC_C0: usize = 16; // f32 x3
pub const P1_TEMP_MAX: usize = 28; // i16
pub const P1_TEMP_MIN: usize = 30; // i16
pub const P1_ADC_TO_DEGC_C0: usize = 32; // f32 x3
pub const P1_THERMISTOR_R298: usize = 44; // i16
pub const P1_THERMISTOR_BETA: usize = 46; // i16
pub const P1_CALIBRATION_DATE: usize = 48; // 12 chars
pub const P1_CALIBRATED_BY: usize = 60; // 3 chars

// Page 2
pub const P2_DETECTOR_NAME: usize = 0; // 16 chars
pub const P2_ACTIVE_PIXELS: usize = 16; // u16
pub const P2_ACTUAL_PIXELS: usize = 18; // u16
pub const P2_MIN_INTEGRATION_LEGACY: usize = 20; // u16, format < 5
pub const P2_MAX_INTEGRATION_LEGACY: usize = 22; // u16, format < 5
pub const P2_ROI_H_START: usize = 24; // u16
pub const P2_ROI_H_END: usize = 26; // u16
pub const P2_ROI_V_REGIONS: usize = 28; // (u16,u16) x3
pub const P2_LINEARITY_C0: usize = 40; // f32 x5
pub const P2_WAVECAL_C4: usize = 60; // f32, format >= 8

// Page 3
pub const P3_LASER_POWER_C0: usize = 0; // f32 x4
pub const P3_MAX_LASER_MW: usize = 16; // f32
pub const P3_MIN_LASER_MW: usize = 20; // f32
pub const P3_EXCITATION_NM_FLOAT: usize = 24; // f32, format >= 4
pub const P3_MIN_INTEGRATION: usize = 28; // u32, format >= 5
pub const P3_MAX_INTEGRATION: usize = 32; // u32, format >= 5
pub const P3_AVG_RESOLUTION: usize = 36; // f32, format >= 7

// Page 5
pub const P5_BAD_PIXELS: usize = 0; // i16 x15
pub const P5_PRODUCT_CONFIG: usize = 30; // 16 chars
pub const P5_SUBFORMAT: usize = 63; // u8, format >= 8

// Page 6 (IntensityCalibration subformat)
pub const P6_INTENSITY_ORDER: usize = 0; // u8
pub const P6_INTENSITY_C0: usize = 1; // f32, up to 8

/// A single raw page.
pub type Page = [u8; PAGE_SIZE];

pub(crate) fn blank_pages() -> Vec<Page> {
    vec![[0u8; PAGE_SIZE]; PAGE_COUNT]
}

// ---------------------------------------------------------------------------
// Little-endian field accessors. Offsets are trusted constants from this
// module; slicing is still checked so a malformed page cannot panic the
// driver.
// ---------------------------------------------------------------------------

pub(crate) fn get_u8(page: &Page, off: usize) -> u8 {
    page[off]
}

pub(crate) fn get_u16(page: &Page, off: usize) -> u16 {
    u16::from_le_bytes([page[off], page[off + 1]])
}

pub(crate) fn get_i16(page: &Page, off: usize) -> i16 {
    i16::from_le_bytes([page[off], page[off + 1]])
}

pub(crate) fn get_u32(page: &Page, off: usize) -> u32 {
    u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

pub(crate) fn get_f32(page: &Page, off: usize) -> f32 {
    f32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

/// NUL-clipped, whitespace-trimmed ASCII string.
pub(crate) fn get_string(page: &Page, off: usize, len: usize) -> String {
    let raw = &page[off..off + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

pub(crate) fn put_u8(page: &mut Page, off: usize, v: u8) {
    page[off] = v;
}

pub(crate) fn put_u16(page: &mut Page, off: usize, v: u16) {
    page[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i16(page: &mut Page, off: usize, v: i16) {
    page[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(page: &mut Page, off: usize, v: u32) {
    page[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_f32(page: &mut Page, off: usize, v: f32) {
    page[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Writes the string truncated to `len`, zero-padding the remainder.
pub(crate) fn put_string(page: &mut Page, off: usize, len: usize, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    page[off..off + n].copy_from_slice(&bytes[..n]);
    for b in &mut page[off + n..off + len] {
        *b = 0;
    }
}
