//! Acquisition pipeline: averaging, dark subtraction, bad-pixel repair,
//! boxcar smoothing.
//!
//! The processing stages are pure functions over an owned vector; nothing
//! here mutates the input spectrum or touches device state. [`acquire`]
//! performs the averaged acquisition against any [`SpectrumSource`] and then
//! runs the stages in fixed order: dark, bad pixels, boxcar.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::capabilities::{CalibrationAccess, SpectrumSource};

/// Per-acquisition processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Scans averaged per returned spectrum. Forced to at least 1.
    pub scan_averaging: u32,
    /// Dark spectrum to subtract, if one was taken.
    pub dark: Option<Vec<f64>>,
    /// Boxcar half-width; 0 disables smoothing.
    pub boxcar_half_width: usize,
    /// Interpolate over the calibration record's bad pixels.
    pub correct_bad_pixels: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_averaging: 1,
            dark: None,
            boxcar_half_width: 0,
            correct_bad_pixels: true,
        }
    }
}

/// Acquire `scan_averaging` spectra from the device, average them, and run
/// the processing stages.
pub async fn acquire<D>(device: &D, config: &PipelineConfig) -> Result<Vec<f64>>
where
    D: SpectrumSource + CalibrationAccess + ?Sized,
{
    let scans = config.scan_averaging.max(1);
    let mut sum = device.acquire_raw().await?;
    for _ in 1..scans {
        let next = device.acquire_raw().await?;
        if next.len() != sum.len() {
            bail!(
                "inconsistent spectrum length during averaging: {} vs {}",
                next.len(),
                sum.len()
            );
        }
        for (acc, v) in sum.iter_mut().zip(next.iter()) {
            *acc += v;
        }
    }
    if scans > 1 {
        let n = f64::from(scans);
        for acc in sum.iter_mut() {
            *acc /= n;
        }
        debug!(scans, "averaged acquisition");
    }
    Ok(process(sum, config, &device.bad_pixel_set()))
}

/// Run the processing stages over an already-acquired spectrum.
pub fn process(spectrum: Vec<f64>, config: &PipelineConfig, bad_pixels: &[usize]) -> Vec<f64> {
    let mut out = spectrum;
    if let Some(dark) = &config.dark {
        out = subtract_dark(out, dark);
    }
    if config.correct_bad_pixels {
        out = correct_bad_pixels(out, bad_pixels);
    }
    if config.boxcar_half_width > 0 {
        out = boxcar(out, config.boxcar_half_width);
    }
    out
}

/// Subtract a dark spectrum. A length mismatch means the dark was taken
/// under a different detector configuration; it is skipped with a warning
/// rather than corrupting the data.
pub fn subtract_dark(spectrum: Vec<f64>, dark: &[f64]) -> Vec<f64> {
    if dark.len() != spectrum.len() {
        warn!(
            spectrum_len = spectrum.len(),
            dark_len = dark.len(),
            "dark length mismatch, skipping subtraction"
        );
        return spectrum;
    }
    spectrum
        .into_iter()
        .zip(dark.iter())
        .map(|(s, d)| s - d)
        .collect()
}

/// Replace each bad pixel with the linear interpolation of its nearest valid
/// neighbors. A bad pixel at the boundary (or with no valid neighbor on one
/// side) takes the nearest valid value. Idempotent: corrected values are a
/// pure function of the valid pixels, so running it twice changes nothing.
pub fn correct_bad_pixels(spectrum: Vec<f64>, bad_pixels: &[usize]) -> Vec<f64> {
    let mut out = spectrum;
    let n = out.len();
    if n == 0 {
        return out;
    }
    let is_bad = |px: usize| bad_pixels.contains(&px);
    let source = out.clone();

    for &px in bad_pixels {
        if px >= n {
            continue;
        }
        let left = (0..px).rev().find(|&i| !is_bad(i));
        let right = (px + 1..n).find(|&i| !is_bad(i));
        out[px] = match (left, right) {
            (Some(l), Some(r)) => {
                let t = (px - l) as f64 / (r - l) as f64;
                source[l] + t * (source[r] - source[l])
            }
            (Some(l), None) => source[l],
            (None, Some(r)) => source[r],
            // Every pixel bad: nothing valid to borrow from.
            (None, None) => source[px],
        };
    }
    out
}

/// Boxcar smoothing: each output pixel is the mean of the window
/// `[i - half_width, i + half_width]`, clipped at the boundaries.
pub fn boxcar(spectrum: Vec<f64>, half_width: usize) -> Vec<f64> {
    if half_width == 0 || spectrum.is_empty() {
        return spectrum;
    }
    let n = spectrum.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half_width);
            let hi = (i + half_width).min(n - 1);
            let window = &spectrum[lo..=hi];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect()
}

/// Line-scan sensors clocked through the transposed readout path deliver
/// their first few columns as garbage. Replace them with the first
/// trustworthy value. Deliberately narrow: this is the only frame-geometry
/// fixup in the crate.
pub fn correct_leading_columns(spectrum: &mut [f64], columns: usize) {
    if columns == 0 || spectrum.len() <= columns {
        return;
    }
    let first_valid = spectrum[columns];
    for v in &mut spectrum[..columns] {
        *v = first_valid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_subtraction_elementwise() {
        let out = subtract_dark(vec![10.0, 20.0, 30.0], &[1.0, 2.0, 3.0]);
        assert_eq!(out, vec![9.0, 18.0, 27.0]);
    }

    #[test]
    fn dark_length_mismatch_is_skipped() {
        let out = subtract_dark(vec![10.0, 20.0], &[1.0]);
        assert_eq!(out, vec![10.0, 20.0]);
    }

    #[test]
    fn bad_pixel_interpolation() {
        let out = correct_bad_pixels(vec![1.0, 99.0, 3.0], &[1]);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn bad_pixel_run_spans_to_valid_neighbors() {
        // Pixels 1 and 2 bad: both interpolate between pixels 0 and 3.
        let out = correct_bad_pixels(vec![0.0, -1.0, -1.0, 3.0], &[1, 2]);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn bad_pixel_boundary_clamps() {
        let out = correct_bad_pixels(vec![99.0, 5.0, 6.0, 77.0], &[0, 3]);
        assert_eq!(out, vec![5.0, 5.0, 6.0, 6.0]);
    }

    #[test]
    fn bad_pixel_correction_is_idempotent() {
        let bad = vec![0, 4, 9];
        let once = correct_bad_pixels(
            vec![9.0, 1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            &bad,
        );
        let twice = correct_bad_pixels(once.clone(), &bad);
        assert_eq!(once, twice);
    }

    #[test]
    fn boxcar_window_clips_at_edges() {
        let out = boxcar(vec![1.0, 2.0, 3.0, 4.0], 1);
        assert_eq!(out[0], 1.5);
        assert_eq!(out[1], 2.0);
        assert_eq!(out[3], 3.5);
    }

    #[test]
    fn boxcar_zero_is_identity() {
        let v = vec![1.0, 5.0, 2.0];
        assert_eq!(boxcar(v.clone(), 0), v);
    }

    #[test]
    fn leading_column_fixup() {
        let mut v = vec![9999.0, 9999.0, 3.0, 4.0];
        correct_leading_columns(&mut v, 2);
        assert_eq!(v, vec![3.0, 3.0, 3.0, 4.0]);
    }

    #[test]
    fn leading_column_fixup_ignores_degenerate_input() {
        let mut v = vec![1.0, 2.0];
        correct_leading_columns(&mut v, 5);
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn process_order_dark_then_pixels_then_boxcar() {
        let config = PipelineConfig {
            scan_averaging: 1,
            dark: Some(vec![1.0; 4]),
            boxcar_half_width: 0,
            correct_bad_pixels: true,
        };
        let out = process(vec![2.0, 50.0, 4.0, 5.0], &config, &[1]);
        // Dark first (2->1, 4->3), then pixel 1 interpolates to 2.
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
