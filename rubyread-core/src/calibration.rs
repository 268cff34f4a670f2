//! # Wavelength Calibration Module
//!
//! Rebuilds the wavelength axis from a neon lamp spectrum. The operator
//! marks pixels near known lines; each mark is refined by a single
//! pseudo-Voigt fit, matched to the closest reference line, and the checked
//! marks feed a cubic pixel-to-wavelength least-squares fit.

use crate::error::{Result, RubyError};
use crate::fitter::solve_single;
use crate::spectrum::{Spectrum, argmax};
use nalgebra::{DMatrix, DVector};

/// Neon emission lines in nm used as calibration references.
pub const REFERENCE_LINES: [f64; 6] = [671.704, 692.947, 703.241, 724.517, 750.387, 763.511];

/// Number of calibration slots.
pub const MAX_ENTRIES: usize = 9;

/// Half width in pixels of the search and fit windows.
pub const FIT_HALF_WIDTH: usize = 20;

/// Marks whose error against their reference line (nm) is below this are
/// checked automatically.
pub const AUTO_CHECK_ERROR: f64 = 1.0;

const MIN_CHECKED: usize = 4;

/// One marked line.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    /// Pixel the operator clicked.
    pub pixel_guess: usize,
    /// Sub-pixel line center.
    pub pixel_fit: f64,
    /// Line center on the current wavelength axis.
    pub wavelength_fit: f64,
    /// Closest reference line.
    pub reference: f64,
    /// `wavelength_fit - reference`.
    pub error: f64,
    pub checked: bool,
}

/// Cubic pixel-to-wavelength mapping. Pixels are scaled by `scale` before
/// the polynomial is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CubicAxis {
    pub coefficients: [f64; 4],
    pub scale: f64,
}

impl CubicAxis {
    pub fn evaluate(&self, pixel: f64) -> f64 {
        let u = pixel / self.scale;
        let c = &self.coefficients;
        c[0] + u * (c[1] + u * (c[2] + u * c[3]))
    }

    /// Wavelengths for pixels `0..pixel_count`.
    pub fn axis(&self, pixel_count: usize) -> Vec<f64> {
        (0..pixel_count).map(|p| self.evaluate(p as f64)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WavelengthCalibrator {
    entries: [Option<CalibrationEntry>; MAX_ENTRIES],
}

impl WavelengthCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Option<CalibrationEntry>; MAX_ENTRIES] {
        &self.entries
    }

    pub fn entry(&self, slot: usize) -> Option<&CalibrationEntry> {
        self.entries.get(slot).and_then(|e| e.as_ref())
    }

    /// Refines the operator's mark `pixel` into slot `slot`.
    ///
    /// The strongest pixel within ±[`FIT_HALF_WIDTH`] of the mark becomes
    /// the center of the fit window. The line is fitted twice, against
    /// pixel index and against the current wavelength axis, and snapped to
    /// the nearest entry of [`REFERENCE_LINES`].
    ///
    /// # Arguments
    /// * `slot` - Entry index, below [`MAX_ENTRIES`]
    /// * `pixel` - Marked pixel
    /// * `spectrum` - Lamp spectrum on the provisional axis
    ///
    /// # Returns
    /// * The new entry
    pub fn mark_point(
        &mut self,
        slot: usize,
        pixel: usize,
        spectrum: &Spectrum,
    ) -> Result<&CalibrationEntry> {
        if slot >= MAX_ENTRIES {
            return Err(RubyError::Calibration(format!(
                "slot {} out of range, {} available",
                slot, MAX_ENTRIES
            )));
        }
        let n = spectrum.len();
        if pixel >= n {
            return Err(RubyError::Calibration(format!(
                "pixel {} outside the {} pixel spectrum",
                pixel, n
            )));
        }
        let ys = spectrum.intensities();
        let xs = spectrum.wavelengths();

        let (lo, hi) = window(pixel, n);
        let center = lo + argmax(&ys[lo..hi]);
        let (lo, hi) = window(center, n);

        let pixels: Vec<f64> = (lo..hi).map(|p| p as f64).collect();
        let local_ys = &ys[lo..hi];
        let local_xs = &xs[lo..hi];

        let pixel_fit = fit_center(&pixels, local_ys, center - lo).ok_or_else(|| {
            RubyError::Calibration(format!("no line found near pixel {}", pixel))
        })?;
        let wavelength_fit = fit_center(local_xs, local_ys, center - lo).ok_or_else(|| {
            RubyError::Calibration(format!("no line found near {:.3} nm", xs[center]))
        })?;

        let reference = nearest_line(wavelength_fit);
        let error = wavelength_fit - reference;
        log::debug!(
            "Calibration mark {} at pixel {}: {:.3} px, {:.3} nm -> {:.3} nm",
            slot,
            pixel,
            pixel_fit,
            wavelength_fit,
            reference
        );
        let entry = self.entries[slot].insert(CalibrationEntry {
            pixel_guess: pixel,
            pixel_fit,
            wavelength_fit,
            reference,
            error,
            checked: error < AUTO_CHECK_ERROR,
        });
        Ok(&*entry)
    }

    pub fn set_checked(&mut self, slot: usize, checked: bool) {
        if let Some(Some(entry)) = self.entries.get_mut(slot) {
            entry.checked = checked;
        }
    }

    pub fn clear(&mut self, slot: usize) {
        if let Some(entry) = self.entries.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn clear_all(&mut self) {
        self.entries = Default::default();
    }

    /// Fits a cubic through the checked `(pixel_fit, reference)` pairs.
    pub fn calibrate(&self, pixel_count: usize) -> Result<CubicAxis> {
        let points: Vec<(f64, f64)> = self
            .entries
            .iter()
            .flatten()
            .filter(|e| e.checked)
            .map(|e| (e.pixel_fit, e.reference))
            .collect();
        if points.len() < MIN_CHECKED {
            return Err(RubyError::Calibration(format!(
                "{} checked lines, at least {} needed",
                points.len(),
                MIN_CHECKED
            )));
        }

        let scale = pixel_count.max(1) as f64;
        let a = DMatrix::from_fn(points.len(), 4, |i, j| {
            (points[i].0 / scale).powi(j as i32)
        });
        let b = DVector::from_iterator(points.len(), points.iter().map(|p| p.1));
        let c = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| RubyError::Calibration(e.to_string()))?;
        let axis = CubicAxis {
            coefficients: [c[0], c[1], c[2], c[3]],
            scale,
        };
        log::info!(
            "Wavelength calibration from {} lines: {:.3} to {:.3} nm",
            points.len(),
            axis.evaluate(0.0),
            axis.evaluate((pixel_count.max(1) - 1) as f64)
        );
        Ok(axis)
    }
}

fn window(center: usize, len: usize) -> (usize, usize) {
    let lo = center.saturating_sub(FIT_HALF_WIDTH);
    let hi = (center + FIT_HALF_WIDTH).min(len);
    (lo, hi.max(lo + 1).min(len))
}

fn nearest_line(wavelength: f64) -> f64 {
    REFERENCE_LINES
        .iter()
        .copied()
        .min_by(|a, b| (a - wavelength).abs().total_cmp(&(b - wavelength).abs()))
        .unwrap_or(REFERENCE_LINES[0])
}

/// Fits one line and returns its center.
fn fit_center(xs: &[f64], ys: &[f64], peak: usize) -> Option<f64> {
    let (first, last) = (*xs.first()?, *xs.last()?);
    let slope = (ys[ys.len() - 1] - ys[0]) / (last - first);
    let intercept = ys[0] - slope * first;
    let floor = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let height = ys[peak] - floor;
    let seed = [
        height,
        xs[peak],
        0.5,
        half_max_width(xs, ys, peak, floor),
        slope,
        intercept,
    ];
    let fit = solve_single(xs, ys, &seed)?;
    // a center outside the window means the fit ran off
    (fit[1] >= first && fit[1] <= last).then_some(fit[1])
}

/// Full width at half maximum read off the samples around `peak`.
fn half_max_width(xs: &[f64], ys: &[f64], peak: usize, floor: f64) -> f64 {
    let half = floor + (ys[peak] - floor) / 2.0;
    let left = (0..peak).rev().find(|&i| ys[i] < half).unwrap_or(0);
    let right = (peak + 1..ys.len()).find(|&i| ys[i] < half).unwrap_or(ys.len() - 1);
    let width = xs[right] - xs[left];
    let step = (xs[xs.len() - 1] - xs[0]) / (xs.len() - 1).max(1) as f64;
    width.max(2.0 * step)
}
