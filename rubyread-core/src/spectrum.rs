//! # Spectrum Module
//!
//! Holds the active spectrum and its region of interest (ROI).
//!
//! A [`Spectrum`] is immutable once built; the [`SpectrumBuffer`] replaces it
//! wholesale on every acquisition or wavelength recalibration and hands out
//! `Arc` snapshots, so a fit running on another thread always sees one
//! complete spectrum.
//!
//! ## Features
//! - Length and monotonicity validation
//! - Peak index and nearest-wavelength lookups
//! - ROI selection with independent left/right margins and two high-end clamp policies

use crate::error::{Result, RubyError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One detector readout: N pixels with strictly increasing wavelengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    wavelengths: Vec<f64>,
    intensities: Vec<f64>,
}

impl Spectrum {
    /// Builds a spectrum after checking that both arrays have the same length,
    /// hold at least two samples and that the wavelength axis increases.
    pub fn new(wavelengths: Vec<f64>, intensities: Vec<f64>) -> Result<Self> {
        validate_axis(&wavelengths)?;
        if wavelengths.len() != intensities.len() {
            return Err(RubyError::InvalidSpectrum(format!(
                "{} wavelengths but {} intensities",
                wavelengths.len(),
                intensities.len()
            )));
        }
        Ok(Self {
            wavelengths,
            intensities,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    /// Index of the maximum intensity over the whole spectrum.
    ///
    /// Ties resolve to the first occurrence; NaN samples never win.
    pub fn peak_index(&self) -> usize {
        argmax(&self.intensities)
    }

    /// Index of the pixel whose wavelength is closest to `wavelength`.
    pub fn nearest_index(&self, wavelength: f64) -> usize {
        self.wavelengths
            .iter()
            .enumerate()
            .min_by(|a, b| {
                let da = (a.1 - wavelength).abs();
                let db = (b.1 - wavelength).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn slice(&self, roi: Roi) -> RoiView<'_> {
        RoiView {
            roi,
            wavelengths: &self.wavelengths[roi.lo..roi.hi],
            intensities: &self.intensities[roi.lo..roi.hi],
        }
    }

    /// Same intensities over a new axis.
    fn with_axis(&self, wavelengths: Vec<f64>) -> Result<Self> {
        Self::new(wavelengths, self.intensities.clone())
    }

    /// Same axis with new intensities.
    fn with_intensities(&self, intensities: Vec<f64>) -> Result<Self> {
        Self::new(self.wavelengths.clone(), intensities)
    }
}

/// Index of the largest value, first occurrence wins.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    best
}

fn validate_axis(wavelengths: &[f64]) -> Result<()> {
    if wavelengths.len() < 2 {
        return Err(RubyError::InvalidSpectrum(format!(
            "need at least 2 samples, got {}",
            wavelengths.len()
        )));
    }
    if let Some(i) = wavelengths
        .windows(2)
        .position(|w| w[1].partial_cmp(&w[0]) != Some(std::cmp::Ordering::Greater))
    {
        return Err(RubyError::InvalidSpectrum(format!(
            "wavelength axis is not increasing at pixel {}",
            i + 1
        )));
    }
    Ok(())
}

/// Pixel margins around the peak, left and right independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiMargins {
    /// Pixels kept below the peak index (`roi_min`).
    pub below: usize,
    /// Pixels kept above the peak index (`roi_max`).
    pub above: usize,
}

impl Default for RoiMargins {
    fn default() -> Self {
        Self {
            below: 150,
            above: 150,
        }
    }
}

/// How the high ROI bound is clamped when it runs past the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoiHighClamp {
    /// Clamp to `N`, the ROI keeps the last sample.
    #[default]
    EndOfSpectrum,
    /// Any bound above `N - 1` becomes `N - 1`, dropping the last sample.
    /// Matches the behaviour of earlier RubyRead releases.
    OpenSlice,
}

/// Half-open index range `[lo, hi)` into a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub lo: usize,
    pub hi: usize,
}

impl Roi {
    /// ROI centred on `peak_index` for a spectrum of `len` pixels.
    ///
    /// The low bound clamps to 0, the high bound follows `clamp`.
    /// The result always satisfies `0 <= lo < hi <= len` for `len >= 1`.
    pub fn around(
        peak_index: usize,
        margins: RoiMargins,
        len: usize,
        clamp: RoiHighClamp,
    ) -> Self {
        let mut lo = peak_index.saturating_sub(margins.below);
        let mut hi = peak_index.saturating_add(margins.above);
        match clamp {
            RoiHighClamp::EndOfSpectrum => {
                if hi > len {
                    hi = len;
                }
            }
            RoiHighClamp::OpenSlice => {
                if hi > len.saturating_sub(1) {
                    hi = len.saturating_sub(1);
                }
            }
        }
        if hi <= lo {
            hi = (lo + 1).min(len);
            lo = hi.saturating_sub(1);
        }
        Self { lo, hi }
    }

    pub fn len(&self) -> usize {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.hi == self.lo
    }
}

/// Borrowed ROI slice of a spectrum.
#[derive(Debug, Clone, Copy)]
pub struct RoiView<'a> {
    pub roi: Roi,
    pub wavelengths: &'a [f64],
    pub intensities: &'a [f64],
}

/// The single current spectrum plus the ROI found by the last peak search.
#[derive(Debug, Clone, Default)]
pub struct SpectrumBuffer {
    current: Option<Arc<Spectrum>>,
    roi: Option<Roi>,
}

impl SpectrumBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the active spectrum.
    pub fn set_spectrum(&mut self, wavelengths: Vec<f64>, intensities: Vec<f64>) -> Result<()> {
        let spectrum = Spectrum::new(wavelengths, intensities)?;
        self.install(spectrum);
        Ok(())
    }

    /// Installs a freshly acquired frame on the current wavelength axis.
    pub fn replace_intensities(&mut self, intensities: Vec<f64>) -> Result<()> {
        let spectrum = match &self.current {
            Some(current) => current.with_intensities(intensities)?,
            None => {
                return Err(RubyError::InvalidSpectrum(
                    "no wavelength axis installed".to_string(),
                ));
            }
        };
        self.install(spectrum);
        Ok(())
    }

    /// Swaps the wavelength axis, intensities are untouched.
    pub fn replace_wavelength_axis(&mut self, wavelengths: Vec<f64>) -> Result<()> {
        let spectrum = match &self.current {
            Some(current) => current.with_axis(wavelengths)?,
            None => {
                return Err(RubyError::InvalidSpectrum(
                    "no spectrum to recalibrate".to_string(),
                ));
            }
        };
        log::info!(
            "[SPECTRUM] New wavelength axis {:.3}..{:.3} nm",
            spectrum.wavelengths()[0],
            spectrum.wavelengths()[spectrum.len() - 1]
        );
        self.current = Some(Arc::new(spectrum));
        Ok(())
    }

    fn install(&mut self, spectrum: Spectrum) {
        if let Some(roi) = self.roi {
            if roi.hi > spectrum.len() {
                self.roi = None;
            }
        }
        self.current = Some(Arc::new(spectrum));
    }

    /// Cheap shared handle to the current spectrum.
    pub fn snapshot(&self) -> Option<Arc<Spectrum>> {
        self.current.clone()
    }

    pub fn spectrum(&self) -> Option<&Spectrum> {
        self.current.as_deref()
    }

    /// Records the ROI found by the latest peak search.
    pub fn set_roi(&mut self, roi: Roi) {
        self.roi = Some(roi);
    }

    /// Current ROI slice, if both a spectrum and a ROI exist.
    pub fn roi(&self) -> Option<RoiView<'_>> {
        let spectrum = self.current.as_deref()?;
        let roi = self.roi?;
        if roi.hi > spectrum.len() {
            return None;
        }
        Some(spectrum.slice(roi))
    }
}
