//! # Pressure Module
//!
//! Converts the fitted R1 wavelength into pressure using the ruby gauge
//! `P = A/B * ((λ/λ0)^B - 1)`, with λ0 corrected for temperature.
//!
//! ## Features
//! - Named calibration presets, current and legacy tables
//! - User override of the calibration constants
//! - Temperature correction of the zero-pressure wavelength
//! - Inverse conversion for target pressure markers
//! - Reference and target markers with deltas against the fit
//! - Reference-wavelength snippet export and import

use crate::error::{Result, RubyError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Zero-pressure R1 wavelength at room temperature in nm.
pub const LAMBDA_0_REF: f64 = 694.260;

/// Temperature in K at which [`LAMBDA_0_REF`] applies.
pub const ROOM_TEMPERATURE: f64 = 295.0;

/// Temperatures reported by the process-variable feed are accepted only
/// strictly inside this range.
pub const TRACKING_RANGE: (f64, f64) = (0.0, 601.0);

/// Named ruby-gauge calibrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Preset {
    IppsRuby2020,
    Mao1986,
    Dewaele2004,
    Dorogokupets2007,
}

impl Preset {
    /// Presets offered by the current revision.
    pub const CURRENT: [Preset; 3] = [Preset::IppsRuby2020, Preset::Mao1986, Preset::Dewaele2004];

    /// Presets offered by the earlier revision.
    pub const LEGACY: [Preset; 3] = [
        Preset::Dorogokupets2007,
        Preset::Mao1986,
        Preset::Dewaele2004,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::IppsRuby2020 => "IPPS-Ruby2020",
            Preset::Mao1986 => "Mao 1986",
            Preset::Dewaele2004 => "Dewaele 2004",
            Preset::Dorogokupets2007 => "Dorogokupets 2007",
        }
    }

    /// `(alpha, beta)` of the preset.
    pub fn constants(&self) -> (f64, f64) {
        match self {
            Preset::IppsRuby2020 => (1870.0, 10.69),
            Preset::Mao1986 => (1904.0, 7.665),
            Preset::Dewaele2004 => (1904.0, 9.5),
            Preset::Dorogokupets2007 => (1885.0, 11.0),
        }
    }

    /// Looks a preset up by its display name, ignoring case.
    pub fn from_name(name: &str) -> Option<Preset> {
        PRESET_MAP.get(name.to_lowercase().as_str()).copied()
    }
}

impl Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lower-cased name to preset, covering both tables.
static PRESET_MAP: Lazy<BTreeMap<String, Preset>> = Lazy::new(|| {
    Preset::CURRENT
        .iter()
        .chain(Preset::LEGACY.iter())
        .map(|p| (p.name().to_lowercase(), *p))
        .collect()
});

/// Calibration curve selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CalibrationCurve {
    Preset(Preset),
    Custom { alpha: f64, beta: f64 },
}

impl CalibrationCurve {
    pub fn constants(&self) -> (f64, f64) {
        match self {
            CalibrationCurve::Preset(p) => p.constants(),
            CalibrationCurve::Custom { alpha, beta } => (*alpha, *beta),
        }
    }
}

impl Default for CalibrationCurve {
    fn default() -> Self {
        CalibrationCurve::Preset(Preset::IppsRuby2020)
    }
}

impl Display for CalibrationCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationCurve::Preset(p) => write!(f, "{}", p),
            CalibrationCurve::Custom { alpha, beta } => {
                write!(f, "User (A = {}, B = {})", alpha, beta)
            }
        }
    }
}

/// Temperature-corrected zero-pressure wavelength for `temperature` in K.
///
/// # Arguments
/// * `temperature` - Sample temperature in K
///
/// # Returns
/// * λ0(T) in nm, without any user offset
pub fn lambda_0_at(temperature: f64) -> f64 {
    let t = temperature;
    1.0e7 / (14423.0 + 0.0446 * t - 0.000481 * t * t + 0.000000371 * t * t * t)
}

/// Ruby-gauge constants plus the zero-pressure wavelength bookkeeping.
///
/// `lambda_0_t_user` is derived and only ever written by `recompute`, which
/// runs after every change of temperature, `lambda_0_user` or
/// `lambda_0_ref`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    curve: CalibrationCurve,
    alpha: f64,
    beta: f64,
    lambda_0_ref: f64,
    lambda_0_user: f64,
    lambda_0_t_user: f64,
    temperature: f64,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self::new(CalibrationCurve::default(), ROOM_TEMPERATURE)
    }
}

impl CalibrationState {
    pub fn new(curve: CalibrationCurve, temperature: f64) -> Self {
        let (alpha, beta) = curve.constants();
        let mut state = Self {
            curve,
            alpha,
            beta,
            lambda_0_ref: LAMBDA_0_REF,
            lambda_0_user: LAMBDA_0_REF,
            lambda_0_t_user: LAMBDA_0_REF,
            temperature,
        };
        state.recompute();
        state
    }

    fn recompute(&mut self) {
        let offset = self.lambda_0_user - self.lambda_0_ref;
        self.lambda_0_t_user = lambda_0_at(self.temperature) + offset;
    }

    pub fn curve(&self) -> CalibrationCurve {
        self.curve
    }

    pub fn set_curve(&mut self, curve: CalibrationCurve) {
        let (alpha, beta) = curve.constants();
        self.curve = curve;
        self.alpha = alpha;
        self.beta = beta;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
        self.recompute();
    }

    pub fn lambda_0_ref(&self) -> f64 {
        self.lambda_0_ref
    }

    pub fn set_lambda_0_ref(&mut self, lambda: f64) {
        self.lambda_0_ref = lambda;
        self.recompute();
    }

    pub fn lambda_0_user(&self) -> f64 {
        self.lambda_0_user
    }

    pub fn set_lambda_0_user(&mut self, lambda: f64) {
        self.lambda_0_user = lambda;
        self.recompute();
    }

    pub fn lambda_0_t_user(&self) -> f64 {
        self.lambda_0_t_user
    }

    /// Pressure in GPa for an R1 wavelength in nm.
    pub fn pressure(&self, lambda_r1: f64) -> f64 {
        self.alpha * (1.0 / self.beta) * ((lambda_r1 / self.lambda_0_t_user).powf(self.beta) - 1.0)
    }

    /// R1 wavelength in nm at which the gauge reads `pressure` GPa.
    pub fn wavelength(&self, pressure: f64) -> f64 {
        self.lambda_0_t_user * (pressure * self.beta / self.alpha + 1.0).powf(1.0 / self.beta)
    }
}

/// A wavelength/pressure pair shown next to the fitted position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureMarker {
    pub wavelength: f64,
    pub pressure: f64,
}

/// Marker pressures minus the fitted pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerDeltas {
    pub reference: f64,
    pub target: f64,
}

/// Calibration plus the last fitted R1 position and the two markers.
///
/// The target marker follows calibration changes with its pressure held
/// fixed; the reference marker stays where it was put.
#[derive(Debug, Clone)]
pub struct PressureCalculator {
    calibration: CalibrationState,
    tracking: bool,
    lambda_r1: Option<f64>,
    reference: PressureMarker,
    target: PressureMarker,
}

impl Default for PressureCalculator {
    fn default() -> Self {
        Self::new(CalibrationState::default())
    }
}

impl PressureCalculator {
    pub fn new(calibration: CalibrationState) -> Self {
        let zero = PressureMarker {
            wavelength: calibration.lambda_0_t_user(),
            pressure: 0.0,
        };
        Self {
            calibration,
            tracking: false,
            lambda_r1: None,
            reference: zero,
            target: zero,
        }
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn set_curve(&mut self, curve: CalibrationCurve) {
        log::info!("Pressure calibration set to {}", curve);
        self.calibration.set_curve(curve);
        self.refresh_target();
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.calibration.set_temperature(temperature);
        self.refresh_target();
    }

    pub fn set_lambda_0_user(&mut self, lambda: f64) {
        self.calibration.set_lambda_0_user(lambda);
        self.refresh_target();
    }

    /// Uses the last fitted R1 position as the user reference wavelength.
    ///
    /// # Returns
    /// * The new reference wavelength, or `None` when nothing has been fitted
    pub fn lambda_0_user_from_fit(&mut self) -> Option<f64> {
        let lambda = self.lambda_r1?;
        self.set_lambda_0_user(lambda);
        Some(lambda)
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn set_tracking(&mut self, enabled: bool) {
        self.tracking = enabled;
    }

    /// Applies a reading from the temperature feed.
    ///
    /// # Returns
    /// * `true` if the reading was accepted
    pub fn track_temperature(&mut self, reading: f64) -> bool {
        let (low, high) = TRACKING_RANGE;
        if !self.tracking || !(reading > low && reading < high) {
            return false;
        }
        self.set_temperature(reading);
        true
    }

    /// Records a new fitted R1 position and returns its pressure.
    pub fn update_fit(&mut self, lambda_r1: f64) -> f64 {
        self.lambda_r1 = Some(lambda_r1);
        self.calibration.pressure(lambda_r1)
    }

    pub fn lambda_r1(&self) -> Option<f64> {
        self.lambda_r1
    }

    /// Pressure of the last fit under the current calibration.
    pub fn fitted_pressure(&self) -> Option<f64> {
        self.lambda_r1.map(|l| self.calibration.pressure(l))
    }

    pub fn reference(&self) -> PressureMarker {
        self.reference
    }

    pub fn target(&self) -> PressureMarker {
        self.target
    }

    pub fn set_target_wavelength(&mut self, wavelength: f64) -> PressureMarker {
        self.target = PressureMarker {
            wavelength,
            pressure: self.calibration.pressure(wavelength),
        };
        self.target
    }

    pub fn set_target_pressure(&mut self, pressure: f64) -> PressureMarker {
        self.target = PressureMarker {
            wavelength: self.calibration.wavelength(pressure),
            pressure,
        };
        self.target
    }

    /// Places the target `delta` GPa away from the fitted pressure.
    pub fn set_target_delta(&mut self, delta: f64) -> Option<PressureMarker> {
        let fit = self.fitted_pressure()?;
        Some(self.set_target_pressure(fit + delta))
    }

    pub fn set_reference_from_zero(&mut self) -> PressureMarker {
        self.reference = PressureMarker {
            wavelength: self.calibration.lambda_0_t_user(),
            pressure: 0.0,
        };
        self.reference
    }

    pub fn set_reference_from_fit(&mut self) -> Option<PressureMarker> {
        let wavelength = self.lambda_r1?;
        self.reference = PressureMarker {
            wavelength,
            pressure: self.calibration.pressure(wavelength),
        };
        Some(self.reference)
    }

    pub fn set_reference_from_target(&mut self) -> PressureMarker {
        self.reference = self.target;
        self.reference
    }

    pub fn deltas(&self) -> Option<MarkerDeltas> {
        let fit = self.fitted_pressure()?;
        Some(MarkerDeltas {
            reference: self.reference.pressure - fit,
            target: self.target.pressure - fit,
        })
    }

    fn refresh_target(&mut self) {
        self.target.wavelength = self.calibration.wavelength(self.target.pressure);
    }
}

const SNIPPET_DISPLAY_KEY: &str = "gui.lambda_naught_295_display.setText";
const SNIPPET_VALUE_KEY: &str = "core.lambda_0_user";

/// Formats the user reference wavelength as the two-line recall snippet.
pub fn export_reference_wavelength(lambda: f64) -> String {
    format!(
        "{}('{:.3}')\n{} = {:.3}\n",
        SNIPPET_DISPLAY_KEY, lambda, SNIPPET_VALUE_KEY, lambda
    )
}

/// Reads the user reference wavelength back from a recall snippet.
///
/// The value assignment line is authoritative; the display line is only
/// used when the assignment is missing.
pub fn import_reference_wavelength(text: &str) -> Result<f64> {
    let mut display = None;
    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(SNIPPET_VALUE_KEY) {
            let value = rest.trim_start().strip_prefix('=').unwrap_or(rest).trim();
            return parse_wavelength(value);
        }
        if let Some(rest) = line.strip_prefix(SNIPPET_DISPLAY_KEY) {
            let value = rest.trim_matches(|c| c == '(' || c == ')' || c == '\'' || c == '"');
            display = Some(value.to_string());
        }
    }
    match display {
        Some(value) => parse_wavelength(&value),
        None => Err(RubyError::Parse("no reference wavelength assignment".to_string())),
    }
}

fn parse_wavelength(value: &str) -> Result<f64> {
    let lambda: f64 = value
        .parse()
        .map_err(|_| RubyError::Parse(format!("'{}' is not a number", value)))?;
    if !(lambda.is_finite() && lambda > 0.0) {
        return Err(RubyError::Parse(format!("{} is not a wavelength", lambda)));
    }
    Ok(lambda)
}
