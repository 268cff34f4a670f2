//! # Settings Module
//!
//! Operator settings that survive a restart. Every field has a default
//! equal to the start-up state, so partial files load.

use crate::error::{Result, RubyError};
use crate::fitter::FitSettings;
use crate::instrument::DEFAULT_INTEGRATION_MS;
use crate::pressure::{CalibrationCurve, ROOM_TEMPERATURE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest number of frames averaged into one spectrum.
pub const MAX_AVERAGING: u32 = 10;

/// Longest continuous collection run, one week in seconds.
pub const MAX_DURATION_S: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fit: FitSettings,
    pub calibration: CalibrationCurve,
    /// Sample temperature in K.
    pub temperature: f64,
    pub temperature_tracking: bool,
    pub integration_ms: u64,
    /// Frames per spectrum, 1 disables averaging.
    pub averaging: u32,
    /// Length of a continuous collection run in seconds.
    pub duration_s: f64,
    pub continuous_fit: bool,
    /// Where the user reference wavelength is kept between runs.
    pub reference_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fit: FitSettings::default(),
            calibration: CalibrationCurve::default(),
            temperature: ROOM_TEMPERATURE,
            temperature_tracking: false,
            integration_ms: DEFAULT_INTEGRATION_MS,
            averaging: 1,
            duration_s: 300.0,
            continuous_fit: false,
            reference_file: PathBuf::from("rubyread.txt"),
        }
    }
}

impl Settings {
    /// Run length, capped at [`MAX_DURATION_S`]. NaN reads as zero.
    pub fn duration(&self) -> Duration {
        let seconds = self.duration_s.max(0.0).min(MAX_DURATION_S);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    /// Averaging count clamped to `1..=MAX_AVERAGING`.
    pub fn averaging(&self) -> u32 {
        self.averaging.clamp(1, MAX_AVERAGING)
    }
}

/// Checks a requested run length in seconds.
///
/// Negative values become zero; non-finite values and values above
/// [`MAX_DURATION_S`] are refused.
pub fn check_duration(seconds: f64) -> Result<f64> {
    if !seconds.is_finite() || seconds > MAX_DURATION_S {
        return Err(RubyError::InvalidSetting(format!(
            "collection duration {} s is outside 0 to {} s",
            seconds, MAX_DURATION_S
        )));
    }
    Ok(seconds.max(0.0))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peak_model::ProfileKind;
    use crate::pressure::Preset;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.fit.margins.below, 150);
        assert_eq!(settings.fit.margins.above, 150);
        assert_eq!(settings.fit.threshold, 1000.0);
        assert_eq!(settings.fit.profile, ProfileKind::PseudoVoigt);
        assert_eq!(settings.calibration, CalibrationCurve::Preset(Preset::IppsRuby2020));
        assert_eq!(settings.integration_ms, 100);
        assert_eq!(settings.duration(), Duration::from_secs(300));
    }

    #[test]
    fn partial_json() {
        let settings: Settings =
            serde_json::from_str(r#"{ "temperature": 80.0, "averaging": 40 }"#).unwrap();
        assert_eq!(settings.temperature, 80.0);
        assert_eq!(settings.averaging(), MAX_AVERAGING);
        assert_eq!(settings.fit, FitSettings::default());
    }

    #[test]
    fn duration_out_of_range() {
        let settings: Settings = serde_json::from_str(r#"{ "duration_s": 1e30 }"#).unwrap();
        assert_eq!(settings.duration(), Duration::from_secs_f64(MAX_DURATION_S));
        let settings = Settings {
            duration_s: -5.0,
            ..Default::default()
        };
        assert_eq!(settings.duration(), Duration::ZERO);

        assert_eq!(check_duration(-1.0).unwrap(), 0.0);
        assert_eq!(check_duration(60.0).unwrap(), 60.0);
        assert!(matches!(
            check_duration(f64::INFINITY),
            Err(RubyError::InvalidSetting(_))
        ));
        assert!(check_duration(f64::NAN).is_err());
        assert!(check_duration(1e30).is_err());
    }
}
