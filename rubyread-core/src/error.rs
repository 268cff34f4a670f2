//! # Error Module
//!
//! Typed errors for the parts of the pipeline that can genuinely fail:
//! instrument access, spectrum validation, persistence and the wavelength
//! calibration. Fit failures are *not* errors; they are reported as
//! [`crate::fitter::FitOutcome`] values.

use std::error::Error;
use std::fmt::Display;

/// Result type used throughout `rubyread-core`.
pub type Result<T> = std::result::Result<T, RubyError>;

#[derive(Debug)]
pub enum RubyError {
    /// No spectrometer found, or the device is busy.
    InstrumentUnavailable(String),
    /// Serial number is not on the allow-list.
    InstrumentNotRecognized(String),
    /// More spectrometers are attached than the session can choose from.
    TooManyInstruments(usize),
    /// The operator aborted the session start.
    Aborted,
    /// The driver reported a failure while talking to an open device.
    Instrument(String),
    /// Wavelength and intensity arrays do not describe a valid spectrum.
    InvalidSpectrum(String),
    /// Not enough usable points to run the wavelength calibration.
    Calibration(String),
    /// The requested operation conflicts with a running acquisition.
    Busy(String),
    /// The reference-wavelength snippet could not be parsed.
    Parse(String),
    /// A setting is out of its usable range.
    InvalidSetting(String),
    File(std::io::Error),
    Csv(csv::Error),
    Json(serde_json::Error),
    /// A worker thread hung up its channel.
    Sync,
}

impl From<std::io::Error> for RubyError {
    fn from(err: std::io::Error) -> RubyError {
        RubyError::File(err)
    }
}

impl From<csv::Error> for RubyError {
    fn from(err: csv::Error) -> RubyError {
        RubyError::Csv(err)
    }
}

impl From<serde_json::Error> for RubyError {
    fn from(err: serde_json::Error) -> RubyError {
        RubyError::Json(err)
    }
}

impl Display for RubyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RubyError::InstrumentUnavailable(x) => {
                write!(f, "No spectrometer available: {}", x)
            }
            RubyError::InstrumentNotRecognized(x) => write!(
                f,
                "The serial number of your spectrometer ({}) is not recognized",
                x
            ),
            RubyError::TooManyInstruments(n) => write!(
                f,
                "{} spectrometers found, please limit the number of spectrometers",
                n
            ),
            RubyError::Aborted => write!(f, "Session start aborted by the operator"),
            RubyError::Instrument(x) => write!(f, "Spectrometer error: {}", x),
            RubyError::InvalidSpectrum(x) => write!(f, "Invalid spectrum: {}", x),
            RubyError::Calibration(x) => write!(f, "Wavelength calibration failed: {}", x),
            RubyError::Busy(x) => write!(f, "Unable to {} during continuous collection", x),
            RubyError::Parse(x) => write!(f, "Unable to parse reference wavelength: {}", x),
            RubyError::InvalidSetting(x) => write!(f, "Invalid setting: {}", x),
            RubyError::File(x) => write!(f, "File I/O error: {}", x),
            RubyError::Csv(x) => write!(f, "Error reading spectrum file: {}", x),
            RubyError::Json(x) => write!(f, "Error reading settings: {}", x),
            RubyError::Sync => write!(f, "A worker thread is no longer reachable"),
        }
    }
}

impl Error for RubyError {}
