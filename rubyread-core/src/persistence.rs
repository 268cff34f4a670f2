//! # Persistence Module
//!
//! File formats read and written by the session.
//!
//! ## Features
//! - Spectrum CSV: one header line, `wavelength,intensity` rows
//! - Settings as pretty-printed JSON
//! - The reference-wavelength recall file

use crate::error::{Result, RubyError};
use crate::pressure::{export_reference_wavelength, import_reference_wavelength};
use crate::settings::Settings;
use crate::spectrum::Spectrum;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Value used for empty or missing cells.
const FILL_VALUE: f64 = 1.0;

/// Loads a spectrum from a comma-separated file.
///
/// The first line is a header and is skipped. Only the first two columns
/// are read; empty or missing cells read as 1.
///
/// # Arguments
/// * `path` - CSV or text file
///
/// # Returns
/// * The spectrum, validated like any other
pub fn load_spectrum(path: &Path) -> Result<Spectrum> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(file);
    let mut wavelengths = Vec::new();
    let mut intensities = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        wavelengths.push(cell(record.get(0), row)?);
        intensities.push(cell(record.get(1), row)?);
    }
    log::info!("Loaded {} points from {}", wavelengths.len(), path.display());
    Spectrum::new(wavelengths, intensities)
}

fn cell(value: Option<&str>, row: usize) -> Result<f64> {
    match value {
        None | Some("") => Ok(FILL_VALUE),
        Some(v) => v.parse().map_err(|_| {
            RubyError::InvalidSpectrum(format!("row {}: '{}' is not a number", row + 2, v))
        }),
    }
}

/// Writes a spectrum in the format [`load_spectrum`] reads.
pub fn save_spectrum(path: &Path, spectrum: &Spectrum) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;
    writer.write_record(["wavelength", "intensity"])?;
    for (x, y) in spectrum.wavelengths().iter().zip(spectrum.intensities()) {
        writer.write_record([x.to_string(), y.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Saves the settings as pretty-printed JSON.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    let json_string = serde_json::to_string_pretty(settings)?;
    let mut file = File::create(path)?;
    file.write_all(json_string.as_bytes())?;
    Ok(())
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut file = File::open(path)?;
    let mut data = String::new();
    file.read_to_string(&mut data)?;
    let settings: Settings = serde_json::from_str(&data)?;
    Ok(settings)
}

/// Stores the user reference wavelength for the next start.
pub fn save_reference_wavelength(path: &Path, lambda: f64) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(export_reference_wavelength(lambda).as_bytes())?;
    Ok(())
}

/// Reads the user reference wavelength stored by [`save_reference_wavelength`].
pub fn recall_reference_wavelength(path: &Path) -> Result<f64> {
    let mut file = File::open(path)?;
    let mut data = String::new();
    file.read_to_string(&mut data)?;
    import_reference_wavelength(&data)
}
