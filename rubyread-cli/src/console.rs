//! # Console Input Module
//!
//! Turns typed lines into session [`Command`]s and asks the operator the
//! questions raised while opening the spectrometer.
//!
//! ## Commands
//! - `take`, `go` (start/stop), `fit`, `auto` (continuous fit)
//! - `threshold <counts>`, `roi <below> <above>`, `clamp end|open`, `profile pv|moffat`
//! - `preset <name>`, `custom <alpha> <beta>`, `temp <K>`, `track on|off`, `reading <K>`
//! - `lambda0 <nm>`, `lambda0 fit`
//! - `time <ms>`, `up`, `down`, `average <n>`, `duration <s>`
//! - `target nm|gpa|delta <value>`, `ref zero|fit|target`
//! - `mark <slot> <pixel>`, `check <slot> on|off`, `clear <slot>`, `calibrate`
//! - `load <file>`, `save <file>`, `quit`

use rubyread_core::Command;
use rubyread_core::instrument::{DeviceHandle, Operator, Step, UnavailableChoice};
use rubyread_core::peak_model::ProfileKind;
use rubyread_core::pressure::{CalibrationCurve, Preset};
use rubyread_core::spectrum::{RoiHighClamp, RoiMargins};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Printed for `help`.
pub const HELP: &str = "\
acquisition: take | go | time <ms> | up | down | average <n> | duration <s>
fitting:     fit | auto | threshold <counts> | roi <below> <above> | clamp end|open | profile pv|moffat
pressure:    preset <name> | custom <A> <B> | temp <K> | track on|off | reading <K> | lambda0 <nm>|fit
markers:     target nm|gpa|delta <value> | ref zero|fit|target
wavelength:  mark <slot> <pixel> | check <slot> on|off | clear <slot> | calibrate
files:       load <file> | save <file>
             quit";

/// Parses one console line.
///
/// # Returns
/// * `Ok(None)` for an empty line
/// * `Err(message)` when the line is not a valid command
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match (verb.to_lowercase().as_str(), rest.as_slice()) {
        ("take", []) => Command::TakeOne,
        ("go", []) => Command::StartStopContinuous,
        ("fit", []) => Command::FitOnce,
        ("auto", []) => Command::ToggleContinuousFit,
        ("threshold", [v]) => Command::SetThreshold(number(v)?),
        ("roi", [below, above]) => Command::SetRoiMargins(RoiMargins {
            below: number(below)?,
            above: number(above)?,
        }),
        ("clamp", ["end"]) => Command::SetRoiHighClamp(RoiHighClamp::EndOfSpectrum),
        ("clamp", ["open"]) => Command::SetRoiHighClamp(RoiHighClamp::OpenSlice),
        ("profile", ["pv"]) => Command::SetProfile(ProfileKind::PseudoVoigt),
        ("profile", ["moffat"]) => Command::SetProfile(ProfileKind::Moffat),
        ("preset", name) if !name.is_empty() => {
            let name = name.join(" ");
            let preset =
                Preset::from_name(&name).ok_or_else(|| format!("unknown preset '{}'", name))?;
            Command::SetCalibration(CalibrationCurve::Preset(preset))
        }
        ("custom", [alpha, beta]) => Command::SetCalibration(CalibrationCurve::Custom {
            alpha: number(alpha)?,
            beta: number(beta)?,
        }),
        ("temp", [t]) => Command::SetTemperature(number(t)?),
        ("track", [state]) => Command::SetTemperatureTracking(on_off(state)?),
        ("reading", [t]) => Command::TemperatureReading(number(t)?),
        ("lambda0", ["fit"]) => Command::UserReferenceFromFit,
        ("lambda0", [v]) => Command::SetUserReferenceWavelength(number(v)?),
        ("time", [ms]) => Command::SetIntegrationTime(number(ms)?),
        ("up", []) => Command::StepIntegrationTime(Step::Up),
        ("down", []) => Command::StepIntegrationTime(Step::Down),
        ("average", [n]) => Command::SetAveraging(number(n)?),
        ("duration", [s]) => Command::SetDuration(number(s)?),
        ("target", ["nm", v]) => Command::SetTargetWavelength(number(v)?),
        ("target", ["gpa", v]) => Command::SetTargetPressure(number(v)?),
        ("target", ["delta", v]) => Command::SetTargetDelta(number(v)?),
        ("ref", ["zero"]) => Command::ReferenceFromZero,
        ("ref", ["fit"]) => Command::ReferenceFromFit,
        ("ref", ["target"]) => Command::ReferenceFromTarget,
        ("mark", [slot, pixel]) => Command::MarkCalibrationPoint {
            slot: number(slot)?,
            pixel: number(pixel)?,
        },
        ("check", [slot, state]) => Command::SetCalibrationPointChecked {
            slot: number(slot)?,
            checked: on_off(state)?,
        },
        ("clear", [slot]) => Command::ClearCalibrationPoint(number(slot)?),
        ("calibrate", []) => Command::RunWavelengthCalibration,
        ("load", [path]) => Command::LoadSpectrum(PathBuf::from(path)),
        ("save", [path]) => Command::SaveSpectrum(PathBuf::from(path)),
        ("quit" | "exit", []) => Command::Shutdown,
        _ => return Err(format!("unknown command '{}'", line.trim())),
    };
    Ok(Some(command))
}

fn number<T: std::str::FromStr>(word: &str) -> Result<T, String> {
    word.parse()
        .map_err(|_| format!("'{}' is not a valid number", word))
}

fn on_off(word: &str) -> Result<bool, String> {
    match word {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(format!("expected on or off, got '{}'", word)),
    }
}

/// Asks the operator on a console. `reader` is stdin in the binary and a
/// canned buffer in tests.
pub struct ConsoleOperator<R: BufRead, W: Write> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    fn ask(&mut self, prompt: &str) -> String {
        let _ = write!(self.writer, "{}", prompt);
        let _ = self.writer.flush();
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(_) => line.trim().to_lowercase(),
            Err(_) => String::new(),
        }
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn no_device(&mut self, retries: u32) -> UnavailableChoice {
        let prompt = format!(
            "No spectrometer available (attempt {}).\n\
             Please connect a spectrometer and make sure it is not already in use.\n\
             [r]etry, [a]bort or [i]gnore and continue without hardware? ",
            retries + 1
        );
        loop {
            match self.ask(&prompt).as_str() {
                "r" | "retry" => return UnavailableChoice::Retry,
                "i" | "ignore" => return UnavailableChoice::ProceedWithoutHardware,
                // end of input counts as abort
                "a" | "abort" | "" => return UnavailableChoice::Abort,
                _ => continue,
            }
        }
    }

    fn choose_device(&mut self, devices: &[DeviceHandle]) -> usize {
        let prompt = format!(
            "Two spectrometers found.\n  0: {}\n  1: {}\nSelect 0 or 1: ",
            devices[0], devices[1]
        );
        loop {
            match self.ask(&prompt).as_str() {
                "0" | "" => return 0,
                "1" => return 1,
                _ => continue,
            }
        }
    }
}
