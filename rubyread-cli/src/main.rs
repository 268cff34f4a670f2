//! # RubyRead - Ruby Fluorescence Pressure Console
//!
//! Terminal front-end for the ruby pressure gauge. Spectra come from a
//! (simulated) spectrometer or from files, the R1/R2 doublet is fitted and
//! the pressure printed as it changes.
//!
//! ## Architecture
//! - **Main Thread**: runs the [`Session`] loop
//! - **Input Thread**: parses console lines into commands
//! - **Display Thread**: prints session events
//! - **Communication**: Crossbeam channels between all three

mod console;
mod display;

use anyhow::{Context, bail};
use clap::Parser;
use console::{ConsoleOperator, HELP, parse_command};
use crossbeam_channel::{Receiver, Sender};
use env_logger::Env;
use rubyread_core::instrument::{
    ALLOW_LIST, SessionStart, SimulatedConfig, SimulatedDriver, SimulatedSource, open_session,
};
use rubyread_core::peak_model::ProfileKind;
use rubyread_core::persistence::{load_settings, save_settings};
use rubyread_core::pressure::{CalibrationCurve, Preset};
use rubyread_core::settings::check_duration;
use rubyread_core::{Command, Session, SessionEvent, Settings};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// settings file, read at start and written on exit
    #[arg(short, long, default_value = "rubyread.json")]
    settings: PathBuf,

    /// spectrum file to load right after start
    #[arg(short, long)]
    load: Option<PathBuf>,

    /// start without a spectrometer
    #[arg(long)]
    offline: bool,

    /// number of simulated spectrometers attached (0 to 3)
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// serial number reported by the first simulated spectrometer
    #[arg(long)]
    serial: Option<String>,

    /// pressure in GPa seen by the simulated spectrometer
    #[arg(short, long, default_value_t = 0.0)]
    pressure: f64,

    /// point the simulated spectrometer at a neon lamp instead of ruby
    #[arg(long)]
    lamp: bool,

    /// pressure calibration preset, e.g. "Mao 1986"
    #[arg(short, long)]
    calibration: Option<String>,

    /// sample temperature in K
    #[arg(short, long)]
    temperature: Option<f64>,

    /// follow temperature readings typed with `reading`
    #[arg(long)]
    track_temperature: bool,

    /// minimum peak height above background for a fit, in counts
    #[arg(long)]
    threshold: Option<f64>,

    /// fit with Moffat peaks instead of pseudo-Voigt
    #[arg(long)]
    moffat: bool,

    /// integration time in ms
    #[arg(short, long)]
    integration_ms: Option<u64>,

    /// frames averaged per spectrum
    #[arg(short, long)]
    averaging: Option<u32>,

    /// length of a continuous run in s
    #[arg(short, long)]
    duration: Option<f64>,

    /// fit every new spectrum
    #[arg(long)]
    continuous_fit: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let args = Args::parse();
    log::info!("[MAIN] Starting RubyRead {}", env!("CARGO_PKG_VERSION"));

    let settings = merge_args(initial_settings(&args.settings), &args)?;
    let spectrometer = if args.offline {
        None
    } else {
        connect(&args, &settings)?
    };

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<SessionEvent>();
    let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
    let session =
        Session::new(settings, spectrometer, event_tx).context("unable to start the session")?;
    if let Some(path) = &args.load {
        command_tx.send(Command::LoadSpectrum(path.clone()))?;
    }

    let display_handle = spawn_display(event_rx);
    let input_handle = spawn_input(command_tx);
    println!("{}", HELP);

    let settings = session.run(command_rx);

    if input_handle.join().is_err() {
        log::error!("[MAIN] Input thread panicked");
    }
    if display_handle.join().is_err() {
        log::error!("[MAIN] Display thread panicked");
    }
    save_settings(&settings, &args.settings)
        .with_context(|| format!("unable to save settings to {}", args.settings.display()))?;
    log::info!("[MAIN] Settings saved to {}", args.settings.display());
    Ok(())
}

/// Settings from `path`, or defaults when the file is missing or broken.
fn initial_settings(path: &Path) -> Settings {
    match load_settings(path) {
        Ok(settings) => {
            log::info!("[MAIN] Loaded settings from {}", path.display());
            settings
        }
        Err(e) => {
            log::info!("[MAIN] Using default settings ({}: {})", path.display(), e);
            Settings::default()
        }
    }
}

fn merge_args(mut settings: Settings, args: &Args) -> anyhow::Result<Settings> {
    if let Some(name) = &args.calibration {
        let Some(preset) = Preset::from_name(name) else {
            bail!("unknown calibration preset '{}'", name);
        };
        settings.calibration = CalibrationCurve::Preset(preset);
    }
    if let Some(temperature) = args.temperature {
        settings.temperature = temperature;
    }
    if args.track_temperature {
        settings.temperature_tracking = true;
    }
    if let Some(threshold) = args.threshold {
        settings.fit.threshold = threshold;
    }
    if args.moffat {
        settings.fit.profile = ProfileKind::Moffat;
    }
    if let Some(ms) = args.integration_ms {
        if ms == 0 {
            bail!("integration time must be positive");
        }
        settings.integration_ms = ms;
    }
    if let Some(n) = args.averaging {
        settings.averaging = n;
    }
    if let Some(seconds) = args.duration {
        settings.duration_s = check_duration(seconds)?;
    }
    if args.continuous_fit {
        settings.continuous_fit = true;
    }
    Ok(settings)
}

/// Lists the simulated devices and runs the session-open flow on the console.
fn connect(
    args: &Args,
    settings: &Settings,
) -> anyhow::Result<Option<Box<dyn rubyread_core::instrument::Spectrometer>>> {
    let source = if args.lamp {
        SimulatedSource::NeonLamp
    } else {
        SimulatedSource::Ruby {
            pressure: args.pressure,
            temperature: settings.temperature,
        }
    };
    let serials = [ALLOW_LIST[0], ALLOW_LIST[10], ALLOW_LIST[1]];
    let devices = serials
        .iter()
        .take(args.devices.min(serials.len()))
        .enumerate()
        .map(|(i, serial)| SimulatedConfig {
            serial_number: match (&args.serial, i) {
                (Some(serial), 0) => serial.clone(),
                _ => serial.to_string(),
            },
            source,
            seed: 42 + i as u64,
            ..Default::default()
        })
        .collect();
    let driver = SimulatedDriver::new(devices);

    let stdin = std::io::stdin();
    let mut operator = ConsoleOperator::new(stdin.lock(), std::io::stdout());
    match open_session(&driver, &mut operator).context("no spectrometer")? {
        SessionStart::Connected(spectrometer) => {
            log::info!("[MAIN] Connected to {}", spectrometer.serial_number());
            Ok(Some(spectrometer))
        }
        SessionStart::Offline => {
            log::warn!("[MAIN] Continuing without a spectrometer");
            Ok(None)
        }
    }
}

fn spawn_display(events: Receiver<SessionEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        log::debug!("[DISPLAY-THREAD] Started");
        // ends when the session drops its sender
        for event in events.iter() {
            if let Some(line) = display::format_event(&event) {
                println!("{}", line);
            }
        }
        log::debug!("[DISPLAY-THREAD] Finished");
    })
}

fn spawn_input(commands: Sender<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        log::debug!("[INPUT-THREAD] Started");
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim() == "help" {
                println!("{}", HELP);
                continue;
            }
            match parse_command(&line) {
                Ok(Some(command)) => {
                    let quit = command == Command::Shutdown;
                    if commands.send(command).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => eprintln!("{} (type help for a list)", message),
            }
        }
        // end of input stops the session too
        let _ = commands.send(Command::Shutdown);
        log::debug!("[INPUT-THREAD] Finished");
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn args_override_settings() {
        let args = Args::parse_from([
            "rubyread",
            "--calibration",
            "Dewaele 2004",
            "--temperature",
            "80",
            "--moffat",
            "-i",
            "250",
            "--continuous-fit",
        ]);
        let settings = merge_args(Settings::default(), &args).unwrap();
        assert_eq!(
            settings.calibration,
            CalibrationCurve::Preset(Preset::Dewaele2004)
        );
        assert_eq!(settings.temperature, 80.0);
        assert_eq!(settings.fit.profile, ProfileKind::Moffat);
        assert_eq!(settings.integration_ms, 250);
        assert!(settings.continuous_fit);
        assert!(!settings.temperature_tracking);
    }

    #[test]
    fn bad_arguments() {
        let args = Args::parse_from(["rubyread", "--calibration", "Holzapfel"]);
        assert!(merge_args(Settings::default(), &args).is_err());
        let args = Args::parse_from(["rubyread", "-i", "0"]);
        assert!(merge_args(Settings::default(), &args).is_err());
        let args = Args::parse_from(["rubyread", "--duration", "inf"]);
        assert!(merge_args(Settings::default(), &args).is_err());
    }

    #[test]
    fn missing_settings_file_gives_defaults() {
        let settings = initial_settings(Path::new("/nonexistent/rubyread.json"));
        assert_eq!(settings, Settings::default());
    }
}
