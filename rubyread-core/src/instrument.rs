//! # Instrument Module
//!
//! The spectrometer boundary: a driver that lists and opens devices, the
//! open device itself, and the decision flow that runs when a session
//! starts.
//!
//! ## Features
//! - [`SpectrometerDriver`] / [`Spectrometer`] traits for real or simulated hardware
//! - Session-open flow with operator decisions and a bounded retry count
//! - Serial-number allow-list
//! - Integration-time step presets
//! - A simulated spectrometer emitting a noisy ruby doublet or a neon lamp

use crate::calibration::REFERENCE_LINES;
use crate::error::{Result, RubyError};
use crate::peak_model::{double_pseudo_voigt, pseudo_voigt};
use crate::pressure::CalibrationState;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::fmt::Display;

/// Spectrometers cleared for use with this program.
pub const ALLOW_LIST: [&str; 12] = [
    "HR+C0308",
    "HR+C0996",
    "HR+D1333",
    "HR+C2429",
    "HR+C0614",
    "HR+C2911",
    "HR+C1514",
    "HR+D2121",
    "HR+C1923",
    "HR+D0677",
    "FLMS18881",
    "FLMT06374",
];

/// Integration time applied right after a device is opened, in ms.
pub const DEFAULT_INTEGRATION_MS: u64 = 100;

/// Integration-time shortcuts in ms.
pub const INTEGRATION_PRESETS_MS: [u64; 6] = [20, 50, 100, 200, 500, 1000];

/// Empty device lists the operator may retry before the start is aborted.
pub const MAX_RETRIES: u32 = 3;

/// Identifies an attached spectrometer before it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub model: String,
    pub serial_number: String,
}

impl Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}:{}>", self.model, self.serial_number)
    }
}

/// An open spectrometer.
///
/// Implementations are moved into the acquisition thread while continuous
/// collection runs, hence `Send`.
pub trait Spectrometer: Send {
    fn serial_number(&self) -> &str;
    fn set_integration_time(&mut self, micros: u64) -> Result<()>;
    fn integration_time(&self) -> u64;
    fn wavelengths(&self) -> Vec<f64>;
    /// Blocks for one integration period and returns the frame.
    fn intensities(&mut self) -> Result<Vec<f64>>;
    fn max_intensity(&self) -> f64;
    fn pixel_count(&self) -> usize;
}

pub trait SpectrometerDriver {
    fn list_devices(&self) -> Vec<DeviceHandle>;
    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn Spectrometer>>;
}

/// What the operator wants when no spectrometer is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableChoice {
    Retry,
    Abort,
    ProceedWithoutHardware,
}

/// Decisions the session start hands to a human.
pub trait Operator {
    /// Called when the device list is empty. `retries` counts earlier retries.
    fn no_device(&mut self, retries: u32) -> UnavailableChoice;
    /// Picks one of exactly two devices, returning its index.
    fn choose_device(&mut self, devices: &[DeviceHandle]) -> usize;
}

/// Result of a successful session start.
pub enum SessionStart {
    Connected(Box<dyn Spectrometer>),
    /// No hardware; only loaded spectra can be analysed.
    Offline,
}

/// Runs the session-open decision flow against `driver`.
///
/// One device is opened directly, two are offered to the operator, three
/// or more are refused. An empty list asks the operator to retry, abort
/// or continue without hardware; after [`MAX_RETRIES`] retries the start
/// is aborted. The opened device must be on the [`ALLOW_LIST`] and gets
/// the default integration time.
///
/// # Arguments
/// * `driver` - Device enumeration and opening
/// * `operator` - Receives the decisions
///
/// # Returns
/// * The opened device, or [`SessionStart::Offline`] when the operator chose so
pub fn open_session(
    driver: &dyn SpectrometerDriver,
    operator: &mut dyn Operator,
) -> Result<SessionStart> {
    let mut retries = 0;
    let device = loop {
        let mut devices = driver.list_devices();
        match devices.len() {
            0 => {
                if retries >= MAX_RETRIES {
                    log::error!("[SESSION] Too many retries, giving up");
                    return Err(RubyError::InstrumentUnavailable(
                        "too many retries".to_string(),
                    ));
                }
                match operator.no_device(retries) {
                    UnavailableChoice::Retry => retries += 1,
                    UnavailableChoice::Abort => return Err(RubyError::Aborted),
                    UnavailableChoice::ProceedWithoutHardware => {
                        log::warn!("[SESSION] No spectrometer, continuing offline");
                        return Ok(SessionStart::Offline);
                    }
                }
            }
            1 => break devices.remove(0),
            2 => {
                let index = operator.choose_device(&devices).min(1);
                break devices.swap_remove(index);
            }
            n => return Err(RubyError::TooManyInstruments(n)),
        }
    };

    if !ALLOW_LIST.contains(&device.serial_number.as_str()) {
        return Err(RubyError::InstrumentNotRecognized(device.serial_number));
    }
    let mut spectrometer = driver.open(&device)?;
    spectrometer.set_integration_time(DEFAULT_INTEGRATION_MS * 1000)?;
    log::info!("[SESSION] Opened spectrometer {}", device);
    Ok(SessionStart::Connected(spectrometer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Up,
    Down,
}

/// Next integration-time preset strictly above or below `current_ms`.
///
/// # Returns
/// * `None` when `current_ms` is already beyond the last preset in that direction
pub fn step_integration_time(current_ms: u64, step: Step) -> Option<u64> {
    match step {
        Step::Up => INTEGRATION_PRESETS_MS.iter().copied().find(|&t| t > current_ms),
        Step::Down => INTEGRATION_PRESETS_MS.iter().rev().copied().find(|&t| t < current_ms),
    }
}

/// What the simulated spectrometer is looking at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimulatedSource {
    /// Ruby in a cell at the given pressure (GPa) and temperature (K).
    Ruby { pressure: f64, temperature: f64 },
    /// A neon calibration lamp.
    NeonLamp,
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub serial_number: String,
    pub pixels: usize,
    pub max_intensity: f64,
    /// R1 peak counts per ms of integration.
    pub counts_per_ms: f64,
    pub background: f64,
    pub noise: f64,
    pub source: SimulatedSource,
    pub seed: u64,
    /// Sleep for the integration time on every frame.
    pub realtime: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            serial_number: "HR+C0308".to_string(),
            pixels: 2048,
            max_intensity: 16383.0,
            counts_per_ms: 60.0,
            background: 800.0,
            noise: 25.0,
            source: SimulatedSource::Ruby {
                pressure: 0.0,
                temperature: 295.0,
            },
            seed: 42,
            realtime: true,
        }
    }
}

/// Stand-in for a spectrometer.
///
/// The wavelength axis is a gentle quadratic over roughly 640 to 775 nm,
/// the detector clips at `max_intensity`.
pub struct SimulatedSpectrometer {
    config: SimulatedConfig,
    wavelengths: Vec<f64>,
    integration_micros: u64,
    rng: StdRng,
}

impl SimulatedSpectrometer {
    pub fn new(config: SimulatedConfig) -> Self {
        let wavelengths = (0..config.pixels)
            .map(|p| {
                let p = p as f64 * 2048.0 / config.pixels as f64;
                640.0 + 0.07 * p - 2.0e-6 * p * p
            })
            .collect();
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            wavelengths,
            integration_micros: DEFAULT_INTEGRATION_MS * 1000,
            rng,
        }
    }

    pub fn set_source(&mut self, source: SimulatedSource) {
        self.config.source = source;
    }

    /// Noise-free frame for the current source and integration time.
    fn clean_frame(&self) -> Vec<f64> {
        let scale = self.config.counts_per_ms * self.integration_micros as f64 / 1000.0;
        let background = self.config.background;
        match self.config.source {
            SimulatedSource::Ruby {
                pressure,
                temperature,
            } => {
                let calibration = CalibrationState::new(Default::default(), temperature);
                let r1 = calibration.wavelength(pressure);
                let r2 = r1 - 1.4;
                let params = [scale / 2.0, r2, 0.5, 0.8, scale, r1, 0.5, 0.8, 0.0, background];
                self.wavelengths
                    .iter()
                    .map(|&x| double_pseudo_voigt(x, &params))
                    .collect()
            }
            SimulatedSource::NeonLamp => self
                .wavelengths
                .iter()
                .map(|&x| {
                    REFERENCE_LINES
                        .iter()
                        .map(|&c| pseudo_voigt(x, scale / 4.0, c, 0.3, 0.25, 0.0, 0.0))
                        .sum::<f64>()
                        + background
                })
                .collect(),
        }
    }
}

impl Spectrometer for SimulatedSpectrometer {
    fn serial_number(&self) -> &str {
        &self.config.serial_number
    }

    fn set_integration_time(&mut self, micros: u64) -> Result<()> {
        if micros == 0 {
            return Err(RubyError::Instrument(
                "integration time must be positive".to_string(),
            ));
        }
        log::debug!("Integration time set to {} us", micros);
        self.integration_micros = micros;
        Ok(())
    }

    fn integration_time(&self) -> u64 {
        self.integration_micros
    }

    fn wavelengths(&self) -> Vec<f64> {
        self.wavelengths.clone()
    }

    fn intensities(&mut self) -> Result<Vec<f64>> {
        if self.config.realtime {
            std::thread::sleep(std::time::Duration::from_micros(self.integration_micros));
        }
        let noise = Normal::new(0.0, self.config.noise)
            .map_err(|e| RubyError::Instrument(format!("noise model: {}", e)))?;
        let max = self.config.max_intensity;
        let clean = self.clean_frame();
        let rng = &mut self.rng;
        let frame = clean
            .into_iter()
            .map(|y| (y + noise.sample(&mut *rng)).clamp(0.0, max))
            .collect();
        Ok(frame)
    }

    fn max_intensity(&self) -> f64 {
        self.config.max_intensity
    }

    fn pixel_count(&self) -> usize {
        self.config.pixels
    }
}

/// Driver exposing a fixed set of simulated devices.
pub struct SimulatedDriver {
    devices: Vec<SimulatedConfig>,
}

impl SimulatedDriver {
    pub fn new(devices: Vec<SimulatedConfig>) -> Self {
        Self { devices }
    }
}

impl SpectrometerDriver for SimulatedDriver {
    fn list_devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .iter()
            .map(|c| DeviceHandle {
                model: "SIMULATED".to_string(),
                serial_number: c.serial_number.clone(),
            })
            .collect()
    }

    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn Spectrometer>> {
        let config = self
            .devices
            .iter()
            .find(|c| c.serial_number == device.serial_number)
            .ok_or_else(|| RubyError::InstrumentUnavailable(device.to_string()))?;
        Ok(Box::new(SimulatedSpectrometer::new(config.clone())))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::argmax;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Driver whose device list changes on every call.
    struct ScriptedDriver {
        lists: RefCell<VecDeque<Vec<&'static str>>>,
    }

    impl ScriptedDriver {
        fn new(lists: Vec<Vec<&'static str>>) -> Self {
            Self {
                lists: RefCell::new(lists.into()),
            }
        }
    }

    impl SpectrometerDriver for ScriptedDriver {
        fn list_devices(&self) -> Vec<DeviceHandle> {
            self.lists
                .borrow_mut()
                .pop_front()
                .unwrap_or_default()
                .into_iter()
                .map(|s| DeviceHandle {
                    model: "TEST".to_string(),
                    serial_number: s.to_string(),
                })
                .collect()
        }

        fn open(&self, device: &DeviceHandle) -> Result<Box<dyn Spectrometer>> {
            Ok(Box::new(SimulatedSpectrometer::new(SimulatedConfig {
                serial_number: device.serial_number.clone(),
                realtime: false,
                ..Default::default()
            })))
        }
    }

    struct ScriptedOperator {
        choices: VecDeque<UnavailableChoice>,
        pick: usize,
        asked: u32,
    }

    impl ScriptedOperator {
        fn new(choices: Vec<UnavailableChoice>, pick: usize) -> Self {
            Self {
                choices: choices.into(),
                pick,
                asked: 0,
            }
        }
    }

    impl Operator for ScriptedOperator {
        fn no_device(&mut self, _retries: u32) -> UnavailableChoice {
            self.asked += 1;
            self.choices.pop_front().unwrap_or(UnavailableChoice::Retry)
        }

        fn choose_device(&mut self, _devices: &[DeviceHandle]) -> usize {
            self.pick
        }
    }

    fn serial(start: SessionStart) -> String {
        match start {
            SessionStart::Connected(s) => s.serial_number().to_string(),
            SessionStart::Offline => "offline".to_string(),
        }
    }

    #[test]
    fn single_device_opens() {
        let driver = ScriptedDriver::new(vec![vec!["HR+D1333"]]);
        let mut operator = ScriptedOperator::new(vec![], 0);
        let start = open_session(&driver, &mut operator).unwrap();
        if let SessionStart::Connected(s) = &start {
            assert_eq!(s.integration_time(), 100_000);
        }
        assert_eq!(serial(start), "HR+D1333");
        assert_eq!(operator.asked, 0);
    }

    #[test]
    fn retry_then_connect() {
        let driver = ScriptedDriver::new(vec![vec![], vec![], vec!["FLMS18881"]]);
        let mut operator = ScriptedOperator::new(vec![], 0);
        let start = open_session(&driver, &mut operator).unwrap();
        assert_eq!(serial(start), "FLMS18881");
        assert_eq!(operator.asked, 2);
    }

    #[test]
    fn too_many_retries() {
        let driver = ScriptedDriver::new(vec![]);
        let mut operator = ScriptedOperator::new(vec![], 0);
        let result = open_session(&driver, &mut operator);
        assert!(matches!(result, Err(RubyError::InstrumentUnavailable(_))));
        assert_eq!(operator.asked, MAX_RETRIES);
    }

    #[test]
    fn abort_and_offline() {
        let driver = ScriptedDriver::new(vec![]);
        let mut operator = ScriptedOperator::new(vec![UnavailableChoice::Abort], 0);
        assert!(matches!(
            open_session(&driver, &mut operator),
            Err(RubyError::Aborted)
        ));

        let mut operator = ScriptedOperator::new(
            vec![UnavailableChoice::Retry, UnavailableChoice::ProceedWithoutHardware],
            0,
        );
        assert_eq!(serial(open_session(&driver, &mut operator).unwrap()), "offline");
    }

    #[test]
    fn two_devices_operator_picks() {
        let driver = ScriptedDriver::new(vec![vec!["HR+C0308", "HR+C0996"]]);
        let mut operator = ScriptedOperator::new(vec![], 1);
        assert_eq!(serial(open_session(&driver, &mut operator).unwrap()), "HR+C0996");
    }

    #[test]
    fn three_devices_refused() {
        let driver = ScriptedDriver::new(vec![vec!["HR+C0308", "HR+C0996", "HR+D1333"]]);
        let mut operator = ScriptedOperator::new(vec![], 0);
        assert!(matches!(
            open_session(&driver, &mut operator),
            Err(RubyError::TooManyInstruments(3))
        ));
    }

    #[test]
    fn unknown_serial_refused() {
        let driver = ScriptedDriver::new(vec![vec!["USB4000"]]);
        let mut operator = ScriptedOperator::new(vec![], 0);
        match open_session(&driver, &mut operator) {
            Err(RubyError::InstrumentNotRecognized(s)) => assert_eq!(s, "USB4000"),
            _ => panic!("expected InstrumentNotRecognized"),
        }
    }

    #[test]
    fn integration_steps() {
        assert_eq!(step_integration_time(100, Step::Up), Some(200));
        assert_eq!(step_integration_time(100, Step::Down), Some(50));
        assert_eq!(step_integration_time(130, Step::Down), Some(100));
        assert_eq!(step_integration_time(130, Step::Up), Some(200));
        assert_eq!(step_integration_time(1000, Step::Up), None);
        assert_eq!(step_integration_time(20, Step::Down), None);
        assert_eq!(step_integration_time(5, Step::Up), Some(20));
    }

    #[test]
    fn simulated_ruby_peak() {
        let mut spec = SimulatedSpectrometer::new(SimulatedConfig {
            realtime: false,
            source: SimulatedSource::Ruby {
                pressure: 10.0,
                temperature: 295.0,
            },
            ..Default::default()
        });
        let xs = spec.wavelengths();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
        let ys = spec.intensities().unwrap();
        assert_eq!(ys.len(), 2048);
        let expected = CalibrationState::default().wavelength(10.0);
        assert!((xs[argmax(&ys)] - expected).abs() < 0.2);
    }

    #[test]
    fn simulated_clips_at_max() {
        let mut spec = SimulatedSpectrometer::new(SimulatedConfig {
            realtime: false,
            ..Default::default()
        });
        spec.set_integration_time(1_000_000).unwrap();
        let ys = spec.intensities().unwrap();
        assert!(ys.iter().any(|&y| y == spec.max_intensity()));
        assert!(spec.set_integration_time(0).is_err());
    }

    #[test]
    fn simulated_source_switch() {
        let mut spec = SimulatedSpectrometer::new(SimulatedConfig {
            realtime: false,
            ..Default::default()
        });
        spec.set_source(SimulatedSource::NeonLamp);
        let xs = spec.wavelengths();
        let ys = spec.intensities().unwrap();
        let peak = xs[argmax(&ys)];
        assert!(REFERENCE_LINES.iter().any(|&line| (peak - line).abs() < 0.2));
        assert!(ys.iter().all(|y| y.is_finite() && *y >= 0.0));
    }
}
