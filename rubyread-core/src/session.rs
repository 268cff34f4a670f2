//! # Session Module
//!
//! The owned context that ties the pipeline together. A [`Session`] holds
//! the spectrum buffer, the pressure calculator, the wavelength calibrator
//! and the settings, and coordinates two worker threads:
//!
//! - the acquisition worker, which owns the spectrometer while collecting
//! - the fit worker, which runs the peak fit off the coordinating thread
//!
//! Front-ends talk to it with [`Command`]s and listen to [`SessionEvent`]s.
//! The session is the only writer of the spectrum and of the fit results;
//! workers only ever send messages back.
//!
//! ## Message flow
//! ```text
//! Command ─► Session ─► AcquisitionWorker ─► AcquisitionEvent ─┐
//!               ▲                                              │
//!               └──── FitDone ◄── FitWorker ◄── FitJob ◄───────┘
//!               │
//!               └──► SessionEvent (spectrum, fit, pressure, remaining time)
//! ```

use crate::acquisition::{AcquisitionControl, AcquisitionEvent, AcquisitionWorker, acquire};
use crate::calibration::{CalibrationEntry, WavelengthCalibrator};
use crate::error::{Result, RubyError};
use crate::fit_worker::{FitDone, FitJob, FitWorker};
use crate::fitter::{FitOutcome, FittedCurves, PeakFitter};
use crate::instrument::{Spectrometer, Step, step_integration_time};
use crate::peak_model::ProfileKind;
use crate::persistence;
use crate::pressure::{
    CalibrationCurve, CalibrationState, MarkerDeltas, PressureCalculator, PressureMarker,
};
use crate::settings::{MAX_AVERAGING, Settings, check_duration};
use crate::spectrum::{Roi, RoiHighClamp, RoiMargins, Spectrum, SpectrumBuffer};
use crossbeam_channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;

/// Saturation ceiling assumed for loaded spectra when no device is open.
pub const OFFLINE_MAX_INTENSITY: f64 = 65535.0;

/// Operator requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TakeOne,
    StartStopContinuous,
    FitOnce,
    ToggleContinuousFit,
    SetThreshold(f64),
    SetRoiMargins(RoiMargins),
    SetRoiHighClamp(RoiHighClamp),
    SetProfile(ProfileKind),
    SetCalibration(CalibrationCurve),
    SetTemperature(f64),
    SetTemperatureTracking(bool),
    /// A reading from the temperature feed.
    TemperatureReading(f64),
    SetUserReferenceWavelength(f64),
    UserReferenceFromFit,
    SetIntegrationTime(u64),
    StepIntegrationTime(Step),
    SetAveraging(u32),
    SetDuration(f64),
    SetTargetWavelength(f64),
    SetTargetPressure(f64),
    SetTargetDelta(f64),
    ReferenceFromZero,
    ReferenceFromFit,
    ReferenceFromTarget,
    MarkCalibrationPoint { slot: usize, pixel: usize },
    SetCalibrationPointChecked { slot: usize, checked: bool },
    ClearCalibrationPoint(usize),
    RunWavelengthCalibration,
    LoadSpectrum(PathBuf),
    SaveSpectrum(PathBuf),
    Shutdown,
}

/// Pressure side of the display.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureReadout {
    pub lambda_r1: f64,
    pub pressure: f64,
    pub lambda_0_t_user: f64,
    pub deltas: Option<MarkerDeltas>,
}

/// Everything a front-end needs to draw.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Spectrum(Arc<Spectrum>),
    /// Seconds left in the running collection, `None` when idle.
    RemainingTime(Option<f64>),
    Fit {
        outcome: FitOutcome,
        roi: Option<Roi>,
        curves: Option<FittedCurves>,
    },
    Pressure(PressureReadout),
    Calibration {
        curve: CalibrationCurve,
        temperature: f64,
        lambda_0_user: f64,
        lambda_0_t_user: f64,
    },
    Markers {
        reference: PressureMarker,
        target: PressureMarker,
        deltas: Option<MarkerDeltas>,
    },
    IntegrationTime(u64),
    CalibrationPoint {
        slot: usize,
        entry: Option<CalibrationEntry>,
    },
    WavelengthAxis {
        first: f64,
        last: f64,
    },
    ContinuousFit(bool),
    /// A command failed; the session carries on.
    Error(String),
}

enum Instrument {
    Offline,
    Idle(Box<dyn Spectrometer>),
    Collecting(AcquisitionWorker),
}

pub struct Session {
    settings: Settings,
    buffer: SpectrumBuffer,
    pressure: PressureCalculator,
    calibrator: WavelengthCalibrator,
    instrument: Instrument,
    max_intensity: f64,

    events: Sender<SessionEvent>,
    acquisition_tx: Sender<AcquisitionEvent>,
    acquisition_rx: Receiver<AcquisitionEvent>,
    fit_worker: FitWorker,
    fit_rx: Receiver<FitDone>,
    fit_in_flight: bool,
    pending_fit: Option<Arc<Spectrum>>,
}

impl Session {
    /// Builds a session around an opened spectrometer, or offline with `None`.
    ///
    /// With a spectrometer the wavelength axis and a first frame are read
    /// right away. The user reference wavelength is recalled from
    /// `settings.reference_file` when that file exists.
    pub fn new(
        settings: Settings,
        spectrometer: Option<Box<dyn Spectrometer>>,
        events: Sender<SessionEvent>,
    ) -> Result<Self> {
        let mut calibration = CalibrationState::new(settings.calibration, settings.temperature);
        match persistence::recall_reference_wavelength(&settings.reference_file) {
            Ok(lambda) => {
                log::info!("[SESSION] Recalled reference wavelength {:.3} nm", lambda);
                calibration.set_lambda_0_user(lambda);
            }
            Err(e) => log::info!(
                "[SESSION] Unable to update zero pressure wavelength from {}: {}",
                settings.reference_file.display(),
                e
            ),
        }
        let mut pressure = PressureCalculator::new(calibration);
        pressure.set_tracking(settings.temperature_tracking);

        let mut buffer = SpectrumBuffer::new();
        let (instrument, max_intensity) = match spectrometer {
            Some(mut spectrometer) => {
                spectrometer.set_integration_time(micros(settings.integration_ms)?)?;
                let intensities = acquire(spectrometer.as_mut(), settings.averaging())?;
                buffer.set_spectrum(spectrometer.wavelengths(), intensities)?;
                let max = spectrometer.max_intensity();
                (Instrument::Idle(spectrometer), max)
            }
            None => (Instrument::Offline, OFFLINE_MAX_INTENSITY),
        };

        let (acquisition_tx, acquisition_rx) = crossbeam_channel::unbounded();
        let (fit_tx, fit_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            settings,
            buffer,
            pressure,
            calibrator: WavelengthCalibrator::new(),
            instrument,
            max_intensity,
            events,
            acquisition_tx,
            acquisition_rx,
            fit_worker: FitWorker::start(fit_tx),
            fit_rx,
            fit_in_flight: false,
            pending_fit: None,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn buffer(&self) -> &SpectrumBuffer {
        &self.buffer
    }

    pub fn pressure(&self) -> &PressureCalculator {
        &self.pressure
    }

    pub fn calibrator(&self) -> &WavelengthCalibrator {
        &self.calibrator
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.instrument, Instrument::Collecting(_))
    }

    pub fn is_fitting(&self) -> bool {
        self.fit_in_flight
    }

    /// Applies one command. Failures are also reported as
    /// [`SessionEvent::Error`].
    pub fn handle(&mut self, command: Command) -> Result<()> {
        log::debug!("[SESSION] {:?}", command);
        let result = self.apply(command);
        if let Err(e) = &result {
            log::warn!("[SESSION] {}", e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
        result
    }

    /// Drains worker messages without blocking.
    pub fn pump(&mut self) {
        while let Ok(event) = self.acquisition_rx.try_recv() {
            self.on_acquisition(event);
        }
        while let Ok(done) = self.fit_rx.try_recv() {
            self.on_fit(done);
        }
    }

    /// Serves `commands` until [`Command::Shutdown`] arrives or every sender
    /// is gone, then stops the workers.
    pub fn run(mut self, commands: Receiver<Command>) -> Settings {
        log::info!("[SESSION] Running");
        let acquisition_rx = self.acquisition_rx.clone();
        let fit_rx = self.fit_rx.clone();
        loop {
            crossbeam_channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => {
                        let _ = self.handle(command);
                    }
                },
                recv(acquisition_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.on_acquisition(event);
                    }
                },
                recv(fit_rx) -> msg => {
                    if let Ok(done) = msg {
                        self.on_fit(done);
                    }
                },
            }
        }
        self.shutdown();
        self.settings
    }

    /// Stops continuous collection and the fit worker, waiting for both.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop_collecting() {
            log::error!("[SESSION] {}", e);
        }
        self.fit_worker.stop();
        log::info!("[SESSION] Shut down");
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::TakeOne => self.take_one()?,
            Command::StartStopContinuous => {
                if self.is_collecting() {
                    self.stop_collecting()?;
                } else {
                    self.start_collecting()?;
                }
            }
            Command::FitOnce => {
                // continuous fitting already covers every spectrum
                if !self.settings.continuous_fit {
                    self.request_fit()?;
                }
            }
            Command::ToggleContinuousFit => {
                self.settings.continuous_fit = !self.settings.continuous_fit;
                self.emit(SessionEvent::ContinuousFit(self.settings.continuous_fit));
                if self.settings.continuous_fit {
                    self.request_fit()?;
                }
            }
            Command::SetThreshold(threshold) => self.settings.fit.threshold = threshold,
            Command::SetRoiMargins(margins) => self.settings.fit.margins = margins,
            Command::SetRoiHighClamp(clamp) => self.settings.fit.high_clamp = clamp,
            Command::SetProfile(profile) => {
                log::info!("[SESSION] Peak profile {}", profile);
                self.settings.fit.profile = profile;
            }
            Command::SetCalibration(curve) => {
                self.settings.calibration = curve;
                self.pressure.set_curve(curve);
                self.emit_pressure();
            }
            Command::SetTemperature(temperature) => {
                self.settings.temperature = temperature;
                self.pressure.set_temperature(temperature);
                self.emit_pressure();
            }
            Command::SetTemperatureTracking(enabled) => {
                self.settings.temperature_tracking = enabled;
                self.pressure.set_tracking(enabled);
            }
            Command::TemperatureReading(reading) => {
                if self.pressure.track_temperature(reading) {
                    self.settings.temperature = reading;
                    self.emit_pressure();
                }
            }
            Command::SetUserReferenceWavelength(lambda) => self.set_reference_wavelength(lambda)?,
            Command::UserReferenceFromFit => {
                let lambda = self.pressure.lambda_r1().ok_or_else(|| {
                    RubyError::InvalidSpectrum("no fitted R1 position yet".to_string())
                })?;
                self.set_reference_wavelength(lambda)?;
            }
            Command::SetIntegrationTime(ms) => self.set_integration_time(ms)?,
            Command::StepIntegrationTime(step) => {
                if let Some(ms) = step_integration_time(self.settings.integration_ms, step) {
                    self.set_integration_time(ms)?;
                }
            }
            Command::SetAveraging(n) => {
                self.settings.averaging = n.clamp(1, MAX_AVERAGING);
                if let Instrument::Collecting(worker) = &self.instrument {
                    worker.control(AcquisitionControl::SetAveraging(self.settings.averaging))?;
                }
            }
            Command::SetDuration(seconds) => self.settings.duration_s = check_duration(seconds)?,
            Command::SetTargetWavelength(lambda) => {
                self.pressure.set_target_wavelength(lambda);
                self.emit_markers();
            }
            Command::SetTargetPressure(p) => {
                self.pressure.set_target_pressure(p);
                self.emit_markers();
            }
            Command::SetTargetDelta(delta) => {
                if self.pressure.set_target_delta(delta).is_some() {
                    self.emit_markers();
                }
            }
            Command::ReferenceFromZero => {
                self.pressure.set_reference_from_zero();
                self.emit_markers();
            }
            Command::ReferenceFromFit => {
                if self.pressure.set_reference_from_fit().is_some() {
                    self.emit_markers();
                }
            }
            Command::ReferenceFromTarget => {
                self.pressure.set_reference_from_target();
                self.emit_markers();
            }
            Command::MarkCalibrationPoint { slot, pixel } => {
                let spectrum = self.current_spectrum()?;
                let entry = self.calibrator.mark_point(slot, pixel, &spectrum)?.clone();
                self.emit(SessionEvent::CalibrationPoint {
                    slot,
                    entry: Some(entry),
                });
            }
            Command::SetCalibrationPointChecked { slot, checked } => {
                self.calibrator.set_checked(slot, checked);
                self.emit_calibration_point(slot);
            }
            Command::ClearCalibrationPoint(slot) => {
                self.calibrator.clear(slot);
                self.emit_calibration_point(slot);
            }
            Command::RunWavelengthCalibration => {
                let n = self.current_spectrum()?.len();
                let axis = self.calibrator.calibrate(n)?;
                self.buffer.replace_wavelength_axis(axis.axis(n))?;
                if let Some(spectrum) = self.buffer.snapshot() {
                    let xs = spectrum.wavelengths();
                    self.emit(SessionEvent::WavelengthAxis {
                        first: xs[0],
                        last: xs[xs.len() - 1],
                    });
                    self.emit(SessionEvent::Spectrum(spectrum));
                }
            }
            Command::LoadSpectrum(path) => {
                if self.is_collecting() {
                    return Err(RubyError::Busy("load data".to_string()));
                }
                let spectrum = persistence::load_spectrum(&path)?;
                self.buffer.set_spectrum(
                    spectrum.wavelengths().to_vec(),
                    spectrum.intensities().to_vec(),
                )?;
                self.on_new_spectrum();
            }
            Command::SaveSpectrum(path) => {
                let spectrum = self.current_spectrum()?;
                persistence::save_spectrum(&path, &spectrum)?;
                log::info!("[SESSION] Saved spectrum to {}", path.display());
            }
            Command::Shutdown => self.shutdown(),
        }
        Ok(())
    }

    fn current_spectrum(&self) -> Result<Arc<Spectrum>> {
        self.buffer
            .snapshot()
            .ok_or_else(|| RubyError::InvalidSpectrum("no spectrum loaded".to_string()))
    }

    fn take_one(&mut self) -> Result<()> {
        let averaging = self.settings.averaging();
        let intensities = match &mut self.instrument {
            Instrument::Idle(spectrometer) => acquire(spectrometer.as_mut(), averaging)?,
            Instrument::Collecting(_) => return Ok(()),
            Instrument::Offline => {
                return Err(RubyError::InstrumentUnavailable("session is offline".to_string()));
            }
        };
        self.buffer.replace_intensities(intensities)?;
        self.on_new_spectrum();
        Ok(())
    }

    fn start_collecting(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.instrument, Instrument::Offline) {
            Instrument::Idle(spectrometer) => {
                let worker = AcquisitionWorker::start(
                    spectrometer,
                    self.settings.duration(),
                    self.settings.averaging(),
                    self.acquisition_tx.clone(),
                );
                self.instrument = Instrument::Collecting(worker);
                Ok(())
            }
            other => {
                self.instrument = other;
                Err(RubyError::InstrumentUnavailable("session is offline".to_string()))
            }
        }
    }

    /// Stops a running collection and waits until the device is back.
    fn stop_collecting(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.instrument, Instrument::Offline) {
            Instrument::Collecting(worker) => {
                let spectrometer = worker.stop()?;
                self.instrument = Instrument::Idle(spectrometer);
                // frames sent before the stop still count
                while let Ok(event) = self.acquisition_rx.try_recv() {
                    self.on_acquisition(event);
                }
                Ok(())
            }
            other => {
                self.instrument = other;
                Ok(())
            }
        }
    }

    fn set_integration_time(&mut self, ms: u64) -> Result<()> {
        if ms == 0 {
            return Err(RubyError::Instrument(
                "integration time must be positive".to_string(),
            ));
        }
        let integration = micros(ms)?;
        match &mut self.instrument {
            Instrument::Idle(spectrometer) => spectrometer.set_integration_time(integration)?,
            Instrument::Collecting(worker) => {
                worker.control(AcquisitionControl::SetIntegrationTime(integration))?
            }
            Instrument::Offline => {}
        }
        self.settings.integration_ms = ms;
        self.emit(SessionEvent::IntegrationTime(ms));
        Ok(())
    }

    fn set_reference_wavelength(&mut self, lambda: f64) -> Result<()> {
        if !(lambda.is_finite() && lambda > 0.0) {
            return Err(RubyError::Parse(format!("{} is not a wavelength", lambda)));
        }
        self.pressure.set_lambda_0_user(lambda);
        let path = &self.settings.reference_file;
        if let Err(e) = persistence::save_reference_wavelength(path, lambda) {
            log::warn!("[SESSION] Unable to store reference wavelength: {}", e);
        }
        self.emit_pressure();
        Ok(())
    }

    fn on_acquisition(&mut self, event: AcquisitionEvent) {
        match event {
            AcquisitionEvent::Frame {
                intensities,
                remaining,
            } => {
                if let Err(e) = self.buffer.replace_intensities(intensities) {
                    log::warn!("[SESSION] Dropping frame: {}", e);
                    return;
                }
                self.emit(SessionEvent::RemainingTime(Some(remaining)));
                self.on_new_spectrum();
            }
            AcquisitionEvent::Failed(message) => {
                self.emit(SessionEvent::Error(message));
            }
            AcquisitionEvent::Idle => {
                // Idle is the last thing the thread sends, so the join is short
                if let Err(e) = self.stop_collecting() {
                    log::error!("[SESSION] {}", e);
                }
                self.emit(SessionEvent::RemainingTime(None));
            }
        }
    }

    fn on_new_spectrum(&mut self) {
        let Some(spectrum) = self.buffer.snapshot() else {
            return;
        };
        self.emit(SessionEvent::Spectrum(spectrum));
        if self.settings.continuous_fit {
            if let Err(e) = self.request_fit() {
                log::error!("[SESSION] {}", e);
            }
        }
    }

    /// Queues a fit of the current spectrum. While a fit runs only the most
    /// recent request is kept.
    fn request_fit(&mut self) -> Result<()> {
        let spectrum = self.current_spectrum()?;
        if self.fit_in_flight {
            self.pending_fit = Some(spectrum);
            return Ok(());
        }
        self.submit_fit(spectrum)
    }

    fn submit_fit(&mut self, spectrum: Arc<Spectrum>) -> Result<()> {
        let fitter = PeakFitter::new(self.settings.fit, self.max_intensity);
        self.fit_worker.submit(FitJob { spectrum, fitter })?;
        self.fit_in_flight = true;
        Ok(())
    }

    fn on_fit(&mut self, done: FitDone) {
        self.fit_in_flight = false;
        match done.report {
            Some(report) => {
                self.buffer.set_roi(report.roi);
                if let FitOutcome::Fitted(params) = &report.outcome {
                    self.pressure.update_fit(params.r1_center());
                }
                self.emit(SessionEvent::Fit {
                    outcome: report.outcome.clone(),
                    roi: Some(report.roi),
                    curves: report.curves,
                });
                if report.outcome.is_fitted() {
                    self.emit_readout();
                }
            }
            None => self.emit(SessionEvent::Fit {
                outcome: FitOutcome::PoorFit,
                roi: None,
                curves: None,
            }),
        }
        if let Some(spectrum) = self.pending_fit.take() {
            if let Err(e) = self.submit_fit(spectrum) {
                log::error!("[SESSION] {}", e);
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("[SESSION] No event listener");
        }
    }

    fn emit_readout(&self) {
        if let (Some(lambda_r1), Some(pressure)) =
            (self.pressure.lambda_r1(), self.pressure.fitted_pressure())
        {
            self.emit(SessionEvent::Pressure(PressureReadout {
                lambda_r1,
                pressure,
                lambda_0_t_user: self.pressure.calibration().lambda_0_t_user(),
                deltas: self.pressure.deltas(),
            }));
        }
    }

    fn emit_markers(&self) {
        self.emit(SessionEvent::Markers {
            reference: self.pressure.reference(),
            target: self.pressure.target(),
            deltas: self.pressure.deltas(),
        });
    }

    /// Calibration changed: new λ0(T), pressure of the last fit and markers.
    fn emit_pressure(&self) {
        let calibration = self.pressure.calibration();
        self.emit(SessionEvent::Calibration {
            curve: calibration.curve(),
            temperature: calibration.temperature(),
            lambda_0_user: calibration.lambda_0_user(),
            lambda_0_t_user: calibration.lambda_0_t_user(),
        });
        self.emit_readout();
        self.emit_markers();
    }

    fn emit_calibration_point(&self, slot: usize) {
        self.emit(SessionEvent::CalibrationPoint {
            slot,
            entry: self.calibrator.entry(slot).cloned(),
        });
    }
}

/// Integration time in µs for a value in ms.
fn micros(ms: u64) -> Result<u64> {
    ms.checked_mul(1000)
        .ok_or_else(|| RubyError::Instrument(format!("integration time {} ms is too long", ms)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instrument::{SimulatedConfig, SimulatedSource, SimulatedSpectrometer};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn settings(dir: &tempfile::TempDir) -> Settings {
        Settings {
            reference_file: dir.path().join("rubyread.txt"),
            ..Default::default()
        }
    }

    fn simulated(pressure: f64) -> Box<dyn Spectrometer> {
        Box::new(SimulatedSpectrometer::new(SimulatedConfig {
            source: SimulatedSource::Ruby {
                pressure,
                temperature: 295.0,
            },
            ..Default::default()
        }))
    }

    /// Pumps the session until an event matching `pred` shows up.
    fn wait_for(
        session: &mut Session,
        events: &Receiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        let start = std::time::Instant::now();
        loop {
            session.pump();
            while let Ok(event) = events.try_recv() {
                if pred(&event) {
                    return event;
                }
            }
            assert!(start.elapsed() < TIMEOUT, "timed out waiting for event");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn take_one_and_fit_gives_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = Session::new(settings(&dir), Some(simulated(12.0)), tx).unwrap();

        session.handle(Command::TakeOne).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Spectrum(_)));
        session.handle(Command::FitOnce).unwrap();
        assert!(session.is_fitting());

        let event = wait_for(&mut session, &rx, |e| matches!(e, SessionEvent::Pressure(_)));
        let SessionEvent::Pressure(readout) = event else {
            unreachable!()
        };
        assert!((readout.pressure - 12.0).abs() < 0.1, "{}", readout.pressure);
        assert!(session.buffer().roi().is_some());
        session.shutdown();
    }

    #[test]
    fn continuous_collection_with_fitting() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut config = settings(&dir);
        config.duration_s = 0.3;
        config.integration_ms = 50;
        let mut session = Session::new(config, Some(simulated(5.0)), tx).unwrap();

        session.handle(Command::ToggleContinuousFit).unwrap();
        session.handle(Command::StartStopContinuous).unwrap();
        assert!(session.is_collecting());
        assert!(matches!(
            session.handle(Command::LoadSpectrum(dir.path().join("x.csv"))),
            Err(RubyError::Busy(_))
        ));

        wait_for(&mut session, &rx, |e| matches!(e, SessionEvent::Pressure(_)));
        wait_for(&mut session, &rx, |e| {
            matches!(e, SessionEvent::RemainingTime(None))
        });
        assert!(!session.is_collecting());
        session.handle(Command::TakeOne).unwrap();
        session.shutdown();
    }

    #[test]
    fn stop_collecting_returns_device() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut config = settings(&dir);
        config.integration_ms = 20;
        let mut session = Session::new(config, Some(simulated(0.0)), tx).unwrap();
        session.handle(Command::StartStopContinuous).unwrap();
        wait_for(&mut session, &rx, |e| {
            matches!(e, SessionEvent::RemainingTime(Some(_)))
        });
        session.handle(Command::StartStopContinuous).unwrap();
        assert!(!session.is_collecting());
        session.handle(Command::SetIntegrationTime(200)).unwrap();
        assert_eq!(session.settings().integration_ms, 200);
        session.handle(Command::StepIntegrationTime(Step::Up)).unwrap();
        assert_eq!(session.settings().integration_ms, 500);
    }

    #[test]
    fn out_of_range_settings_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut config = settings(&dir);
        config.integration_ms = 20;
        let mut session = Session::new(config, Some(simulated(0.0)), tx).unwrap();

        assert!(matches!(
            session.handle(Command::SetIntegrationTime(u64::MAX / 100)),
            Err(RubyError::Instrument(_))
        ));
        assert_eq!(session.settings().integration_ms, 20);

        assert!(matches!(
            session.handle(Command::SetDuration(1e30)),
            Err(RubyError::InvalidSetting(_))
        ));
        assert!(session.handle(Command::SetDuration(f64::INFINITY)).is_err());
        assert_eq!(session.settings().duration_s, 300.0);

        session.handle(Command::SetDuration(0.05)).unwrap();
        session.handle(Command::StartStopContinuous).unwrap();
        session.handle(Command::StartStopContinuous).unwrap();
        assert!(!session.is_collecting());
        session.shutdown();
    }

    #[test]
    fn offline_session() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = Session::new(settings(&dir), None, tx).unwrap();
        assert!(matches!(
            session.handle(Command::TakeOne),
            Err(RubyError::InstrumentUnavailable(_))
        ));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Error(_)));
        assert!(session.handle(Command::FitOnce).is_err());

        let path = dir.path().join("spectrum.csv");
        let xs: Vec<f64> = (0..400).map(|i| 690.0 + i as f64 * 0.025).collect();
        let doublet = [800.0, 692.86, 0.5, 0.8, 1600.0, 694.26, 0.5, 0.8, 0.0, 300.0];
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| crate::peak_model::double_pseudo_voigt(x, &doublet))
            .collect();
        persistence::save_spectrum(&path, &Spectrum::new(xs, ys).unwrap()).unwrap();
        session.handle(Command::LoadSpectrum(path)).unwrap();
        session.handle(Command::FitOnce).unwrap();
        let event = wait_for(&mut session, &rx, |e| matches!(e, SessionEvent::Fit { .. }));
        let SessionEvent::Fit { outcome, .. } = event else {
            unreachable!()
        };
        assert!(outcome.is_fitted());
        assert!(session.pressure().fitted_pressure().unwrap().abs() < 0.01);
    }

    #[test]
    fn reference_wavelength_is_stored_and_recalled() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut session = Session::new(settings(&dir), None, tx.clone()).unwrap();
        session.handle(Command::SetUserReferenceWavelength(694.31)).unwrap();
        assert!(session.handle(Command::UserReferenceFromFit).is_err());
        drop(session);

        let session = Session::new(settings(&dir), None, tx).unwrap();
        assert_eq!(session.pressure().calibration().lambda_0_user(), 694.31);
    }

    #[test]
    fn calibration_commands_update_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = Session::new(settings(&dir), None, tx).unwrap();
        session
            .handle(Command::SetCalibration(CalibrationCurve::Preset(
                crate::pressure::Preset::Mao1986,
            )))
            .unwrap();
        assert_eq!(session.pressure().calibration().alpha(), 1904.0);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Calibration { .. }));

        session.handle(Command::TemperatureReading(100.0)).unwrap();
        assert_eq!(session.settings().temperature, 295.0);
        session.handle(Command::SetTemperatureTracking(true)).unwrap();
        session.handle(Command::TemperatureReading(100.0)).unwrap();
        assert_eq!(session.settings().temperature, 100.0);
        assert_eq!(session.pressure().calibration().temperature(), 100.0);
    }
}
