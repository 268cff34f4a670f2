//! # Acquisition Module
//!
//! Continuous spectrum collection on a dedicated thread.
//!
//! The worker owns the spectrometer while it runs. Every loop iteration
//! checks the shutdown channel, applies pending control messages and
//! then reads one (optionally averaged) frame, so stopping takes at most
//! one integration period. [`AcquisitionWorker::stop`] joins the thread
//! and hands the spectrometer back, which guarantees no read is in
//! flight when the caller reconfigures or closes the device.

use crate::error::{Result, RubyError};
use crate::instrument::Spectrometer;
use crossbeam_channel::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Messages emitted by the acquisition thread.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// A new frame and the collection time left in seconds.
    Frame { intensities: Vec<f64>, remaining: f64 },
    /// The driver failed; collection stops after this.
    Failed(String),
    /// Collection is over. Always the last event of a run.
    Idle,
}

/// Adjustments applied between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionControl {
    SetIntegrationTime(u64),
    SetAveraging(u32),
}

/// Reads `averaging` frames and returns their mean. `averaging` of 0 or 1
/// reads a single frame.
///
/// # Arguments
/// * `spectrometer` - Device to read from
/// * `averaging` - Number of frames to average
///
/// # Returns
/// * The averaged intensities
pub fn acquire(spectrometer: &mut dyn Spectrometer, averaging: u32) -> Result<Vec<f64>> {
    let mut sum = spectrometer.intensities()?;
    let n = averaging.max(1);
    for _ in 1..n {
        let frame = spectrometer.intensities()?;
        if frame.len() != sum.len() {
            return Err(RubyError::Instrument(format!(
                "frame length changed from {} to {}",
                sum.len(),
                frame.len()
            )));
        }
        sum.iter_mut().zip(frame).for_each(|(s, f)| *s += f);
    }
    if n > 1 {
        sum.iter_mut().for_each(|s| *s /= n as f64);
    }
    Ok(sum)
}

/// Handle to a running acquisition thread.
#[derive(Debug)]
pub struct AcquisitionWorker {
    shutdown_tx: Sender<()>,
    control_tx: Sender<AcquisitionControl>,
    thread_handle: Option<JoinHandle<Box<dyn Spectrometer>>>,
}

impl AcquisitionWorker {
    /// Moves `spectrometer` into a new thread that collects frames for
    /// `duration` and reports them on `events`.
    pub fn start(
        mut spectrometer: Box<dyn Spectrometer>,
        duration: Duration,
        averaging: u32,
        events: Sender<AcquisitionEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let thread_handle = thread::spawn(move || {
            log::info!(
                "[ACQUISITION] Collecting for {:.0} s from {}",
                duration.as_secs_f64(),
                spectrometer.serial_number()
            );
            collect(
                spectrometer.as_mut(),
                duration,
                averaging,
                &events,
                &shutdown_rx,
                &control_rx,
            );
            if events.send(AcquisitionEvent::Idle).is_err() {
                log::debug!("[ACQUISITION] Event receiver gone");
            }
            log::info!("[ACQUISITION] Thread finished");
            spectrometer
        });
        Self {
            shutdown_tx,
            control_tx,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn control(&self, control: AcquisitionControl) -> Result<()> {
        self.control_tx.send(control).map_err(|_| RubyError::Sync)
    }

    /// True once the thread has left its loop, e.g. when the duration ran out.
    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Signals the thread, waits for it to exit and returns the spectrometer.
    pub fn stop(mut self) -> Result<Box<dyn Spectrometer>> {
        // A full channel or an exited thread both mean the signal is not needed
        let _ = self.shutdown_tx.try_send(());
        let handle = self.thread_handle.take().ok_or(RubyError::Sync)?;
        handle.join().map_err(|_| {
            log::error!("[ACQUISITION] Thread panicked, spectrometer lost");
            RubyError::Sync
        })
    }
}

fn collect(
    spectrometer: &mut dyn Spectrometer,
    duration: Duration,
    mut averaging: u32,
    events: &Sender<AcquisitionEvent>,
    shutdown_rx: &Receiver<()>,
    control_rx: &Receiver<AcquisitionControl>,
) {
    let start = Instant::now();
    loop {
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => {
                log::info!("[ACQUISITION] Received shutdown signal");
                return;
            },
            recv(control_rx) -> msg => match msg {
                Ok(AcquisitionControl::SetIntegrationTime(micros)) => {
                    if let Err(e) = spectrometer.set_integration_time(micros) {
                        log::warn!("[ACQUISITION] {}", e);
                    }
                }
                Ok(AcquisitionControl::SetAveraging(n)) => averaging = n,
                Err(_) => return,
            },
            default => {
                let intensities = match acquire(spectrometer, averaging) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("[ACQUISITION] {}", e);
                        let _ = events.send(AcquisitionEvent::Failed(e.to_string()));
                        return;
                    }
                };
                let remaining = duration.as_secs_f64() - start.elapsed().as_secs_f64();
                if events
                    .send(AcquisitionEvent::Frame {
                        intensities,
                        remaining: remaining.max(0.0),
                    })
                    .is_err()
                {
                    log::debug!("[ACQUISITION] Event receiver gone");
                    return;
                }
                if remaining <= 0.0 {
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instrument::{SimulatedConfig, SimulatedSpectrometer};

    fn device() -> Box<dyn Spectrometer> {
        Box::new(SimulatedSpectrometer::new(SimulatedConfig {
            realtime: false,
            pixels: 256,
            ..Default::default()
        }))
    }

    /// Frame values count up by one on every read.
    struct Counter(f64);

    impl Spectrometer for Counter {
        fn serial_number(&self) -> &str {
            "COUNTER"
        }
        fn set_integration_time(&mut self, _micros: u64) -> Result<()> {
            Ok(())
        }
        fn integration_time(&self) -> u64 {
            1
        }
        fn wavelengths(&self) -> Vec<f64> {
            vec![1.0, 2.0]
        }
        fn intensities(&mut self) -> Result<Vec<f64>> {
            self.0 += 1.0;
            Ok(vec![self.0, 2.0 * self.0])
        }
        fn max_intensity(&self) -> f64 {
            100.0
        }
        fn pixel_count(&self) -> usize {
            2
        }
    }

    #[test]
    fn averaging() {
        let mut counter = Counter(0.0);
        assert_eq!(acquire(&mut counter, 0).unwrap(), vec![1.0, 2.0]);
        // frames 2, 3, 4
        assert_eq!(acquire(&mut counter, 3).unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn zero_duration_emits_one_frame_then_idle() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = AcquisitionWorker::start(device(), Duration::ZERO, 1, tx);
        match rx.recv().unwrap() {
            AcquisitionEvent::Frame {
                intensities,
                remaining,
            } => {
                assert_eq!(intensities.len(), 256);
                assert_eq!(remaining, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.recv().unwrap(), AcquisitionEvent::Idle);
        let spectrometer = worker.stop().unwrap();
        assert_eq!(spectrometer.pixel_count(), 256);
    }

    #[test]
    fn stop_waits_and_returns_device() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = AcquisitionWorker::start(device(), Duration::from_secs(600), 1, tx);
        worker
            .control(AcquisitionControl::SetIntegrationTime(20_000))
            .unwrap();
        for _ in 0..3 {
            assert!(matches!(rx.recv().unwrap(), AcquisitionEvent::Frame { .. }));
        }
        assert!(!worker.is_finished());
        let spectrometer = worker.stop().unwrap();
        assert_eq!(spectrometer.integration_time(), 20_000);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&AcquisitionEvent::Idle));
        assert!(events.iter().all(|e| !matches!(e, AcquisitionEvent::Failed(_))));
    }
}
