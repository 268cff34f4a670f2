//! # Fit Worker Module
//!
//! Runs [`PeakFitter::fit`] on a dedicated thread so the coordinating
//! session never blocks on the solver. Jobs carry their own fitter, so a
//! settings change applies from the next job on.

use crate::error::{Result, RubyError};
use crate::fitter::{FitReport, PeakFitter};
use crate::spectrum::Spectrum;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One spectrum to fit.
#[derive(Debug, Clone)]
pub struct FitJob {
    pub spectrum: Arc<Spectrum>,
    pub fitter: PeakFitter,
}

/// Answer to a [`FitJob`].
#[derive(Debug, Clone)]
pub struct FitDone {
    pub spectrum: Arc<Spectrum>,
    /// `None` when the fit panicked.
    pub report: Option<FitReport>,
}

#[derive(Debug)]
pub struct FitWorker {
    job_tx: Sender<FitJob>,
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FitWorker {
    pub fn start(results: Sender<FitDone>) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<FitJob>();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_handle = thread::spawn(move || {
            log::debug!("[FIT-THREAD] Started");
            loop {
                crossbeam_channel::select! {
                    recv(job_rx) -> msg => match msg {
                        Ok(job) => {
                            let report = match std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| job.fitter.fit(&job.spectrum)),
                            ) {
                                Ok(report) => Some(report),
                                Err(_) => {
                                    log::error!("[FIT-THREAD] Fit panicked, dropping result");
                                    None
                                }
                            };
                            let done = FitDone {
                                spectrum: job.spectrum,
                                report,
                            };
                            if results.send(done).is_err() {
                                log::debug!("[FIT-THREAD] Result receiver gone");
                                break;
                            }
                        }
                        Err(_) => {
                            log::debug!("[FIT-THREAD] Job channel closed");
                            break;
                        }
                    },
                    recv(shutdown_rx) -> _ => {
                        log::debug!("[FIT-THREAD] Received shutdown signal");
                        break;
                    },
                }
            }
            log::debug!("[FIT-THREAD] Finished");
        });
        Self {
            job_tx,
            shutdown_tx,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn submit(&self, job: FitJob) -> Result<()> {
        self.job_tx.send(job).map_err(|_| RubyError::Sync)
    }

    /// Signals the thread and waits for the job in progress to finish.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("[FIT-THREAD] Thread panicked");
            }
        }
    }
}

impl Drop for FitWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
