// rubyread-core/src/lib.rs

//! The core logic for ruby fluorescence pressure measurement.
//! This crate is responsible for spectrum acquisition, fitting of the
//! R1/R2 doublet, and conversion of the R1 position into pressure.
//! It is completely headless and contains no front-end code.

pub mod acquisition;
pub mod calibration;
pub mod error;
pub mod fit_worker;
pub mod fitter;
pub mod instrument;
pub mod peak_model;
pub mod persistence;
pub mod pressure;
pub mod session;
pub mod settings;
pub mod spectrum;

pub use error::{Result, RubyError};
pub use session::{Command, Session, SessionEvent};
pub use settings::Settings;
