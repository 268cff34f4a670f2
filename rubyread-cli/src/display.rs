//! Text rendering of session events for the terminal.

use rubyread_core::SessionEvent;
use rubyread_core::fitter::FitOutcome;
use rubyread_core::pressure::MarkerDeltas;

/// One line per event, `None` for events not worth printing.
pub fn format_event(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::Spectrum(spectrum) => {
            let peak = spectrum.peak_index();
            format!(
                "spectrum: {} px, max {:.0} counts at {:.3} nm",
                spectrum.len(),
                spectrum.intensities()[peak],
                spectrum.wavelengths()[peak]
            )
        }
        SessionEvent::RemainingTime(Some(seconds)) => format!("remaining: {:.1} s", seconds),
        SessionEvent::RemainingTime(None) => "collection finished".to_string(),
        SessionEvent::Fit { outcome, roi, .. } => match outcome {
            FitOutcome::Fitted(params) => {
                let uncertainty = params
                    .r1_center_uncertainty()
                    .map(|u| format!(" ± {:.4}", u))
                    .unwrap_or_default();
                let roi = roi.map(|r| format!(" roi [{}, {})", r.lo, r.hi));
                format!(
                    "fit: R1 {:.3}{} nm, R2 {:.3} nm{}",
                    params.r1_center(),
                    uncertainty,
                    params.r2_center(),
                    roi.unwrap_or_default()
                )
            }
            other => format!("fit: {}", other.warning()),
        },
        SessionEvent::Pressure(readout) => {
            let mut line = format!(
                "P = {:.2} GPa (R1 {:.3} nm, λ0(T) {:.3} nm)",
                readout.pressure, readout.lambda_r1, readout.lambda_0_t_user
            );
            if let Some(deltas) = &readout.deltas {
                line.push_str(&deltas_text(deltas));
            }
            line
        }
        SessionEvent::Calibration {
            curve,
            temperature,
            lambda_0_user,
            lambda_0_t_user,
        } => format!(
            "calibration: {} at {:.1} K, λ0 {:.3} nm, λ0(T) {:.3} nm",
            curve, temperature, lambda_0_user, lambda_0_t_user
        ),
        SessionEvent::Markers {
            reference,
            target,
            deltas,
        } => {
            let mut line = format!(
                "markers: reference {:.3} nm / {:.2} GPa, target {:.3} nm / {:.2} GPa",
                reference.wavelength, reference.pressure, target.wavelength, target.pressure
            );
            if let Some(deltas) = deltas {
                line.push_str(&deltas_text(deltas));
            }
            line
        }
        SessionEvent::IntegrationTime(ms) => format!("integration time: {} ms", ms),
        SessionEvent::CalibrationPoint { slot, entry } => match entry {
            Some(entry) => format!(
                "line {}: pixel {:.2} at {:.3} nm, nearest {:.3} nm, error {:+.3} nm{}",
                slot,
                entry.pixel_fit,
                entry.wavelength_fit,
                entry.reference,
                entry.error,
                if entry.checked { " [x]" } else { " [ ]" }
            ),
            None => format!("line {}: cleared", slot),
        },
        SessionEvent::WavelengthAxis { first, last } => {
            format!("new wavelength axis {:.3} to {:.3} nm", first, last)
        }
        SessionEvent::ContinuousFit(on) => {
            format!("continuous fit {}", if *on { "on" } else { "off" })
        }
        SessionEvent::Error(message) => format!("error: {}", message),
    };
    Some(line)
}

fn deltas_text(deltas: &MarkerDeltas) -> String {
    format!(
        " | Δref {:+.2} GPa, Δtarget {:+.2} GPa",
        deltas.reference, deltas.target
    )
}
