//! # Peak Fitter Module
//!
//! Locates the ruby doublet in a spectrum and fits it with a two-peak model
//! on a linear background.
//!
//! Each call is independent of the previous one:
//! 1. The peak index is searched over the *full* spectrum
//! 2. A ROI is cut around it using the configured margins
//! 3. A linear background is estimated from the first and last samples
//! 4. R1 is seeded at the ROI maximum, R2 1.4 nm below it with half the height
//! 5. Weak or saturated signals are rejected before any fitting
//! 6. The remaining cases go through a Levenberg-Marquardt fit
//!
//! Rejections and solver failures are ordinary [`FitOutcome`] values.
//!
//! The solver is varpro's separable Levenberg-Marquardt: the amplitudes and
//! the background slope/intercept enter linearly and are solved exactly at
//! every step, the centers and shape parameters are iterated. No bounds are
//! placed on any parameter.

use crate::peak_model::{
    ProfileKind, moffat_basis, moffat_pd_center, moffat_pd_exponent, moffat_pd_width,
    pseudo_voigt_basis, pseudo_voigt_pd_center, pseudo_voigt_pd_eta, pseudo_voigt_pd_width,
};
use crate::spectrum::{Roi, RoiHighClamp, RoiMargins, Spectrum, argmax};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use varpro::model::builder::SeparableModelBuilder;
use varpro::solvers::levmar::{LevMarProblemBuilder, LevMarSolver};

/// Empirical R1 - R2 spacing in nm used to seed R2.
pub const DOUBLET_SPACING: f64 = 1.4;

const SHAPE_SEED: [f64; 2] = [0.5, 1.0];

/// User-tunable fitting configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    pub margins: RoiMargins,
    pub high_clamp: RoiHighClamp,
    /// Minimum background-subtracted R1 height in counts.
    pub threshold: f64,
    pub profile: ProfileKind,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            margins: RoiMargins::default(),
            high_clamp: RoiHighClamp::default(),
            threshold: 1000.0,
            profile: ProfileKind::default(),
        }
    }
}

/// The 10 values of the double-peak model in [`ProfileKind`] order:
/// `(a1, c1, s1, t1, a2, c2, s2, t2, slope, intercept)`.
///
/// Peak 1 is R2, peak 2 is R1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakFitParameters {
    pub profile: ProfileKind,
    pub values: [f64; 10],
    /// One standard error per value, when the solver could provide them.
    pub uncertainties: Option<[f64; 10]>,
}

impl PeakFitParameters {
    fn seed(
        profile: ProfileKind,
        r1_pos: f64,
        r1_height: f64,
        slope: f64,
        intercept: f64,
    ) -> Self {
        // (eta, width) for pseudo-Voigt, (width, exponent) for Moffat
        let (s, t) = (SHAPE_SEED[0], SHAPE_SEED[1]);
        let r2_pos = r1_pos - DOUBLET_SPACING;
        let r2_height = r1_height / 2.0;
        Self {
            profile,
            values: [
                r2_height, r2_pos, s, t, r1_height, r1_pos, s, t, slope, intercept,
            ],
            uncertainties: None,
        }
    }

    pub fn r1_center(&self) -> f64 {
        self.values[5]
    }

    pub fn r2_center(&self) -> f64 {
        self.values[1]
    }

    pub fn slope(&self) -> f64 {
        self.values[8]
    }

    pub fn intercept(&self) -> f64 {
        self.values[9]
    }

    /// Standard error of the R1 center, if known.
    pub fn r1_center_uncertainty(&self) -> Option<f64> {
        self.uncertainties.map(|u| u[5])
    }

    /// R1 as a single peak with the shared background.
    pub fn r1(&self) -> [f64; 6] {
        let v = &self.values;
        [v[4], v[5], v[6], v[7], v[8], v[9]]
    }

    /// R2 as a single peak with the shared background.
    pub fn r2(&self) -> [f64; 6] {
        let v = &self.values;
        [v[0], v[1], v[2], v[3], v[8], v[9]]
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.profile.evaluate(x, &self.values)
    }
}

/// Result classification of one fit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    Fitted(PeakFitParameters),
    /// R1 height below the threshold; nothing was fitted.
    TooWeak,
    /// ROI maximum at the detector ceiling; nothing was fitted.
    Saturated,
    /// The solver did not converge or returned non-finite values.
    PoorFit,
}

impl FitOutcome {
    /// Warning text for the presentation layer, empty on success.
    pub fn warning(&self) -> &'static str {
        match self {
            FitOutcome::Fitted(_) => "",
            FitOutcome::TooWeak => "Too weak",
            FitOutcome::Saturated => "Saturated",
            FitOutcome::PoorFit => "Poor fit",
        }
    }

    pub fn parameters(&self) -> Option<&PeakFitParameters> {
        match self {
            FitOutcome::Fitted(params) => Some(params),
            _ => None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self, FitOutcome::Fitted(_))
    }
}

/// Model curves sampled on the ROI wavelengths, for display.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedCurves {
    pub wavelengths: Vec<f64>,
    pub total: Vec<f64>,
    pub r1: Vec<f64>,
    pub r2: Vec<f64>,
    pub background: Vec<f64>,
}

impl FittedCurves {
    pub fn sample(params: &PeakFitParameters, wavelengths: &[f64]) -> Self {
        let r1 = params.r1();
        let r2 = params.r2();
        Self {
            wavelengths: wavelengths.to_vec(),
            total: wavelengths.iter().map(|&x| params.evaluate(x)).collect(),
            r1: wavelengths
                .iter()
                .map(|&x| params.profile.evaluate_single(x, &r1))
                .collect(),
            r2: wavelengths
                .iter()
                .map(|&x| params.profile.evaluate_single(x, &r2))
                .collect(),
            background: wavelengths
                .iter()
                .map(|&x| params.slope() * x + params.intercept())
                .collect(),
        }
    }
}

/// Everything one fit attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub outcome: FitOutcome,
    pub roi: Roi,
    /// Seed vector built from the data before fitting.
    pub initial_guess: PeakFitParameters,
    /// Present only for [`FitOutcome::Fitted`].
    pub curves: Option<FittedCurves>,
}

/// Stateless apart from its settings; safe to move into a worker thread.
#[derive(Debug, Clone)]
pub struct PeakFitter {
    settings: FitSettings,
    max_intensity: f64,
}

impl PeakFitter {
    /// `max_intensity` is the detector's saturation ceiling in counts.
    pub fn new(settings: FitSettings, max_intensity: f64) -> Self {
        Self {
            settings,
            max_intensity,
        }
    }

    pub fn fit(&self, spectrum: &Spectrum) -> FitReport {
        let xs = spectrum.wavelengths();
        let ys = spectrum.intensities();
        let n = spectrum.len();

        let peak_index = spectrum.peak_index();
        let roi = Roi::around(
            peak_index,
            self.settings.margins,
            n,
            self.settings.high_clamp,
        );
        let view = spectrum.slice(roi);

        // approximate linear background from the full spectrum
        let slope = (ys[n - 1] - ys[0]) / (xs[n - 1] - xs[0]);
        let intercept = ys[0] - slope * xs[0];

        let roi_max_index = argmax(view.intensities);
        let r1_pos = view.wavelengths[roi_max_index];
        let raw_max = view.intensities[roi_max_index];
        let r1_height = raw_max - (slope * r1_pos + intercept);

        let initial_guess =
            PeakFitParameters::seed(self.settings.profile, r1_pos, r1_height, slope, intercept);

        let outcome = if r1_height.is_nan() || r1_height < self.settings.threshold {
            FitOutcome::TooWeak
        } else if raw_max >= self.max_intensity - 1.0 {
            FitOutcome::Saturated
        } else if !view.intensities.iter().all(|y| y.is_finite()) {
            log::warn!("ROI holds non-finite intensities, skipping fit");
            FitOutcome::PoorFit
        } else {
            match solve_doublet(view.wavelengths, view.intensities, &initial_guess) {
                Some(params) => FitOutcome::Fitted(params),
                None => FitOutcome::PoorFit,
            }
        };

        match &outcome {
            FitOutcome::Fitted(params) => log::debug!(
                "Fitted R1 at {:.3} nm (R2 at {:.3} nm) over pixels {}..{}",
                params.r1_center(),
                params.r2_center(),
                roi.lo,
                roi.hi
            ),
            other => log::debug!("Fit rejected: {}", other.warning()),
        }

        let curves = outcome
            .parameters()
            .map(|params| FittedCurves::sample(params, view.wavelengths));

        FitReport {
            outcome,
            roi,
            initial_guess,
            curves,
        }
    }
}

/// Runs the separable fit for a doublet, seeded from `seed`.
///
/// Returns `None` when the model cannot be built, the solver does not
/// converge, or any fitted value is non-finite.
fn solve_doublet(xs: &[f64], ys: &[f64], seed: &PeakFitParameters) -> Option<PeakFitParameters> {
    let s = &seed.values;
    let x_data = DVector::from_column_slice(xs);
    let y_data = DVector::from_column_slice(ys);

    // nonlinear parameters: center and the two shape values of each peak
    let initial = vec![s[1], s[2], s[3], s[5], s[6], s[7]];

    let builder = SeparableModelBuilder::<f64>::new(["c1", "s1", "t1", "c2", "s2", "t2"])
        .initial_parameters(initial)
        .independent_variable(x_data)
        .invariant_function(|x: &DVector<f64>| x.clone())
        .invariant_function(|x: &DVector<f64>| DVector::from_element(x.nrows(), 1.0));

    let model = match seed.profile {
        ProfileKind::PseudoVoigt => builder
            .function(&["c1", "s1", "t1"], pseudo_voigt_basis)
            .partial_deriv("c1", pseudo_voigt_pd_center)
            .partial_deriv("s1", pseudo_voigt_pd_eta)
            .partial_deriv("t1", pseudo_voigt_pd_width)
            .function(&["c2", "s2", "t2"], pseudo_voigt_basis)
            .partial_deriv("c2", pseudo_voigt_pd_center)
            .partial_deriv("s2", pseudo_voigt_pd_eta)
            .partial_deriv("t2", pseudo_voigt_pd_width)
            .build(),
        ProfileKind::Moffat => builder
            .function(&["c1", "s1", "t1"], moffat_basis)
            .partial_deriv("c1", moffat_pd_center)
            .partial_deriv("s1", moffat_pd_width)
            .partial_deriv("t1", moffat_pd_exponent)
            .function(&["c2", "s2", "t2"], moffat_basis)
            .partial_deriv("c2", moffat_pd_center)
            .partial_deriv("s2", moffat_pd_width)
            .partial_deriv("t2", moffat_pd_exponent)
            .build(),
    };
    let model = match model {
        Ok(model) => model,
        Err(e) => {
            log::error!("Failed to build model: {:?}", e);
            return None;
        }
    };

    let problem = match LevMarProblemBuilder::new(model).observations(y_data).build() {
        Ok(problem) => problem,
        Err(e) => {
            log::error!("Failed to build problem: {:?}", e);
            return None;
        }
    };

    let solved = LevMarSolver::default().fit_with_statistics(problem);
    let (fit_result, fit_statistics) = match solved {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Levenberg-Marquardt did not converge");
            return None;
        }
    };

    let nonlinear = fit_result.nonlinear_parameters();
    let linear = fit_result.linear_coefficients()?;
    // linear coefficients follow the basis order: x, 1, peak 1, peak 2
    let values = [
        linear[2],
        nonlinear[0],
        nonlinear[1],
        nonlinear[2],
        linear[3],
        nonlinear[3],
        nonlinear[4],
        nonlinear[5],
        linear[0],
        linear[1],
    ];
    if !values.iter().all(|v| v.is_finite()) {
        log::warn!("Fit returned non-finite parameters");
        return None;
    }

    let nonlinear_var = fit_statistics.nonlinear_parameters_variance();
    let linear_var = fit_statistics.linear_coefficients_variance();
    let variances = [
        linear_var[2],
        nonlinear_var[0],
        nonlinear_var[1],
        nonlinear_var[2],
        linear_var[3],
        nonlinear_var[3],
        nonlinear_var[4],
        nonlinear_var[5],
        linear_var[0],
        linear_var[1],
    ];
    let uncertainties = variances
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
        .then(|| variances.map(f64::sqrt));

    Some(PeakFitParameters {
        profile: seed.profile,
        values,
        uncertainties,
    })
}

/// Fits one pseudo-Voigt peak on a linear background.
///
/// `seed` is `(amplitude, center, eta, width, slope, intercept)`; only
/// center, eta and width are used as starting values.
pub(crate) fn solve_single(xs: &[f64], ys: &[f64], seed: &[f64; 6]) -> Option<[f64; 6]> {
    if xs.len() < 7 || !ys.iter().all(|y| y.is_finite()) {
        return None;
    }
    let x_data = DVector::from_column_slice(xs);
    let y_data = DVector::from_column_slice(ys);

    let model = SeparableModelBuilder::<f64>::new(["center", "eta", "width"])
        .initial_parameters(vec![seed[1], seed[2], seed[3]])
        .independent_variable(x_data)
        .invariant_function(|x: &DVector<f64>| x.clone())
        .invariant_function(|x: &DVector<f64>| DVector::from_element(x.nrows(), 1.0))
        .function(&["center", "eta", "width"], pseudo_voigt_basis)
        .partial_deriv("center", pseudo_voigt_pd_center)
        .partial_deriv("eta", pseudo_voigt_pd_eta)
        .partial_deriv("width", pseudo_voigt_pd_width)
        .build();
    let model = match model {
        Ok(model) => model,
        Err(e) => {
            log::error!("Failed to build model: {:?}", e);
            return None;
        }
    };

    let problem = match LevMarProblemBuilder::new(model).observations(y_data).build() {
        Ok(problem) => problem,
        Err(e) => {
            log::error!("Failed to build problem: {:?}", e);
            return None;
        }
    };

    let fit_result = match LevMarSolver::default().fit(problem) {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Single-peak fit did not converge");
            return None;
        }
    };

    let nonlinear = fit_result.nonlinear_parameters();
    let linear = fit_result.linear_coefficients()?;
    let values = [
        linear[2],
        nonlinear[0],
        nonlinear[1],
        nonlinear[2],
        linear[0],
        linear[1],
    ];
    values.iter().all(|v| v.is_finite()).then_some(values)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    pub(crate) const PIXELS: usize = 2048;
    pub(crate) const MAX_INTENSITY: f64 = 65535.0;

    pub(crate) fn axis() -> Vec<f64> {
        (0..PIXELS)
            .map(|i| 650.0 + 100.0 * i as f64 / (PIXELS - 1) as f64)
            .collect()
    }

    /// Synthetic doublet with Gaussian noise of the given standard deviation.
    pub(crate) fn synthetic(profile: ProfileKind, params: &[f64; 10], sigma: f64) -> Spectrum {
        let xs = axis();
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, sigma).unwrap();
        let ys = xs
            .iter()
            .map(|&x| profile.evaluate(x, params) + noise.sample(&mut rng))
            .collect();
        Spectrum::new(xs, ys).unwrap()
    }

    fn flat(level: f64, peak_at: usize, peak: f64) -> Spectrum {
        let mut ys = vec![level; PIXELS];
        ys[peak_at] = peak;
        Spectrum::new(axis(), ys).unwrap()
    }

    fn fitter() -> PeakFitter {
        PeakFitter::new(FitSettings::default(), MAX_INTENSITY)
    }

    #[test]
    fn too_weak_skips_fit() {
        let report = fitter().fit(&flat(100.0, 900, 500.0));
        assert_eq!(report.outcome, FitOutcome::TooWeak);
        assert!(report.curves.is_none());
        assert_eq!(report.outcome.warning(), "Too weak");
    }

    #[test]
    fn saturated_skips_fit() {
        let report = fitter().fit(&flat(100.0, 900, MAX_INTENSITY));
        assert_eq!(report.outcome, FitOutcome::Saturated);
        assert!(report.curves.is_none());
    }

    #[test]
    fn non_finite_roi_is_poor_fit() {
        let mut ys: Vec<f64> = vec![100.0; PIXELS];
        ys[900] = 5000.0;
        ys[910] = f64::NAN;
        let spectrum = Spectrum::new(axis(), ys).unwrap();
        assert_eq!(fitter().fit(&spectrum).outcome, FitOutcome::PoorFit);
    }

    #[test]
    fn seeds_follow_roi_maximum() {
        let spectrum = flat(100.0, 900, 5000.0);
        let settings = FitSettings {
            threshold: 1e9,
            ..FitSettings::default()
        };
        let report = PeakFitter::new(settings, MAX_INTENSITY).fit(&spectrum);
        assert_eq!(report.outcome, FitOutcome::TooWeak);
        let seed = &report.initial_guess;
        let x = spectrum.wavelengths()[900];
        assert_eq!(report.roi, Roi { lo: 750, hi: 1050 });
        assert_eq!(seed.r1_center(), x);
        assert!((seed.r2_center() - (x - DOUBLET_SPACING)).abs() < 1e-12);
        assert_eq!(seed.values[4], 4900.0);
        assert_eq!(seed.values[0], 2450.0);
        assert_eq!(seed.slope(), 0.0);
        assert_eq!(seed.intercept(), 100.0);
    }

    #[test]
    fn recovers_pseudo_voigt_doublet() {
        let truth = [
            1500.0, 692.86, 0.5, 0.8, 3000.0, 694.26, 0.5, 0.8, 0.0, 500.0,
        ];
        let spectrum = synthetic(ProfileKind::PseudoVoigt, &truth, 30.0);
        let report = fitter().fit(&spectrum);
        let params = report.outcome.parameters().expect("fit should converge");
        assert!((params.r1_center() - 694.26).abs() < 0.01);
        assert!((params.r2_center() - 692.86).abs() < 0.05);
        let curves = report.curves.unwrap();
        assert_eq!(curves.total.len(), report.roi.len());
    }

    #[test]
    fn recovers_moffat_doublet() {
        let truth = [
            1200.0, 692.86, 0.45, 1.5, 2500.0, 694.26, 0.45, 1.5, 0.0, 300.0,
        ];
        let spectrum = synthetic(ProfileKind::Moffat, &truth, 20.0);
        let settings = FitSettings {
            profile: ProfileKind::Moffat,
            ..FitSettings::default()
        };
        let report = PeakFitter::new(settings, MAX_INTENSITY).fit(&spectrum);
        let params = report.outcome.parameters().expect("fit should converge");
        assert_eq!(params.profile, ProfileKind::Moffat);
        assert!((params.r1_center() - 694.26).abs() < 0.01);
    }

    #[test]
    fn curves_add_up() {
        let params = PeakFitParameters {
            profile: ProfileKind::PseudoVoigt,
            values: [1.0, 1.0, 0.5, 1.0, 2.0, 2.4, 0.5, 1.0, 0.1, 3.0],
            uncertainties: None,
        };
        let xs = [0.5, 1.0, 2.0, 3.0];
        let curves = FittedCurves::sample(&params, &xs);
        for i in 0..xs.len() {
            let sum = curves.r1[i] + curves.r2[i] - curves.background[i];
            assert!((curves.total[i] - sum).abs() < 1e-12);
        }
    }
}
