//! # Peak Model Module
//!
//! Line shapes used to describe the ruby R1/R2 doublet.
//!
//! Two profiles are available behind [`ProfileKind`]:
//! - **Pseudo-Voigt**: area-normalised Lorentzian/Gaussian mixture sharing
//!   amplitude, center and FWHM, mixed by `eta`.
//! - **Moffat**: `amplitude * (((x - c) / w)^2 + 1)^-b`.
//!
//! Each single-peak function takes `(amplitude, center, shape_1, shape_2)`
//! plus a linear background; the double-peak variants take the usual
//! 10-element vector `(a1, c1, s1, t1, a2, c2, s2, t2, slope, intercept)` where
//! the background is counted once.
//!
//! The vectorised `*_basis` functions and their partial derivatives feed the
//! separable least-squares solver in [`crate::fitter`]. They evaluate the
//! unit-amplitude shape without background, since amplitude and background
//! enter the model linearly.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::Display;

const FOUR_LN2: f64 = 4.0 * std::f64::consts::LN_2;

/// `sqrt(4 ln2) / sqrt(pi)`, the Gaussian normalisation for a FWHM parameter.
fn gauss_norm() -> f64 {
    FOUR_LN2.sqrt() / PI.sqrt()
}

fn lorentzian_part(d: f64, width: f64) -> f64 {
    (2.0 / PI) * (width / (4.0 * d * d + width * width))
}

fn gaussian_part(d: f64, width: f64) -> f64 {
    (gauss_norm() / width) * (-(FOUR_LN2 / (width * width)) * d * d).exp()
}

/// Unit-area pseudo-Voigt shape without background.
fn pseudo_voigt_shape(x: f64, center: f64, eta: f64, width: f64) -> f64 {
    let d = x - center;
    eta * lorentzian_part(d, width) + (1.0 - eta) * gaussian_part(d, width)
}

fn moffat_shape(x: f64, center: f64, width: f64, exponent: f64) -> f64 {
    let u = (x - center) / width;
    (u * u + 1.0).powf(-exponent)
}

/// Single pseudo-Voigt peak on a linear background.
pub fn pseudo_voigt(
    x: f64,
    amplitude: f64,
    center: f64,
    eta: f64,
    width: f64,
    slope: f64,
    intercept: f64,
) -> f64 {
    amplitude * pseudo_voigt_shape(x, center, eta, width) + slope * x + intercept
}

/// Two pseudo-Voigt peaks sharing one linear background.
pub fn double_pseudo_voigt(x: f64, p: &[f64; 10]) -> f64 {
    p[0] * pseudo_voigt_shape(x, p[1], p[2], p[3])
        + p[4] * pseudo_voigt_shape(x, p[5], p[6], p[7])
        + p[8] * x
        + p[9]
}

/// Single Moffat peak on a linear background.
pub fn moffat(
    x: f64,
    amplitude: f64,
    center: f64,
    width: f64,
    exponent: f64,
    slope: f64,
    intercept: f64,
) -> f64 {
    amplitude * moffat_shape(x, center, width, exponent) + slope * x + intercept
}

/// Two Moffat peaks sharing one linear background.
pub fn double_moffat(x: f64, p: &[f64; 10]) -> f64 {
    p[0] * moffat_shape(x, p[1], p[2], p[3])
        + p[4] * moffat_shape(x, p[5], p[6], p[7])
        + p[8] * x
        + p[9]
}

/// Selects the line shape used by the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProfileKind {
    #[default]
    PseudoVoigt,
    Moffat,
}

impl ProfileKind {
    /// Evaluates the double-peak model at `x`.
    pub fn evaluate(&self, x: f64, params: &[f64; 10]) -> f64 {
        match self {
            ProfileKind::PseudoVoigt => double_pseudo_voigt(x, params),
            ProfileKind::Moffat => double_moffat(x, params),
        }
    }

    /// Evaluates a single peak `(amplitude, center, s, t, slope, intercept)` at `x`.
    pub fn evaluate_single(&self, x: f64, params: &[f64; 6]) -> f64 {
        let [a, c, s, t, m, b] = *params;
        match self {
            ProfileKind::PseudoVoigt => pseudo_voigt(x, a, c, s, t, m, b),
            ProfileKind::Moffat => moffat(x, a, c, s, t, m, b),
        }
    }
}

impl Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::PseudoVoigt => write!(f, "Pseudo-Voigt"),
            ProfileKind::Moffat => write!(f, "Moffat"),
        }
    }
}

// --- Basis functions for the separable solver ---

pub fn pseudo_voigt_basis(x: &DVector<f64>, center: f64, eta: f64, width: f64) -> DVector<f64> {
    x.map(|x_val| pseudo_voigt_shape(x_val, center, eta, width))
}

pub fn pseudo_voigt_pd_center(x: &DVector<f64>, center: f64, eta: f64, width: f64) -> DVector<f64> {
    let k = gauss_norm();
    x.map(|x_val| {
        let d = x_val - center;
        let q = 4.0 * d * d + width * width;
        let dl = (2.0 / PI) * width * 8.0 * d / (q * q);
        let e = (-(FOUR_LN2 / (width * width)) * d * d).exp();
        let dg = (k / width) * e * 2.0 * FOUR_LN2 * d / (width * width);
        eta * dl + (1.0 - eta) * dg
    })
}

pub fn pseudo_voigt_pd_eta(x: &DVector<f64>, center: f64, _eta: f64, width: f64) -> DVector<f64> {
    x.map(|x_val| {
        let d = x_val - center;
        lorentzian_part(d, width) - gaussian_part(d, width)
    })
}

pub fn pseudo_voigt_pd_width(x: &DVector<f64>, center: f64, eta: f64, width: f64) -> DVector<f64> {
    let k = gauss_norm();
    x.map(|x_val| {
        let d = x_val - center;
        let q = 4.0 * d * d + width * width;
        let dl = (2.0 / PI) * (4.0 * d * d - width * width) / (q * q);
        let e = (-(FOUR_LN2 / (width * width)) * d * d).exp();
        let dg = (k * e / (width * width)) * (2.0 * FOUR_LN2 * d * d / (width * width) - 1.0);
        eta * dl + (1.0 - eta) * dg
    })
}

pub fn moffat_basis(x: &DVector<f64>, center: f64, width: f64, exponent: f64) -> DVector<f64> {
    x.map(|x_val| moffat_shape(x_val, center, width, exponent))
}

pub fn moffat_pd_center(x: &DVector<f64>, center: f64, width: f64, exponent: f64) -> DVector<f64> {
    x.map(|x_val| {
        let d = x_val - center;
        let q = (d / width).powi(2) + 1.0;
        2.0 * exponent * d / (width * width) * q.powf(-exponent - 1.0)
    })
}

pub fn moffat_pd_width(x: &DVector<f64>, center: f64, width: f64, exponent: f64) -> DVector<f64> {
    x.map(|x_val| {
        let d = x_val - center;
        let q = (d / width).powi(2) + 1.0;
        2.0 * exponent * d * d / width.powi(3) * q.powf(-exponent - 1.0)
    })
}

pub fn moffat_pd_exponent(
    x: &DVector<f64>,
    center: f64,
    width: f64,
    exponent: f64,
) -> DVector<f64> {
    x.map(|x_val| {
        let q = ((x_val - center) / width).powi(2) + 1.0;
        -q.ln() * q.powf(-exponent)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    const PV: [f64; 10] = [
        1500.0, 692.86, 0.4, 0.9, 3000.0, 694.26, 0.6, 0.8, 2.5, -1200.0,
    ];

    fn peak_value_at_center(a: f64, eta: f64, w: f64) -> f64 {
        let lorentz = (2.0 / PI) / w;
        let gauss = (4.0 * 2f64.ln()).sqrt() / (PI.sqrt() * w);
        a * (eta * lorentz + (1.0 - eta) * gauss)
    }

    #[test]
    fn double_pseudo_voigt_at_component_centers() {
        for (own, other) in [(0usize, 4usize), (4, 0)] {
            let c = PV[own + 1];
            let own_peak = peak_value_at_center(PV[own], PV[own + 2], PV[own + 3]);
            let other_peak =
                PV[other] * pseudo_voigt_shape(c, PV[other + 1], PV[other + 2], PV[other + 3]);
            let background = PV[8] * c + PV[9];
            assert_relative_eq!(
                double_pseudo_voigt(c, &PV),
                own_peak + other_peak + background,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn single_peak_matches_closed_form() {
        let value = pseudo_voigt(10.0, 2.0, 10.0, 1.0, 0.5, 0.0, 1.0);
        assert_relative_eq!(value, 2.0 * (2.0 / PI) / 0.5 + 1.0, max_relative = 1e-12);
        let value = moffat(3.0, 5.0, 3.0, 0.7, 1.5, 1.0, 0.0);
        assert_relative_eq!(value, 5.0 + 3.0, max_relative = 1e-12);
    }

    #[test]
    fn pseudo_voigt_has_unit_area() {
        let step = 0.001;
        let area: f64 = (0..200_000)
            .map(|i| pseudo_voigt_shape(-100.0 + i as f64 * step, 0.0, 0.0, 1.3) * step)
            .sum();
        assert_relative_eq!(area, 1.0, max_relative = 1e-6);
    }

    #[test]
    fn profile_kind_dispatch() {
        let moffat_params = [10.0, 5.0, 1.0, 2.0, 4.0, 7.0, 0.5, 1.0, 0.0, 3.0];
        assert_relative_eq!(
            ProfileKind::Moffat.evaluate(5.0, &moffat_params),
            double_moffat(5.0, &moffat_params)
        );
        assert_relative_eq!(
            ProfileKind::PseudoVoigt.evaluate(694.0, &PV),
            double_pseudo_voigt(694.0, &PV)
        );
        let single = [3.0, 1.0, 0.5, 1.0, 0.1, 2.0];
        assert_relative_eq!(
            ProfileKind::PseudoVoigt.evaluate_single(1.2, &single),
            pseudo_voigt(1.2, 3.0, 1.0, 0.5, 1.0, 0.1, 2.0)
        );
        assert_eq!(ProfileKind::Moffat.to_string(), "Moffat");
    }

    fn numeric(f: impl Fn(f64) -> f64, at: f64) -> f64 {
        let h = 1e-6;
        (f(at + h) - f(at - h)) / (2.0 * h)
    }

    #[test]
    fn pseudo_voigt_derivatives_match_finite_differences() {
        let x = DVector::from_vec(vec![693.1, 693.9, 694.2, 694.9]);
        let (c, eta, w) = (694.26, 0.35, 0.85);
        let dc = pseudo_voigt_pd_center(&x, c, eta, w);
        let de = pseudo_voigt_pd_eta(&x, c, eta, w);
        let dw = pseudo_voigt_pd_width(&x, c, eta, w);
        for i in 0..x.len() {
            let xv = x[i];
            let nc = numeric(|v| pseudo_voigt_shape(xv, v, eta, w), c);
            let ne = numeric(|v| pseudo_voigt_shape(xv, c, v, w), eta);
            let nw = numeric(|v| pseudo_voigt_shape(xv, c, eta, v), w);
            assert_relative_eq!(dc[i], nc, epsilon = 1e-6, max_relative = 1e-5);
            assert_relative_eq!(de[i], ne, epsilon = 1e-6, max_relative = 1e-5);
            assert_relative_eq!(dw[i], nw, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn moffat_derivatives_match_finite_differences() {
        let x = DVector::from_vec(vec![-1.0, 0.3, 0.9, 2.5]);
        let (c, w, b) = (0.5, 0.8, 1.7);
        let dc = moffat_pd_center(&x, c, w, b);
        let dw = moffat_pd_width(&x, c, w, b);
        let db = moffat_pd_exponent(&x, c, w, b);
        for i in 0..x.len() {
            let xv = x[i];
            let nc = numeric(|v| moffat_shape(xv, v, w, b), c);
            let nw = numeric(|v| moffat_shape(xv, c, v, b), w);
            let nb = numeric(|v| moffat_shape(xv, c, w, v), b);
            assert_relative_eq!(dc[i], nc, epsilon = 1e-6, max_relative = 1e-5);
            assert_relative_eq!(dw[i], nw, epsilon = 1e-6, max_relative = 1e-5);
            assert_relative_eq!(db[i], nb, epsilon = 1e-6, max_relative = 1e-5);
        }
    }
}
