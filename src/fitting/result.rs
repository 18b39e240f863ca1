//! # Fit results
//!
//! One record shared by every solver family. Which fields are filled depends on the
//! family:
//!
//! * least-squares fits fill `pars`, their covariance and the layout-derived `g`, `T`
//!   and per-band fluxes,
//! * adaptive moments fill `e` (and `g` with the same values), `T` and `s2n`,
//! * samplers fill the weighted mean and covariance, plus `efficiency`,
//! * metacal runs add the weighted PSF shape and size of the variant.
//!
//! `flags == 0` means success; the bits are described by
//! [`flagstr`](crate::fitting::flagstr).

use nalgebra::{DMatrix, DVector};

use crate::constants::Pars;

/// Outcome of one solver invocation.
///
/// `flags == 0` means success. On failure the parameter fields are left empty and only
/// `flags`, `flagstr` and the bookkeeping counters are meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub flags: u32,
    pub flagstr: String,
    /// Name of the fitted model, e.g. `"gauss"`, `"em3"`, `"am"`.
    pub model: String,
    pub pars: Pars,
    pub pars_cov: DMatrix<f64>,
    pub pars_err: Pars,
    /// Reduced shear `(g1, g2)` and its covariance.
    pub g: Option<[f64; 2]>,
    pub g_cov: Option<DMatrix<f64>>,
    /// Distortion `(e1, e2)` and its covariance (adaptive moments).
    pub e: Option<[f64; 2]>,
    pub e_cov: Option<DMatrix<f64>>,
    pub t: Option<f64>,
    pub t_err: Option<f64>,
    /// One entry per band.
    pub flux: Vec<f64>,
    pub flux_err: Vec<f64>,
    pub flux_s2n: Vec<f64>,
    /// Weighted signal-to-noise of the fitted model or of the adaptive moments.
    pub s2n: Option<f64>,
    pub chi2per: Option<f64>,
    pub nfev: usize,
    pub numiter: usize,
    /// Attempt on which the retry loop stopped (1-based).
    pub ntry: usize,
    /// Importance sampling efficiency.
    pub efficiency: Option<f64>,
    /// Weighted PSF shape and size (metacal variants).
    pub gpsf: Option<[f64; 2]>,
    pub tpsf: Option<f64>,
}

impl Default for FitResult {
    fn default() -> Self {
        FitResult {
            flags: 0,
            flagstr: String::new(),
            model: String::new(),
            pars: DVector::zeros(0),
            pars_cov: DMatrix::zeros(0, 0),
            pars_err: DVector::zeros(0),
            g: None,
            g_cov: None,
            e: None,
            e_cov: None,
            t: None,
            t_err: None,
            flux: Vec::new(),
            flux_err: Vec::new(),
            flux_s2n: Vec::new(),
            s2n: None,
            chi2per: None,
            nfev: 0,
            numiter: 0,
            ntry: 0,
            efficiency: None,
            gpsf: None,
            tpsf: None,
        }
    }
}

impl FitResult {
    /// A failed result carrying only `flags`.
    pub fn failed(model: impl Into<String>, flags: u32, flagstr: impl Into<String>) -> Self {
        FitResult {
            flags,
            flagstr: flagstr.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// `true` when no flag is set.
    pub fn is_ok(&self) -> bool {
        self.flags == 0
    }

    /// Total flux over bands, or `None` when no flux was measured.
    pub fn total_flux(&self) -> Option<f64> {
        (!self.flux.is_empty()).then(|| self.flux.iter().sum())
    }

    /// Flux signal-to-noise of a single-band result.
    pub fn flux_ratio(&self) -> Option<f64> {
        let flux = *self.flux.first()?;
        let err = *self.flux_err.first()?;
        (err > 0.0).then_some(flux / err)
    }

    /// Fill `pars`, `pars_cov`, `pars_err` and the quantities derived from the
    /// `[cen1, cen2, g1, g2, T, ..., flux_0, ..., flux_{nband-1}]` layout.
    pub(crate) fn set_layout_derived(&mut self, pars: Pars, cov: DMatrix<f64>, nshape: usize) {
        let npars = pars.len();
        let pars_err = DVector::from_fn(npars, |i, _| cov[(i, i)].max(0.0).sqrt());

        self.g = Some([pars[2], pars[3]]);
        self.g_cov = Some(cov.view((2, 2), (2, 2)).into_owned());
        self.t = Some(pars[4]);
        self.t_err = Some(pars_err[4]);

        self.flux = pars.iter().skip(nshape).copied().collect();
        self.flux_err = pars_err.iter().skip(nshape).copied().collect();
        self.flux_s2n = self
            .flux
            .iter()
            .zip(&self.flux_err)
            .map(|(f, e)| if *e > 0.0 { f / e } else { 0.0 })
            .collect();

        self.pars = pars;
        self.pars_cov = cov;
        self.pars_err = pars_err;
    }
}
