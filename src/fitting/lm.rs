//! # Levenberg–Marquardt least squares
//!
//! [`run_lm`] minimizes the sum of squares of a residual vector with a forward-difference
//! jacobian and multiplicative damping of the normal matrix diagonal. A residual function
//! that returns [`BootError::GMixRange`] marks the trial point as invalid: the step is
//! rejected and the damping increased, exactly as for a step that raised χ².
//!
//! On exit the covariance is `(JᵀJ)⁻¹` at the solution, with residuals already scaled by
//! `sqrt(weight)`.
//!
//! Solvers built on top:
//!
//! * [`LmPsfSolver`] – fixed-profile PSF model on one observation,
//! * [`CoellipSolver`] – coelliptical gaussians on one observation, with a prior,
//! * [`LmGalaxySolver`] – PSF-convolved galaxy model over every band and epoch, with an
//!   optional prior and fixed parameters.

use std::sync::Arc;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::boot_errors::BootError;
use crate::constants::{
    LM_MAXFEV, LM_NEG_COV_DIAG, LM_SINGULAR_MATRIX, ObsList, Pars,
};
use crate::fitting::pars::LmPars;
use crate::fitting::traits::{FixedPars, GalaxySolver, Solver};
use crate::fitting::{flagstr, push_residuals, FitResult};
use crate::gmix::model::{coellip_gmix, coellip_npars, galaxy_gmix, simple_gmix};
use crate::gmix::GMix;
use crate::models::{GalaxyModel, GaussCount, SimpleModel};
use crate::observation::Observation;
use crate::priors::Prior;

const LAMBDA_START: f64 = 1.0e-3;
const LAMBDA_MIN: f64 = 1.0e-12;
const LAMBDA_MAX: f64 = 1.0e16;

#[derive(Debug, Clone)]
pub(crate) struct LmOutcome {
    pub pars: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub flags: u32,
    pub nfev: usize,
    pub niter: usize,
    pub chi2: f64,
    pub nres: usize,
}

fn is_range(err: &BootError) -> bool {
    matches!(err, BootError::GMixRange(_))
}

fn forward_jacobian<F>(
    fdiff: &mut F,
    x: &DVector<f64>,
    r: &DVector<f64>,
    nfev: &mut usize,
) -> Result<DMatrix<f64>, BootError>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, BootError>,
{
    let mut jac = DMatrix::zeros(r.len(), x.len());
    for j in 0..x.len() {
        let h = 1.0e-5 * x[j].abs().max(1.0e-2);
        let mut xp = x.clone();
        xp[j] += h;
        *nfev += 1;
        let (rp, step) = match fdiff(&xp) {
            Ok(rp) => (rp, h),
            Err(err) if is_range(&err) => {
                xp[j] = x[j] - h;
                *nfev += 1;
                (fdiff(&xp)?, -h)
            }
            Err(err) => return Err(err),
        };
        if rp.len() != r.len() {
            return Err(BootError::InvalidParameter(format!(
                "residual length changed from {} to {}",
                r.len(),
                rp.len()
            )));
        }
        jac.set_column(j, &((rp - r) / step));
    }
    Ok(jac)
}

/// Largest parameter change relative to the parameter magnitude.
fn relative_step(step: &DVector<f64>, x: &DVector<f64>) -> f64 {
    step.iter()
        .zip(x.iter())
        .map(|(dx, xi)| dx.abs() / (xi.abs() + 1.0e-3))
        .fold(0.0, f64::max)
}

/// Minimize `|fdiff(x)|²` starting from `guess`.
///
/// A range error on the starting point is returned to the caller.
pub(crate) fn run_lm<F>(
    mut fdiff: F,
    guess: DVector<f64>,
    lm: &LmPars,
) -> Result<LmOutcome, BootError>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, BootError>,
{
    let npar = guess.len();
    let mut x = guess;
    let mut r = fdiff(&x)?;
    let mut nfev = 1;
    let mut chi2 = r.norm_squared();
    let mut lambda = LAMBDA_START;
    let mut flags = 0;
    let mut niter = 0;
    let mut small_drop = false;

    let mut jac = forward_jacobian(&mut fdiff, &x, &r, &mut nfev)?;

    'outer: loop {
        if nfev >= lm.maxfev {
            flags |= LM_MAXFEV;
            break;
        }
        niter += 1;
        let jt = jac.transpose();
        let normal = &jt * &jac;
        let neg_grad = -(&jt * &r);

        loop {
            let mut damped = normal.clone();
            for i in 0..npar {
                damped[(i, i)] += lambda * normal[(i, i)].max(1.0e-12);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    break 'outer;
                }
                continue;
            };
            let step = chol.solve(&neg_grad);
            let trial = &x + &step;
            nfev += 1;

            match fdiff(&trial) {
                Ok(rt) => {
                    let chi2_trial = rt.norm_squared();
                    if chi2_trial <= chi2 {
                        let drop = (chi2 - chi2_trial) / chi2.max(f64::MIN_POSITIVE);
                        let rel = relative_step(&step, &x);
                        x = trial;
                        r = rt;
                        chi2 = chi2_trial;
                        lambda = (lambda / 10.0).max(LAMBDA_MIN);

                        let converged = rel < lm.xtol || (drop < lm.ftol && small_drop);
                        small_drop = drop < lm.ftol;
                        if converged {
                            break 'outer;
                        }
                        jac = forward_jacobian(&mut fdiff, &x, &r, &mut nfev)?;
                        continue 'outer;
                    }
                }
                Err(err) if is_range(&err) => {
                    debug!("lm step rejected: {err}");
                }
                Err(err) => return Err(err),
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                // no downhill step left at machine precision
                break 'outer;
            }
            if nfev >= lm.maxfev {
                flags |= LM_MAXFEV;
                break 'outer;
            }
        }
    }

    let jac = forward_jacobian(&mut fdiff, &x, &r, &mut nfev)?;
    let normal = jac.transpose() * &jac;
    let cov = match normal.try_inverse() {
        Some(cov) => cov,
        None => {
            flags |= LM_SINGULAR_MATRIX;
            DMatrix::zeros(npar, npar)
        }
    };
    if flags & LM_SINGULAR_MATRIX == 0 && (0..npar).any(|i| !(cov[(i, i)] > 0.0)) {
        flags |= LM_NEG_COV_DIAG;
    }

    Ok(LmOutcome {
        pars: x,
        cov,
        flags,
        nfev,
        niter,
        chi2,
        nres: r.len(),
    })
}

fn chi2per(outcome: &LmOutcome, nfree: usize) -> Option<f64> {
    let dof = outcome.nres.checked_sub(nfree).filter(|d| *d > 0)?;
    Some(outcome.chi2 / dof as f64)
}

fn base_result(model: String, outcome: &LmOutcome, nfree: usize) -> FitResult {
    let mut result = FitResult::failed(model, outcome.flags, flagstr(outcome.flags));
    result.nfev = outcome.nfev;
    result.numiter = outcome.niter;
    result.chi2per = chi2per(outcome, nfree);
    result
}

fn sqrt_weight(obs: &Observation) -> DMatrix<f64> {
    obs.weight.map(f64::sqrt)
}

// -------------------------------------------------------------------------------------------------
// Fixed-profile PSF
// -------------------------------------------------------------------------------------------------

/// Least-squares fit of a `gauss` or `turb` profile to one PSF image.
#[derive(Debug, Clone)]
pub struct LmPsfSolver {
    model: SimpleModel,
    lm: LmPars,
    result: FitResult,
    gmix: Option<GMix>,
}

impl LmPsfSolver {
    /// Only the `gauss` and `turb` profiles are meaningful PSF models.
    pub fn new(model: SimpleModel, lm: LmPars) -> Self {
        LmPsfSolver {
            model,
            lm,
            result: FitResult::default(),
            gmix: None,
        }
    }
}

impl Solver for LmPsfSolver {
    type Data = Observation;
    type Guess = Pars;

    fn go(&mut self, obs: &Observation, guess: &Pars) -> Result<(), BootError> {
        self.gmix = None;
        if guess.len() != 6 {
            return Err(BootError::InvalidParameter(format!(
                "{} psf guess needs 6 parameters, got {}",
                self.model,
                guess.len()
            )));
        }
        let model = self.model;
        let sqrtw = sqrt_weight(obs);
        let fdiff = |x: &DVector<f64>| -> Result<DVector<f64>, BootError> {
            let gm = simple_gmix(model, x.as_slice())?;
            let mut out = Vec::with_capacity(obs.image.len());
            push_residuals(&gm, obs, &sqrtw, &mut out);
            Ok(DVector::from_vec(out))
        };
        let outcome = run_lm(fdiff, guess.clone(), &self.lm)?;

        let mut result = base_result(model.to_string(), &outcome, 6);
        if outcome.flags == 0 {
            let gm = simple_gmix(model, outcome.pars.as_slice())?;
            result.set_layout_derived(outcome.pars, outcome.cov, 5);
            self.gmix = Some(gm);
        }
        self.result = result;
        Ok(())
    }

    fn result(&self) -> &FitResult {
        &self.result
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.gmix
            .clone()
            .ok_or_else(|| BootError::GMixRange("psf fit produced no mixture".into()))
    }
}

// -------------------------------------------------------------------------------------------------
// Coelliptical PSF
// -------------------------------------------------------------------------------------------------

/// Least-squares fit of `ngauss` coelliptical gaussians to one PSF image.
#[derive(Debug, Clone)]
pub struct CoellipSolver {
    ngauss: GaussCount,
    lm: LmPars,
    prior: Option<Arc<dyn Prior>>,
    result: FitResult,
    gmix: Option<GMix>,
}

impl CoellipSolver {
    pub fn new(ngauss: GaussCount, lm: LmPars, prior: Option<Arc<dyn Prior>>) -> Self {
        CoellipSolver {
            ngauss,
            lm,
            prior,
            result: FitResult::default(),
            gmix: None,
        }
    }
}

impl Solver for CoellipSolver {
    type Data = Observation;
    type Guess = Pars;

    fn go(&mut self, obs: &Observation, guess: &Pars) -> Result<(), BootError> {
        self.gmix = None;
        let n = self.ngauss.get();
        let npars = coellip_npars(n);
        if guess.len() != npars {
            return Err(BootError::InvalidParameter(format!(
                "coellip{n} guess needs {npars} parameters, got {}",
                guess.len()
            )));
        }
        let sqrtw = sqrt_weight(obs);
        let prior = self.prior.as_deref();
        let fdiff = |x: &DVector<f64>| -> Result<DVector<f64>, BootError> {
            let gm = coellip_gmix(n, x.as_slice())?;
            let mut out = Vec::with_capacity(obs.image.len() + npars);
            push_residuals(&gm, obs, &sqrtw, &mut out);
            if let Some(prior) = prior {
                prior.fill_fdiff(x.as_slice(), &mut out)?;
            }
            Ok(DVector::from_vec(out))
        };
        let outcome = run_lm(fdiff, guess.clone(), &self.lm)?;

        let mut result = base_result(format!("coellip{n}"), &outcome, npars);
        if outcome.flags == 0 {
            let gm = coellip_gmix(n, outcome.pars.as_slice())?;
            let pars_err = DVector::from_fn(npars, |i, _| outcome.cov[(i, i)].max(0.0).sqrt());
            let flux_var = outcome
                .cov
                .view((4 + n, 4 + n), (n, n))
                .iter()
                .sum::<f64>();
            result.g = Some([outcome.pars[2], outcome.pars[3]]);
            result.g_cov = Some(outcome.cov.view((2, 2), (2, 2)).into_owned());
            result.t = Some(gm.t());
            result.flux = vec![gm.psum()];
            result.flux_err = vec![flux_var.max(0.0).sqrt()];
            result.pars = outcome.pars;
            result.pars_cov = outcome.cov;
            result.pars_err = pars_err;
            self.gmix = Some(gm);
        }
        self.result = result;
        Ok(())
    }

    fn result(&self) -> &FitResult {
        &self.result
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.gmix
            .clone()
            .ok_or_else(|| BootError::GMixRange("coellip fit produced no mixture".into()))
    }
}

// -------------------------------------------------------------------------------------------------
// Galaxy
// -------------------------------------------------------------------------------------------------

/// Maximum-likelihood galaxy fit over a multi-band observation list.
///
/// The model of band `b` is convolved with the PSF mixture of each of its epochs. The
/// parameter layout is `[cen1, cen2, g1, g2, T, (extra shape,) flux_0, ..., flux_{nband-1}]`;
/// see [`GalaxyModel`] for the extra shape parameters of the bulge + disk models.
#[derive(Debug, Clone)]
pub struct LmGalaxySolver {
    model: GalaxyModel,
    lm: LmPars,
    prior: Option<Arc<dyn Prior>>,
    fixed: FixedPars,
    result: FitResult,
}

impl LmGalaxySolver {
    /// # Arguments
    ///
    /// * `model` - galaxy layout; the band count comes from the data at fit time
    /// * `lm` - tolerances and evaluation budget
    /// * `prior` - its residual terms are appended to the pixel residuals
    /// * `fixed` - `Some(value)` entries are pinned and left out of the minimization; an
    ///   empty vector frees every parameter
    pub fn new(
        model: GalaxyModel,
        lm: LmPars,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
    ) -> Self {
        LmGalaxySolver {
            model,
            lm,
            prior,
            fixed,
            result: FitResult::default(),
        }
    }

    fn check_layout(&self, data: &[ObsList], npars: usize) -> Result<(), BootError> {
        let expected = self.model.npars(data.len());
        if npars != expected {
            return Err(BootError::InvalidParameter(format!(
                "{} over {} bands needs {expected} parameters, got {npars}",
                self.model,
                data.len()
            )));
        }
        if !self.fixed.is_empty() && self.fixed.len() != expected {
            return Err(BootError::InvalidParameter(format!(
                "fixed parameter mask has {} entries, expected {expected}",
                self.fixed.len()
            )));
        }
        Ok(())
    }

    fn free_indices(&self, npars: usize) -> Vec<usize> {
        if self.fixed.is_empty() {
            return (0..npars).collect();
        }
        (0..npars).filter(|&i| self.fixed[i].is_none()).collect()
    }

    fn expand(&self, free: &[usize], x: &DVector<f64>, template: &DVector<f64>) -> DVector<f64> {
        let mut full = template.clone();
        for (i, fixed) in self.fixed.iter().enumerate() {
            if let Some(val) = fixed {
                full[i] = *val;
            }
        }
        for (k, &i) in free.iter().enumerate() {
            full[i] = x[k];
        }
        full
    }

    /// Pixel residuals of every band and epoch, followed by the prior terms.
    fn residuals(
        &self,
        data: &[ObsList],
        sqrtw: &[Vec<DMatrix<f64>>],
        full: &DVector<f64>,
    ) -> Result<DVector<f64>, BootError> {
        let mut out = Vec::new();
        for (band, obs_list) in data.iter().enumerate() {
            let band_gm = galaxy_gmix(self.model, full.as_slice(), band)?;
            for (epoch, obs) in obs_list.iter().enumerate() {
                let psf = obs.psf_gmix().ok_or(BootError::MissingPsfGmix { band })?;
                let conv = band_gm.convolve(psf)?;
                push_residuals(&conv, obs, &sqrtw[band][epoch], &mut out);
            }
        }
        if let Some(prior) = &self.prior {
            prior.fill_fdiff(full.as_slice(), &mut out)?;
        }
        Ok(DVector::from_vec(out))
    }

    fn ln_prob_full(
        &self,
        data: &[ObsList],
        sqrtw: &[Vec<DMatrix<f64>>],
        full: &DVector<f64>,
    ) -> Result<f64, BootError> {
        let lnp_prior = match &self.prior {
            Some(prior) => prior.ln_prob(full.as_slice())?,
            None => 0.0,
        };
        Ok(self.ln_like_full(data, sqrtw, full)? + lnp_prior)
    }

    fn ln_like_full(
        &self,
        data: &[ObsList],
        sqrtw: &[Vec<DMatrix<f64>>],
        full: &DVector<f64>,
    ) -> Result<f64, BootError> {
        let mut out = Vec::new();
        for (band, obs_list) in data.iter().enumerate() {
            let band_gm = galaxy_gmix(self.model, full.as_slice(), band)?;
            for (epoch, obs) in obs_list.iter().enumerate() {
                let psf = obs.psf_gmix().ok_or(BootError::MissingPsfGmix { band })?;
                let conv = band_gm.convolve(psf)?;
                push_residuals(&conv, obs, &sqrtw[band][epoch], &mut out);
            }
        }
        let chi2: f64 = out.iter().map(|r| r * r).sum();
        Ok(-0.5 * chi2)
    }

    fn step_sizes(&self, free: &[usize], pars: &DVector<f64>, h: f64, m: f64) -> Vec<f64> {
        free.iter()
            .map(|&i| {
                if i < 4 {
                    h
                } else {
                    h * m * pars[i].abs().max(h)
                }
            })
            .collect()
    }
}

fn sqrt_weights(data: &[ObsList]) -> Vec<Vec<DMatrix<f64>>> {
    data.iter()
        .map(|list| list.iter().map(sqrt_weight).collect())
        .collect()
}

impl Solver for LmGalaxySolver {
    type Data = [ObsList];
    type Guess = Pars;

    fn go(&mut self, data: &[ObsList], guess: &Pars) -> Result<(), BootError> {
        self.check_layout(data, guess.len())?;
        let npars = guess.len();
        let free = self.free_indices(npars);
        let sqrtw = sqrt_weights(data);
        let template = self.expand(&free, &DVector::from_iterator(free.len(), free.iter().map(|&i| guess[i])), guess);

        let start = DVector::from_iterator(free.len(), free.iter().map(|&i| template[i]));
        let this = &*self;
        let fdiff = |x: &DVector<f64>| this.residuals(data, &sqrtw, &this.expand(&free, x, &template));
        let outcome = run_lm(fdiff, start, &self.lm)?;

        let mut result = base_result(self.model.to_string(), &outcome, free.len());
        if outcome.flags == 0 {
            let full = self.expand(&free, &outcome.pars, &template);
            let mut cov = DMatrix::zeros(npars, npars);
            for (a, &i) in free.iter().enumerate() {
                for (b, &j) in free.iter().enumerate() {
                    cov[(i, j)] = outcome.cov[(a, b)];
                }
            }
            result.set_layout_derived(full, cov, self.model.nshape());
        }
        self.result = result;
        Ok(())
    }

    fn result(&self) -> &FitResult {
        &self.result
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    /// Unconvolved model of the first band at the best fit.
    fn gmix(&self) -> Result<GMix, BootError> {
        if self.result.pars.is_empty() {
            return Err(BootError::GMixRange("galaxy fit produced no parameters".into()));
        }
        galaxy_gmix(self.model, self.result.pars.as_slice(), 0)
    }
}

impl GalaxySolver for LmGalaxySolver {
    fn convolved_gmix(
        &self,
        data: &[ObsList],
        band: usize,
        epoch: usize,
    ) -> Result<GMix, BootError> {
        if self.result.pars.is_empty() {
            return Err(BootError::GMixRange("galaxy fit produced no parameters".into()));
        }
        let obs = data
            .get(band)
            .and_then(|list| list.get(epoch))
            .ok_or(BootError::MissingPsf { band, epoch })?;
        let psf = obs.psf_gmix().ok_or(BootError::MissingPsfGmix { band })?;
        galaxy_gmix(self.model, self.result.pars.as_slice(), band)?.convolve(psf)
    }

    fn ln_prob(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError> {
        self.check_layout(data, pars.len())?;
        self.ln_prob_full(data, &sqrt_weights(data), pars)
    }

    fn ln_like(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError> {
        self.check_layout(data, pars.len())?;
        self.ln_like_full(data, &sqrt_weights(data), pars)
    }

    fn calc_cov(&mut self, data: &[ObsList], h: f64, m: f64) -> Result<(), BootError> {
        let pars = self.result.pars.clone();
        if pars.is_empty() {
            return Err(BootError::GMixRange("no best fit to compute a covariance at".into()));
        }
        self.check_layout(data, pars.len())?;
        let npars = pars.len();
        let free = self.free_indices(npars);
        let steps = self.step_sizes(&free, &pars, h, m);
        let sqrtw = sqrt_weights(data);

        let lnp = |shifts: &[(usize, f64)]| -> Result<f64, BootError> {
            let mut p = pars.clone();
            for &(k, dx) in shifts {
                p[free[k]] += dx;
            }
            self.ln_prob_full(data, &sqrtw, &p)
        };

        let nfree = free.len();
        let hessian = (|| -> Result<DMatrix<f64>, BootError> {
            let f0 = lnp(&[])?;
            let mut hess = DMatrix::zeros(nfree, nfree);
            for a in 0..nfree {
                let ha = steps[a];
                let fp = lnp(&[(a, ha)])?;
                let fm = lnp(&[(a, -ha)])?;
                hess[(a, a)] = (fp - 2.0 * f0 + fm) / (ha * ha);
                for b in 0..a {
                    let hb = steps[b];
                    let fpp = lnp(&[(a, ha), (b, hb)])?;
                    let fpm = lnp(&[(a, ha), (b, -hb)])?;
                    let fmp = lnp(&[(a, -ha), (b, hb)])?;
                    let fmm = lnp(&[(a, -ha), (b, -hb)])?;
                    let val = (fpp - fpm - fmp + fmm) / (4.0 * ha * hb);
                    hess[(a, b)] = val;
                    hess[(b, a)] = val;
                }
            }
            Ok(hess)
        })();

        let hessian = match hessian {
            Ok(hess) => hess,
            Err(err) if is_range(&err) => {
                warn!("covariance step left the valid parameter range: {err}");
                self.result.flags |= LM_NEG_COV_DIAG;
                self.result.flagstr = flagstr(self.result.flags);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let cov_free = (-hessian)
            .try_inverse()
            .filter(|c| (0..nfree).all(|i| c[(i, i)] > 0.0));
        let Some(cov_free) = cov_free else {
            self.result.flags |= LM_NEG_COV_DIAG;
            self.result.flagstr = flagstr(self.result.flags);
            return Ok(());
        };

        let mut cov = DMatrix::zeros(npars, npars);
        for (a, &i) in free.iter().enumerate() {
            for (b, &j) in free.iter().enumerate() {
                cov[(i, j)] = cov_free[(a, b)];
            }
        }
        let nshape = self.model.nshape();
        self.result.set_layout_derived(pars, cov, nshape);
        Ok(())
    }
}

#[cfg(test)]
mod lm_tests {
    use super::*;
    use crate::jacobian::Jacobian;
    use approx::assert_relative_eq;

    #[test]
    fn test_lm_linear_fit() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let fdiff = |p: &DVector<f64>| -> Result<DVector<f64>, BootError> {
            Ok(DVector::from_iterator(
                xs.len(),
                xs.iter().map(|x| p[0] + p[1] * x - (1.5 - 0.5 * x)),
            ))
        };
        let out = run_lm(fdiff, DVector::from_vec(vec![0.0, 0.0]), &LmPars::default()).unwrap();
        assert_eq!(out.flags & (LM_SINGULAR_MATRIX | LM_MAXFEV), 0);
        assert_relative_eq!(out.pars[0], 1.5, epsilon = 1e-6);
        assert_relative_eq!(out.pars[1], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_lm_psf_gauss() {
        let jac = Jacobian::diagonal(0.263, 12.0, 12.0);
        let truth = simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.05, -0.02, 0.3, 2.0]).unwrap();
        let obs = Observation::new(truth.make_image(25, 25, &jac), jac)
            .with_weight(DMatrix::from_element(25, 25, 1.0e4))
            .unwrap();
        let mut solver = LmPsfSolver::new(SimpleModel::Gauss, LmPars::default());
        let guess = DVector::from_vec(vec![0.01, -0.01, 0.0, 0.0, 0.25, 1.8]);
        solver.go(&obs, &guess).unwrap();

        let res = solver.result();
        assert_eq!(res.flags, 0);
        assert_relative_eq!(res.pars[4], 0.3, max_relative = 1e-4);
        assert_relative_eq!(res.flux[0], 2.0, max_relative = 1e-3);
        assert_relative_eq!(res.g.unwrap()[0], 0.05, epsilon = 1e-4);
    }

    #[test]
    fn test_galaxy_ln_like_leaves_out_the_prior() {
        use crate::priors::{CenPrior, GaussianPrior, JointPrior, ZDisk2D};

        let jac = Jacobian::diagonal(0.263, 12.0, 12.0);
        let psf_gm = simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, 0.27, 1.0]).unwrap();
        let gal = simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.1, 0.05, 0.3, 100.0]).unwrap();
        let mut psf = Observation::new(psf_gm.make_image(25, 25, &jac), jac);
        psf.gmix = Some(psf_gm.clone());
        let image = gal.convolve(&psf_gm).unwrap().make_image(25, 25, &jac);
        let data: Vec<ObsList> = vec![vec![Observation::new(image, jac).with_psf(psf)]];

        let prior: Arc<dyn Prior> = Arc::new(JointPrior::simple(
            CenPrior::new(0.0, 0.0, 1e-3, 1e-3).unwrap(),
            ZDisk2D::new(1.0).unwrap(),
            Box::new(GaussianPrior::new(0.3, 1e-3).unwrap()),
            vec![Box::new(GaussianPrior::new(100.0, 1e-2).unwrap())],
        ));
        let model = GalaxyModel::Simple(SimpleModel::Gauss);
        let with = LmGalaxySolver::new(model, LmPars::default(), Some(prior.clone()), FixedPars::new());
        let without = LmGalaxySolver::new(model, LmPars::default(), None, FixedPars::new());

        let p = DVector::from_vec(vec![0.01, 0.0, 0.1, 0.05, 0.31, 99.0]);
        let like = with.ln_like(&data, &p).unwrap();
        assert_eq!(like, without.ln_like(&data, &p).unwrap());
        assert_eq!(like, without.ln_prob(&data, &p).unwrap());

        let lnp_prior = prior.ln_prob(p.as_slice()).unwrap();
        assert!(lnp_prior < -1.0e3);
        assert_relative_eq!(
            with.ln_prob(&data, &p).unwrap() - like,
            lnp_prior,
            max_relative = 1e-9
        );
    }

    #[test]
    fn test_lm_psf_rejects_bad_guess_length() {
        let jac = Jacobian::identity(2.0, 2.0);
        let obs = Observation::new(DMatrix::from_element(5, 5, 1.0), jac);
        let mut solver = LmPsfSolver::new(SimpleModel::Gauss, LmPars::default());
        assert!(solver.go(&obs, &DVector::zeros(4)).is_err());
    }
}
