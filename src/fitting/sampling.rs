//! # Samplers
//!
//! Both samplers refine a maximum-likelihood fit into a weighted set of parameter draws:
//!
//! * [`ISampler`] draws from a multivariate Student-t proposal centered on a mean with a
//!   (clipped) covariance and weights each draw by `posterior / proposal`;
//! * [`PSampler`] takes externally supplied draws from the prior, keeps those inside an
//!   `nsigma` box around the fit and weights them by the likelihood.
//!
//! `calc_result` summarizes the draws as a weighted mean and covariance. The sampling
//! efficiency is `(Σ w)² / (n Σ w²)`, 1 for uniform weights.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use crate::boot_errors::BootError;
use crate::constants::{Pars, SAMPLER_NO_WEIGHT};
use crate::fitting::{flagstr, FitResult};

/// Weighted mean, covariance and efficiency; `None` when the weights sum to zero.
fn weighted_stats(samples: &[DVector<f64>], weights: &[f64]) -> Option<(Pars, DMatrix<f64>, f64)> {
    let first = samples.first()?;
    let wsum: f64 = weights.iter().sum();
    if !(wsum > 0.0) {
        return None;
    }
    let npar = first.len();
    let mut mean = DVector::zeros(npar);
    for (s, w) in samples.iter().zip(weights) {
        mean += s * *w;
    }
    mean /= wsum;

    let mut cov = DMatrix::zeros(npar, npar);
    for (s, w) in samples.iter().zip(weights) {
        let d = s - &mean;
        cov += (&d * d.transpose()) * *w;
    }
    cov /= wsum;

    let w2sum: f64 = weights.iter().map(|w| w * w).sum();
    let efficiency = wsum * wsum / (weights.len() as f64 * w2sum);
    Some((mean, cov, efficiency))
}

/// Weights `exp(lnp - max lnp)`; non-finite log values get zero weight.
fn normalized_weights(lnp: &[f64]) -> Vec<f64> {
    let max = lnp
        .iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    lnp.iter()
        .map(|&x| if x.is_finite() { (x - max).exp() } else { 0.0 })
        .collect()
}

fn summarize(
    model: &str,
    samples: &[DVector<f64>],
    weights: &[f64],
    nshape: usize,
) -> FitResult {
    match weighted_stats(samples, weights) {
        Some((mean, cov, efficiency)) => {
            let mut result = FitResult::failed(model, 0, "");
            result.set_layout_derived(mean, cov, nshape);
            result.efficiency = Some(efficiency);
            result
        }
        None => FitResult::failed(model, SAMPLER_NO_WEIGHT, flagstr(SAMPLER_NO_WEIGHT)),
    }
}

/// Importance sampler with a multivariate Student-t proposal.
#[derive(Debug, Clone)]
pub struct ISampler {
    mean: Pars,
    chol: Cholesky<f64, Dyn>,
    df: f64,
    samples: Vec<DVector<f64>>,
    /// Squared Mahalanobis distance of each draw under the proposal
    mahal: Vec<f64>,
    iweights: Vec<f64>,
    result: FitResult,
}

impl ISampler {
    /// Build the proposal from `mean` and `cov`.
    ///
    /// Per-parameter errors `sqrt(cov_ii)` are clipped to `[min_err_i, max_err_i]` (the
    /// correlations are kept) and the covariance is then scaled by `ifactor²`.
    ///
    /// # Arguments
    ///
    /// * `mean`, `cov` - center and covariance of the proposal, usually the maximum-likelihood
    ///   fit
    /// * `df` - Student-t degrees of freedom; small values give heavy tails
    /// * `min_err`, `max_err` - optional per-parameter bounds on the proposal widths
    /// * `ifactor` - overall width multiplier
    ///
    /// # Errors
    ///
    /// [`BootError::LinAlg`] when the clipped covariance has no Cholesky factor.
    pub fn new(
        mean: Pars,
        cov: &DMatrix<f64>,
        df: f64,
        min_err: Option<&[f64]>,
        max_err: Option<&[f64]>,
        ifactor: f64,
    ) -> Result<Self, BootError> {
        let npar = mean.len();
        if cov.shape() != (npar, npar) {
            return Err(BootError::InvalidParameter(format!(
                "covariance shape {:?} does not match {npar} parameters",
                cov.shape()
            )));
        }
        if !(df > 0.0) {
            return Err(BootError::InvalidParameter(format!(
                "degrees of freedom must be > 0, got {df}"
            )));
        }
        for (what, bounds) in [("min_err", min_err), ("max_err", max_err)] {
            if let Some(b) = bounds {
                if b.len() != npar {
                    return Err(BootError::InvalidParameter(format!(
                        "{what} has {} entries, expected {npar}",
                        b.len()
                    )));
                }
            }
        }

        let mut scale = DVector::from_element(npar, 1.0);
        for i in 0..npar {
            let var = cov[(i, i)];
            if !(var > 0.0) {
                return Err(BootError::LinAlg(format!(
                    "covariance diagonal {i} is not positive: {var}"
                )));
            }
            let err = var.sqrt();
            let mut clipped = err;
            if let Some(lo) = min_err {
                clipped = clipped.max(lo[i]);
            }
            if let Some(hi) = max_err {
                clipped = clipped.min(hi[i]);
            }
            scale[i] = clipped / err;
        }
        let prop = DMatrix::from_fn(npar, npar, |i, j| {
            cov[(i, j)] * scale[i] * scale[j] * ifactor * ifactor
        });
        let chol = prop
            .cholesky()
            .ok_or_else(|| BootError::LinAlg("proposal covariance is not positive definite".into()))?;

        Ok(ISampler {
            mean,
            chol,
            df,
            samples: Vec::new(),
            mahal: Vec::new(),
            iweights: Vec::new(),
            result: FitResult::default(),
        })
    }

    /// Draw `n` samples from the proposal, replacing any previous draws.
    pub fn make_samples<R: Rng + ?Sized>(&mut self, n: usize, rng: &mut R) -> Result<(), BootError> {
        let chi2 = ChiSquared::new(self.df)
            .map_err(|e| BootError::InvalidParameter(format!("student-t proposal: {e}")))?;
        let npar = self.mean.len();
        let l = self.chol.l();
        self.samples.clear();
        self.mahal.clear();
        for _ in 0..n {
            let z = DVector::from_fn(npar, |_, _| StandardNormal.sample(rng));
            let t_scale = (self.df / chi2.sample(rng)).sqrt();
            let y = &z * t_scale;
            self.mahal.push(y.norm_squared());
            self.samples.push(&self.mean + &l * y);
        }
        self.iweights.clear();
        Ok(())
    }

    /// Weight each draw by `exp(lnprob - ln proposal)`, normalized to a maximum of 1.
    ///
    /// Draws for which `lnprob` reports a mixture range error get zero weight.
    pub fn set_iweights<F>(&mut self, mut lnprob: F) -> Result<(), BootError>
    where
        F: FnMut(&DVector<f64>) -> Result<f64, BootError>,
    {
        let npar = self.mean.len() as f64;
        let mut lnw = Vec::with_capacity(self.samples.len());
        for (s, q) in self.samples.iter().zip(&self.mahal) {
            let lnp = match lnprob(s) {
                Ok(lnp) => lnp,
                Err(BootError::GMixRange(_)) => f64::NEG_INFINITY,
                Err(err) => return Err(err),
            };
            let ln_proposal = -0.5 * (self.df + npar) * (1.0 + q / self.df).ln();
            lnw.push(lnp - ln_proposal);
        }
        self.iweights = normalized_weights(&lnw);
        Ok(())
    }

    /// Summarize the weighted draws; `nshape` splits shape parameters from fluxes.
    pub fn calc_result(&mut self, model: &str, nshape: usize) {
        let weights = if self.iweights.len() == self.samples.len() {
            self.iweights.clone()
        } else {
            vec![0.0; self.samples.len()]
        };
        self.result = summarize(model, &self.samples, &weights, nshape);
    }

    pub fn result(&self) -> &FitResult {
        &self.result
    }

    /// Draws in proposal order.
    pub fn samples(&self) -> &[DVector<f64>] {
        &self.samples
    }

    /// Importance weights, `exp(ln p - ln q)` rescaled to a maximum of one.
    pub fn iweights(&self) -> &[f64] {
        &self.iweights
    }
}

/// Likelihood reweighting of draws from the prior.
#[derive(Debug, Clone)]
pub struct PSampler {
    samples: Vec<DVector<f64>>,
    weights: Vec<f64>,
    result: FitResult,
}

impl PSampler {
    /// Keep the prior draws within `nsigma × pars_err` of `pars` in every parameter.
    ///
    /// # Errors
    ///
    /// [`BootError::InvalidParameter`] when `pars_err` or a draw does not match the length of
    /// `pars`.
    pub fn new(
        pars: &Pars,
        pars_err: &Pars,
        prior_samples: &[Vec<f64>],
        nsigma: f64,
    ) -> Result<Self, BootError> {
        let npar = pars.len();
        if pars_err.len() != npar {
            return Err(BootError::InvalidParameter(format!(
                "{} errors for {npar} parameters",
                pars_err.len()
            )));
        }
        if let Some(bad) = prior_samples.iter().find(|s| s.len() != npar) {
            return Err(BootError::InvalidParameter(format!(
                "prior sample has {} parameters, expected {npar}",
                bad.len()
            )));
        }
        let samples = prior_samples
            .iter()
            .filter(|s| {
                s.iter()
                    .zip(pars.iter().zip(pars_err.iter()))
                    .all(|(x, (p, e))| (x - p).abs() < nsigma * e)
            })
            .map(|s| DVector::from_column_slice(s))
            .collect();
        Ok(PSampler {
            samples,
            weights: Vec::new(),
            result: FitResult::default(),
        })
    }

    /// Number of prior draws inside the window.
    pub fn nuse(&self) -> usize {
        self.samples.len()
    }

    /// Weight each kept draw by its likelihood and summarize.
    pub fn calc_loglikes<F>(&mut self, model: &str, nshape: usize, mut lnlike: F) -> Result<(), BootError>
    where
        F: FnMut(&DVector<f64>) -> Result<f64, BootError>,
    {
        let mut lnp = Vec::with_capacity(self.samples.len());
        for s in &self.samples {
            lnp.push(match lnlike(s) {
                Ok(v) => v,
                Err(BootError::GMixRange(_)) => f64::NEG_INFINITY,
                Err(err) => return Err(err),
            });
        }
        self.weights = normalized_weights(&lnp);
        self.result = summarize(model, &self.samples, &self.weights, nshape);
        Ok(())
    }

    pub fn result(&self) -> &FitResult {
        &self.result
    }

    pub fn samples(&self) -> &[DVector<f64>] {
        &self.samples
    }

    /// Likelihood weights of the kept draws, rescaled to a maximum of one.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

#[cfg(test)]
mod sampling_tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gaussian_lnprob<'a>(
        mean: &'a [f64],
        sigma: &'a [f64],
    ) -> impl Fn(&DVector<f64>) -> Result<f64, BootError> + 'a {
        move |p: &DVector<f64>| {
            Ok(p.iter()
                .zip(mean.iter().zip(sigma))
                .map(|(x, (m, s))| -0.5 * ((x - m) / s).powi(2))
                .sum())
        }
    }

    #[test]
    fn test_isampler_recovers_gaussian() {
        let mean = [0.0, 0.0, 0.1, -0.1, 1.0, 100.0];
        let sigma = [0.01, 0.01, 0.02, 0.02, 0.1, 5.0];
        let cov = DMatrix::from_diagonal(&DVector::from_iterator(6, sigma.iter().map(|s| s * s)));

        let mut sampler =
            ISampler::new(DVector::from_column_slice(&mean), &cov, 50.0, None, None, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        sampler.make_samples(4000, &mut rng).unwrap();
        sampler.set_iweights(gaussian_lnprob(&mean, &sigma)).unwrap();
        sampler.calc_result("gauss", 5);

        let res = sampler.result();
        assert_eq!(res.flags, 0);
        assert!(res.efficiency.unwrap() > 0.5);
        assert_relative_eq!(res.flux[0], 100.0, epsilon = 0.5);
        assert_relative_eq!(res.pars_err[4], 0.1, max_relative = 0.1);
    }

    #[test]
    fn test_isampler_clips_errors() {
        let cov = DMatrix::from_diagonal_element(2, 2, 1.0e-8);
        let sampler = ISampler::new(
            DVector::zeros(2),
            &cov,
            10.0,
            Some(&[1.0e-2, 1.0e-2]),
            None,
            1.0,
        )
        .unwrap();
        let l = sampler.chol.l();
        assert_relative_eq!(l[(0, 0)], 1.0e-2, max_relative = 1e-12);
    }

    #[test]
    fn test_isampler_rejects_bad_cov() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let err = ISampler::new(DVector::zeros(2), &cov, 10.0, None, None, 1.0).unwrap_err();
        assert!(matches!(err, BootError::LinAlg(_)));
    }

    #[test]
    fn test_psampler_window_and_weights() {
        let pars = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0, 1.0, 10.0]);
        let err = DVector::from_vec(vec![0.1, 0.1, 0.1, 0.1, 0.1, 1.0]);
        let samples = vec![
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 10.0],
            vec![0.05, 0.0, 0.0, 0.0, 1.0, 10.0],
            vec![5.0, 0.0, 0.0, 0.0, 1.0, 10.0],
        ];
        let mut sampler = PSampler::new(&pars, &err, &samples, 4.0).unwrap();
        assert_eq!(sampler.nuse(), 2);
        sampler.calc_loglikes("gauss", 5, |_| Ok(0.0)).unwrap();
        assert_eq!(sampler.result().flags, 0);
        assert_relative_eq!(sampler.result().pars[0], 0.025, epsilon = 1e-12);
        assert_relative_eq!(sampler.result().efficiency.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_psampler_empty_window() {
        let pars = DVector::from_vec(vec![0.0, 0.0]);
        let err = DVector::from_vec(vec![0.1, 0.1]);
        let samples = vec![vec![9.0, 9.0]];
        let mut sampler = PSampler::new(&pars, &err, &samples, 4.0).unwrap();
        sampler.calc_loglikes("gauss", 5, |_| Ok(0.0)).unwrap();
        assert_eq!(sampler.result().flags, SAMPLER_NO_WEIGHT);
    }
}
