//! # Priors on fit parameters
//!
//! Priors enter the bootstrapper in three places:
//!
//! * least-squares solvers append the prior's residual terms (`fill_fdiff`) to the pixel
//!   residuals,
//! * guessers draw centers and shapes from [`Prior::sample`],
//! * samplers weight draws with [`Prior::ln_prob`].
//!
//! A prior with zero probability at a point reports a [`BootError::GMixRange`], which the
//! solvers treat like any other out-of-range parameter vector.
//!
//! ## Building blocks
//!
//! | type              | parameters                                      |
//! |-------------------|-------------------------------------------------|
//! | [`GaussianPrior`] | one scalar                                      |
//! | [`FlatPrior`]     | one scalar, uniform on `[min, max]`             |
//! | [`TwoSidedErf`]   | one scalar, soft edges at both ends             |
//! | [`CenPrior`]      | center `(cen1, cen2)`                           |
//! | [`ZDisk2D`]       | shape `(g1, g2)` uniform inside a disk          |
//!
//! [`JointPrior`] combines them over the simple, bdf and bd layouts;
//! [`CoellipSamePrior`] applies one size and one flux prior to every component of a
//! coelliptical model.

use std::f64::consts::PI;
use std::fmt;

use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};
use statrs::function::erf::erf;

use crate::boot_errors::BootError;

/// Prior on a single scalar parameter.
pub trait ScalarPrior: fmt::Debug + Send + Sync {
    fn ln_prob(&self, x: f64) -> Result<f64, BootError>;

    /// Residual-form term, `sqrt(-2 ln p)` up to a constant.
    fn fdiff(&self, x: f64) -> Result<f64, BootError>;

    fn sample(&self, rng: &mut dyn RngCore) -> f64;
}

/// Prior on a full parameter vector.
pub trait Prior: fmt::Debug + Send + Sync {
    fn ln_prob(&self, pars: &[f64]) -> Result<f64, BootError>;

    /// Append the residual terms of this prior to `fdiff`.
    fn fill_fdiff(&self, pars: &[f64], fdiff: &mut Vec<f64>) -> Result<(), BootError>;

    fn sample(&self, rng: &mut dyn RngCore) -> Vec<f64>;
}

fn zero_prob(what: &str, x: f64) -> BootError {
    BootError::GMixRange(format!("{what} prior has zero probability at {x}"))
}

/// Normal prior on one scalar.
#[derive(Debug, Clone)]
pub struct GaussianPrior {
    mean: f64,
    sigma: f64,
    dist: Normal<f64>,
}

impl GaussianPrior {
    pub fn new(mean: f64, sigma: f64) -> Result<Self, BootError> {
        let dist = Normal::new(mean, sigma).map_err(|e| {
            BootError::InvalidParameter(format!("gaussian prior sigma={sigma}: {e}"))
        })?;
        if !(sigma > 0.0) {
            return Err(BootError::InvalidParameter(
                "gaussian prior sigma must be > 0".into(),
            ));
        }
        Ok(GaussianPrior { mean, sigma, dist })
    }
}

impl ScalarPrior for GaussianPrior {
    fn ln_prob(&self, x: f64) -> Result<f64, BootError> {
        let d = (x - self.mean) / self.sigma;
        Ok(-0.5 * d * d)
    }

    fn fdiff(&self, x: f64) -> Result<f64, BootError> {
        Ok((x - self.mean) / self.sigma)
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        self.dist.sample(rng)
    }
}

/// Uniform on `[min, max]`; zero probability outside.
#[derive(Debug, Clone, Copy)]
pub struct FlatPrior {
    min: f64,
    max: f64,
}

impl FlatPrior {
    pub fn new(min: f64, max: f64) -> Result<Self, BootError> {
        if !(min < max) {
            return Err(BootError::InvalidParameter(format!(
                "flat prior needs min < max, got [{min}, {max}]"
            )));
        }
        Ok(FlatPrior { min, max })
    }
}

impl ScalarPrior for FlatPrior {
    fn ln_prob(&self, x: f64) -> Result<f64, BootError> {
        if x < self.min || x > self.max {
            return Err(zero_prob("flat", x));
        }
        Ok(0.0)
    }

    fn fdiff(&self, x: f64) -> Result<f64, BootError> {
        self.ln_prob(x).map(|_| 0.0)
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        rng.random_range(self.min..self.max)
    }
}

/// Product of two error functions: rises around `minval`, falls around `maxval`.
#[derive(Debug, Clone, Copy)]
pub struct TwoSidedErf {
    minval: f64,
    width_at_min: f64,
    maxval: f64,
    width_at_max: f64,
}

impl TwoSidedErf {
    pub fn new(
        minval: f64,
        width_at_min: f64,
        maxval: f64,
        width_at_max: f64,
    ) -> Result<Self, BootError> {
        if !(width_at_min > 0.0) || !(width_at_max > 0.0) || !(minval < maxval) {
            return Err(BootError::InvalidParameter(format!(
                "two-sided erf prior: need positive widths and minval < maxval, got \
                 ({minval}, {width_at_min}, {maxval}, {width_at_max})"
            )));
        }
        Ok(TwoSidedErf {
            minval,
            width_at_min,
            maxval,
            width_at_max,
        })
    }

    fn prob(&self, x: f64) -> f64 {
        let low = 0.5 * (1.0 + erf((x - self.minval) / self.width_at_min));
        let high = 0.5 * (1.0 + erf((self.maxval - x) / self.width_at_max));
        low * high
    }
}

impl ScalarPrior for TwoSidedErf {
    fn ln_prob(&self, x: f64) -> Result<f64, BootError> {
        let p = self.prob(x);
        if !(p > 0.0) {
            return Err(zero_prob("two-sided erf", x));
        }
        Ok(p.ln())
    }

    fn fdiff(&self, x: f64) -> Result<f64, BootError> {
        let lnp = self.ln_prob(x)?;
        Ok((-2.0 * lnp).max(0.0).sqrt())
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        let low = self.minval - 5.0 * self.width_at_min;
        let high = self.maxval + 5.0 * self.width_at_max;
        loop {
            let x = rng.random_range(low..high);
            if rng.random::<f64>() < self.prob(x) {
                return x;
            }
        }
    }
}

/// Independent gaussians on the two center coordinates.
#[derive(Debug, Clone)]
pub struct CenPrior {
    cen1: GaussianPrior,
    cen2: GaussianPrior,
}

impl CenPrior {
    pub fn new(cen1: f64, cen2: f64, sigma1: f64, sigma2: f64) -> Result<Self, BootError> {
        Ok(CenPrior {
            cen1: GaussianPrior::new(cen1, sigma1)?,
            cen2: GaussianPrior::new(cen2, sigma2)?,
        })
    }

    /// Sum of the two gaussian log probabilities.
    pub fn ln_prob(&self, c1: f64, c2: f64) -> Result<f64, BootError> {
        Ok(self.cen1.ln_prob(c1)? + self.cen2.ln_prob(c2)?)
    }

    pub fn fdiff(&self, c1: f64, c2: f64) -> Result<[f64; 2], BootError> {
        Ok([self.cen1.fdiff(c1)?, self.cen2.fdiff(c2)?])
    }

    pub fn sample(&self, rng: &mut dyn RngCore) -> (f64, f64) {
        (self.cen1.sample(rng), self.cen2.sample(rng))
    }
}

/// Shape prior uniform inside `|g| < radius`.
#[derive(Debug, Clone, Copy)]
pub struct ZDisk2D {
    radius: f64,
}

impl ZDisk2D {
    pub fn new(radius: f64) -> Result<Self, BootError> {
        if !(radius > 0.0) {
            return Err(BootError::InvalidParameter(
                "disk prior radius must be > 0".into(),
            ));
        }
        Ok(ZDisk2D { radius })
    }

    /// Flat inside the disk; a shape on or beyond the edge is a range error, which the
    /// solvers treat as an invalid step.
    pub fn ln_prob(&self, g1: f64, g2: f64) -> Result<f64, BootError> {
        let g = (g1 * g1 + g2 * g2).sqrt();
        if g >= self.radius {
            return Err(zero_prob("disk", g));
        }
        Ok(0.0)
    }

    /// Uniform over the disk area.
    pub fn sample(&self, rng: &mut dyn RngCore) -> (f64, f64) {
        let r = self.radius * rng.random::<f64>().sqrt();
        let theta = 2.0 * PI * rng.random::<f64>();
        (r * theta.cos(), r * theta.sin())
    }
}

/// Separable prior over `[cen1, cen2, g1, g2, T, (extra shape,) flux...]`.
///
/// The extra shape parameters sit between `T` and the fluxes: none for the simple
/// layout, `fracdev` for bdf, `log10(Tbulge/T), fracdev` for bd.
#[derive(Debug)]
pub struct JointPrior {
    cen: CenPrior,
    g: ZDisk2D,
    t: Box<dyn ScalarPrior>,
    extra: Vec<Box<dyn ScalarPrior>>,
    fluxes: Vec<Box<dyn ScalarPrior>>,
}

impl JointPrior {
    /// Prior for the simple layout, one flux prior per band.
    pub fn simple(
        cen: CenPrior,
        g: ZDisk2D,
        t: Box<dyn ScalarPrior>,
        fluxes: Vec<Box<dyn ScalarPrior>>,
    ) -> Self {
        JointPrior {
            cen,
            g,
            t,
            extra: Vec::new(),
            fluxes,
        }
    }

    /// Prior for the bulge + disk layout.
    pub fn bdf(
        cen: CenPrior,
        g: ZDisk2D,
        t: Box<dyn ScalarPrior>,
        fracdev: Box<dyn ScalarPrior>,
        fluxes: Vec<Box<dyn ScalarPrior>>,
    ) -> Self {
        JointPrior {
            cen,
            g,
            t,
            extra: vec![fracdev],
            fluxes,
        }
    }

    /// Prior for the two-size bulge + disk layout.
    ///
    /// # Arguments
    ///
    /// * `t` - prior on the disk size
    /// * `log_tratio` - prior on `log10(Tbulge/T)`
    /// * `fracdev` - prior on the bulge flux fraction
    pub fn bd(
        cen: CenPrior,
        g: ZDisk2D,
        t: Box<dyn ScalarPrior>,
        log_tratio: Box<dyn ScalarPrior>,
        fracdev: Box<dyn ScalarPrior>,
        fluxes: Vec<Box<dyn ScalarPrior>>,
    ) -> Self {
        JointPrior {
            cen,
            g,
            t,
            extra: vec![log_tratio, fracdev],
            fluxes,
        }
    }

    fn nshape(&self) -> usize {
        5 + self.extra.len()
    }

    fn check_len(&self, pars: &[f64]) -> Result<(), BootError> {
        let expected = self.nshape() + self.fluxes.len();
        if pars.len() != expected {
            return Err(BootError::InvalidParameter(format!(
                "prior expects {expected} parameters, got {}",
                pars.len()
            )));
        }
        Ok(())
    }
}

impl Prior for JointPrior {
    fn ln_prob(&self, pars: &[f64]) -> Result<f64, BootError> {
        self.check_len(pars)?;
        let mut lnp = self.cen.ln_prob(pars[0], pars[1])?;
        lnp += self.g.ln_prob(pars[2], pars[3])?;
        lnp += self.t.ln_prob(pars[4])?;
        let rest = self.extra.iter().chain(&self.fluxes);
        for (prior, &x) in rest.zip(&pars[5..]) {
            lnp += prior.ln_prob(x)?;
        }
        Ok(lnp)
    }

    fn fill_fdiff(&self, pars: &[f64], fdiff: &mut Vec<f64>) -> Result<(), BootError> {
        self.check_len(pars)?;
        fdiff.extend(self.cen.fdiff(pars[0], pars[1])?);
        self.g.ln_prob(pars[2], pars[3])?;
        fdiff.push(self.t.fdiff(pars[4])?);
        let rest = self.extra.iter().chain(&self.fluxes);
        for (prior, &x) in rest.zip(&pars[5..]) {
            fdiff.push(prior.fdiff(x)?);
        }
        Ok(())
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        let (c1, c2) = self.cen.sample(rng);
        let (g1, g2) = self.g.sample(rng);
        let mut pars = vec![c1, c2, g1, g2, self.t.sample(rng)];
        pars.extend(self.extra.iter().map(|p| p.sample(rng)));
        pars.extend(self.fluxes.iter().map(|p| p.sample(rng)));
        pars
    }
}

/// Prior for a coelliptical model: the same size and flux prior on every component.
#[derive(Debug)]
pub struct CoellipSamePrior {
    ngauss: usize,
    cen: CenPrior,
    g: ZDisk2D,
    t: Box<dyn ScalarPrior>,
    flux: Box<dyn ScalarPrior>,
}

impl CoellipSamePrior {
    pub fn new(
        ngauss: usize,
        cen: CenPrior,
        g: ZDisk2D,
        t: Box<dyn ScalarPrior>,
        flux: Box<dyn ScalarPrior>,
    ) -> Self {
        CoellipSamePrior {
            ngauss,
            cen,
            g,
            t,
            flux,
        }
    }

    fn split<'a>(&self, pars: &'a [f64]) -> Result<(&'a [f64], &'a [f64]), BootError> {
        let n = self.ngauss;
        if pars.len() != 4 + 2 * n {
            return Err(BootError::InvalidParameter(format!(
                "coellip{n} prior expects {} parameters, got {}",
                4 + 2 * n,
                pars.len()
            )));
        }
        Ok((&pars[4..4 + n], &pars[4 + n..]))
    }
}

impl Prior for CoellipSamePrior {
    fn ln_prob(&self, pars: &[f64]) -> Result<f64, BootError> {
        let (ts, fs) = self.split(pars)?;
        let mut lnp = self.cen.ln_prob(pars[0], pars[1])? + self.g.ln_prob(pars[2], pars[3])?;
        for &t in ts {
            lnp += self.t.ln_prob(t)?;
        }
        for &f in fs {
            lnp += self.flux.ln_prob(f)?;
        }
        Ok(lnp)
    }

    fn fill_fdiff(&self, pars: &[f64], fdiff: &mut Vec<f64>) -> Result<(), BootError> {
        let (ts, fs) = self.split(pars)?;
        fdiff.extend(self.cen.fdiff(pars[0], pars[1])?);
        self.g.ln_prob(pars[2], pars[3])?;
        for &t in ts {
            fdiff.push(self.t.fdiff(t)?);
        }
        for &f in fs {
            fdiff.push(self.flux.fdiff(f)?);
        }
        Ok(())
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Vec<f64> {
        let (c1, c2) = self.cen.sample(rng);
        let (g1, g2) = self.g.sample(rng);
        let mut pars = vec![c1, c2, g1, g2];
        pars.extend((0..self.ngauss).map(|_| self.t.sample(rng)));
        pars.extend((0..self.ngauss).map(|_| self.flux.sample(rng)));
        pars
    }
}
