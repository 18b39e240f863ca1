//! Solver contracts consumed by the bootstrapper.
//!
//! The orchestration layer never calls a numerical algorithm directly. It asks a
//! [`FitBackend`] for a fresh solver, hands it data and a guess, and reads back a
//! [`FitResult`]. Any implementation honoring the `flags` contract can be plugged in; the
//! crate ships [`NativeBackend`](crate::fitting::NativeBackend).

use std::sync::Arc;

use nalgebra::DVector;

use crate::boot_errors::BootError;
use crate::constants::{ObsList, Pars};
use crate::fitting::pars::{AdmomPars, EmPars, LmPars};
use crate::fitting::FitResult;
use crate::gmix::GMix;
use crate::models::{GalaxyModel, GaussCount, SimpleModel};
use crate::observation::Observation;
use crate::priors::Prior;

/// One solver invocation: consume a guess, produce a result.
///
/// A mixture range error returned from [`Solver::go`] is an ordinary failed attempt for
/// the retry loop; any other error aborts the fit.
pub trait Solver {
    type Data: ?Sized;
    type Guess;

    fn go(&mut self, data: &Self::Data, guess: &Self::Guess) -> Result<(), BootError>;

    fn result(&self) -> &FitResult;

    fn result_mut(&mut self) -> &mut FitResult;

    /// Best-fit mixture; only meaningful when `result().flags == 0`.
    fn gmix(&self) -> Result<GMix, BootError>;
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    type Data = S::Data;
    type Guess = S::Guess;

    fn go(&mut self, data: &Self::Data, guess: &Self::Guess) -> Result<(), BootError> {
        (**self).go(data, guess)
    }

    fn result(&self) -> &FitResult {
        (**self).result()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        (**self).result_mut()
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        (**self).gmix()
    }
}

/// Single-observation PSF solver with a mixture guess (EM, adaptive moments).
pub type GMixPsfSolver = Box<dyn Solver<Data = Observation, Guess = GMix>>;

/// Single-observation PSF solver with a parameter-vector guess (least squares).
pub type ParsPsfSolver = Box<dyn Solver<Data = Observation, Guess = Pars>>;

/// Adaptive moments over every observation of every band.
pub type AdmomGalSolver = Box<dyn Solver<Data = [ObsList], Guess = GMix>>;

/// Maximum-likelihood galaxy solver over a multi-band observation list.
pub trait GalaxySolver: Solver<Data = [ObsList], Guess = Pars> {
    /// Model mixture for `(band, epoch)` convolved with that epoch's PSF, at the best fit.
    fn convolved_gmix(
        &self,
        data: &[ObsList],
        band: usize,
        epoch: usize,
    ) -> Result<GMix, BootError>;

    /// Log posterior of a full parameter vector: [`ln_like`](Self::ln_like) plus the
    /// solver's prior, if any.
    fn ln_prob(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError>;

    /// Log likelihood `-χ²/2` of a full parameter vector, without any prior term.
    fn ln_like(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError>;

    /// Replace the covariance with a numerical estimate from the log posterior
    /// curvature. On failure the covariance is kept and a flag is set on the result.
    fn calc_cov(&mut self, data: &[ObsList], h: f64, m: f64) -> Result<(), BootError>;
}

/// Linear flux solve against a fixed template.
pub trait TemplateFluxSolver {
    fn go(&mut self, obs_list: &[Observation]) -> Result<(), BootError>;

    fn result(&self) -> &FitResult;
}

/// Where the flux template comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemplateSource {
    /// Each epoch's PSF mixture, rescaled to unit flux when `normalize` is set
    Psf { normalize: bool },
    /// The mixture attached to each observation, at unit flux
    Gmix,
}

/// Parameters held fixed during a galaxy fit: `Some(value)` pins that index.
pub type FixedPars = Vec<Option<f64>>;

/// Factory for the solvers used by the bootstrapping stages.
pub trait FitBackend {
    fn em(&self, pars: &EmPars) -> GMixPsfSolver;

    fn lm_psf(&self, model: SimpleModel, pars: &LmPars) -> ParsPsfSolver;

    fn coellip(
        &self,
        ngauss: GaussCount,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
    ) -> ParsPsfSolver;

    fn admom_psf(&self, pars: &AdmomPars) -> GMixPsfSolver;

    fn admom(&self, pars: &AdmomPars) -> AdmomGalSolver;

    /// Least-squares galaxy solver. `fixed` is either empty or has one entry per
    /// parameter.
    fn galaxy(
        &self,
        model: GalaxyModel,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
    ) -> Box<dyn GalaxySolver>;

    fn template_flux(&self, source: TemplateSource) -> Box<dyn TemplateFluxSolver>;
}
