//! # Bootstrapper
//!
//! The [`Bootstrapper`] chains the fitting stages of one object, each stage seeding the
//! next:
//!
//! ```text
//! Created ─fit_psfs─▶ PsfFit ─fit_gal_psf_flux─▶ FluxMeasured ─fit_max─▶ GalaxyFit ─isample / psample─▶ Sampled
//! ```
//!
//! * [`Bootstrapper::fit_psfs`] fits every epoch's PSF and rebuilds the working list
//!   with the epochs that succeeded.
//! * [`Bootstrapper::fit_gal_psf_flux`] measures per-band fluxes with the PSF as template.
//! * [`Bootstrapper::fit_max`] and its variants ([`fit_max_fix_t`](Bootstrapper::fit_max_fix_t),
//!   [`fit_max_gonly`](Bootstrapper::fit_max_gonly), [`fit_bdf`](Bootstrapper::fit_bdf),
//!   [`fit_bd`](Bootstrapper::fit_bd))
//!   run the maximum-likelihood galaxy fit, seeded by the PSF size and fluxes.
//! * [`Bootstrapper::isample`] and [`Bootstrapper::psample`] refine the galaxy fit by
//!   sampling; [`Bootstrapper::try_replace_cov`] swaps in a numerical covariance.
//! * [`Bootstrapper::replace_masked_pixels`] fills bad pixels with the best-fit model.
//!
//! The bootstrapper owns its observations: the caller's input becomes
//! `mb_obs_list_orig` and is never modified, fitted mixtures and results are written
//! to the working copy returned by [`Bootstrapper::mb_obs_list`].
//!
//! Accessors for stage outputs return [`BootError::StageNotReached`] until the producing
//! stage has run.
//!
//! ## Example
//!
//! ```no_run
//! use gmix_bootstrap::bootstrap::{Bootstrapper, MaxFitParams, PsfFitParams};
//! use gmix_bootstrap::observation::Observation;
//! # fn obs() -> Observation { unimplemented!() }
//!
//! let mut boot = Bootstrapper::new(obs())?.with_seed(42);
//! boot.fit_psfs("em3".parse()?, &PsfFitParams::builder().tguess(0.3).build()?)?;
//! boot.fit_max("exp".parse()?, &MaxFitParams::default(), None)?;
//! let res = boot.max_fitter()?.result();
//! println!("flux = {:?}", res.flux);
//! # Ok::<(), gmix_bootstrap::boot_errors::BootError>(())
//! ```

pub mod masked;
pub mod params;

use std::sync::Arc;

use log::{info, warn};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub use params::{
    AdmomParams, AdmomParamsBuilder, CovParams, IsampleParams, IsampleParamsBuilder,
    MaxFitParams, MaxFitParamsBuilder, MetacalParams, MetacalParamsBuilder, MetacalPsf, PsampleParams,
    PsfFitParams, PsfFitParamsBuilder,
};

use crate::boot_errors::BootError;
use crate::constants::{MultiBandObsList, FLUX_ERR_SENTINEL, FLUX_SENTINEL};
use crate::fitting::pars::{AdmomPars, EmPars, LmPars, SolverPars};
use crate::fitting::sampling::{ISampler, PSampler};
use crate::fitting::traits::{FitBackend, FixedPars, GalaxySolver, Solver, TemplateSource};
use crate::fitting::{flagstr, FitResult, NativeBackend};
use crate::gmix::GMix;
use crate::guessers::{
    BdGuesser, BdfGuesser, GuessGenerator, ParsGuesser, PriorSampleGuesser, TFluxAndPriorGuesser,
    TFluxGuesser,
};
use crate::models::{GalaxyModel, PsfModel};
use crate::observation::{ObsInput, Observation};
use crate::priors::Prior;
use crate::runners::{self, FitRunner, ParsGuessGenerator};

/// Progress of a bootstrapper, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Created,
    /// PSF mixtures attached to every surviving epoch
    PsfFit,
    FluxMeasured,
    /// Maximum-likelihood galaxy fit accepted
    GalaxyFit,
    /// Importance or prior-sample refinement done
    Sampled,
    Metacaled,
}

/// Per-band PSF template fluxes.
///
/// Bands whose solve failed carry a non-zero flag, [`FLUX_SENTINEL`] and
/// [`FLUX_ERR_SENTINEL`].
#[derive(Debug, Clone, PartialEq)]
pub struct PsfFluxResult {
    /// Solver flags, one per band
    pub flags: Vec<u32>,
    pub psf_flux: Vec<f64>,
    pub psf_flux_err: Vec<f64>,
}

impl PsfFluxResult {
    /// Fluxes usable as a galaxy guess: failed bands take the mean of the measured
    /// bands, or `1.0` when none was measured.
    pub fn guess_fluxes(&self) -> Vec<f64> {
        let good: Vec<f64> = self
            .flags
            .iter()
            .zip(&self.psf_flux)
            .filter(|(f, _)| **f == 0)
            .map(|(_, v)| *v)
            .collect();
        let fallback = if good.is_empty() {
            1.0
        } else {
            good.iter().sum::<f64>() / good.len() as f64
        };
        self.flags
            .iter()
            .zip(&self.psf_flux)
            .map(|(f, v)| if *f == 0 { *v } else { fallback })
            .collect()
    }
}

/// Sequential PSF → flux → galaxy fitting of one object.
pub struct Bootstrapper {
    mb_obs_list_orig: MultiBandObsList,
    mb_obs_list: MultiBandObsList,
    mb_obs_list_old: Option<MultiBandObsList>,
    backend: Arc<dyn FitBackend>,
    rng: StdRng,
    stage: Stage,
    psf_flux_res: Option<PsfFluxResult>,
    max_fitter: Option<MaxFit>,
    isampler: Option<ISampler>,
    psampler: Option<PSampler>,
}

/// The galaxy solver kept after a successful maximum-likelihood stage.
struct MaxFit {
    model: GalaxyModel,
    solver: Box<dyn GalaxySolver>,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("nband", &self.mb_obs_list.len())
            .field("stage", &self.stage)
            .field("psf_flux_res", &self.psf_flux_res)
            .field("max_model", &self.max_fitter.as_ref().map(|m| m.model))
            .finish_non_exhaustive()
    }
}

impl Bootstrapper {
    /// Bootstrapper over a single observation, one band's epochs or a multi-band set.
    ///
    /// Uses the [`NativeBackend`] and an OS-seeded generator; see
    /// [`with_backend`](Self::with_backend) and [`with_seed`](Self::with_seed).
    ///
    /// # Arguments
    ///
    /// * `obs` - anything convertible to [`ObsInput`]: an [`Observation`], an `ObsList` of
    ///   epochs or a `[band][epoch]` list
    ///
    /// # Return
    ///
    /// [`BootError::InvalidParameter`] when the set has no band. Missing PSF observations are
    /// only reported by [`fit_psfs`](Self::fit_psfs).
    pub fn new(obs: impl Into<ObsInput>) -> Result<Self, BootError> {
        let mbo = obs.into().into_multi_band();
        if mbo.is_empty() {
            return Err(BootError::InvalidParameter(
                "observation set has no bands".into(),
            ));
        }
        Ok(Bootstrapper {
            mb_obs_list_orig: mbo.clone(),
            mb_obs_list: mbo,
            mb_obs_list_old: None,
            backend: Arc::new(NativeBackend),
            rng: StdRng::from_os_rng(),
            stage: Stage::Created,
            psf_flux_res: None,
            max_fitter: None,
            isampler: None,
            psampler: None,
        })
    }

    /// Swap the solver implementations used by every stage.
    ///
    /// # Arguments
    ///
    /// * `backend` - factory of the PSF, galaxy and flux solvers; the default is
    ///   [`NativeBackend`]
    ///
    /// # See also
    ///
    /// * [`FitBackend`] for the solver families a backend provides
    pub fn with_backend(mut self, backend: Arc<dyn FitBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Seed the generator feeding every guesser, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Use `rng` for every guesser.
    ///
    /// Metacal runs hand each variant a generator forked from the parent's, so a seeded
    /// parent reproduces all of its variants.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Furthest stage reached since the last PSF fit.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Shared handle on the solver backend.
    pub fn backend(&self) -> Arc<dyn FitBackend> {
        self.backend.clone()
    }

    /// The caller's observations, untouched.
    pub fn mb_obs_list_orig(&self) -> &MultiBandObsList {
        &self.mb_obs_list_orig
    }

    /// The working observations, annotated by the stages run so far.
    pub fn mb_obs_list(&self) -> &MultiBandObsList {
        &self.mb_obs_list
    }

    /// Working set in place before the last non-inplace masked-pixel repair.
    pub fn mb_obs_list_old(&self) -> Option<&MultiBandObsList> {
        self.mb_obs_list_old.as_ref()
    }

    pub(crate) fn mb_obs_list_mut(&mut self) -> &mut MultiBandObsList {
        &mut self.mb_obs_list
    }

    /// Consume the bootstrapper, keeping the working observations.
    pub fn into_mb_obs_list(self) -> MultiBandObsList {
        self.mb_obs_list
    }

    pub(crate) fn not_reached(&self, needed: Stage) -> BootError {
        BootError::StageNotReached {
            needed,
            current: self.stage,
        }
    }

    pub(crate) fn advance(&mut self, stage: Stage) {
        self.stage = self.stage.max(stage);
    }

    /// Drop every result computed from the previous PSFs and return to [`Stage::PsfFit`].
    fn reset_downstream(&mut self) {
        self.psf_flux_res = None;
        self.max_fitter = None;
        self.isampler = None;
        self.psampler = None;
        self.stage = Stage::PsfFit;
    }

    /// Fresh generator for one runner, drawn from the bootstrapper's generator.
    pub(crate) fn fork_rng(&mut self) -> StdRng {
        StdRng::from_rng(&mut self.rng)
    }

    // ---------------------------------------------------------------------------------------------
    // PSF stage
    // ---------------------------------------------------------------------------------------------

    /// Fit the PSF of every epoch and keep the epochs whose fit succeeded.
    ///
    /// With `skip_failed`, an epoch whose fit fails (or whose PSF flux s/n is below
    /// `min_s2n`) is dropped from the working list; otherwise the error propagates and
    /// the working list is left unchanged. Fails when no epoch survives.
    ///
    /// On success every downstream result (fluxes, galaxy fit, samplers) is discarded and
    /// the stage returns to [`Stage::PsfFit`]: those results describe the previous PSFs.
    ///
    /// # Arguments
    ///
    /// * `model` - solver family and component count, decoded from names like `"em3"`,
    ///   `"coellip2"`, `"gauss"` or `"am"`
    /// * `params` - size guess (fixed or from metadata), retries, solver settings and the
    ///   skip, normalization and s/n options
    ///
    /// # Errors
    ///
    /// * [`BootError::MissingPsf`] when an epoch has no PSF observation
    /// * [`BootError::PsfFailure`] when a band has no epochs or no fit survives
    /// * [`BootError::InvalidParameter`] when `params.fit_pars` belongs to another solver
    ///   family or a metadata key is missing
    ///
    /// # See also
    ///
    /// * [`AdmomBootstrapper::fit_psfs`](crate::admom_boot::AdmomBootstrapper::fit_psfs) for the
    ///   adaptive-moment flavor
    pub fn fit_psfs(&mut self, model: PsfModel, params: &PsfFitParams) -> Result<(), BootError> {
        params.validate()?;

        for (band, obs_list) in self.mb_obs_list.iter().enumerate() {
            if obs_list.is_empty() {
                return Err(BootError::PsfFailure(format!("no epochs for band {band}")));
            }
            if let Some(epoch) = obs_list.iter().position(|o| !o.has_psf()) {
                return Err(BootError::MissingPsf { band, epoch });
            }
        }

        let mut ntot = 0;
        let mut new_mbo = MultiBandObsList::with_capacity(self.mb_obs_list.len());
        for (band, obs_list) in self.mb_obs_list.iter().enumerate() {
            let mut new_list = Vec::with_capacity(obs_list.len());
            for (epoch, obs) in obs_list.iter().enumerate() {
                let mut obs = obs.clone();
                let fitted = fit_epoch_psf(
                    &self.backend,
                    &mut self.rng,
                    model,
                    &mut obs,
                    (band, epoch),
                    params,
                );
                match fitted {
                    Ok(true) => {
                        new_list.push(obs);
                        ntot += 1;
                    }
                    Ok(false) => {}
                    Err(err) if params.skip_failed && err.is_psf_failure() => {
                        info!("failed psf fit band {band} obs {epoch}: '{err}'. skipping observation");
                    }
                    Err(err) => return Err(err),
                }
            }
            new_mbo.push(new_list);
        }

        if ntot == 0 {
            return Err(BootError::PsfFailure("no psf fits succeeded".into()));
        }

        self.mb_obs_list = new_mbo;
        self.reset_downstream();
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Flux stage
    // ---------------------------------------------------------------------------------------------

    /// Measure each band's flux with its PSF mixtures as template.
    ///
    /// A band with no epochs is fatal; a band whose solve fails is logged and reported
    /// with a non-zero flag and sentinel values.
    ///
    /// # Arguments
    ///
    /// * `normalize` - rescale each PSF mixture to unit flux before using it as template
    ///
    /// # Errors
    ///
    /// * [`BootError::MissingPsfGmix`] when the PSF stage has not attached a mixture
    /// * [`BootError::PsfFailure`] when a band lost all of its epochs
    pub fn fit_gal_psf_flux(&mut self, normalize: bool) -> Result<(), BootError> {
        let nband = self.mb_obs_list.len();
        let mut res = PsfFluxResult {
            flags: Vec::with_capacity(nband),
            psf_flux: vec![FLUX_SENTINEL; nband],
            psf_flux_err: vec![FLUX_ERR_SENTINEL; nband],
        };

        for (band, obs_list) in self.mb_obs_list.iter().enumerate() {
            if obs_list.is_empty() {
                return Err(BootError::PsfFailure(format!("no epochs for band {band}")));
            }
            if !obs_list.iter().all(|o| o.has_psf_gmix()) {
                return Err(BootError::MissingPsfGmix { band });
            }

            let mut fitter = self.backend.template_flux(TemplateSource::Psf { normalize });
            fitter.go(obs_list)?;
            let fres = fitter.result();

            res.flags.push(fres.flags);
            if fres.flags == 0 {
                res.psf_flux[band] = fres.flux.first().copied().unwrap_or(FLUX_SENTINEL);
                res.psf_flux_err[band] =
                    fres.flux_err.first().copied().unwrap_or(FLUX_ERR_SENTINEL);
            } else {
                warn!(
                    "failed to fit psf flux for band {band}: {}",
                    flagstr(fres.flags)
                );
            }
        }

        self.psf_flux_res = Some(res);
        self.advance(Stage::FluxMeasured);
        Ok(())
    }

    /// Per-band PSF fluxes of the last flux stage.
    ///
    /// # Errors
    ///
    /// [`BootError::StageNotReached`] when [`fit_gal_psf_flux`](Self::fit_gal_psf_flux) has
    /// not run since the last PSF fit.
    pub fn psf_flux_result(&self) -> Result<&PsfFluxResult, BootError> {
        self.psf_flux_res
            .as_ref()
            .ok_or_else(|| self.not_reached(Stage::FluxMeasured))
    }

    /// Flux stage result, running the stage with normalized templates when it is missing.
    fn ensure_psf_flux(&mut self) -> Result<&PsfFluxResult, BootError> {
        if self.psf_flux_res.is_none() {
            self.fit_gal_psf_flux(true)?;
        }
        self.psf_flux_result()
    }

    // ---------------------------------------------------------------------------------------------
    // Galaxy stage
    // ---------------------------------------------------------------------------------------------

    /// Maximum-likelihood fit of `model` over every band and epoch.
    ///
    /// The guess is `params.guess` when given, else built from the PSF size of the first
    /// epoch and the PSF template fluxes, with center and shape drawn from `prior` when
    /// one is given. The bulge + disk models require a prior.
    ///
    /// # Arguments
    ///
    /// * `model` - `gauss`, `exp`, `dev`, `bdf` or `bd`
    /// * `params` - retries, solver settings and an optional explicit guess
    /// * `prior` - added to the likelihood and used to draw the center and shape guesses
    ///
    /// # Errors
    ///
    /// * [`BootError::GalFailure`] when every attempt failed; the flags are those of the last
    ///   attempt
    /// * [`BootError::InvalidParameter`] for a guess of the wrong length or a bulge + disk
    ///   model without prior
    ///
    /// # See also
    ///
    /// * [`fit_max_fix_t`](Self::fit_max_fix_t), [`fit_max_gonly`](Self::fit_max_gonly)
    /// * [`max_fitter`](Self::max_fitter) to read the result
    pub fn fit_max(
        &mut self,
        model: GalaxyModel,
        params: &MaxFitParams,
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<(), BootError> {
        params.validate()?;
        let guesser = self.max_guesser(model, params, prior.clone())?;
        self.run_max(model, params, prior, FixedPars::new(), guesser)
    }

    /// Bulge + disk fit, `[c1, c2, g1, g2, T, fracdev, F...]`.
    ///
    /// The prior must cover the bdf layout, e.g. a
    /// [`JointPrior::bdf`](crate::priors::JointPrior::bdf).
    pub fn fit_bdf(&mut self, params: &MaxFitParams, prior: Arc<dyn Prior>) -> Result<(), BootError> {
        params.validate()?;
        let guesser = self.max_guesser(GalaxyModel::Bdf, params, Some(prior.clone()))?;
        self.run_max(GalaxyModel::Bdf, params, Some(prior), FixedPars::new(), guesser)
    }

    /// Two-size bulge + disk fit, `[c1, c2, g1, g2, T, log10(Tbulge/T), fracdev, F...]`.
    ///
    /// # Arguments
    ///
    /// * `params` - retries, solver settings and an optional explicit guess
    /// * `prior` - a [`JointPrior::bd`](crate::priors::JointPrior::bd) or any prior over the
    ///   same layout
    ///
    /// # See also
    ///
    /// * [`fit_bdf`](Self::fit_bdf) for the single-size variant
    pub fn fit_bd(&mut self, params: &MaxFitParams, prior: Arc<dyn Prior>) -> Result<(), BootError> {
        params.validate()?;
        let guesser = self.max_guesser(GalaxyModel::Bd, params, Some(prior.clone()))?;
        self.run_max(GalaxyModel::Bd, params, Some(prior), FixedPars::new(), guesser)
    }

    /// Maximum-likelihood fit with the size held at `t`.
    ///
    /// The guess is built as in [`fit_max`](Self::fit_max); its size entry is ignored by
    /// the solver.
    pub fn fit_max_fix_t(
        &mut self,
        model: GalaxyModel,
        params: &MaxFitParams,
        t: f64,
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<(), BootError> {
        params.validate()?;
        let mut fixed: FixedPars = vec![None; model.npars(self.mb_obs_list.len())];
        fixed[4] = Some(t);
        let guesser = self.max_guesser(model, params, prior.clone())?;
        self.run_max(model, params, prior, fixed, guesser)
    }

    /// Shape-only fit: every parameter but `g1, g2` is held at its value in `pars_in`.
    ///
    /// Guesses are drawn from `prior` when one is given.
    pub fn fit_max_gonly(
        &mut self,
        model: GalaxyModel,
        params: &MaxFitParams,
        pars_in: &[f64],
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<(), BootError> {
        params.validate()?;
        let npars = model.npars(self.mb_obs_list.len());
        if pars_in.len() != npars {
            return Err(BootError::InvalidParameter(format!(
                "shape-only fit needs {npars} parameters, got {}",
                pars_in.len()
            )));
        }
        let fixed: FixedPars = pars_in
            .iter()
            .enumerate()
            .map(|(i, p)| (i != 2 && i != 3).then_some(*p))
            .collect();

        let guesser: ParsGuessGenerator = match &prior {
            Some(p) => Box::new(PriorSampleGuesser::new(p.clone(), self.fork_rng())),
            None => self.max_guesser(model, params, None)?,
        };
        self.run_max(model, params, prior, fixed, guesser)
    }

    fn run_max(
        &mut self,
        model: GalaxyModel,
        params: &MaxFitParams,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
        guesser: ParsGuessGenerator,
    ) -> Result<(), BootError> {
        let mut runner = match (model, prior) {
            (GalaxyModel::Bdf, Some(prior)) if fixed.is_empty() => runners::bdf_runner(
                self.backend.clone(),
                params.lm_pars,
                prior,
                guesser,
                params.ntry,
            )?,
            (GalaxyModel::Bd, Some(prior)) if fixed.is_empty() => runners::bd_runner(
                self.backend.clone(),
                params.lm_pars,
                prior,
                guesser,
                params.ntry,
            )?,
            (GalaxyModel::Bdf | GalaxyModel::Bd, None) => {
                return Err(BootError::InvalidParameter(format!(
                    "the {model} model requires a prior"
                )))
            }
            (model, prior) => runners::max_runner(
                self.backend.clone(),
                model,
                params.lm_pars,
                prior,
                fixed,
                guesser,
                params.ntry,
            )?,
        };
        let solver = runner.go(&self.mb_obs_list, None)?;
        self.accept_max(model, solver)
    }

    fn accept_max(
        &mut self,
        model: GalaxyModel,
        solver: Box<dyn GalaxySolver>,
    ) -> Result<(), BootError> {
        let flags = solver.result().flags;
        if flags != 0 {
            return Err(BootError::gal("failed to fit galaxy with maxlike", flags));
        }
        self.max_fitter = Some(MaxFit { model, solver });
        self.isampler = None;
        self.psampler = None;
        self.advance(Stage::GalaxyFit);
        Ok(())
    }

    fn max_guesser(
        &mut self,
        model: GalaxyModel,
        params: &MaxFitParams,
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<ParsGuessGenerator, BootError> {
        let nband = self.mb_obs_list.len();

        if let Some(guess) = &params.guess {
            let npars = model.npars(nband);
            if guess.len() != npars {
                return Err(BootError::InvalidParameter(format!(
                    "{model} guess needs {npars} parameters, got {}",
                    guess.len()
                )));
            }
            let widths = params
                .guess_widths
                .as_ref()
                .map(|w| DVector::from_column_slice(w));
            let guesser =
                ParsGuesser::new(DVector::from_column_slice(guess), widths, self.fork_rng())?;
            return Ok(Box::new(guesser));
        }

        let fluxes = self.ensure_psf_flux()?.guess_fluxes();
        let psf_t = self
            .mb_obs_list
            .first()
            .and_then(|l| l.first())
            .and_then(Observation::psf_gmix)
            .map(GMix::t)
            .ok_or(BootError::MissingPsfGmix { band: 0 })?;
        let rng = self.fork_rng();

        let guesser: ParsGuessGenerator = match (model, prior) {
            (GalaxyModel::Bdf, Some(prior)) => Box::new(BdfGuesser::new(psf_t, fluxes, prior, rng)),
            (GalaxyModel::Bd, Some(prior)) => Box::new(BdGuesser::new(psf_t, fluxes, prior, rng)),
            (GalaxyModel::Bdf | GalaxyModel::Bd, None) => {
                return Err(BootError::InvalidParameter(format!(
                    "the {model} model requires a prior"
                )))
            }
            (_, Some(prior)) => Box::new(TFluxAndPriorGuesser::new(psf_t, fluxes, prior, rng)),
            (_, None) => Box::new(TFluxGuesser::new(psf_t, fluxes, rng)),
        };
        Ok(guesser)
    }

    /// The galaxy solver of the last successful maximum-likelihood stage.
    pub fn max_fitter(&self) -> Result<&dyn GalaxySolver, BootError> {
        self.max_fitter
            .as_ref()
            .map(|m| m.solver.as_ref())
            .ok_or_else(|| self.not_reached(Stage::GalaxyFit))
    }

    /// Model of the last successful maximum-likelihood stage.
    pub fn max_model(&self) -> Result<GalaxyModel, BootError> {
        self.max_fitter
            .as_ref()
            .map(|m| m.model)
            .ok_or_else(|| self.not_reached(Stage::GalaxyFit))
    }

    // ---------------------------------------------------------------------------------------------
    // Refinements of the galaxy fit
    // ---------------------------------------------------------------------------------------------

    /// Iterated importance sampling around the maximum-likelihood fit.
    ///
    /// Each entry of `params.nsample` is one iteration; the proposal of an iteration is
    /// centered on the weighted mean and covariance of the previous one. Samples are
    /// weighted by the fitter's log posterior, plus `prior` when given.
    ///
    /// # Arguments
    ///
    /// * `params` - sample counts per iteration, Student-t degrees of freedom and the error
    ///   floor and ceiling of the proposal
    /// * `prior` - extra prior multiplied into the weights
    ///
    /// # Errors
    ///
    /// * [`BootError::StageNotReached`] before a galaxy fit
    /// * [`BootError::GalFailure`] when an iteration ends with no usable weight or a
    ///   covariance that cannot be factored
    ///
    /// # See also
    ///
    /// * [`isampler`](Self::isampler)
    pub fn isample(
        &mut self,
        params: &IsampleParams,
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<(), BootError> {
        params.validate()?;
        let current = self.stage;
        let max = self.max_fitter.as_ref().ok_or(BootError::StageNotReached {
            needed: Stage::GalaxyFit,
            current,
        })?;
        let model_name = max.model.to_string();
        let nshape = max.model.nshape();
        let data = &self.mb_obs_list;

        let mut mean = max.solver.result().pars.clone();
        let mut cov = max.solver.result().pars_cov.clone();
        let mut sampler = None;

        for (iter, &nsample) in params.nsample.iter().enumerate() {
            let mut s = ISampler::new(
                mean,
                &cov,
                params.df,
                params.min_err.as_deref(),
                params.max_err.as_deref(),
                params.ifactor,
            )
            .map_err(|err| match err {
                BootError::LinAlg(msg) => BootError::gal(format!("isampling failed: {msg}"), 0),
                other => other,
            })?;
            s.make_samples(nsample, &mut self.rng)?;
            s.set_iweights(|p| {
                let lnp = max.solver.ln_prob(data, p)?;
                match &prior {
                    Some(prior) => Ok(lnp + prior.ln_prob(p.as_slice())?),
                    None => Ok(lnp),
                }
            })?;
            s.calc_result(&model_name, nshape);

            let res = s.result();
            info!(
                "isample iteration {}: {nsample} samples, efficiency {:.3}",
                iter + 1,
                res.efficiency.unwrap_or(0.0)
            );
            if res.flags != 0 {
                return Err(BootError::gal("isampling failed", res.flags));
            }
            mean = res.pars.clone();
            cov = res.pars_cov.clone();
            sampler = Some(s);
        }

        self.isampler = sampler;
        self.advance(Stage::Sampled);
        Ok(())
    }

    /// Importance sampler of the last [`isample`](Self::isample) run.
    ///
    /// # Return
    ///
    /// The sampler with its draws, weights and weighted summary, or
    /// [`BootError::StageNotReached`] when no sampling ran since the last galaxy fit.
    pub fn isampler(&self) -> Result<&ISampler, BootError> {
        self.isampler
            .as_ref()
            .ok_or_else(|| self.not_reached(Stage::Sampled))
    }

    /// Reweight draws from a prior by the fitter's log likelihood.
    ///
    /// The draws already follow the prior, so the fitter's own prior is left out of the
    /// weights.
    ///
    /// Only draws within `nsigma` errors of the maximum-likelihood fit in every
    /// parameter are used. The sampler is kept even when no weight survives.
    ///
    /// # Arguments
    ///
    /// * `params` - half-width of the acceptance window, in units of the fit errors
    /// * `samples` - draws from the prior, each laid out like the galaxy parameters
    ///
    /// # Errors
    ///
    /// * [`BootError::StageNotReached`] before a galaxy fit
    /// * [`BootError::InvalidParameter`] for draws of the wrong length
    /// * [`BootError::GalFailure`] when no draw keeps a positive weight
    pub fn psample(&mut self, params: &PsampleParams, samples: &[Vec<f64>]) -> Result<(), BootError> {
        params.validate()?;
        let current = self.stage;
        let max = self.max_fitter.as_ref().ok_or(BootError::StageNotReached {
            needed: Stage::GalaxyFit,
            current,
        })?;
        let res = max.solver.result();
        let data = &self.mb_obs_list;

        let mut sampler = PSampler::new(&res.pars, &res.pars_err, samples, params.nsigma)?;
        info!("psample: {} of {} prior draws in window", sampler.nuse(), samples.len());
        sampler.calc_loglikes(&max.model.to_string(), max.model.nshape(), |p| {
            max.solver.ln_like(data, p)
        })?;

        let flags = sampler.result().flags;
        self.psampler = Some(sampler);
        if flags != 0 {
            return Err(BootError::gal("psampling failed", flags));
        }
        self.advance(Stage::Sampled);
        Ok(())
    }

    /// Reweighting sampler of the last [`psample`](Self::psample) run.
    ///
    /// The sampler is kept even when every weight vanished; its result then carries the
    /// failure flags.
    ///
    /// # See also
    ///
    /// * [`isampler`](Self::isampler)
    pub fn psampler(&self) -> Result<&PSampler, BootError> {
        self.psampler
            .as_ref()
            .ok_or_else(|| self.not_reached(Stage::Sampled))
    }

    /// Replace the maximum-likelihood covariance by a numerical estimate.
    ///
    /// Best effort: when the estimate fails the previous covariance is kept and the
    /// failure is logged. A fit that was successful before stays successful.
    ///
    /// # Arguments
    ///
    /// * `params` - step sizes of the finite differences, see [`CovParams`]
    ///
    /// # Errors
    ///
    /// Only [`BootError::StageNotReached`] and invalid `params`; solver trouble is absorbed.
    pub fn try_replace_cov(&mut self, params: &CovParams) -> Result<(), BootError> {
        params.validate()?;
        let current = self.stage;
        let max = self.max_fitter.as_mut().ok_or(BootError::StageNotReached {
            needed: Stage::GalaxyFit,
            current,
        })?;

        let before = max.solver.result().flags;
        max.solver.calc_cov(&self.mb_obs_list, params.h, params.m)?;

        let res = max.solver.result_mut();
        if res.flags != before {
            warn!("cov replacement failed: {}", flagstr(res.flags));
            if before == 0 {
                res.flags = 0;
                res.flagstr.clear();
            }
        }
        Ok(())
    }

    /// Fill masked and zero-weight pixels with the best-fit model.
    ///
    /// Uses `fitter` when given, else the maximum-likelihood fitter. Unless `inplace`,
    /// the repair is made on a copy and the previous working set is kept as
    /// [`mb_obs_list_old`](Self::mb_obs_list_old).
    ///
    /// # Return
    ///
    /// The number of pixels replaced over every band and epoch.
    ///
    /// # Errors
    ///
    /// [`BootError::StageNotReached`] when no fitter is given and no galaxy fit was made.
    pub fn replace_masked_pixels(
        &mut self,
        inplace: bool,
        fitter: Option<&dyn GalaxySolver>,
        add_noise: bool,
    ) -> Result<usize, BootError> {
        let current = self.stage;
        let fitter: &dyn GalaxySolver = match fitter {
            Some(f) => f,
            None => self
                .max_fitter
                .as_ref()
                .map(|m| m.solver.as_ref())
                .ok_or(BootError::StageNotReached {
                    needed: Stage::GalaxyFit,
                    current,
                })?,
        };

        if inplace {
            let nrep =
                masked::replace_masked_pixels(&mut self.mb_obs_list, fitter, add_noise, &mut self.rng)?;
            self.mb_obs_list_old = None;
            Ok(nrep)
        } else {
            let mut repaired = self.mb_obs_list.clone();
            let nrep = masked::replace_masked_pixels(&mut repaired, fitter, add_noise, &mut self.rng)?;
            self.mb_obs_list_old = Some(std::mem::replace(&mut self.mb_obs_list, repaired));
            Ok(nrep)
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Per-epoch PSF fit
// -------------------------------------------------------------------------------------------------

/// Fit one epoch's PSF and attach the mixture.
///
/// Returns `Ok(false)` when the epoch is dropped without a fit because its PSF carries
/// an earlier failed result.
pub(crate) fn fit_epoch_psf(
    backend: &Arc<dyn FitBackend>,
    rng: &mut StdRng,
    model: PsfModel,
    obs: &mut Observation,
    (band, epoch): (usize, usize),
    params: &PsfFitParams,
) -> Result<bool, BootError> {
    let psf = obs
        .psf
        .as_deref_mut()
        .ok_or(BootError::MissingPsf { band, epoch })?;

    if params.skip_already_done {
        if psf.has_gmix() {
            return Ok(true);
        }
        if let Some(prev) = psf.fit_result.as_ref().filter(|r| r.flags != 0) {
            info!(
                "band {band} obs {epoch}: psf already failed ({}), dropping",
                prev.flagstr
            );
            return Ok(false);
        }
    }

    let tguess = match (&params.tguess_key, params.tguess) {
        (Some(key), _) => psf.meta_value(key)?,
        (None, Some(t)) => t,
        (None, None) => 4.0 * psf.jacobian.scale(),
    };

    let (result, gmix) = run_psf_model(backend, rng, model, psf, tguess, params)?;
    let flags = result.flags;
    let flux_s2n = result.flux_ratio().unwrap_or(0.0);
    psf.fit_result = Some(result);

    if flags != 0 {
        return Err(BootError::PsfFailure(format!(
            "psf fit failed: {}",
            flagstr(flags)
        )));
    }
    let mut gmix = gmix
        .ok_or_else(|| BootError::PsfFailure("psf fit produced no mixture".into()))?;

    if let Some(key) = &params.norm_key {
        let norm = psf.meta_value(key)?;
        gmix.set_psum(norm)
            .map_err(|err| BootError::PsfFailure(err.to_string()))?;
    }

    if let Some(min_s2n) = params.min_s2n {
        if flux_s2n < min_s2n {
            return Err(BootError::PsfLowS2n {
                s2n: flux_s2n,
                min_s2n,
            });
        }
    }

    psf.gmix = Some(gmix);
    Ok(true)
}

fn family_mismatch(model: PsfModel, pars: &SolverPars) -> BootError {
    BootError::InvalidParameter(format!(
        "psf model {model} cannot use solver settings {pars:?}"
    ))
}

/// Dispatch to the runner of the model's solver family.
fn run_psf_model(
    backend: &Arc<dyn FitBackend>,
    rng: &mut StdRng,
    model: PsfModel,
    psf: &Observation,
    tguess: f64,
    params: &PsfFitParams,
) -> Result<(FitResult, Option<GMix>), BootError> {
    let ntry = params.ntry;
    let fork = StdRng::from_rng(rng);
    let backend = backend.clone();

    match model {
        PsfModel::Em(ngauss) => {
            let pars = match params.fit_pars {
                None => EmPars::default(),
                Some(SolverPars::Em(p)) => p,
                Some(ref other) => return Err(family_mismatch(model, other)),
            };
            finish_psf(runners::em_psf_runner(backend, ngauss, tguess, pars, ntry, fork)?, psf)
        }
        PsfModel::Coellip(ngauss) => {
            let pars = lm_pars_for(model, params)?;
            finish_psf(
                runners::coellip_psf_runner(backend, psf, ngauss, tguess, pars, ntry, fork)?,
                psf,
            )
        }
        PsfModel::LeastSquares(simple) => {
            let pars = lm_pars_for(model, params)?;
            finish_psf(
                runners::lm_psf_runner(backend, psf, simple, tguess, pars, ntry, fork)?,
                psf,
            )
        }
        PsfModel::AdaptiveMoment => {
            let pars = match params.fit_pars {
                None => AdmomPars::default(),
                Some(SolverPars::Admom(p)) => p,
                Some(ref other) => return Err(family_mismatch(model, other)),
            };
            let scale = psf.jacobian.scale();
            finish_psf(
                runners::admom_psf_runner(backend, tguess, scale, pars, ntry, fork)?,
                psf,
            )
        }
    }
}

fn lm_pars_for(model: PsfModel, params: &PsfFitParams) -> Result<LmPars, BootError> {
    match params.fit_pars {
        None => Ok(LmPars::default()),
        Some(SolverPars::Lm(p)) => Ok(p),
        Some(ref other) => Err(family_mismatch(model, other)),
    }
}

fn finish_psf<G, S>(
    mut runner: FitRunner<G, S>,
    psf: &Observation,
) -> Result<(FitResult, Option<GMix>), BootError>
where
    G: GuessGenerator,
    S: Solver<Data = Observation, Guess = G::Guess>,
{
    let solver = runner.go(psf, None)?;
    let result = solver.result().clone();
    if result.flags != 0 {
        return Ok((result, None));
    }
    let gmix = solver
        .gmix()
        .map_err(|err| BootError::PsfFailure(err.to_string()))?;
    Ok((result, Some(gmix)))
}

/// Weighted mean PSF `(g1, g2)` and `T` over every epoch, weighted by each
/// observation's weight sum.
pub fn psf_shape_stats(mbo: &MultiBandObsList) -> Result<([f64; 2], f64), BootError> {
    let mut wsum = 0.0;
    let mut gsum = [0.0; 2];
    let mut tsum = 0.0;
    for (band, obs_list) in mbo.iter().enumerate() {
        for obs in obs_list {
            let gm = obs.psf_gmix().ok_or(BootError::MissingPsfGmix { band })?;
            let (g1, g2, t) = gm.g1g2t()?;
            let w = obs.weight_sum();
            wsum += w;
            gsum[0] += g1 * w;
            gsum[1] += g2 * w;
            tsum += t * w;
        }
    }
    if !(wsum > 0.0) {
        return Err(BootError::InvalidParameter(
            "observations have no weight for the psf statistics".into(),
        ));
    }
    Ok(([gsum[0] / wsum, gsum[1] / wsum], tsum / wsum))
}

#[cfg(test)]
mod bootstrap_tests {
    use super::*;
    use crate::gmix::model::simple_gmix;
    use crate::jacobian::Jacobian;
    use crate::models::SimpleModel;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    const SCALE: f64 = 0.263;

    fn gauss(t: f64, flux: f64) -> GMix {
        simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, t, flux]).unwrap()
    }

    fn psf_obs(t: f64) -> Observation {
        let jac = Jacobian::diagonal(SCALE, 12.0, 12.0);
        Observation::new(gauss(t, 1.0).make_image(25, 25, &jac), jac)
    }

    fn galaxy_obs(flux: f64) -> Observation {
        let jac = Jacobian::diagonal(SCALE, 12.0, 12.0);
        let psf = gauss(0.27, 1.0);
        let image = gauss(0.3, flux).convolve(&psf).unwrap().make_image(25, 25, &jac);
        Observation::new(image, jac).with_psf(psf_obs(0.27))
    }

    fn psf_params() -> PsfFitParams {
        PsfFitParams::builder().tguess(0.3).ntry(4).build().unwrap()
    }

    #[test]
    fn test_accessors_before_stages() {
        let boot = Bootstrapper::new(galaxy_obs(100.0)).unwrap();
        assert_eq!(boot.stage(), Stage::Created);
        assert_eq!(
            boot.max_fitter().err(),
            Some(BootError::StageNotReached {
                needed: Stage::GalaxyFit,
                current: Stage::Created
            })
        );
        assert!(boot.isampler().is_err());
        assert!(boot.psampler().is_err());
        assert_eq!(
            boot.psf_flux_result().err(),
            Some(BootError::StageNotReached {
                needed: Stage::FluxMeasured,
                current: Stage::Created
            })
        );
    }

    #[test]
    fn test_flux_accessor_does_not_run_the_stage() {
        let mut boot = Bootstrapper::new(galaxy_obs(100.0)).unwrap().with_seed(4);
        boot.fit_psfs("gauss".parse().unwrap(), &psf_params()).unwrap();
        assert!(matches!(
            boot.psf_flux_result(),
            Err(BootError::StageNotReached {
                needed: Stage::FluxMeasured,
                current: Stage::PsfFit
            })
        ));
        assert_eq!(boot.stage(), Stage::PsfFit);
    }

    #[test]
    fn test_missing_psf_is_reported() {
        let jac = Jacobian::diagonal(SCALE, 12.0, 12.0);
        let obs = Observation::new(DMatrix::zeros(25, 25), jac);
        let mut boot = Bootstrapper::new(obs).unwrap();
        let err = boot.fit_psfs("gauss".parse().unwrap(), &psf_params());
        assert_eq!(err, Err(BootError::MissingPsf { band: 0, epoch: 0 }));
    }

    #[test]
    fn test_flux_stage_requires_psf_gmix() {
        let mut boot = Bootstrapper::new(galaxy_obs(100.0)).unwrap();
        assert_eq!(
            boot.fit_gal_psf_flux(true),
            Err(BootError::MissingPsfGmix { band: 0 })
        );
    }

    #[test]
    fn test_psf_then_flux() {
        let mut boot = Bootstrapper::new(galaxy_obs(100.0)).unwrap().with_seed(3);
        boot.fit_psfs("gauss".parse().unwrap(), &psf_params()).unwrap();
        assert_eq!(boot.stage(), Stage::PsfFit);

        let psf = boot.mb_obs_list()[0][0].psf.as_ref().unwrap();
        assert!(psf.fit_result.as_ref().unwrap().is_ok());
        assert_relative_eq!(psf.gmix.as_ref().unwrap().t(), 0.27, max_relative = 1e-3);
        assert!(!boot.mb_obs_list_orig()[0][0].has_psf_gmix());

        boot.fit_gal_psf_flux(true).unwrap();
        let res = boot.psf_flux_result().unwrap().clone();
        assert_eq!(res.flags, vec![0]);
        assert!(res.psf_flux[0] > 0.0);
        assert_eq!(boot.stage(), Stage::FluxMeasured);
    }

    #[test]
    fn test_low_s2n_psf_is_dropped_or_raised() {
        let params = PsfFitParams::builder()
            .tguess(0.3)
            .min_s2n(1.0e12)
            .build()
            .unwrap();
        let mut boot = Bootstrapper::new(vec![galaxy_obs(100.0), galaxy_obs(50.0)]).unwrap();
        assert_eq!(
            boot.fit_psfs("gauss".parse().unwrap(), &params),
            Err(BootError::PsfFailure("no psf fits succeeded".into()))
        );

        let strict = PsfFitParams {
            skip_failed: false,
            ..params
        };
        let err = boot.fit_psfs("gauss".parse().unwrap(), &strict).unwrap_err();
        assert!(matches!(err, BootError::PsfLowS2n { .. }));
        assert!(!boot.mb_obs_list()[0][0].has_psf_gmix());
    }

    #[test]
    fn test_solver_family_mismatch() {
        let params = PsfFitParams::builder()
            .tguess(0.3)
            .fit_pars(SolverPars::Admom(AdmomPars::default()))
            .build()
            .unwrap();
        let mut boot = Bootstrapper::new(galaxy_obs(100.0)).unwrap();
        let err = boot.fit_psfs("gauss".parse().unwrap(), &params).unwrap_err();
        assert!(matches!(err, BootError::InvalidParameter(_)));
    }

    #[test]
    fn test_guess_fluxes_fallback() {
        let res = PsfFluxResult {
            flags: vec![0, 4, 0],
            psf_flux: vec![10.0, FLUX_SENTINEL, 30.0],
            psf_flux_err: vec![1.0, FLUX_ERR_SENTINEL, 1.0],
        };
        assert_eq!(res.guess_fluxes(), vec![10.0, 20.0, 30.0]);

        let none = PsfFluxResult {
            flags: vec![4],
            psf_flux: vec![FLUX_SENTINEL],
            psf_flux_err: vec![FLUX_ERR_SENTINEL],
        };
        assert_eq!(none.guess_fluxes(), vec![1.0]);
    }

    #[test]
    fn test_psf_shape_stats_weighted() {
        let mut a = galaxy_obs(100.0);
        let mut b = galaxy_obs(100.0);
        a.psf.as_mut().unwrap().gmix = Some(gauss(0.2, 1.0));
        b.psf.as_mut().unwrap().gmix = Some(gauss(0.5, 1.0));
        b.weight = DMatrix::from_element(25, 25, 3.0);

        let (g, t) = psf_shape_stats(&vec![vec![a], vec![b]]).unwrap();
        assert_relative_eq!(g[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(t, (0.2 + 3.0 * 0.5) / 4.0, epsilon = 1e-12);
    }
}
