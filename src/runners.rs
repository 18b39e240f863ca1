//! # Fit runners
//!
//! A [`FitRunner`] is the retry loop shared by every solver family:
//!
//! 1. draw a guess (the caller's guess on the first attempt, if given),
//! 2. build a **fresh** solver,
//! 3. run it and stop at the first result with `flags == 0`.
//!
//! When every attempt fails, the last solver is returned with its failed result; the
//! caller decides whether that is fatal. The attempt on which the loop stopped is stored
//! in `FitResult::ntry`.
//!
//! A [`BootError::GMixRange`] raised while guessing or solving does not abort the loop:
//! it is logged and turned into a failed attempt with `flags = FIT_FAILURE`.
//!
//! The constructors at the bottom of this module wire a guesser and a solver factory
//! for each family.

use std::sync::Arc;

use log::warn;
use rand::rngs::StdRng;

use crate::boot_errors::BootError;
use crate::constants::{Pars, FIT_FAILURE};
use crate::fitting::pars::{AdmomPars, EmPars, LmPars};
use crate::fitting::traits::{
    AdmomGalSolver, FitBackend, FixedPars, GMixPsfSolver, GalaxySolver, ParsPsfSolver, Solver,
};
use crate::fitting::flagstr;
use crate::guessers::{AdmomGuesser, CoellipGuesser, EmGuesser, GuessGenerator, PsfLmGuesser};
use crate::models::{GalaxyModel, GaussCount, SimpleModel};
use crate::observation::Observation;
use crate::priors::{CenPrior, CoellipSamePrior, Prior, ScalarPrior, TwoSidedErf, ZDisk2D};

/// Builds a new solver for each attempt.
pub type SolverFactory<S> = Box<dyn FnMut() -> S>;

/// Guess generator for galaxy parameter vectors.
pub type ParsGuessGenerator = Box<dyn GuessGenerator<Guess = Pars>>;

/// Retry loop around a solver: each attempt builds a fresh solver and starts it from a
/// new guess, until one succeeds or `ntry` attempts are spent.
///
/// # See also
///
/// * [`em_psf_runner`], [`lm_psf_runner`], [`coellip_psf_runner`] and [`max_runner`] for the
///   runners the bootstrapper builds
pub struct FitRunner<G, S> {
    guesser: G,
    make_solver: SolverFactory<S>,
    ntry: usize,
}

impl<G, S> FitRunner<G, S>
where
    G: GuessGenerator,
    S: Solver<Guess = G::Guess>,
{
    /// Fails with [`BootError::InvalidParameter`] when `ntry` is zero.
    pub fn new(guesser: G, make_solver: SolverFactory<S>, ntry: usize) -> Result<Self, BootError> {
        if ntry == 0 {
            return Err(BootError::InvalidParameter("ntry must be >= 1".into()));
        }
        Ok(FitRunner {
            guesser,
            make_solver,
            ntry,
        })
    }

    /// Attempt budget.
    pub fn ntry(&self) -> usize {
        self.ntry
    }

    /// Run up to `ntry` attempts and return the last solver.
    pub fn go(&mut self, data: &S::Data, first_guess: Option<&G::Guess>) -> Result<S, BootError> {
        let mut last = None;
        for attempt in 1..=self.ntry {
            let mut solver = (self.make_solver)();

            let drawn;
            let guess = match first_guess {
                Some(g) if attempt == 1 => Ok(g),
                _ => match self.guesser.guess() {
                    Ok(g) => {
                        drawn = g;
                        Ok(&drawn)
                    }
                    Err(err) => Err(err),
                },
            };
            let outcome = guess.and_then(|g| solver.go(data, g));

            match outcome {
                Ok(()) => {}
                Err(BootError::GMixRange(msg)) => {
                    warn!("attempt {attempt}/{}: {msg}", self.ntry);
                    let res = solver.result_mut();
                    res.flags = FIT_FAILURE;
                    res.flagstr = flagstr(FIT_FAILURE);
                }
                Err(err) => return Err(err),
            }

            solver.result_mut().ntry = attempt;
            let done = solver.result().flags == 0;
            last = Some(solver);
            if done {
                break;
            }
        }
        last.ok_or_else(|| BootError::InvalidParameter("ntry must be >= 1".into()))
    }
}

/// EM fit of an `ngauss` PSF.
///
/// # Arguments
///
/// * `backend` - source of a fresh EM solver per attempt
/// * `ngauss` - number of free gaussians; the starting fractions and sizes come from the
///   built-in table for that count
/// * `tguess` - starting total size
/// * `rng` - generator of the guess jitter, kept across attempts
///
/// # Errors
///
/// [`BootError::InvalidParameter`] for invalid `pars` or `ntry == 0`.
pub fn em_psf_runner(
    backend: Arc<dyn FitBackend>,
    ngauss: GaussCount,
    tguess: f64,
    pars: EmPars,
    ntry: usize,
    rng: StdRng,
) -> Result<FitRunner<EmGuesser, GMixPsfSolver>, BootError> {
    pars.validate()?;
    FitRunner::new(
        EmGuesser::new(ngauss, tguess, rng),
        Box::new(move || backend.em(&pars)),
        ntry,
    )
}

/// Least-squares fit of a fixed-profile PSF.
///
/// The starting flux is the image sum, so `obs` is read once here and not kept.
pub fn lm_psf_runner(
    backend: Arc<dyn FitBackend>,
    obs: &Observation,
    model: SimpleModel,
    tguess: f64,
    pars: LmPars,
    ntry: usize,
    rng: StdRng,
) -> Result<FitRunner<PsfLmGuesser, ParsPsfSolver>, BootError> {
    pars.validate()?;
    FitRunner::new(
        PsfLmGuesser::new(obs, tguess, rng),
        Box::new(move || backend.lm_psf(model, &pars)),
        ntry,
    )
}

/// Loose prior keeping a coelliptical PSF fit well-behaved.
///
/// Sizes and fluxes have soft edges at `0.01×` and `100×` the guesses; the center is
/// gaussian with a width of two pixels.
pub fn coellip_psf_prior(
    ngauss: GaussCount,
    tguess: f64,
    fguess: f64,
    pixel_scale: f64,
) -> Result<CoellipSamePrior, BootError> {
    let cen_width = 2.0 * pixel_scale;
    let erf_prior = |x: f64| {
        TwoSidedErf::new(0.01 * x, 0.001 * x, 100.0 * x, x)
            .map(|p| Box::new(p) as Box<dyn ScalarPrior>)
    };
    Ok(CoellipSamePrior::new(
        ngauss.get(),
        CenPrior::new(0.0, 0.0, cen_width, cen_width)?,
        ZDisk2D::new(1.0)?,
        erf_prior(tguess)?,
        erf_prior(fguess)?,
    ))
}

/// Coelliptical least-squares fit of a PSF.
///
/// The solver is given [`coellip_psf_prior`] around the guesser's central size and
/// flux, so a wandering component is pulled back rather than failing the fit.
pub fn coellip_psf_runner(
    backend: Arc<dyn FitBackend>,
    obs: &Observation,
    ngauss: GaussCount,
    tguess: f64,
    pars: LmPars,
    ntry: usize,
    rng: StdRng,
) -> Result<FitRunner<CoellipGuesser, ParsPsfSolver>, BootError> {
    pars.validate()?;
    let guesser = CoellipGuesser::new(obs, ngauss, tguess, rng);
    let prior: Arc<dyn Prior> = Arc::new(coellip_psf_prior(
        ngauss,
        guesser.tguess(),
        guesser.fguess(),
        obs.jacobian.scale(),
    )?);
    FitRunner::new(
        guesser,
        Box::new(move || backend.coellip(ngauss, &pars, Some(prior.clone()))),
        ntry,
    )
}

/// Adaptive moments of a single PSF image.
pub fn admom_psf_runner(
    backend: Arc<dyn FitBackend>,
    tguess: f64,
    pixel_scale: f64,
    pars: AdmomPars,
    ntry: usize,
    rng: StdRng,
) -> Result<FitRunner<AdmomGuesser, GMixPsfSolver>, BootError> {
    FitRunner::new(
        AdmomGuesser::new(tguess, pixel_scale, rng),
        Box::new(move || backend.admom_psf(&pars)),
        ntry,
    )
}

/// Adaptive moments over every observation of every band.
pub fn admom_gal_runner(
    backend: Arc<dyn FitBackend>,
    tguess: f64,
    pixel_scale: f64,
    pars: AdmomPars,
    ntry: usize,
    rng: StdRng,
) -> Result<FitRunner<AdmomGuesser, AdmomGalSolver>, BootError> {
    FitRunner::new(
        AdmomGuesser::new(tguess, pixel_scale, rng),
        Box::new(move || backend.admom(&pars)),
        ntry,
    )
}

/// Maximum-likelihood galaxy fit, optionally with some parameters held fixed.
///
/// # Arguments
///
/// * `model` - galaxy layout, which sets the parameter count with the number of bands
/// * `prior` - passed to every solver; least-squares fits add its residual terms
/// * `fixed` - indices pinned to a value, empty when every parameter is free
/// * `guesser` - any generator of full-length parameter vectors
///
/// # See also
///
/// * [`bdf_runner`] and [`bd_runner`], which require a prior
pub fn max_runner(
    backend: Arc<dyn FitBackend>,
    model: GalaxyModel,
    pars: LmPars,
    prior: Option<Arc<dyn Prior>>,
    fixed: FixedPars,
    guesser: ParsGuessGenerator,
    ntry: usize,
) -> Result<FitRunner<ParsGuessGenerator, Box<dyn GalaxySolver>>, BootError> {
    pars.validate()?;
    FitRunner::new(
        guesser,
        Box::new(move || backend.galaxy(model, &pars, prior.clone(), fixed.clone())),
        ntry,
    )
}

/// Bulge + disk galaxy fit; the prior is required.
pub fn bdf_runner(
    backend: Arc<dyn FitBackend>,
    pars: LmPars,
    prior: Arc<dyn Prior>,
    guesser: ParsGuessGenerator,
    ntry: usize,
) -> Result<FitRunner<ParsGuessGenerator, Box<dyn GalaxySolver>>, BootError> {
    max_runner(
        backend,
        GalaxyModel::Bdf,
        pars,
        Some(prior),
        FixedPars::new(),
        guesser,
        ntry,
    )
}

/// Two-size bulge + disk galaxy fit; the prior is required.
pub fn bd_runner(
    backend: Arc<dyn FitBackend>,
    pars: LmPars,
    prior: Arc<dyn Prior>,
    guesser: ParsGuessGenerator,
    ntry: usize,
) -> Result<FitRunner<ParsGuessGenerator, Box<dyn GalaxySolver>>, BootError> {
    max_runner(
        backend,
        GalaxyModel::Bd,
        pars,
        Some(prior),
        FixedPars::new(),
        guesser,
        ntry,
    )
}

#[cfg(test)]
mod runners_tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::fitting::FitResult;
    use crate::gmix::GMix;

    /// Counts calls and fails until `succeed_on`.
    struct Stub {
        calls: Rc<Cell<usize>>,
        succeed_on: usize,
        result: FitResult,
    }

    impl Solver for Stub {
        type Data = ();
        type Guess = f64;

        fn go(&mut self, _data: &(), _guess: &f64) -> Result<(), BootError> {
            let n = self.calls.get();
            self.result.flags = if n >= self.succeed_on { 0 } else { 4 };
            Ok(())
        }

        fn result(&self) -> &FitResult {
            &self.result
        }

        fn result_mut(&mut self) -> &mut FitResult {
            &mut self.result
        }

        fn gmix(&self) -> Result<GMix, BootError> {
            Err(BootError::GMixRange("stub".into()))
        }
    }

    struct ConstGuess;

    impl GuessGenerator for ConstGuess {
        type Guess = f64;

        fn guess(&mut self) -> Result<f64, BootError> {
            Ok(1.0)
        }
    }

    fn runner(succeed_on: usize, ntry: usize) -> (FitRunner<ConstGuess, Stub>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let factory: SolverFactory<Stub> = Box::new(move || {
            counter.set(counter.get() + 1);
            Stub {
                calls: counter.clone(),
                succeed_on,
                result: FitResult::default(),
            }
        });
        (FitRunner::new(ConstGuess, factory, ntry).unwrap(), calls)
    }

    #[test]
    fn test_first_success_builds_one_solver() {
        let (mut runner, calls) = runner(1, 4);
        let solver = runner.go(&(), None).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(solver.result().ntry, 1);
        assert_eq!(solver.result().flags, 0);
    }

    #[test]
    fn test_exhaustion_surfaces_last_failure() {
        let (mut runner, calls) = runner(usize::MAX, 3);
        let solver = runner.go(&(), Some(&0.5)).unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(solver.result().ntry, 3);
        assert_eq!(solver.result().flags, 4);
    }

    #[test]
    fn test_zero_ntry_rejected() {
        let (runner, _) = runner(1, 1);
        assert!(FitRunner::new(ConstGuess, runner.make_solver, 0).is_err());
    }
}
