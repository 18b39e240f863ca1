#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use gmix_bootstrap::boot_errors::BootError;
use gmix_bootstrap::bootstrap::MetacalParams;
use gmix_bootstrap::constants::{MultiBandObsList, ObsList, Pars, EM_MAXITER, LM_MAXFEV};
use gmix_bootstrap::fitting::pars::{AdmomPars, EmPars, LmPars};
use gmix_bootstrap::fitting::traits::{
    AdmomGalSolver, FitBackend, FixedPars, GMixPsfSolver, GalaxySolver, ParsPsfSolver, Solver,
    TemplateFluxSolver, TemplateSource,
};
use gmix_bootstrap::fitting::{flagstr, FitResult, NativeBackend};
use gmix_bootstrap::gmix::shape::moments_from_e;
use gmix_bootstrap::gmix::{GMix, Gauss2D};
use gmix_bootstrap::jacobian::Jacobian;
use gmix_bootstrap::metacal::{MetacalObs, MetacalShearer};
use gmix_bootstrap::models::{GalaxyModel, GaussCount, SimpleModel};
use gmix_bootstrap::observation::Observation;
use gmix_bootstrap::priors::Prior;
use nalgebra::DVector;

pub const SCALE: f64 = 0.263;
pub const DIM: usize = 25;
pub const CEN: f64 = 12.0;

/// Metadata key marking a PSF observation whose EM fit must fail.
pub const BROKEN: &str = "broken";

/// Single elliptical gaussian with size `t`, distortion `(e1, e2)` and `flux`.
pub fn gauss(t: f64, e1: f64, e2: f64, flux: f64) -> GMix {
    let (vv, vu, uu) = moments_from_e(t, e1, e2);
    GMix::from_components(vec![Gauss2D::new(flux, 0.0, 0.0, vv, vu, uu).unwrap()]).unwrap()
}

/// Noise-free image of a gaussian galaxy convolved with a round gaussian PSF, with the
/// PSF image attached.
pub fn synthetic_obs(psf_t: f64, gal: &GMix) -> Observation {
    let jac = Jacobian::diagonal(SCALE, CEN, CEN);
    let psf_gm = gauss(psf_t, 0.0, 0.0, 1.0);
    let psf = Observation::new(psf_gm.make_image(DIM, DIM, &jac), jac);
    let image = gal.convolve(&psf_gm).unwrap().make_image(DIM, DIM, &jac);
    Observation::new(image, jac).with_psf(psf)
}

/// The reference object: PSF `T = 0.27`, galaxy `T = 0.28`, `e = (0.1, 0.05)`.
pub fn reference_obs(flux: f64) -> Observation {
    synthetic_obs(0.27, &gauss(0.55 - 0.27, 0.1, 0.05, flux))
}

pub fn broken(mut obs: Observation) -> Observation {
    if let Some(psf) = obs.psf.as_mut() {
        psf.meta.insert(BROKEN.to_string(), 1.0);
    }
    obs
}

// -------------------------------------------------------------------------------------------------
// Stub backends
// -------------------------------------------------------------------------------------------------

/// EM solver failing on PSF observations carrying [`BROKEN`].
struct FlakyEm(GMixPsfSolver);

impl Solver for FlakyEm {
    type Data = Observation;
    type Guess = GMix;

    fn go(&mut self, obs: &Observation, guess: &GMix) -> Result<(), BootError> {
        if obs.meta.contains_key(BROKEN) {
            *self.0.result_mut() = FitResult::failed("em", EM_MAXITER, flagstr(EM_MAXITER));
            return Ok(());
        }
        self.0.go(obs, guess)
    }

    fn result(&self) -> &FitResult {
        self.0.result()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        self.0.result_mut()
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.0.gmix()
    }
}

/// Galaxy solver that always exhausts its budget.
struct FailingGalaxy(Box<dyn GalaxySolver>);

impl Solver for FailingGalaxy {
    type Data = [ObsList];
    type Guess = Pars;

    fn go(&mut self, _data: &[ObsList], _guess: &Pars) -> Result<(), BootError> {
        *self.0.result_mut() = FitResult::failed("gauss", LM_MAXFEV, flagstr(LM_MAXFEV));
        Ok(())
    }

    fn result(&self) -> &FitResult {
        self.0.result()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        self.0.result_mut()
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.0.gmix()
    }
}

impl GalaxySolver for FailingGalaxy {
    fn convolved_gmix(&self, data: &[ObsList], band: usize, epoch: usize) -> Result<GMix, BootError> {
        self.0.convolved_gmix(data, band, epoch)
    }

    fn ln_prob(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError> {
        self.0.ln_prob(data, pars)
    }

    fn ln_like(&self, data: &[ObsList], pars: &DVector<f64>) -> Result<f64, BootError> {
        self.0.ln_like(data, pars)
    }

    fn calc_cov(&mut self, data: &[ObsList], h: f64, m: f64) -> Result<(), BootError> {
        self.0.calc_cov(data, h, m)
    }
}

/// Native backend with injectable failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBackend {
    /// Fail the EM fit of PSFs marked [`BROKEN`].
    pub flaky_em: bool,
    /// Fail every galaxy fit.
    pub failing_galaxy: bool,
}

impl FitBackend for StubBackend {
    fn em(&self, pars: &EmPars) -> GMixPsfSolver {
        let native = NativeBackend.em(pars);
        if self.flaky_em {
            Box::new(FlakyEm(native))
        } else {
            native
        }
    }

    fn lm_psf(&self, model: SimpleModel, pars: &LmPars) -> ParsPsfSolver {
        NativeBackend.lm_psf(model, pars)
    }

    fn coellip(
        &self,
        ngauss: GaussCount,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
    ) -> ParsPsfSolver {
        NativeBackend.coellip(ngauss, pars, prior)
    }

    fn admom_psf(&self, pars: &AdmomPars) -> GMixPsfSolver {
        NativeBackend.admom_psf(pars)
    }

    fn admom(&self, pars: &AdmomPars) -> AdmomGalSolver {
        NativeBackend.admom(pars)
    }

    fn galaxy(
        &self,
        model: GalaxyModel,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
    ) -> Box<dyn GalaxySolver> {
        let native = NativeBackend.galaxy(model, pars, prior, fixed);
        if self.failing_galaxy {
            Box::new(FailingGalaxy(native))
        } else {
            native
        }
    }

    fn template_flux(&self, source: TemplateSource) -> Box<dyn TemplateFluxSolver> {
        NativeBackend.template_flux(source)
    }
}

/// Least-squares PSF solver logging the size of every starting point.
struct RecordingPsf {
    inner: ParsPsfSolver,
    sizes: Arc<Mutex<Vec<f64>>>,
}

impl Solver for RecordingPsf {
    type Data = Observation;
    type Guess = Pars;

    fn go(&mut self, obs: &Observation, guess: &Pars) -> Result<(), BootError> {
        self.sizes.lock().unwrap().push(guess[4]);
        self.inner.go(obs, guess)
    }

    fn result(&self) -> &FitResult {
        self.inner.result()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        self.inner.result_mut()
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.inner.gmix()
    }
}

/// Native backend recording the `T` guess of each `gauss`/`turb` PSF attempt, in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingBackend {
    pub psf_sizes: Arc<Mutex<Vec<f64>>>,
}

impl RecordingBackend {
    pub fn sizes(&self) -> Vec<f64> {
        self.psf_sizes.lock().unwrap().clone()
    }
}

impl FitBackend for RecordingBackend {
    fn em(&self, pars: &EmPars) -> GMixPsfSolver {
        NativeBackend.em(pars)
    }

    fn lm_psf(&self, model: SimpleModel, pars: &LmPars) -> ParsPsfSolver {
        Box::new(RecordingPsf {
            inner: NativeBackend.lm_psf(model, pars),
            sizes: self.psf_sizes.clone(),
        })
    }

    fn coellip(
        &self,
        ngauss: GaussCount,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
    ) -> ParsPsfSolver {
        NativeBackend.coellip(ngauss, pars, prior)
    }

    fn admom_psf(&self, pars: &AdmomPars) -> GMixPsfSolver {
        NativeBackend.admom_psf(pars)
    }

    fn admom(&self, pars: &AdmomPars) -> AdmomGalSolver {
        NativeBackend.admom(pars)
    }

    fn galaxy(
        &self,
        model: GalaxyModel,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
    ) -> Box<dyn GalaxySolver> {
        NativeBackend.galaxy(model, pars, prior, fixed)
    }

    fn template_flux(&self, source: TemplateSource) -> Box<dyn TemplateFluxSolver> {
        NativeBackend.template_flux(source)
    }
}

/// Shearing stand-in returning an unmodified copy of the input for every requested
/// variant, with the PSF mixtures stripped. An analytic reconvolution PSF replaces the
/// PSF images.
#[derive(Debug, Default)]
pub struct CopyShearer;

impl MetacalShearer for CopyShearer {
    fn get_all_metacal(
        &self,
        mb_obs_list: &MultiBandObsList,
        params: &MetacalParams,
    ) -> Result<MetacalObs, BootError> {
        let analytic = params.psf.analytic_gmix()?;
        let mut stripped = mb_obs_list.clone();
        for obs in stripped.iter_mut().flatten() {
            if let Some(psf) = obs.psf.as_mut() {
                psf.gmix = None;
                psf.fit_result = None;
                if let Some(gm) = &analytic {
                    let (nrow, ncol) = psf.image.shape();
                    psf.image = gm.make_image(nrow, ncol, &psf.jacobian);
                }
            }
        }
        Ok(params
            .types
            .iter()
            .map(|key| (key.clone(), stripped.clone()))
            .collect())
    }
}
