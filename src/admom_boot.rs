//! # Adaptive-moment bootstrapping
//!
//! [`AdmomBootstrapper`] replaces the maximum-likelihood stages of
//! [`Bootstrapper`] by adaptive moments: the PSFs are measured with the
//! [`PsfModel::AdaptiveMoment`] family and the galaxy with a joint adaptive-moment fit
//! over every band and epoch. Per-band fluxes are then solved with the galaxy's moment
//! mixture as template.
//!
//! The galaxy result reports the moment ellipticity under both `e` and `g`, so it can be
//! read like a maximum-likelihood result.
//!
//! [`AdmomMetacalBootstrapper`] runs the same fit on every metacal variant and fails
//! fast on the first failure.

use std::sync::Arc;

use log::debug;

use crate::boot_errors::BootError;
use crate::bootstrap::{psf_shape_stats, AdmomParams, Bootstrapper, MetacalParams, PsfFitParams, Stage};
use crate::constants::{MultiBandObsList, FLUX_ERR_SENTINEL, FLUX_SENTINEL, NOSHEAR};
use crate::fitting::pars::SolverPars;
use crate::fitting::traits::{AdmomGalSolver, FitBackend, Solver, TemplateSource};
use crate::fitting::{flagstr, FitResult};
use crate::metacal::{variants_in_order, MetacalResult, MetacalShearer};
use crate::models::PsfModel;
use crate::observation::ObsInput;
use crate::runners;

/// PSF and galaxy adaptive moments of one object.
pub struct AdmomBootstrapper {
    boot: Bootstrapper,
    params: AdmomParams,
    fitter: Option<AdmomGalSolver>,
}

impl std::fmt::Debug for AdmomBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmomBootstrapper")
            .field("boot", &self.boot)
            .field("params", &self.params)
            .field("fitted", &self.fitter.is_some())
            .finish()
    }
}

impl AdmomBootstrapper {
    /// Adaptive-moment bootstrapper over `obs`.
    ///
    /// # Arguments
    ///
    /// * `obs` - a single observation, one band's epochs or a multi-band set
    /// * `params` - iteration limits and tolerances of both moment fits
    ///
    /// # Return
    ///
    /// [`BootError::InvalidParameter`] when `params` does not validate or `obs` has no band.
    pub fn new(obs: impl Into<ObsInput>, params: AdmomParams) -> Result<Self, BootError> {
        params.validate()?;
        Ok(AdmomBootstrapper {
            boot: Bootstrapper::new(obs)?,
            params,
            fitter: None,
        })
    }

    /// See [`Bootstrapper::with_backend`].
    pub fn with_backend(mut self, backend: Arc<dyn FitBackend>) -> Self {
        self.boot = self.boot.with_backend(backend);
        self
    }

    /// See [`Bootstrapper::with_seed`].
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.boot = self.boot.with_seed(seed);
        self
    }

    pub(crate) fn with_rng(mut self, rng: rand::rngs::StdRng) -> Self {
        self.boot = self.boot.with_rng(rng);
        self
    }

    /// Moment-fit settings shared by the PSF and galaxy stages.
    pub fn params(&self) -> &AdmomParams {
        &self.params
    }

    /// Furthest stage reached since the last PSF fit.
    pub fn stage(&self) -> Stage {
        self.boot.stage()
    }

    /// The working observations, with the PSF moments attached after [`fit_psfs`](Self::fit_psfs).
    pub fn mb_obs_list(&self) -> &MultiBandObsList {
        self.boot.mb_obs_list()
    }

    /// Measure every PSF with adaptive moments.
    ///
    /// The size guess is `tguess`, else the metadata value under `tguess_key`, else
    /// four times the pixel scale. Epochs whose PSF fails are dropped when
    /// `skip_failed` is set. A galaxy fit made against the previous PSFs is discarded.
    pub fn fit_psfs(
        &mut self,
        tguess: Option<f64>,
        tguess_key: Option<&str>,
        skip_failed: bool,
        skip_already_done: bool,
    ) -> Result<(), BootError> {
        let params = PsfFitParams {
            tguess,
            tguess_key: tguess_key.map(str::to_string),
            skip_failed,
            ntry: self.params.ntry,
            fit_pars: Some(SolverPars::Admom(self.params.pars)),
            skip_already_done,
            norm_key: None,
            min_s2n: None,
        };
        self.boot.fit_psfs(PsfModel::AdaptiveMoment, &params)?;
        self.fitter = None;
        Ok(())
    }

    /// Twice the mean PSF size over every epoch.
    fn default_tguess(&self) -> Result<f64, BootError> {
        let mut tsum = 0.0;
        let mut n = 0;
        for (band, obs_list) in self.boot.mb_obs_list().iter().enumerate() {
            for obs in obs_list {
                let gm = obs.psf_gmix().ok_or(BootError::MissingPsfGmix { band })?;
                tsum += gm.t();
                n += 1;
            }
        }
        if n == 0 {
            return Err(BootError::PsfFailure("no epochs to take a size guess from".into()));
        }
        Ok(2.0 * tsum / n as f64)
    }

    /// Joint adaptive moments of the galaxy, then per-band fluxes.
    ///
    /// Without `tguess`, the size guess is twice the mean PSF size. A failed moment fit
    /// is a [`BootError::GalFailure`]; a failed flux solve is a PSF failure.
    pub fn fit(&mut self, tguess: Option<f64>) -> Result<(), BootError> {
        let tguess = match tguess {
            Some(t) => t,
            None => self.default_tguess()?,
        };
        let scale = self
            .boot
            .mb_obs_list()
            .iter()
            .flatten()
            .next()
            .map(|o| o.jacobian.scale())
            .ok_or_else(|| BootError::InvalidParameter("no observations to fit".into()))?;

        let mut runner = runners::admom_gal_runner(
            self.boot.backend(),
            tguess,
            scale,
            self.params.pars,
            self.params.ntry,
            self.boot.fork_rng(),
        )?;
        let mut solver = runner.go(self.boot.mb_obs_list(), None)?;

        let flags = solver.result().flags;
        if flags != 0 {
            return Err(BootError::gal(
                format!("admom gal fit failed: {}", flagstr(flags)),
                flags,
            ));
        }
        {
            let res = solver.result_mut();
            res.g = res.e;
            res.g_cov = res.e_cov.clone();
        }

        self.set_flux(&mut solver)?;
        debug!("admom fit: T = {:?}, flux = {:?}", solver.result().t, solver.result().flux);

        self.fitter = Some(solver);
        self.boot.advance(Stage::GalaxyFit);
        Ok(())
    }

    /// Template flux of each band against the moment mixture, which is attached to
    /// every observation.
    fn set_flux(&mut self, solver: &mut AdmomGalSolver) -> Result<(), BootError> {
        let nband = self.boot.mb_obs_list().len();
        let gmix = solver
            .gmix()
            .map_err(|err| BootError::PsfFailure(err.to_string()))?;
        let backend = self.boot.backend();

        let mut flux = vec![FLUX_SENTINEL; nband];
        let mut flux_err = vec![FLUX_ERR_SENTINEL; nband];
        let mut flux_s2n = vec![FLUX_SENTINEL; nband];

        for (band, obs_list) in self.boot.mb_obs_list_mut().iter_mut().enumerate() {
            for obs in obs_list.iter_mut() {
                obs.gmix = Some(gmix.clone());
            }
            let mut fitter = backend.template_flux(TemplateSource::Gmix);
            fitter.go(obs_list)?;
            let fres = fitter.result();
            if fres.flags != 0 {
                solver.result_mut().flags = fres.flags;
                solver.result_mut().flagstr = flagstr(fres.flags);
                return Err(BootError::PsfFailure("could not get flux".into()));
            }
            flux[band] = fres.flux.first().copied().unwrap_or(FLUX_SENTINEL);
            flux_err[band] = fres.flux_err.first().copied().unwrap_or(FLUX_ERR_SENTINEL);
            if flux_err[band] > 0.0 {
                flux_s2n[band] = flux[band] / flux_err[band];
            }
        }

        let res = solver.result_mut();
        res.flux = flux;
        res.flux_err = flux_err;
        res.flux_s2n = flux_s2n;
        Ok(())
    }

    /// The galaxy moment solver of the last successful [`fit`](Self::fit).
    ///
    /// # Return
    ///
    /// [`BootError::StageNotReached`] before the galaxy fit, and again after a PSF refit.
    ///
    /// # See also
    ///
    /// * [`result`](Self::result) for the fit result alone
    pub fn fitter(&self) -> Result<&AdmomGalSolver, BootError> {
        self.fitter
            .as_ref()
            .ok_or_else(|| self.boot.not_reached(Stage::GalaxyFit))
    }

    /// Galaxy moment result, with per-band template fluxes filled in.
    pub fn result(&self) -> Result<&FitResult, BootError> {
        Ok(self.fitter()?.result())
    }
}

/// Adaptive moments on every metacal variant.
#[derive(Debug)]
pub struct AdmomMetacalBootstrapper {
    admom: AdmomBootstrapper,
    metacal: MetacalParams,
    metacal_res: Option<MetacalResult>,
}

impl AdmomMetacalBootstrapper {
    /// Metacal runner over `obs`.
    ///
    /// `metacal` must list the `noshear` variant; `admom` configures the fit of every
    /// variant.
    pub fn new(
        obs: impl Into<ObsInput>,
        admom: AdmomParams,
        metacal: MetacalParams,
    ) -> Result<Self, BootError> {
        metacal.validate()?;
        Ok(AdmomMetacalBootstrapper {
            admom: AdmomBootstrapper::new(obs, admom)?,
            metacal,
            metacal_res: None,
        })
    }

    /// See [`Bootstrapper::with_backend`].
    pub fn with_backend(mut self, backend: Arc<dyn FitBackend>) -> Self {
        self.admom = self.admom.with_backend(backend);
        self
    }

    /// Seed the parent generator; each variant forks its own from it.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.admom = self.admom.with_seed(seed);
        self
    }

    /// Variants and reconvolution PSF requested from the shearer.
    pub fn metacal_params(&self) -> &MetacalParams {
        &self.metacal
    }

    /// Fit every metacal variant, `noshear` first.
    ///
    /// Only the `noshear` variant measures its PSFs; its weighted PSF shape and size are
    /// stored on its result and, when `tguess` is `None`, twice its PSF size becomes the
    /// galaxy size guess of every variant. Any failure aborts the run.
    pub fn fit_metacal(
        &mut self,
        shearer: &dyn MetacalShearer,
        tguess: Option<f64>,
        psf_tguess: Option<f64>,
        psf_tguess_key: Option<&str>,
    ) -> Result<(), BootError> {
        let obs = shearer.get_all_metacal(self.admom.mb_obs_list(), &self.metacal)?;
        let mut tguess = tguess;
        let mut res = MetacalResult::default();

        for (key, mbo) in variants_in_order(obs)? {
            debug!("admom metacal variant {key}");
            let mut boot = AdmomBootstrapper::new(mbo, self.admom.params)?
                .with_backend(self.admom.boot.backend())
                .with_rng(self.admom.boot.fork_rng());

            let mut psf_stats = None;
            if key == NOSHEAR {
                boot.fit_psfs(psf_tguess, psf_tguess_key, true, false)?;
                let (gpsf, tpsf) = psf_shape_stats(boot.mb_obs_list())?;
                tguess.get_or_insert(2.0 * tpsf);
                psf_stats = Some((gpsf, tpsf));
            }

            boot.fit(tguess)?;
            let mut tres = boot.result()?.clone();
            if let Some((gpsf, tpsf)) = psf_stats {
                tres.gpsf = Some(gpsf);
                tres.tpsf = Some(tpsf);
            }
            res.mcal_flags |= tres.flags;
            res.results.push((key, tres));
        }

        self.metacal_res = Some(res);
        self.admom.boot.advance(Stage::Metacaled);
        Ok(())
    }

    /// Per-variant results of the last [`fit_metacal`](Self::fit_metacal).
    pub fn metacal_result(&self) -> Result<&MetacalResult, BootError> {
        self.metacal_res
            .as_ref()
            .ok_or_else(|| self.admom.boot.not_reached(Stage::Metacaled))
    }
}

#[cfg(test)]
mod admom_boot_tests {
    use super::*;
    use crate::gmix::model::simple_gmix;
    use crate::gmix::GMix;
    use crate::jacobian::Jacobian;
    use crate::models::SimpleModel;
    use crate::observation::Observation;
    use approx::assert_relative_eq;

    fn gauss(t: f64, flux: f64) -> GMix {
        simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, t, flux]).unwrap()
    }

    fn obs(gal_t: f64, flux: f64) -> Observation {
        let jac = Jacobian::diagonal(0.263, 15.0, 15.0);
        let psf = Observation::new(gauss(0.27, 1.0).make_image(31, 31, &jac), jac);
        let image = gauss(gal_t, flux)
            .convolve(&gauss(0.27, 1.0))
            .unwrap()
            .make_image(31, 31, &jac);
        Observation::new(image, jac).with_psf(psf)
    }

    #[test]
    fn test_fit_before_psfs_needs_tguess() {
        let mut boot = AdmomBootstrapper::new(obs(0.5, 100.0), AdmomParams::default()).unwrap();
        assert_eq!(boot.fit(None), Err(BootError::MissingPsfGmix { band: 0 }));
        assert!(boot.fitter().is_err());
    }

    #[test]
    fn test_psf_and_galaxy_moments() {
        let mut boot = AdmomBootstrapper::new(vec![vec![obs(0.5, 100.0)], vec![obs(0.5, 40.0)]], AdmomParams::default())
            .unwrap()
            .with_seed(11);
        boot.fit_psfs(None, None, true, true).unwrap();
        let psf_t = boot.mb_obs_list()[0][0].psf_gmix().unwrap().t();
        assert_relative_eq!(psf_t, 0.27, max_relative = 2e-2);

        boot.fit(None).unwrap();
        assert_eq!(boot.stage(), Stage::GalaxyFit);
        let res = boot.result().unwrap();
        assert_eq!(res.flags, 0);
        assert_eq!(res.g, res.e);
        assert_eq!(res.flux.len(), 2);
        assert!(res.flux[0] > res.flux[1]);
        assert!(boot.mb_obs_list()[1][0].has_gmix());
    }
}
