//! # Metacalibration
//!
//! Metacalibration measures the shear response of a shape estimator by refitting the
//! object on artificially sheared copies of its images. The shearing itself is external
//! to this crate and plugged in through [`MetacalShearer`]; this module runs one fresh
//! [`Bootstrapper`] per variant and gathers the results in a [`MetacalResult`].
//!
//! The unsheared variant [`NOSHEAR`] is always processed first; the remaining variants
//! follow in lexical key order. Its weighted PSF size seeds the PSF fits of the sheared
//! variants.
//!
//! A galaxy failure in one variant does not abort the run: the variant keeps a failed
//! result and its flags are OR-ed into [`MetacalResult::mcal_flags`]. PSF failures and
//! shearing failures abort.
//!
//! The adaptive-moment counterpart lives in
//! [`AdmomMetacalBootstrapper`](crate::admom_boot::AdmomMetacalBootstrapper).

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::boot_errors::BootError;
use crate::bootstrap::{psf_shape_stats, Bootstrapper, MaxFitParams, MetacalParams, PsfFitParams, Stage};
use crate::constants::{MultiBandObsList, NOSHEAR};
use crate::fitting::traits::FitBackend;
use crate::fitting::{flagstr, FitResult};
use crate::models::{GalaxyModel, PsfModel};
use crate::observation::ObsInput;
use crate::priors::Prior;

/// Sheared image variants, keyed by variant name.
pub type MetacalObs = AHashMap<String, MultiBandObsList>;

/// Produces the metacal image variants of an observation set.
pub trait MetacalShearer {
    /// One observation set per key of `params.types`, reconvolved with the PSF chosen
    /// by `params.psf`.
    fn get_all_metacal(
        &self,
        mb_obs_list: &MultiBandObsList,
        params: &MetacalParams,
    ) -> Result<MetacalObs, BootError>;
}

/// Per-variant fit results, in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetacalResult {
    /// OR of every variant's galaxy fit flags.
    pub mcal_flags: u32,
    pub results: Vec<(String, FitResult)>,
}

impl MetacalResult {
    /// Result of variant `key`, `None` when it was not requested.
    pub fn get(&self, key: &str) -> Option<&FitResult> {
        self.results.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    /// Variant keys in processing order, `noshear` first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|(k, _)| k.as_str())
    }
}

/// Take the variants out of `obs` in processing order: `noshear`, then the others sorted.
pub(crate) fn variants_in_order(
    mut obs: MetacalObs,
) -> Result<Vec<(String, MultiBandObsList)>, BootError> {
    let noshear = obs.remove(NOSHEAR).ok_or_else(|| {
        BootError::Metacal(format!("shearing transform returned no '{NOSHEAR}' variant"))
    })?;
    let mut rest: Vec<_> = obs.into_iter().collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ordered = Vec::with_capacity(rest.len() + 1);
    ordered.push((NOSHEAR.to_string(), noshear));
    ordered.extend(rest);
    Ok(ordered)
}

/// Maximum-likelihood fits on every metacal variant.
#[derive(Debug)]
pub struct MaxMetacalBootstrapper {
    boot: Bootstrapper,
    params: MetacalParams,
    metacal_res: Option<MetacalResult>,
}

impl MaxMetacalBootstrapper {
    /// Metacal runner over `obs`.
    ///
    /// # Arguments
    ///
    /// * `obs` - the unsheared observations, with their PSF images
    /// * `params` - variant keys, shear step and reconvolution PSF; must include `noshear`
    ///
    /// # Return
    ///
    /// [`BootError::InvalidParameter`] when `params` does not validate.
    ///
    /// # See also
    ///
    /// * [`MetacalParamsBuilder::analytic_psf`](crate::bootstrap::MetacalParamsBuilder::analytic_psf)
    ///   to reconvolve every variant with a fixed round gaussian
    pub fn new(obs: impl Into<ObsInput>, params: MetacalParams) -> Result<Self, BootError> {
        params.validate()?;
        Ok(MaxMetacalBootstrapper {
            boot: Bootstrapper::new(obs)?,
            params,
            metacal_res: None,
        })
    }

    /// Solver backend handed to the bootstrapper of every variant.
    pub fn with_backend(mut self, backend: Arc<dyn FitBackend>) -> Self {
        self.boot = self.boot.with_backend(backend);
        self
    }

    /// Seed the parent generator; each variant forks its own from it.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.boot = self.boot.with_seed(seed);
        self
    }

    /// Variants and reconvolution PSF requested from the shearer.
    pub fn metacal_params(&self) -> &MetacalParams {
        &self.params
    }

    /// The bootstrapper over the unsheared observations.
    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.boot
    }

    /// Mutable access, e.g. to run extra stages on the unsheared images.
    pub fn bootstrapper_mut(&mut self) -> &mut Bootstrapper {
        &mut self.boot
    }

    /// Fit the PSFs and the galaxy of every metacal variant.
    ///
    /// Each variant gets a fresh bootstrapper with `skip_already_done` off. The
    /// variant results carry the weighted PSF shape and size of their epochs.
    pub fn fit_metacal(
        &mut self,
        shearer: &dyn MetacalShearer,
        psf_model: PsfModel,
        gal_model: GalaxyModel,
        psf_params: &PsfFitParams,
        max_params: &MaxFitParams,
        prior: Option<Arc<dyn Prior>>,
    ) -> Result<(), BootError> {
        psf_params.validate()?;
        max_params.validate()?;

        debug!("metacal with {}", self.params);
        let obs = shearer.get_all_metacal(self.boot.mb_obs_list(), &self.params)?;
        let mut res = MetacalResult::default();
        let mut noshear_tpsf = None;

        for (key, mbo) in variants_in_order(obs)? {
            debug!("metacal variant {key}");
            let mut boot = Bootstrapper::new(mbo)?
                .with_backend(self.boot.backend())
                .with_rng(self.boot.fork_rng());

            let mut pp = psf_params.clone();
            pp.skip_already_done = false;
            if let Some(t) = noshear_tpsf {
                pp.tguess = Some(t);
                pp.tguess_key = None;
            }
            boot.fit_psfs(psf_model, &pp)?;
            let (gpsf, tpsf) = psf_shape_stats(boot.mb_obs_list())?;
            if key == NOSHEAR {
                noshear_tpsf = Some(tpsf);
            }

            let mut tres = match boot.fit_max(gal_model, max_params, prior.clone()) {
                Ok(()) => boot.max_fitter()?.result().clone(),
                Err(BootError::GalFailure { reason, flags }) => {
                    warn!("metacal variant {key}: {reason} ({})", flagstr(flags));
                    FitResult::failed(gal_model.to_string(), flags, flagstr(flags))
                }
                Err(err) => return Err(err),
            };
            res.mcal_flags |= tres.flags;
            tres.gpsf = Some(gpsf);
            tres.tpsf = Some(tpsf);
            res.results.push((key, tres));
        }

        self.metacal_res = Some(res);
        self.boot.advance(Stage::Metacaled);
        Ok(())
    }

    /// Per-variant results of the last [`fit_metacal`](Self::fit_metacal).
    ///
    /// Returns [`BootError::StageNotReached`] until a run completed.
    pub fn metacal_result(&self) -> Result<&MetacalResult, BootError> {
        self.metacal_res
            .as_ref()
            .ok_or_else(|| self.boot.not_reached(Stage::Metacaled))
    }
}

#[cfg(test)]
mod metacal_tests {
    use super::*;
    use crate::observation::Observation;

    fn variants(keys: &[&str]) -> MetacalObs {
        keys.iter()
            .map(|k| (k.to_string(), Vec::<Vec<Observation>>::new()))
            .collect()
    }

    #[test]
    fn test_noshear_goes_first() {
        let ordered = variants_in_order(variants(&["2p", "1m", "noshear", "2m", "1p"])).unwrap();
        let keys: Vec<_> = ordered.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["noshear", "1m", "1p", "2m", "2p"]);
    }

    #[test]
    fn test_missing_noshear_rejected() {
        let err = variants_in_order(variants(&["1p", "1m"])).unwrap_err();
        assert!(matches!(err, BootError::Metacal(_)));
    }

    #[test]
    fn test_result_lookup() {
        let res = MetacalResult {
            mcal_flags: 0,
            results: vec![
                ("noshear".into(), FitResult::failed("gauss", 0, "")),
                ("1p".into(), FitResult::failed("gauss", 2, "x")),
            ],
        };
        assert_eq!(res.get("1p").unwrap().flags, 2);
        assert!(res.get("2m").is_none());
        assert_eq!(res.keys().collect::<Vec<_>>(), ["noshear", "1p"]);
    }
}
