//! # Native backend
//!
//! The solvers shipped with this crate, behind [`FitBackend`].
//!
//! | backend call       | solver                                   |
//! |--------------------|------------------------------------------|
//! | `em`               | [`EmSolver`]                             |
//! | `lm_psf`           | [`LmPsfSolver`], simple PSF profile      |
//! | `coellip`          | [`CoellipSolver`]                        |
//! | `admom_psf`        | [`AdmomSolver`] on one PSF image         |
//! | `admom`            | [`AdmomSolver`] over every band and epoch |
//! | `galaxy`           | [`LmGalaxySolver`]                       |
//! | `template_flux`    | [`TemplateFluxFitter`]                   |
//!
//! A caller wanting to substitute an external solver for one family can wrap
//! [`NativeBackend`] and override that single method.

use std::sync::Arc;

use crate::constants::ObsList;
use crate::fitting::admom::AdmomSolver;
use crate::fitting::em::EmSolver;
use crate::fitting::lm::{CoellipSolver, LmGalaxySolver, LmPsfSolver};
use crate::fitting::pars::{AdmomPars, EmPars, LmPars};
use crate::fitting::template_flux::TemplateFluxFitter;
use crate::fitting::traits::{
    AdmomGalSolver, FitBackend, FixedPars, GMixPsfSolver, GalaxySolver, ParsPsfSolver,
    TemplateFluxSolver, TemplateSource,
};
use crate::models::{GalaxyModel, GaussCount, SimpleModel};
use crate::observation::Observation;
use crate::priors::Prior;

/// Native EM, Levenberg–Marquardt, adaptive moment and template flux solvers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl FitBackend for NativeBackend {
    fn em(&self, pars: &EmPars) -> GMixPsfSolver {
        Box::new(EmSolver::new(*pars))
    }

    fn lm_psf(&self, model: SimpleModel, pars: &LmPars) -> ParsPsfSolver {
        Box::new(LmPsfSolver::new(model, *pars))
    }

    fn coellip(
        &self,
        ngauss: GaussCount,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
    ) -> ParsPsfSolver {
        Box::new(CoellipSolver::new(ngauss, *pars, prior))
    }

    fn admom_psf(&self, pars: &AdmomPars) -> GMixPsfSolver {
        Box::new(AdmomSolver::<Observation>::new(*pars))
    }

    fn admom(&self, pars: &AdmomPars) -> AdmomGalSolver {
        Box::new(AdmomSolver::<[ObsList]>::new(*pars))
    }

    fn galaxy(
        &self,
        model: GalaxyModel,
        pars: &LmPars,
        prior: Option<Arc<dyn Prior>>,
        fixed: FixedPars,
    ) -> Box<dyn GalaxySolver> {
        Box::new(LmGalaxySolver::new(model, *pars, prior, fixed))
    }

    fn template_flux(&self, source: TemplateSource) -> Box<dyn TemplateFluxSolver> {
        Box::new(TemplateFluxFitter::new(source))
    }
}
