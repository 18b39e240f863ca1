//! Linear flux fit against a fixed template.
//!
//! For templates `T_i` (unit flux, surface brightness) and images `I_i` across all epochs
//! the flux is `Σ w T I / Σ w T²` with uncertainty `1 / sqrt(Σ w T²)`.

use crate::boot_errors::BootError;
use crate::constants::TEMPLATE_FLUX_ZERO;
use crate::fitting::traits::{TemplateFluxSolver, TemplateSource};
use crate::fitting::{flagstr, FitResult};
use crate::gmix::GMix;
use crate::observation::Observation;

/// Linear flux of a fixed template over every epoch of one band.
///
/// The template is each epoch's PSF mixture or the epoch's attached model, depending on
/// the [`TemplateSource`].
#[derive(Debug, Clone)]
pub struct TemplateFluxFitter {
    source: TemplateSource,
    result: FitResult,
}

impl TemplateFluxFitter {
    pub fn new(source: TemplateSource) -> Self {
        TemplateFluxFitter {
            source,
            result: FitResult::default(),
        }
    }

    fn template(&self, obs: &Observation, epoch: usize) -> Result<GMix, BootError> {
        let (mut gm, normalize) = match self.source {
            TemplateSource::Psf { normalize } => {
                let gm = obs.psf_gmix().ok_or_else(|| {
                    BootError::InvalidParameter(format!(
                        "epoch {epoch} has no psf mixture to use as flux template"
                    ))
                })?;
                (gm.clone(), normalize)
            }
            TemplateSource::Gmix => {
                let gm = obs.gmix.as_ref().ok_or_else(|| {
                    BootError::InvalidParameter(format!(
                        "epoch {epoch} has no mixture to use as flux template"
                    ))
                })?;
                (gm.clone(), true)
            }
        };
        if normalize {
            gm.set_psum(1.0)?;
        }
        Ok(gm)
    }
}

impl TemplateFluxSolver for TemplateFluxFitter {
    fn go(&mut self, obs_list: &[Observation]) -> Result<(), BootError> {
        let mut num = 0.0;
        let mut den = 0.0;
        for (epoch, obs) in obs_list.iter().enumerate() {
            let gm = self.template(obs, epoch)?;
            let (nrow, ncol) = obs.image.shape();
            let model = gm.make_image(nrow, ncol, &obs.jacobian);
            let wt = model.component_mul(&obs.weight);
            num += wt.dot(&obs.image);
            den += wt.dot(&model);
        }

        let mut result = FitResult::failed("template", 0, "");
        if den > 0.0 {
            let flux = num / den;
            let flux_err = den.recip().sqrt();
            result.flux = vec![flux];
            result.flux_err = vec![flux_err];
            result.flux_s2n = vec![flux / flux_err];
        } else {
            result.flags = TEMPLATE_FLUX_ZERO;
            result.flagstr = flagstr(TEMPLATE_FLUX_ZERO);
        }
        self.result = result;
        Ok(())
    }

    fn result(&self) -> &FitResult {
        &self.result
    }
}
