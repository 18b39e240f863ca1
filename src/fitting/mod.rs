//! # Solvers
//!
//! Native implementations of the numerical fitters the bootstrapper drives, together with
//! the traits that let another implementation stand in for them.
//!
//! | module              | content                                                  |
//! |---------------------|----------------------------------------------------------|
//! | [`traits`]          | [`Solver`], [`GalaxySolver`], [`FitBackend`]             |
//! | [`result`]          | [`FitResult`], shared by every solver                    |
//! | [`pars`]            | numerical settings (tolerances, iteration budgets)       |
//! | [`em`]              | expectation-maximization on one image                    |
//! | [`lm`]              | Levenberg–Marquardt for PSF and galaxy models            |
//! | [`admom`]           | adaptive (weighted) moments                              |
//! | [`template_flux`]   | linear flux against a fixed template                     |
//! | [`sampling`]        | importance sampling and prior sampling                   |
//! | [`backend`]         | [`NativeBackend`], the default [`FitBackend`]            |
//!
//! Every solver reports success through `FitResult::flags == 0`. Non-zero values are
//! OR-ed bits from [`crate::constants`]; [`flagstr`] renders them for logs.

pub mod admom;
pub mod backend;
pub mod em;
pub mod lm;
pub mod pars;
pub mod result;
pub mod sampling;
pub mod template_flux;
pub mod traits;

use itertools::Itertools;
use nalgebra::DMatrix;

use crate::boot_errors::BootError;
use crate::constants::{
    ADMOM_FAINT, ADMOM_MAXIT, ADMOM_SHIFT, EM_MAXITER, EM_RANGE_ERROR, FIT_FAILURE, LM_MAXFEV,
    LM_NEG_COV_DIAG, LM_SINGULAR_MATRIX, SAMPLER_NO_WEIGHT, TEMPLATE_FLUX_ZERO,
};
use crate::gmix::GMix;
use crate::observation::Observation;

pub use backend::NativeBackend;
pub use pars::{AdmomPars, EmPars, LmPars, SolverPars};
pub use result::FitResult;
pub use traits::{
    AdmomGalSolver, FitBackend, FixedPars, GMixPsfSolver, GalaxySolver, ParsPsfSolver, Solver,
    TemplateFluxSolver, TemplateSource,
};

const FLAG_NAMES: [(u32, &str); 11] = [
    (FIT_FAILURE, "failure"),
    (EM_MAXITER, "em maxiter"),
    (EM_RANGE_ERROR, "em range error"),
    (LM_MAXFEV, "lm maxfev"),
    (LM_SINGULAR_MATRIX, "lm singular matrix"),
    (LM_NEG_COV_DIAG, "lm non-positive covariance"),
    (ADMOM_MAXIT, "admom maxit"),
    (ADMOM_SHIFT, "admom shift"),
    (ADMOM_FAINT, "admom faint"),
    (TEMPLATE_FLUX_ZERO, "template flux zero"),
    (SAMPLER_NO_WEIGHT, "sampler no weight"),
];

/// Human-readable description of native solver flags; empty for success.
///
/// ```
/// use gmix_bootstrap::constants::{EM_MAXITER, LM_MAXFEV};
/// use gmix_bootstrap::fitting::flagstr;
///
/// assert_eq!(flagstr(0), "");
/// assert_eq!(flagstr(EM_MAXITER | LM_MAXFEV), "em maxiter|lm maxfev");
/// ```
pub fn flagstr(flags: u32) -> String {
    let known = FLAG_NAMES.iter().fold(0, |acc, (bit, _)| acc | bit);
    let mut names = FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| name.to_string());
    let unknown = flags & !known;
    if unknown != 0 {
        names.chain(std::iter::once(format!("0x{unknown:x}"))).join("|")
    } else {
        names.join("|")
    }
}

/// Append `(model - image) * sqrt(weight)` for every pixel, column-major.
pub(crate) fn push_residuals(
    gm: &GMix,
    obs: &Observation,
    sqrt_weight: &DMatrix<f64>,
    out: &mut Vec<f64>,
) {
    let (nrow, ncol) = obs.image.shape();
    for col in 0..ncol {
        for row in 0..nrow {
            let w = sqrt_weight[(row, col)];
            if w == 0.0 {
                out.push(0.0);
                continue;
            }
            let (v, u) = obs.jacobian.vu(row as f64, col as f64);
            out.push((gm.eval(v, u) - obs.image[(row, col)]) * w);
        }
    }
}

/// Weighted norm `Σ w T²` of the unit-flux rendering of `gm` on `obs`.
pub(crate) fn template_norm(obs: &Observation, gm: &GMix) -> Result<f64, BootError> {
    let mut unit = gm.clone();
    unit.set_psum(1.0)?;
    let (nrow, ncol) = obs.image.shape();
    let template = unit.make_image(nrow, ncol, &obs.jacobian);
    Ok(template.component_mul(&template).dot(&obs.weight))
}

/// Flux uncertainty of a template fit of `gm` to `obs`.
pub(crate) fn template_flux_err(obs: &Observation, gm: &GMix) -> Result<f64, BootError> {
    let norm = template_norm(obs, gm)?;
    if norm > 0.0 {
        Ok(norm.recip().sqrt())
    } else {
        Ok(f64::INFINITY)
    }
}

#[cfg(test)]
mod fitting_tests {
    use super::*;
    use crate::jacobian::Jacobian;

    #[test]
    fn test_flagstr_unknown_bits() {
        assert_eq!(flagstr(FIT_FAILURE | (1 << 20)), "failure|0x100000");
    }

    #[test]
    fn test_residuals_zero_weight() {
        let jac = Jacobian::identity(1.0, 1.0);
        let gm = GMix::from_full_pars(&[1.0, 0.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        let obs = Observation::new(DMatrix::zeros(3, 3), jac);
        let mut sqrtw = DMatrix::from_element(3, 3, 1.0);
        sqrtw[(1, 1)] = 0.0;
        let mut out = Vec::new();
        push_residuals(&gm, &obs, &sqrtw, &mut out);
        assert_eq!(out.len(), 9);
        assert_eq!(out[4], 0.0);
        assert!(out[0] > 0.0);
    }
}
