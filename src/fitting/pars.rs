//! Numerical settings of the native solvers.
//!
//! The PSF stage selects one of them through [`SolverPars`]; a variant that does not
//! match the PSF model's family is rejected before any fit runs.

use serde::{Deserialize, Serialize};

use crate::boot_errors::BootError;
use crate::constants::{
    EM_DEFAULT_MAXITER, EM_DEFAULT_TOL, LM_DEFAULT_FTOL, LM_DEFAULT_MAXFEV, LM_DEFAULT_XTOL,
};

/// Expectation-maximization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmPars {
    /// Relative change in `T` below which the iteration is converged
    pub tol: f64,
    pub maxiter: usize,
    pub miniter: usize,
}

impl Default for EmPars {
    fn default() -> Self {
        EmPars {
            tol: EM_DEFAULT_TOL,
            maxiter: EM_DEFAULT_MAXITER,
            miniter: 10,
        }
    }
}

impl EmPars {
    pub fn validate(&self) -> Result<(), BootError> {
        if !(self.tol > 0.0) {
            return Err(BootError::InvalidParameter("em tol must be > 0".into()));
        }
        if self.maxiter == 0 || self.miniter > self.maxiter {
            return Err(BootError::InvalidParameter(
                "em iterations must satisfy 1 <= miniter <= maxiter".into(),
            ));
        }
        Ok(())
    }
}

/// Levenberg–Marquardt settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LmPars {
    pub maxfev: usize,
    pub xtol: f64,
    pub ftol: f64,
}

impl Default for LmPars {
    fn default() -> Self {
        LmPars {
            maxfev: LM_DEFAULT_MAXFEV,
            xtol: LM_DEFAULT_XTOL,
            ftol: LM_DEFAULT_FTOL,
        }
    }
}

impl LmPars {
    pub fn validate(&self) -> Result<(), BootError> {
        if self.maxfev == 0 {
            return Err(BootError::InvalidParameter("lm maxfev must be >= 1".into()));
        }
        if !(self.xtol > 0.0) || !(self.ftol > 0.0) {
            return Err(BootError::InvalidParameter(
                "lm xtol and ftol must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Adaptive moment iteration settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmomPars {
    pub maxiter: usize,
    /// Maximum centroid shift, in pixels
    pub shiftmax: f64,
    pub etol: f64,
    pub ttol: f64,
}

impl Default for AdmomPars {
    fn default() -> Self {
        AdmomPars {
            maxiter: 200,
            shiftmax: 5.0,
            etol: 1.0e-5,
            ttol: 1.0e-3,
        }
    }
}

/// Solver settings override for the PSF stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SolverPars {
    Em(EmPars),
    Lm(LmPars),
    Admom(AdmomPars),
}
