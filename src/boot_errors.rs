//! Error type of the crate.
//!
//! Stage methods return [`BootError`]; numerical failures inside a solver are not
//! errors but non-zero `flags` on its [`FitResult`](crate::fitting::FitResult), turned
//! into [`BootError::PsfFailure`] or [`BootError::GalFailure`] by the stage that gives
//! up on them.

use thiserror::Error;

use crate::bootstrap::Stage;

/// Errors raised by the bootstrapping stages and the solvers they drive.
///
/// PSF failures ([`PsfFailure`](BootError::PsfFailure), [`PsfLowS2n`](BootError::PsfLowS2n))
/// are the ones an epoch can be dropped for; everything else propagates.
#[derive(Error, Debug, Clone)]
pub enum BootError {
    #[error("PSF fit failure: {0}")]
    PsfFailure(String),

    #[error("low PSF flux s/n {s2n} (minimum {min_s2n})")]
    PsfLowS2n { s2n: f64, min_s2n: f64 },

    #[error("galaxy fit failure: {reason} (flags={flags})")]
    GalFailure { reason: String, flags: u32 },

    #[error("stage {needed:?} has not been run (bootstrapper is at {current:?})")]
    StageNotReached { needed: Stage, current: Stage },

    #[error("Gaussian mixture out of range: {0}")]
    GMixRange(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("observation in band {band}, epoch {epoch} does not have a PSF set")]
    MissingPsf { band: usize, epoch: usize },

    #[error("band {band} has no fitted PSF mixture; run the PSF stage first")]
    MissingPsfGmix { band: usize },

    #[error("Linear algebra failure: {0}")]
    LinAlg(String),

    #[error("Metacal transform failure: {0}")]
    Metacal(String),
}

impl BootError {
    /// Shorthand for a galaxy failure with a message and the solver flags.
    pub(crate) fn gal(reason: impl Into<String>, flags: u32) -> Self {
        BootError::GalFailure {
            reason: reason.into(),
            flags,
        }
    }

    /// True for errors the PSF stage may recover from by dropping the epoch.
    pub fn is_psf_failure(&self) -> bool {
        matches!(
            self,
            BootError::PsfFailure(_) | BootError::PsfLowS2n { .. }
        )
    }
}

impl PartialEq for BootError {
    fn eq(&self, other: &Self) -> bool {
        use BootError::*;
        match (self, other) {
            (PsfFailure(a), PsfFailure(b)) => a == b,
            (
                PsfLowS2n {
                    s2n: a,
                    min_s2n: ma,
                },
                PsfLowS2n {
                    s2n: b,
                    min_s2n: mb,
                },
            ) => a == b && ma == mb,
            (
                GalFailure {
                    reason: a,
                    flags: fa,
                },
                GalFailure {
                    reason: b,
                    flags: fb,
                },
            ) => a == b && fa == fb,
            (
                StageNotReached {
                    needed: a,
                    current: ca,
                },
                StageNotReached {
                    needed: b,
                    current: cb,
                },
            ) => a == b && ca == cb,
            (GMixRange(a), GMixRange(b)) => a == b,
            (InvalidModel(a), InvalidModel(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (MissingPsf { band: a, epoch: ea }, MissingPsf { band: b, epoch: eb }) => {
                a == b && ea == eb
            }
            (MissingPsfGmix { band: a }, MissingPsfGmix { band: b }) => a == b,
            (LinAlg(a), LinAlg(b)) => a == b,
            (Metacal(a), Metacal(b)) => a == b,
            _ => false,
        }
    }
}
