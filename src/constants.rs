//! # Constants and type definitions for gmix_bootstrap
//!
//! This module centralizes the **failure flags**, **sentinel values**, **default solver
//! tolerances**, the **tuned guess tables** and the **container aliases** used throughout
//! the crate.
//!
//! ## Overview
//!
//! - Bootstrapper flag bits (reported in fit results, OR-ed across metacal variants)
//! - Solver flag bits used by the native backend
//! - Sentinels used for per-band quantities that could not be measured
//! - Empirical flux/size splits for multi-gaussian PSF guesses (EM and coelliptical)
//! - Container aliases for per-band, per-epoch observation sets

use crate::observation::Observation;

// -------------------------------------------------------------------------------------------------
// Bootstrapper flags
// -------------------------------------------------------------------------------------------------

/// PSF flux signal-to-noise below the requested minimum
pub const BOOT_S2N_LOW: u32 = 1 << 0;

/// Galaxy-to-PSF size ratio `R2` too low
pub const BOOT_R2_LOW: u32 = 1 << 1;

/// Fourth-order size ratio `R4` too low
pub const BOOT_R4_LOW: u32 = 1 << 2;

/// T signal-to-noise measurement on the rounded image failed
pub const BOOT_TS2N_ROUND_FAIL: u32 = 1 << 3;

/// Convolution of the rounded model failed
pub const BOOT_ROUND_CONVOLVE_FAIL: u32 = 1 << 4;

/// Summed weight below the acceptable level
pub const BOOT_WEIGHTS_LOW: u32 = 1 << 5;

// -------------------------------------------------------------------------------------------------
// Native solver flags
// -------------------------------------------------------------------------------------------------

/// Generic failure (used when a mixture range error is caught at the retry boundary)
pub const FIT_FAILURE: u32 = 1;

/// EM did not reach the requested tolerance within `maxiter`
pub const EM_MAXITER: u32 = 1 << 1;

/// EM produced a degenerate mixture (zero flux or singular component)
pub const EM_RANGE_ERROR: u32 = 1 << 2;

/// Levenberg–Marquardt exhausted its function-evaluation budget
pub const LM_MAXFEV: u32 = 1 << 3;

/// Normal matrix singular at the solution
pub const LM_SINGULAR_MATRIX: u32 = 1 << 4;

/// Covariance at the solution not positive definite
pub const LM_NEG_COV_DIAG: u32 = 1 << 5;

/// Adaptive moments: maximum iterations reached
pub const ADMOM_MAXIT: u32 = 1 << 6;

/// Adaptive moments: centroid wandered further than `shiftmax`
pub const ADMOM_SHIFT: u32 = 1 << 7;

/// Adaptive moments: weighted sum or determinant not positive
pub const ADMOM_FAINT: u32 = 1 << 8;

/// Template flux: the weighted template norm vanished
pub const TEMPLATE_FLUX_ZERO: u32 = 1 << 9;

/// Sampler: all importance weights vanished or no sample in window
pub const SAMPLER_NO_WEIGHT: u32 = 1 << 10;

// -------------------------------------------------------------------------------------------------
// Sentinels
// -------------------------------------------------------------------------------------------------

/// Flux value reported for a band whose flux could not be measured
pub const FLUX_SENTINEL: f64 = -9999.0;

/// Flux error value reported for a band whose flux could not be measured
pub const FLUX_ERR_SENTINEL: f64 = 9999.0;

/// Key of the canonical unsheared metacal variant
pub const NOSHEAR: &str = "noshear";

// -------------------------------------------------------------------------------------------------
// Default solver settings
// -------------------------------------------------------------------------------------------------

/// EM fractional tolerance on the mixture size
pub const EM_DEFAULT_TOL: f64 = 1.0e-6;

/// EM maximum iterations
pub const EM_DEFAULT_MAXITER: usize = 50_000;

/// LM maximum function evaluations
pub const LM_DEFAULT_MAXFEV: usize = 4000;

/// LM relative parameter tolerance
pub const LM_DEFAULT_XTOL: f64 = 5.0e-5;

/// LM relative chi² tolerance
pub const LM_DEFAULT_FTOL: f64 = 5.0e-5;

/// Default metacal shear step
pub const METACAL_DEFAULT_STEP: f64 = 0.01;

// -------------------------------------------------------------------------------------------------
// Tuned guess tables
// -------------------------------------------------------------------------------------------------
//
// `P` rows are flux fractions, `F` rows are size multipliers relative to the overall
// size guess. Rows are indexed by `GaussCount` (one to five components).

/// EM flux fractions for 2..=5 gaussians
pub(crate) const EM_PGUESS: [&[f64]; 4] = [
    &[0.596510042804182, 0.4034898268889178],
    &[0.596510042804182, 0.4034898268889178, 1.303069003078001e-07],
    &[
        0.596510042804182,
        0.4034898268889178,
        1.303069003078001e-07,
        1.0e-8,
    ],
    &[0.59453032, 0.35671819, 0.03567182, 0.01189061, 0.00118906],
];

/// EM size multipliers for 2..=5 gaussians
pub(crate) const EM_FGUESS: [&[f64]; 4] = [
    &[0.5793612389470884, 1.621860687127999],
    &[0.5793612389470884, 1.621860687127999, 7.019347162356363],
    &[0.5793612389470884, 1.621860687127999, 7.019347162356363, 16.0],
    &[0.5, 1.0, 3.0, 10.0, 20.0],
];

/// Coelliptical (Moffat-like) flux fractions for 2..=5 gaussians
pub(crate) const MOFFAT_PGUESS: [&[f64]; 4] = [
    &[0.5, 0.5],
    &[0.27559669, 0.55817131, 0.166232],
    &[0.44534, 0.366951, 0.10506, 0.0826497],
    &[0.57874897, 0.32273483, 0.03327272, 0.0341253, 0.03111819],
];

/// Coelliptical (Moffat-like) size multipliers for 2..=5 gaussians
pub(crate) const MOFFAT_FGUESS: [&[f64]; 4] = [
    &[0.48955064, 1.50658978],
    &[0.36123609, 0.8426139, 2.58747785],
    &[0.541019, 1.19701, 0.282176, 3.51086],
    &[0.27831284, 0.9959897, 5.86989779, 5.63590429, 4.17285878],
];

// -------------------------------------------------------------------------------------------------
// Profile approximations (flux fractions / size multipliers) for the simple models
// -------------------------------------------------------------------------------------------------

pub(crate) const GAUSS_PVALS: [f64; 1] = [1.0];
pub(crate) const GAUSS_FVALS: [f64; 1] = [1.0];

pub(crate) const TURB_PVALS: [f64; 3] = [0.596510042804182, 0.4034898268889178, 1.303069003078001e-07];
pub(crate) const TURB_FVALS: [f64; 3] = [0.5793612389470884, 1.621860687127999, 7.019347162356363];

pub(crate) const EXP_PVALS: [f64; 6] = [
    0.00061601229677880041,
    0.0079461395724623237,
    0.053280454055540001,
    0.21797364640726541,
    0.45496740582554868,
    0.26521634184240478,
];
pub(crate) const EXP_FVALS: [f64; 6] = [
    0.002467115141477932,
    0.018147435573256168,
    0.07944063151366336,
    0.27137669897479122,
    0.79782256866993773,
    2.1623306025075739,
];

pub(crate) const DEV_PVALS: [f64; 10] = [
    6.5288960012625658e-05,
    0.00044199216814302695,
    0.0020859587871659754,
    0.0075913681418996841,
    0.02260266219257237,
    0.056532254390212859,
    0.11939049233042602,
    0.20969545753234975,
    0.29254151133139222,
    0.28905301416582552,
];
pub(crate) const DEV_FVALS: [f64; 10] = [
    2.9934935706271918e-07,
    3.4651596338231207e-06,
    2.4807910570562753e-05,
    0.00014307404300535354,
    0.000727531692982395,
    0.003458246439442726,
    0.0160866454407191,
    0.077006776775654429,
    0.41012562102501476,
    2.9812509778548648,
];

// -------------------------------------------------------------------------------------------------
// Containers
// -------------------------------------------------------------------------------------------------

/// All epochs of one band, in epoch order
pub type ObsList = Vec<Observation>;

/// One [`ObsList`] per band, in band order
pub type MultiBandObsList = Vec<ObsList>;

/// Parameter vector used by every least-squares solver
pub type Pars = nalgebra::DVector<f64>;
