//! # Stage parameters
//!
//! Each bootstrapping stage takes its tunables as one struct with sensible defaults, a
//! validating builder and a `Display` implementation. The alternate form (`{:#}`)
//! prints an aligned, commented table suitable for logs:
//!
//! ```
//! use gmix_bootstrap::bootstrap::PsfFitParams;
//!
//! let params = PsfFitParams::builder()
//!     .tguess(0.3)
//!     .ntry(2)
//!     .build()
//!     .unwrap();
//! println!("{params:#}");
//! ```
//!
//! All parameter structs derive `serde` so they can be read from a configuration file.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::boot_errors::BootError;
use crate::constants::{METACAL_DEFAULT_STEP, NOSHEAR};
use crate::fitting::pars::{AdmomPars, LmPars, SolverPars};
use crate::gmix::model::simple_gmix;
use crate::gmix::GMix;
use crate::models::SimpleModel;

/// Width reserved for `name = value` in the alternate display.
const PARAM_COL: usize = 44;

macro_rules! line {
    ($f:expr, $fmt:expr, $val:expr, $comment:expr) => {{
        let s = format!($fmt, $val);
        let pad = if s.len() < PARAM_COL {
            " ".repeat(PARAM_COL - s.len())
        } else {
            " ".to_string()
        };
        writeln!($f, "  {}{}# {}", s, pad, $comment)
    }};
}

fn opt<T: fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map_or_else(|| "none".to_string(), |x| x.to_string())
}

fn invalid(msg: impl Into<String>) -> BootError {
    BootError::InvalidParameter(msg.into())
}

// -------------------------------------------------------------------------------------------------
// PSF stage
// -------------------------------------------------------------------------------------------------

/// Parameters of [`Bootstrapper::fit_psfs`](crate::bootstrap::Bootstrapper::fit_psfs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfFitParams {
    /// Starting size `T` for every PSF
    pub tguess: Option<f64>,
    /// Per-observation metadata key holding the starting size, used when `tguess` is unset
    pub tguess_key: Option<String>,
    /// Drop epochs whose PSF fit fails instead of aborting
    pub skip_failed: bool,
    pub ntry: usize,
    /// Solver settings; the family default is used when unset
    pub fit_pars: Option<SolverPars>,
    /// Keep an already attached PSF mixture
    pub skip_already_done: bool,
    /// Metadata key holding the flux the PSF mixture is rescaled to
    pub norm_key: Option<String>,
    /// Minimum PSF flux signal-to-noise; lower values fail the epoch
    pub min_s2n: Option<f64>,
}

impl Default for PsfFitParams {
    fn default() -> Self {
        PsfFitParams {
            tguess: None,
            tguess_key: None,
            skip_failed: true,
            ntry: 4,
            fit_pars: None,
            skip_already_done: true,
            norm_key: None,
            min_s2n: None,
        }
    }
}

impl PsfFitParams {
    /// Start from the defaults: four attempts, failed epochs skipped, attached mixtures
    /// kept.
    pub fn builder() -> PsfFitParamsBuilder {
        PsfFitParamsBuilder::new()
    }
}

/// Builder for [`PsfFitParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct PsfFitParamsBuilder {
    params: PsfFitParams,
}

impl PsfFitParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tguess(mut self, v: f64) -> Self {
        self.params.tguess = Some(v);
        self
    }
    pub fn tguess_key(mut self, v: impl Into<String>) -> Self {
        self.params.tguess_key = Some(v.into());
        self
    }
    pub fn skip_failed(mut self, v: bool) -> Self {
        self.params.skip_failed = v;
        self
    }
    pub fn ntry(mut self, v: usize) -> Self {
        self.params.ntry = v;
        self
    }
    pub fn fit_pars(mut self, v: SolverPars) -> Self {
        self.params.fit_pars = Some(v);
        self
    }
    pub fn skip_already_done(mut self, v: bool) -> Self {
        self.params.skip_already_done = v;
        self
    }
    pub fn norm_key(mut self, v: impl Into<String>) -> Self {
        self.params.norm_key = Some(v.into());
        self
    }
    pub fn min_s2n(mut self, v: f64) -> Self {
        self.params.min_s2n = Some(v);
        self
    }

    pub fn build(self) -> Result<PsfFitParams, BootError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl PsfFitParams {
    /// Check retries, size guess, s/n threshold and the solver settings.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.ntry == 0 {
            return Err(invalid("psf ntry must be >= 1"));
        }
        if let Some(t) = self.tguess {
            if !(t > 0.0) {
                return Err(invalid("psf tguess must be > 0"));
            }
        }
        if let Some(s2n) = self.min_s2n {
            if !s2n.is_finite() {
                return Err(invalid("psf min_s2n must be finite"));
            }
        }
        match &self.fit_pars {
            Some(SolverPars::Em(p)) => p.validate(),
            Some(SolverPars::Lm(p)) => p.validate(),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PsfFitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "PSF Fit Parameters")?;
            writeln!(f, "------------------")?;
            line!(f, "tguess            = {}", opt(&self.tguess), "Starting PSF size T")?;
            line!(f, "tguess_key        = {}", opt(&self.tguess_key), "Metadata key for T")?;
            line!(f, "skip_failed       = {}", self.skip_failed, "Drop failed epochs")?;
            line!(f, "ntry              = {}", self.ntry, "Attempts per PSF")?;
            line!(f, "skip_already_done = {}", self.skip_already_done, "Keep attached mixtures")?;
            line!(f, "norm_key          = {}", opt(&self.norm_key), "Metadata key for PSF flux")?;
            line!(f, "min_s2n           = {}", opt(&self.min_s2n), "Minimum PSF flux s/n")?;
            Ok(())
        } else {
            write!(
                f,
                "PsfFitParams(tguess={}, ntry={}, skip_failed={}, skip_already_done={}, min_s2n={})",
                opt(&self.tguess),
                self.ntry,
                self.skip_failed,
                self.skip_already_done,
                opt(&self.min_s2n),
            )
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Maximum likelihood
// -------------------------------------------------------------------------------------------------

/// Parameters of the maximum-likelihood galaxy fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxFitParams {
    pub lm_pars: LmPars,
    pub ntry: usize,
    /// Fixed starting point; the guess is otherwise built from the PSF size and flux
    pub guess: Option<Vec<f64>>,
    /// Perturbation half-widths around `guess`
    pub guess_widths: Option<Vec<f64>>,
}

impl Default for MaxFitParams {
    fn default() -> Self {
        MaxFitParams {
            lm_pars: LmPars::default(),
            ntry: 1,
            guess: None,
            guess_widths: None,
        }
    }
}

impl MaxFitParams {
    /// Start from a single attempt with the default solver settings.
    pub fn builder() -> MaxFitParamsBuilder {
        MaxFitParamsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), BootError> {
        self.lm_pars.validate()?;
        if self.ntry == 0 {
            return Err(invalid("max ntry must be >= 1"));
        }
        match (&self.guess, &self.guess_widths) {
            (None, Some(_)) => Err(invalid("guess_widths given without a guess")),
            (Some(g), Some(w)) if g.len() != w.len() => Err(invalid(format!(
                "guess has {} entries but guess_widths has {}",
                g.len(),
                w.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// Builder for [`MaxFitParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct MaxFitParamsBuilder {
    params: MaxFitParams,
}

impl MaxFitParamsBuilder {
    pub fn lm_pars(mut self, v: LmPars) -> Self {
        self.params.lm_pars = v;
        self
    }
    pub fn ntry(mut self, v: usize) -> Self {
        self.params.ntry = v;
        self
    }
    pub fn guess(mut self, v: Vec<f64>) -> Self {
        self.params.guess = Some(v);
        self
    }
    pub fn guess_widths(mut self, v: Vec<f64>) -> Self {
        self.params.guess_widths = Some(v);
        self
    }

    pub fn build(self) -> Result<MaxFitParams, BootError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for MaxFitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Max-Likelihood Fit Parameters")?;
            writeln!(f, "-----------------------------")?;
            line!(f, "maxfev       = {}", self.lm_pars.maxfev, "LM function evaluations")?;
            line!(f, "xtol         = {:.1e}", self.lm_pars.xtol, "LM parameter tolerance")?;
            line!(f, "ftol         = {:.1e}", self.lm_pars.ftol, "LM chi2 tolerance")?;
            line!(f, "ntry         = {}", self.ntry, "Attempts")?;
            line!(f, "fixed guess  = {}", self.guess.is_some(), "Caller-supplied guess")?;
            Ok(())
        } else {
            write!(
                f,
                "MaxFitParams(maxfev={}, xtol={:.1e}, ftol={:.1e}, ntry={})",
                self.lm_pars.maxfev, self.lm_pars.xtol, self.lm_pars.ftol, self.ntry
            )
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Sampling and covariance
// -------------------------------------------------------------------------------------------------

/// Parameters of the iterated importance sampling stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsampleParams {
    /// Sample count of each iteration
    pub nsample: Vec<usize>,
    /// Degrees of freedom of the Student-t proposal
    pub df: f64,
    pub min_err: Option<Vec<f64>>,
    pub max_err: Option<Vec<f64>>,
    /// Proposal width multiplier
    pub ifactor: f64,
}

impl Default for IsampleParams {
    fn default() -> Self {
        IsampleParams {
            nsample: vec![500, 2000],
            df: 2.1,
            min_err: None,
            max_err: None,
            ifactor: 1.0,
        }
    }
}

impl IsampleParams {
    /// Start from the default two-pass schedule.
    pub fn builder() -> IsampleParamsBuilder {
        IsampleParamsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), BootError> {
        if self.nsample.is_empty() || self.nsample.contains(&0) {
            return Err(invalid("nsample needs at least one positive count"));
        }
        if !(self.df > 0.0) {
            return Err(invalid("df must be > 0"));
        }
        if !(self.ifactor > 0.0) {
            return Err(invalid("ifactor must be > 0"));
        }
        if let (Some(lo), Some(hi)) = (&self.min_err, &self.max_err) {
            if lo.len() != hi.len() || lo.iter().zip(hi).any(|(l, h)| l > h) {
                return Err(invalid("min_err and max_err must pair up with min <= max"));
            }
        }
        Ok(())
    }
}

/// Builder for [`IsampleParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct IsampleParamsBuilder {
    params: IsampleParams,
}

impl IsampleParamsBuilder {
    pub fn nsample(mut self, v: Vec<usize>) -> Self {
        self.params.nsample = v;
        self
    }
    pub fn df(mut self, v: f64) -> Self {
        self.params.df = v;
        self
    }
    pub fn min_err(mut self, v: Vec<f64>) -> Self {
        self.params.min_err = Some(v);
        self
    }
    pub fn max_err(mut self, v: Vec<f64>) -> Self {
        self.params.max_err = Some(v);
        self
    }
    pub fn ifactor(mut self, v: f64) -> Self {
        self.params.ifactor = v;
        self
    }

    pub fn build(self) -> Result<IsampleParams, BootError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for IsampleParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Importance Sampling Parameters")?;
            writeln!(f, "------------------------------")?;
            line!(f, "nsample = {:?}", self.nsample, "Samples per iteration")?;
            line!(f, "df      = {:.2}", self.df, "Student-t degrees of freedom")?;
            line!(f, "ifactor = {:.2}", self.ifactor, "Proposal width multiplier")?;
            Ok(())
        } else {
            write!(
                f,
                "IsampleParams(nsample={:?}, df={:.2}, ifactor={:.2})",
                self.nsample, self.df, self.ifactor
            )
        }
    }
}

/// Parameters of the prior-sample reweighting stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsampleParams {
    /// Half-width of the acceptance box, in units of the fit errors
    pub nsigma: f64,
}

impl Default for PsampleParams {
    fn default() -> Self {
        PsampleParams { nsigma: 4.0 }
    }
}

impl PsampleParams {
    pub fn new(nsigma: f64) -> Result<Self, BootError> {
        let params = PsampleParams { nsigma };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), BootError> {
        if !(self.nsigma > 0.0) {
            return Err(invalid("nsigma must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Display for PsampleParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PsampleParams(nsigma={:.2})", self.nsigma)
    }
}

/// Step settings of the numerical covariance.
///
/// Center and shape use the absolute step `h`; size, the bulge + disk parameters and fluxes use
/// `h × m × max(|p|, h)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovParams {
    pub h: f64,
    pub m: f64,
}

impl Default for CovParams {
    fn default() -> Self {
        CovParams { h: 1.0e-3, m: 5.0 }
    }
}

impl CovParams {
    pub fn new(h: f64, m: f64) -> Result<Self, BootError> {
        let params = CovParams { h, m };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), BootError> {
        if !(self.h > 0.0) || !(self.m > 0.0) {
            return Err(invalid("covariance steps h and m must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Display for CovParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CovParams(h={:.1e}, m={:.2})", self.h, self.m)
    }
}

// -------------------------------------------------------------------------------------------------
// Adaptive moments and metacal
// -------------------------------------------------------------------------------------------------

/// Parameters of the adaptive moment bootstrapper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmomParams {
    pub ntry: usize,
    pub pars: AdmomPars,
}

impl Default for AdmomParams {
    fn default() -> Self {
        AdmomParams {
            ntry: 4,
            pars: AdmomPars::default(),
        }
    }
}

impl AdmomParams {
    pub fn builder() -> AdmomParamsBuilder {
        AdmomParamsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), BootError> {
        if self.ntry == 0 {
            return Err(invalid("admom ntry must be >= 1"));
        }
        if self.pars.maxiter == 0 {
            return Err(invalid("admom maxiter must be >= 1"));
        }
        if !(self.pars.shiftmax > 0.0) || !(self.pars.etol > 0.0) || !(self.pars.ttol > 0.0) {
            return Err(invalid("admom shiftmax, etol and ttol must be > 0"));
        }
        Ok(())
    }
}

/// Builder for [`AdmomParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct AdmomParamsBuilder {
    params: AdmomParams,
}

impl AdmomParamsBuilder {
    pub fn ntry(mut self, v: usize) -> Self {
        self.params.ntry = v;
        self
    }
    pub fn maxiter(mut self, v: usize) -> Self {
        self.params.pars.maxiter = v;
        self
    }
    pub fn shiftmax(mut self, v: f64) -> Self {
        self.params.pars.shiftmax = v;
        self
    }
    pub fn etol(mut self, v: f64) -> Self {
        self.params.pars.etol = v;
        self
    }
    pub fn ttol(mut self, v: f64) -> Self {
        self.params.pars.ttol = v;
        self
    }

    pub fn build(self) -> Result<AdmomParams, BootError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for AdmomParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Adaptive Moment Parameters")?;
            writeln!(f, "--------------------------")?;
            line!(f, "ntry     = {}", self.ntry, "Attempts")?;
            line!(f, "maxiter  = {}", self.pars.maxiter, "Iterations per attempt")?;
            line!(f, "shiftmax = {:.2}", self.pars.shiftmax, "Maximum centroid shift (pixels)")?;
            line!(f, "etol     = {:.1e}", self.pars.etol, "Ellipticity tolerance")?;
            line!(f, "Ttol     = {:.1e}", self.pars.ttol, "Fractional size tolerance")?;
            Ok(())
        } else {
            write!(
                f,
                "AdmomParams(ntry={}, maxiter={}, shiftmax={:.2}, etol={:.1e}, Ttol={:.1e})",
                self.ntry, self.pars.maxiter, self.pars.shiftmax, self.pars.etol, self.pars.ttol
            )
        }
    }
}

/// PSF the sheared images are reconvolved with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetacalPsf {
    /// Dilated copy of each epoch's PSF
    #[default]
    Dilate,
    /// Round gaussian enclosing the dilated PSF
    Gauss,
    /// Round gaussian fitted to each epoch's PSF, then dilated
    FitGauss,
    /// The same round gaussian of size `t` for every epoch
    Analytic { t: f64 },
}

impl MetacalPsf {
    /// Unit-flux mixture of an analytic PSF, `None` for the PSF-derived choices.
    pub fn analytic_gmix(&self) -> Result<Option<GMix>, BootError> {
        match *self {
            MetacalPsf::Analytic { t } => {
                simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, t, 1.0]).map(Some)
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Display for MetacalPsf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetacalPsf::Dilate => f.write_str("dilate"),
            MetacalPsf::Gauss => f.write_str("gauss"),
            MetacalPsf::FitGauss => f.write_str("fitgauss"),
            MetacalPsf::Analytic { t } => write!(f, "analytic(T={t})"),
        }
    }
}

/// Metacal variants to request from the shearing transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetacalParams {
    /// Variant keys; must include `"noshear"`
    pub types: Vec<String>,
    /// Shear step of the signed variants
    pub step: f64,
    /// Reconvolution PSF
    #[serde(default)]
    pub psf: MetacalPsf,
}

impl Default for MetacalParams {
    fn default() -> Self {
        MetacalParams {
            types: ["noshear", "1p", "1m", "2p", "2m"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            step: METACAL_DEFAULT_STEP,
            psf: MetacalPsf::default(),
        }
    }
}

impl MetacalParams {
    /// Start from the five standard variants, the default step and the dilated PSF.
    ///
    /// # See also
    ///
    /// * [`MetacalParamsBuilder::analytic_psf`]
    pub fn builder() -> MetacalParamsBuilder {
        MetacalParamsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), BootError> {
        if !self.types.iter().any(|t| t == NOSHEAR) {
            return Err(invalid(format!("metacal types must include '{NOSHEAR}'")));
        }
        if !(self.step > 0.0) {
            return Err(invalid("metacal step must be > 0"));
        }
        if let MetacalPsf::Analytic { t } = self.psf {
            if !(t > 0.0) || !t.is_finite() {
                return Err(invalid(format!("analytic metacal psf needs T > 0, got {t}")));
            }
        }
        Ok(())
    }
}

/// Builder for [`MetacalParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct MetacalParamsBuilder {
    params: MetacalParams,
}

impl MetacalParamsBuilder {
    pub fn types<I, S>(mut self, v: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.types = v.into_iter().map(Into::into).collect();
        self
    }
    pub fn step(mut self, v: f64) -> Self {
        self.params.step = v;
        self
    }
    pub fn psf(mut self, v: MetacalPsf) -> Self {
        self.params.psf = v;
        self
    }
    /// Reconvolve every variant with a round gaussian of size `t`.
    pub fn analytic_psf(self, t: f64) -> Self {
        self.psf(MetacalPsf::Analytic { t })
    }

    pub fn build(self) -> Result<MetacalParams, BootError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for MetacalParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetacalParams(types={:?}, step={}, psf={})",
            self.types, self.step, self.psf
        )
    }
}
