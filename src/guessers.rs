//! # Guess generators
//!
//! Every retry of a fit draws a fresh starting point from a [`GuessGenerator`]. Guesses
//! are a central estimate perturbed with uniform noise: the center by a small absolute
//! offset, the shape by a larger absolute offset, sizes and fluxes by a fractional
//! offset, and multi-component flux splits by a small multiplicative factor.
//!
//! Each generator owns its random number generator. A runner keeps one generator for all
//! of its attempts, so successive retries explore different starting points.
//!
//! | generator                | guess                       | used by                   |
//! |--------------------------|-----------------------------|---------------------------|
//! | [`PsfLmGuesser`]         | `[c1, c2, g1, g2, T, F]`    | `gauss` / `turb` PSF      |
//! | [`EmGuesser`]            | [`GMix`] of `n` gaussians   | `emN` PSF                 |
//! | [`CoellipGuesser`]       | coelliptical layout         | `coellipN` PSF            |
//! | [`AdmomGuesser`]         | single-gaussian [`GMix`]    | adaptive moments          |
//! | [`ParsGuesser`]          | fixed vector + widths       | galaxy, caller guess      |
//! | [`TFluxGuesser`]         | PSF size and template flux  | galaxy                    |
//! | [`TFluxAndPriorGuesser`] | as above, center/shape from a prior | galaxy with prior |
//! | [`BdfGuesser`]           | bulge + disk layout         | bdf galaxy                |
//! | [`BdGuesser`]            | two-size bulge + disk       | bd galaxy                 |
//! | [`PriorSampleGuesser`]   | a draw from the prior       | shape-only galaxy         |

use std::sync::Arc;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::Rng;

use crate::boot_errors::BootError;
use crate::constants::Pars;
use crate::gmix::{GMix, Gauss2D};
use crate::models::{GalaxyModel, GaussCount};
use crate::observation::Observation;
use crate::priors::Prior;

/// Draws shapes again when `|g| >= 1`, up to this many times.
const MAX_SHAPE_REDRAW: usize = 100;

/// Source of starting points for a solver.
pub trait GuessGenerator {
    type Guess;

    fn guess(&mut self) -> Result<Self::Guess, BootError>;
}

impl<G: GuessGenerator + ?Sized> GuessGenerator for Box<G> {
    type Guess = G::Guess;

    fn guess(&mut self) -> Result<Self::Guess, BootError> {
        (**self).guess()
    }
}

/// Uniform deviate in `[-half, half)`.
fn srandu<R: Rng + ?Sized>(rng: &mut R, half: f64) -> f64 {
    half * (2.0 * rng.random::<f64>() - 1.0)
}

/// Total flux of an image, `sum * scale²`.
fn image_flux_guess(obs: &Observation) -> f64 {
    let scale = obs.jacobian.scale();
    obs.image.sum() * scale * scale
}

/// Shape `(g1, g2)` jittered around `(g1, g2)` by `half`, redrawn until `|g| < 1`.
fn jitter_shape(rng: &mut StdRng, g1: f64, g2: f64, half: f64) -> Result<(f64, f64), BootError> {
    for _ in 0..MAX_SHAPE_REDRAW {
        let n1 = g1 + srandu(rng, half);
        let n2 = g2 + srandu(rng, half);
        if n1.hypot(n2) < 1.0 {
            return Ok((n1, n2));
        }
    }
    Err(BootError::GMixRange(format!(
        "could not draw a shape with |g| < 1 around ({g1}, {g2})"
    )))
}

/// Guesses `[c1, c2, g1, g2, T, F]` for a fixed-profile PSF fit.
#[derive(Debug, Clone)]
pub struct PsfLmGuesser {
    tguess: f64,
    fguess: f64,
    rng: StdRng,
}

impl PsfLmGuesser {
    /// The flux guess is the image sum times the pixel area.
    pub fn new(obs: &Observation, tguess: f64, rng: StdRng) -> Self {
        PsfLmGuesser {
            tguess,
            fguess: image_flux_guess(obs),
            rng,
        }
    }
}

impl GuessGenerator for PsfLmGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        let rng = &mut self.rng;
        Ok(DVector::from_vec(vec![
            srandu(rng, 0.01),
            srandu(rng, 0.01),
            srandu(rng, 0.1),
            srandu(rng, 0.1),
            self.tguess * (1.0 + srandu(rng, 0.1)),
            self.fguess * (1.0 + srandu(rng, 0.1)),
        ]))
    }
}

/// Guesses an `n`-gaussian mixture for EM, from the tuned flux and size splits.
#[derive(Debug, Clone)]
pub struct EmGuesser {
    ngauss: GaussCount,
    sigma2: f64,
    rng: StdRng,
}

impl EmGuesser {
    /// # Arguments
    ///
    /// * `ngauss` - selects the row of the flux and size tables
    /// * `tguess` - total size the table multipliers are applied to
    /// * `rng` - jitter source, advanced by every guess
    pub fn new(ngauss: GaussCount, tguess: f64, rng: StdRng) -> Self {
        EmGuesser {
            ngauss,
            sigma2: tguess / 2.0,
            rng,
        }
    }
}

impl GuessGenerator for EmGuesser {
    type Guess = GMix;

    fn guess(&mut self) -> Result<GMix, BootError> {
        let rng = &mut self.rng;
        let s2 = self.sigma2;
        if self.ngauss == GaussCount::One {
            let g = Gauss2D::new(
                1.0 + srandu(rng, 0.1),
                srandu(rng, 0.1),
                srandu(rng, 0.1),
                s2 * (1.0 + srandu(rng, 0.1)),
                srandu(rng, 0.2 * s2),
                s2 * (1.0 + srandu(rng, 0.1)),
            )?;
            return GMix::from_components(vec![g]);
        }

        let (pvals, fvals) = self.ngauss.em_table();
        let comps = pvals
            .iter()
            .zip(fvals)
            .map(|(p, f)| {
                Gauss2D::new(
                    p * (1.0 + srandu(rng, 0.1)),
                    srandu(rng, 0.1),
                    srandu(rng, 0.1),
                    f * s2 * (1.0 + srandu(rng, 0.1)),
                    srandu(rng, 0.01),
                    f * s2 * (1.0 + srandu(rng, 0.1)),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        GMix::from_components(comps)
    }
}

/// Guesses the coelliptical layout `[c1, c2, g1, g2, T_1..T_n, F_1..F_n]`.
#[derive(Debug, Clone)]
pub struct CoellipGuesser {
    ngauss: GaussCount,
    tguess: f64,
    fguess: f64,
    rng: StdRng,
}

impl CoellipGuesser {
    pub fn new(obs: &Observation, ngauss: GaussCount, tguess: f64, rng: StdRng) -> Self {
        CoellipGuesser {
            ngauss,
            tguess,
            fguess: image_flux_guess(obs),
            rng,
        }
    }

    pub fn tguess(&self) -> f64 {
        self.tguess
    }

    pub fn fguess(&self) -> f64 {
        self.fguess
    }
}

impl GuessGenerator for CoellipGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        let rng = &mut self.rng;
        let n = self.ngauss.get();
        let mut guess = vec![
            srandu(rng, 0.01),
            srandu(rng, 0.01),
            srandu(rng, 0.05),
            srandu(rng, 0.05),
        ];
        if n == 1 {
            guess.push(self.tguess * (1.0 + srandu(rng, 0.1)));
            guess.push(self.fguess * (1.0 + srandu(rng, 0.1)));
        } else {
            let (pvals, fvals) = self.ngauss.moffat_table();
            for f in fvals {
                guess.push(self.tguess * f * (1.0 + srandu(rng, 0.01)));
            }
            for p in pvals {
                guess.push(self.fguess * p * (1.0 + srandu(rng, 0.01)));
            }
        }
        Ok(DVector::from_vec(guess))
    }
}

/// Guesses a round-ish single gaussian to seed adaptive moments.
#[derive(Debug, Clone)]
pub struct AdmomGuesser {
    tguess: f64,
    scale: f64,
    rng: StdRng,
}

impl AdmomGuesser {
    pub fn new(tguess: f64, scale: f64, rng: StdRng) -> Self {
        AdmomGuesser { tguess, scale, rng }
    }
}

impl GuessGenerator for AdmomGuesser {
    type Guess = GMix;

    fn guess(&mut self) -> Result<GMix, BootError> {
        let rng = &mut self.rng;
        let t = self.tguess * (1.0 + srandu(rng, 0.1));
        let half = 0.5 * t;
        let g = Gauss2D::new(
            1.0,
            srandu(rng, 0.5 * self.scale),
            srandu(rng, 0.5 * self.scale),
            half * (1.0 + srandu(rng, 0.01)),
            srandu(rng, 0.01 * half),
            half * (1.0 + srandu(rng, 0.01)),
        )?;
        GMix::from_components(vec![g])
    }
}

/// Perturbs a fixed parameter vector by `widths × U(-1, 1)`.
///
/// Widths default to `0.1` for every parameter.
#[derive(Debug, Clone)]
pub struct ParsGuesser {
    pars: Pars,
    widths: Pars,
    rng: StdRng,
}

impl ParsGuesser {
    pub fn new(pars: Pars, widths: Option<Pars>, rng: StdRng) -> Result<Self, BootError> {
        let widths = widths.unwrap_or_else(|| DVector::from_element(pars.len(), 0.1));
        if widths.len() != pars.len() {
            return Err(BootError::InvalidParameter(format!(
                "guess has {} parameters but {} widths",
                pars.len(),
                widths.len()
            )));
        }
        Ok(ParsGuesser { pars, widths, rng })
    }
}

impl GuessGenerator for ParsGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        let rng = &mut self.rng;
        let mut guess = self.pars.clone();
        for (i, g) in guess.iter_mut().enumerate() {
            if i == 2 || i == 3 {
                continue;
            }
            *g += srandu(rng, self.widths[i]);
        }
        if self.pars.len() > 3 {
            let half = self.widths[2].max(self.widths[3]);
            let (g1, g2) = jitter_shape(rng, self.pars[2], self.pars[3], half)?;
            guess[2] = g1;
            guess[3] = g2;
        }
        Ok(guess)
    }
}

/// Guesses a galaxy from the PSF size and the per-band template fluxes.
#[derive(Debug, Clone)]
pub struct TFluxGuesser {
    tguess: f64,
    fluxes: Vec<f64>,
    rng: StdRng,
}

impl TFluxGuesser {
    pub fn new(tguess: f64, fluxes: Vec<f64>, rng: StdRng) -> Self {
        TFluxGuesser {
            tguess,
            fluxes,
            rng,
        }
    }
}

impl GuessGenerator for TFluxGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        let rng = &mut self.rng;
        let mut guess = vec![
            srandu(rng, 0.01),
            srandu(rng, 0.01),
            srandu(rng, 0.1),
            srandu(rng, 0.1),
            self.tguess * (1.0 + srandu(rng, 0.1)),
        ];
        for f in &self.fluxes {
            guess.push(f * (1.0 + srandu(rng, 0.1)));
        }
        Ok(DVector::from_vec(guess))
    }
}

/// Overwrite size and fluxes of a prior draw with jittered estimates.
fn fold_size_and_flux(
    draw: &mut [f64],
    tguess: f64,
    fluxes: &[f64],
    rng: &mut StdRng,
) -> Result<(), BootError> {
    let nshape = draw.len().checked_sub(fluxes.len()).filter(|n| *n >= 5).ok_or_else(|| {
        BootError::InvalidParameter(format!(
            "prior draw of {} parameters cannot hold {} fluxes",
            draw.len(),
            fluxes.len()
        ))
    })?;
    draw[4] = tguess * (1.0 + srandu(rng, 0.1));
    for (slot, f) in draw[nshape..].iter_mut().zip(fluxes) {
        *slot = f * (1.0 + srandu(rng, 0.1));
    }
    Ok(())
}

/// Like [`TFluxGuesser`] with center, shape and any extra shape parameters drawn from a
/// prior.
#[derive(Debug, Clone)]
pub struct TFluxAndPriorGuesser {
    tguess: f64,
    fluxes: Vec<f64>,
    prior: Arc<dyn Prior>,
    rng: StdRng,
}

impl TFluxAndPriorGuesser {
    pub fn new(tguess: f64, fluxes: Vec<f64>, prior: Arc<dyn Prior>, rng: StdRng) -> Self {
        TFluxAndPriorGuesser {
            tguess,
            fluxes,
            prior,
            rng,
        }
    }
}

impl GuessGenerator for TFluxAndPriorGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        let mut draw = self.prior.sample(&mut self.rng);
        fold_size_and_flux(&mut draw, self.tguess, &self.fluxes, &mut self.rng)?;
        Ok(DVector::from_vec(draw))
    }
}

/// Guesses the bulge + disk layout `[c1, c2, g1, g2, T, fracdev, F...]`.
///
/// Center, shape and `fracdev` come from the prior; `fracdev` is kept inside `[0, 1]`.
#[derive(Debug, Clone)]
pub struct BdfGuesser {
    tguess: f64,
    fluxes: Vec<f64>,
    prior: Arc<dyn Prior>,
    rng: StdRng,
}

impl BdfGuesser {
    pub fn new(tguess: f64, fluxes: Vec<f64>, prior: Arc<dyn Prior>, rng: StdRng) -> Self {
        BdfGuesser {
            tguess,
            fluxes,
            prior,
            rng,
        }
    }
}

impl GuessGenerator for BdfGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        bulge_disk_guess(
            GalaxyModel::Bdf,
            self.prior.as_ref(),
            self.tguess,
            &self.fluxes,
            &mut self.rng,
        )
    }
}

/// Guesses the two-size bulge + disk layout `[c1, c2, g1, g2, T, log10(Tb/T), fracdev, F...]`.
///
/// The size ratio and `fracdev` come from the prior along with center and shape.
#[derive(Debug, Clone)]
pub struct BdGuesser {
    tguess: f64,
    fluxes: Vec<f64>,
    prior: Arc<dyn Prior>,
    rng: StdRng,
}

impl BdGuesser {
    pub fn new(tguess: f64, fluxes: Vec<f64>, prior: Arc<dyn Prior>, rng: StdRng) -> Self {
        BdGuesser {
            tguess,
            fluxes,
            prior,
            rng,
        }
    }
}

impl GuessGenerator for BdGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        bulge_disk_guess(
            GalaxyModel::Bd,
            self.prior.as_ref(),
            self.tguess,
            &self.fluxes,
            &mut self.rng,
        )
    }
}

/// `fracdev` is the last shape parameter of both bulge + disk layouts.
fn bulge_disk_guess(
    model: GalaxyModel,
    prior: &dyn Prior,
    tguess: f64,
    fluxes: &[f64],
    rng: &mut StdRng,
) -> Result<Pars, BootError> {
    let mut draw = prior.sample(rng);
    let npars = model.npars(fluxes.len());
    if draw.len() != npars {
        return Err(BootError::InvalidParameter(format!(
            "{model} prior draws {} parameters, expected {npars}",
            draw.len(),
        )));
    }
    fold_size_and_flux(&mut draw, tguess, fluxes, rng)?;
    let ifracdev = model.nshape() - 1;
    draw[ifracdev] = draw[ifracdev].clamp(0.0, 1.0);
    Ok(DVector::from_vec(draw))
}

/// Draws guesses directly from a prior.
#[derive(Debug, Clone)]
pub struct PriorSampleGuesser {
    prior: Arc<dyn Prior>,
    rng: StdRng,
}

impl PriorSampleGuesser {
    pub fn new(prior: Arc<dyn Prior>, rng: StdRng) -> Self {
        PriorSampleGuesser { prior, rng }
    }
}

impl GuessGenerator for PriorSampleGuesser {
    type Guess = Pars;

    fn guess(&mut self) -> Result<Pars, BootError> {
        Ok(DVector::from_vec(self.prior.sample(&mut self.rng)))
    }
}
