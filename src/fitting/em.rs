//! Expectation-maximization fit of a free gaussian mixture to one image.
//!
//! The image is shifted by a fixed sky level so that every pixel is strictly positive,
//! then treated as a binned sample of `mixture + sky`. Each iteration assigns pixel
//! counts to the components in proportion to their surface brightness (E step) and
//! re-estimates each component's flux, centroid and covariance from its share (M step).
//! The sky component is held fixed. Iteration stops once the relative change of the
//! mixture size `T` falls below `tol`.

use log::debug;
use nalgebra::DVector;

use crate::boot_errors::BootError;
use crate::constants::{EM_MAXITER, EM_RANGE_ERROR};
use crate::fitting::pars::EmPars;
use crate::fitting::traits::Solver;
use crate::fitting::{flagstr, template_flux_err, FitResult};
use crate::gmix::{GMix, Gauss2D};
use crate::observation::Observation;

/// Responsibilities below this are treated as an empty component.
const MIN_COMPONENT_WEIGHT: f64 = 1.0e-300;

/// Expectation-maximization fit of a free gaussian mixture to a PSF image.
#[derive(Debug, Clone)]
pub struct EmSolver {
    pars: EmPars,
    result: FitResult,
    gmix: Option<GMix>,
}

impl EmSolver {
    pub fn new(pars: EmPars) -> Self {
        EmSolver {
            pars,
            result: FitResult::default(),
            gmix: None,
        }
    }
}

/// Pixel positions and counts of the sky-shifted image.
struct EmData {
    pixels: Vec<(f64, f64, f64)>,
    sky: f64,
    source_counts: f64,
}

/// Sky level added to make the smallest pixel `0.001 * (max - min)`.
pub(crate) fn em_sky(obs: &Observation) -> f64 {
    let imin = obs.image.min();
    let imax = obs.image.max();
    0.001 * (imax - imin) - imin
}

fn prep_data(obs: &Observation) -> EmData {
    let sky = em_sky(obs);
    let area = obs.jacobian.area();
    let (nrow, ncol) = obs.image.shape();
    let mut pixels = Vec::with_capacity(nrow * ncol);
    let mut source_counts = 0.0;
    for col in 0..ncol {
        for row in 0..nrow {
            let val = obs.image[(row, col)];
            let (v, u) = obs.jacobian.vu(row as f64, col as f64);
            pixels.push((v, u, (val + sky) * area));
            source_counts += val * area;
        }
    }
    EmData {
        pixels,
        sky,
        source_counts,
    }
}

struct EmOutcome {
    flags: u32,
    numiter: usize,
    gmix: Option<GMix>,
}

fn run_em(data: &EmData, guess: &GMix, pars: &EmPars) -> Result<EmOutcome, BootError> {
    let gpsum = guess.psum();
    if !(gpsum > 0.0) {
        return Err(BootError::GMixRange(format!(
            "em guess must have positive flux, got {gpsum}"
        )));
    }
    if !(data.source_counts > 0.0) {
        return Ok(EmOutcome {
            flags: EM_RANGE_ERROR,
            numiter: 0,
            gmix: None,
        });
    }

    let scale = data.source_counts / gpsum;
    let mut comps = guess
        .components()
        .iter()
        .map(|g| Gauss2D::new(g.p * scale, g.v, g.u, g.vv, g.vu, g.uu))
        .collect::<Result<Vec<_>, _>>()?;

    let ngauss = comps.len();
    let mut sums = vec![[0.0_f64; 6]; ngauss];
    let mut evals = vec![0.0_f64; ngauss];
    let mut t_old = f64::INFINITY;

    for iter in 1..=pars.maxiter {
        sums.iter_mut().for_each(|s| *s = [0.0; 6]);

        for &(v, u, counts) in &data.pixels {
            let mut model = data.sky;
            for (e, g) in evals.iter_mut().zip(&comps) {
                *e = g.eval(v, u);
                model += *e;
            }
            if !(model > 0.0) {
                continue;
            }
            for (s, e) in sums.iter_mut().zip(&evals) {
                let r = counts * e / model;
                s[0] += r;
                s[1] += r * v;
                s[2] += r * u;
                s[3] += r * v * v;
                s[4] += r * v * u;
                s[5] += r * u * u;
            }
        }

        let mut next = Vec::with_capacity(ngauss);
        for (s, old) in sums.iter().zip(&comps) {
            if s[0] < MIN_COMPONENT_WEIGHT {
                next.push(Gauss2D::new(0.0, old.v, old.u, old.vv, old.vu, old.uu)?);
                continue;
            }
            let v = s[1] / s[0];
            let u = s[2] / s[0];
            let g = Gauss2D::new(
                s[0],
                v,
                u,
                s[3] / s[0] - v * v,
                s[4] / s[0] - v * u,
                s[5] / s[0] - u * u,
            );
            match g {
                Ok(g) => next.push(g),
                Err(err) => {
                    debug!("em iteration {iter}: {err}");
                    return Ok(EmOutcome {
                        flags: EM_RANGE_ERROR,
                        numiter: iter,
                        gmix: None,
                    });
                }
            }
        }
        comps = next;

        let gm = GMix::from_components(comps.clone())?;
        let t = gm.t();
        if !(t > 0.0) {
            return Ok(EmOutcome {
                flags: EM_RANGE_ERROR,
                numiter: iter,
                gmix: None,
            });
        }
        let tdiff = ((t - t_old) / t).abs();
        t_old = t;
        if iter >= pars.miniter && tdiff < pars.tol {
            return Ok(EmOutcome {
                flags: 0,
                numiter: iter,
                gmix: Some(gm),
            });
        }
    }

    Ok(EmOutcome {
        flags: EM_MAXITER,
        numiter: pars.maxiter,
        gmix: None,
    })
}

impl Solver for EmSolver {
    type Data = Observation;
    type Guess = GMix;

    fn go(&mut self, obs: &Observation, guess: &GMix) -> Result<(), BootError> {
        self.gmix = None;
        let model = format!("em{}", guess.len());
        let data = prep_data(obs);
        let outcome = run_em(&data, guess, &self.pars)?;

        let mut result = FitResult::failed(model, outcome.flags, flagstr(outcome.flags));
        result.numiter = outcome.numiter;

        if let (0, Some(gm)) = (outcome.flags, outcome.gmix) {
            match gm.g1g2t() {
                Ok((g1, g2, t)) => {
                    result.pars = DVector::from_vec(gm.full_pars());
                    result.g = Some([g1, g2]);
                    result.t = Some(t);
                    result.flux = vec![gm.psum()];
                    result.flux_err = vec![template_flux_err(obs, &gm)?];
                    self.gmix = Some(gm);
                }
                Err(err) => {
                    debug!("em result out of range: {err}");
                    result.flags = EM_RANGE_ERROR;
                    result.flagstr = flagstr(EM_RANGE_ERROR);
                }
            }
        }
        self.result = result;
        Ok(())
    }

    fn result(&self) -> &FitResult {
        &self.result
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.gmix
            .clone()
            .ok_or_else(|| BootError::GMixRange("em fit produced no mixture".into()))
    }
}
