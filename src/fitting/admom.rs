//! Adaptive second moments.
//!
//! The moments are measured with a gaussian weight whose covariance is iterated to twice
//! the weighted moments of the image, which at convergence matches the object for a
//! gaussian profile. With several observations the weighted sums are accumulated over
//! every pixel of every epoch and band; the centroid is shared.
//!
//! Outputs, on success:
//!
//! * `pars = [v, u, vv, vu, uu, flux]`,
//! * ellipticity `e` with a diagonal covariance `(2 / s2n)²`,
//! * the weight's `T`, the weighted signal-to-noise and a flux estimate
//!   `2 Σ W I × area` averaged over observations.

use std::marker::PhantomData;

use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::boot_errors::BootError;
use crate::constants::{ADMOM_FAINT, ADMOM_MAXIT, ADMOM_SHIFT, ObsList};
use crate::fitting::pars::AdmomPars;
use crate::fitting::traits::Solver;
use crate::fitting::{flagstr, FitResult};
use crate::gmix::{GMix, Gauss2D};
use crate::observation::Observation;

/// Adaptive moment solver over `D`, either one [`Observation`] or a slice of
/// [`ObsList`].
#[derive(Debug)]
pub struct AdmomSolver<D: ?Sized> {
    pars: AdmomPars,
    result: FitResult,
    gmix: Option<GMix>,
    _data: PhantomData<fn(&D)>,
}

impl<D: ?Sized> AdmomSolver<D> {
    pub fn new(pars: AdmomPars) -> Self {
        AdmomSolver {
            pars,
            result: FitResult::default(),
            gmix: None,
            _data: PhantomData,
        }
    }

    fn run(&mut self, obs: &[&Observation], guess: &GMix) -> Result<(), BootError> {
        self.gmix = None;
        let outcome = admom_core(obs, guess, &self.pars)?;
        let mut result = FitResult::failed("admom", outcome.flags, flagstr(outcome.flags));
        result.numiter = outcome.numiter;

        if outcome.flags == 0 {
            let w = outcome.weight;
            let t = w.t();
            let e1 = (w.uu - w.vv) / t;
            let e2 = 2.0 * w.vu / t;
            let e_err = 2.0 / outcome.s2n;
            let gm = GMix::from_components(vec![Gauss2D::new(
                outcome.flux,
                w.v,
                w.u,
                w.vv,
                w.vu,
                w.uu,
            )?])?;

            result.pars = DVector::from_vec(vec![w.v, w.u, w.vv, w.vu, w.uu, outcome.flux]);
            result.e = Some([e1, e2]);
            result.e_cov = Some(DMatrix::from_diagonal_element(2, 2, e_err * e_err));
            result.t = Some(t);
            result.s2n = Some(outcome.s2n);
            result.flux = vec![outcome.flux];
            result.flux_err = vec![outcome.flux / outcome.s2n];
            result.flux_s2n = vec![outcome.s2n];
            self.gmix = Some(gm);
        }
        self.result = result;
        Ok(())
    }
}

/// Unnormalized gaussian weight.
#[derive(Debug, Clone, Copy)]
struct Weight {
    v: f64,
    u: f64,
    vv: f64,
    vu: f64,
    uu: f64,
}

impl Weight {
    fn t(&self) -> f64 {
        self.vv + self.uu
    }

    fn det(&self) -> f64 {
        self.vv * self.uu - self.vu * self.vu
    }
}

struct AdmomOutcome {
    flags: u32,
    numiter: usize,
    weight: Weight,
    flux: f64,
    s2n: f64,
}

impl AdmomOutcome {
    fn failed(flags: u32, numiter: usize, weight: Weight) -> Self {
        AdmomOutcome {
            flags,
            numiter,
            weight,
            flux: 0.0,
            s2n: 0.0,
        }
    }
}

#[derive(Default)]
struct Sums {
    s: f64,
    sv: f64,
    su: f64,
    svv: f64,
    svu: f64,
    suu: f64,
    /// `Σ W² / w`, the variance of `s`
    var: f64,
    /// `Σ W I × area`, per observation
    flux: f64,
}

fn accumulate(obs: &Observation, w: &Weight, sums: &mut Sums) {
    let det = w.det();
    let (ivv, ivu, iuu) = (w.uu / det, w.vu / det, w.vv / det);
    let mut flux = 0.0;
    let (nrow, ncol) = obs.image.shape();
    for col in 0..ncol {
        for row in 0..nrow {
            let ivar = obs.weight[(row, col)];
            if ivar <= 0.0 {
                continue;
            }
            let (v, u) = obs.jacobian.vu(row as f64, col as f64);
            let dv = v - w.v;
            let du = u - w.u;
            let chi2 = ivv * dv * dv - 2.0 * ivu * dv * du + iuu * du * du;
            if chi2 > 100.0 {
                continue;
            }
            let wt = (-0.5 * chi2).exp();
            let wi = wt * obs.image[(row, col)];
            sums.s += wi;
            sums.sv += wi * dv;
            sums.su += wi * du;
            sums.svv += wi * dv * dv;
            sums.svu += wi * dv * du;
            sums.suu += wi * du * du;
            sums.var += wt * wt / ivar;
            flux += wi;
        }
    }
    sums.flux += flux * obs.jacobian.area();
}

fn admom_core(
    obs: &[&Observation],
    guess: &GMix,
    pars: &AdmomPars,
) -> Result<AdmomOutcome, BootError> {
    let first = obs
        .first()
        .ok_or_else(|| BootError::InvalidParameter("adaptive moments need an observation".into()))?;
    let (v0, u0) = guess.cen();
    let (vv, vu, uu) = guess.moments();
    let mut w = Weight { v: v0, u: u0, vv, vu, uu };
    if !(w.det() > 0.0) {
        return Err(BootError::GMixRange(format!(
            "admom guess has non-positive determinant {}",
            w.det()
        )));
    }
    let shiftmax = pars.shiftmax * first.jacobian.scale();

    for iter in 1..=pars.maxiter {
        let mut sums = Sums::default();
        for o in obs {
            accumulate(o, &w, &mut sums);
        }
        if !(sums.s > 0.0) {
            return Ok(AdmomOutcome::failed(ADMOM_FAINT, iter, w));
        }

        let dv = sums.sv / sums.s;
        let du = sums.su / sums.s;
        let mvv = sums.svv / sums.s - dv * dv;
        let mvu = sums.svu / sums.s - dv * du;
        let muu = sums.suu / sums.s - du * du;

        let next = Weight {
            v: w.v + dv,
            u: w.u + du,
            vv: 2.0 * mvv,
            vu: 2.0 * mvu,
            uu: 2.0 * muu,
        };
        if !(next.det() > 0.0) || !(next.t() > 0.0) {
            return Ok(AdmomOutcome::failed(ADMOM_FAINT, iter, w));
        }
        if (next.v - v0).hypot(next.u - u0) > shiftmax {
            return Ok(AdmomOutcome::failed(ADMOM_SHIFT, iter, next));
        }

        let (t_old, t_new) = (w.t(), next.t());
        let de1 = (next.uu - next.vv) / t_new - (w.uu - w.vv) / t_old;
        let de2 = 2.0 * next.vu / t_new - 2.0 * w.vu / t_old;
        let dt = t_new / t_old - 1.0;
        trace!("admom iteration {iter}: T={t_new} de=({de1}, {de2})");
        w = next;

        if de1.abs() < pars.etol && de2.abs() < pars.etol && dt.abs() < pars.ttol {
            // final sums at the converged weight
            let mut sums = Sums::default();
            for o in obs {
                accumulate(o, &w, &mut sums);
            }
            if !(sums.s > 0.0) || !(sums.var > 0.0) {
                return Ok(AdmomOutcome::failed(ADMOM_FAINT, iter, w));
            }
            return Ok(AdmomOutcome {
                flags: 0,
                numiter: iter,
                weight: w,
                flux: 2.0 * sums.flux / obs.len() as f64,
                s2n: sums.s / sums.var.sqrt(),
            });
        }
    }
    Ok(AdmomOutcome::failed(ADMOM_MAXIT, pars.maxiter, w))
}

impl<D: ?Sized> AdmomSolver<D> {
    fn result_ref(&self) -> &FitResult {
        &self.result
    }

    fn gmix_owned(&self) -> Result<GMix, BootError> {
        self.gmix
            .clone()
            .ok_or_else(|| BootError::GMixRange("adaptive moments produced no mixture".into()))
    }
}

impl Solver for AdmomSolver<Observation> {
    type Data = Observation;
    type Guess = GMix;

    fn go(&mut self, obs: &Observation, guess: &GMix) -> Result<(), BootError> {
        self.run(&[obs], guess)
    }

    fn result(&self) -> &FitResult {
        self.result_ref()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.gmix_owned()
    }
}

impl Solver for AdmomSolver<[ObsList]> {
    type Data = [ObsList];
    type Guess = GMix;

    fn go(&mut self, data: &[ObsList], guess: &GMix) -> Result<(), BootError> {
        let all: Vec<&Observation> = data.iter().flatten().collect();
        self.run(&all, guess)
    }

    fn result(&self) -> &FitResult {
        self.result_ref()
    }

    fn result_mut(&mut self) -> &mut FitResult {
        &mut self.result
    }

    fn gmix(&self) -> Result<GMix, BootError> {
        self.gmix_owned()
    }
}

#[cfg(test)]
mod admom_tests {
    use super::*;
    use crate::constants::ADMOM_MAXIT;
    use crate::jacobian::Jacobian;
    use approx::assert_relative_eq;

    fn gauss_obs(vv: f64, vu: f64, uu: f64, flux: f64) -> Observation {
        let jac = Jacobian::diagonal(0.263, 15.0, 15.0);
        let gm = GMix::from_full_pars(&[flux, 0.0, 0.0, vv, vu, uu]).unwrap();
        Observation::new(gm.make_image(31, 31, &jac), jac)
            .with_weight(DMatrix::from_element(31, 31, 100.0))
            .unwrap()
    }

    #[test]
    fn test_admom_recovers_gaussian_moments() {
        let obs = gauss_obs(0.2, 0.02, 0.3, 10.0);
        let guess = GMix::from_full_pars(&[1.0, 0.02, -0.02, 0.25, 0.0, 0.25]).unwrap();
        let mut solver = AdmomSolver::<Observation>::new(AdmomPars::default());
        solver.go(&obs, &guess).unwrap();

        let res = solver.result();
        assert_eq!(res.flags, 0, "{}", res.flagstr);
        assert_relative_eq!(res.t.unwrap(), 0.5, max_relative = 1e-2);
        let [e1, e2] = res.e.unwrap();
        assert_relative_eq!(e1, 0.2, epsilon = 5e-3);
        assert_relative_eq!(e2, 0.08, epsilon = 5e-3);
        assert_relative_eq!(res.flux[0], 10.0, max_relative = 2e-2);
        assert!(res.s2n.unwrap() > 0.0);
    }

    #[test]
    fn test_admom_blank_image_is_faint() {
        let jac = Jacobian::diagonal(0.263, 5.0, 5.0);
        let obs = Observation::new(DMatrix::zeros(11, 11), jac);
        let guess = GMix::from_full_pars(&[1.0, 0.0, 0.0, 0.2, 0.0, 0.2]).unwrap();
        let mut solver = AdmomSolver::<Observation>::new(AdmomPars::default());
        solver.go(&obs, &guess).unwrap();
        assert_eq!(solver.result().flags, ADMOM_FAINT);
        assert!(solver.gmix().is_err());
    }

    #[test]
    fn test_admom_maxit() {
        let obs = gauss_obs(0.2, 0.0, 0.2, 10.0);
        let guess = GMix::from_full_pars(&[1.0, 0.0, 0.0, 2.0, 0.0, 2.0]).unwrap();
        let pars = AdmomPars {
            maxiter: 1,
            ..AdmomPars::default()
        };
        let mut solver = AdmomSolver::<Observation>::new(pars);
        solver.go(&obs, &guess).unwrap();
        assert_eq!(solver.result().flags, ADMOM_MAXIT);
    }

    #[test]
    fn test_admom_multi_band() {
        let data = vec![
            vec![gauss_obs(0.2, 0.0, 0.2, 10.0)],
            vec![gauss_obs(0.2, 0.0, 0.2, 10.0)],
        ];
        let guess = GMix::from_full_pars(&[1.0, 0.0, 0.0, 0.25, 0.0, 0.25]).unwrap();
        let mut solver = AdmomSolver::<[ObsList]>::new(AdmomPars::default());
        solver.go(&data, &guess).unwrap();
        assert_eq!(solver.result().flags, 0);
        assert_relative_eq!(solver.result().t.unwrap(), 0.4, max_relative = 1e-2);
    }
}
