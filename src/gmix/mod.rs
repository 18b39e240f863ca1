//! # Gaussian mixtures
//!
//! A [`GMix`] is a weighted sum of elliptical gaussians in the sky plane. It represents a
//! PSF or a galaxy light profile, is attached to an observation once a fit succeeds, and is
//! freely copied for convolution.
//!
//! ## Conventions
//!
//! * Coordinates are sky-plane offsets `(v, u)` from the jacobian center, in arcsec.
//! * Each component stores its flux `p`, its center and its covariance `(vv, vu, uu)`.
//! * Rendered images hold surface brightness at the pixel centers: the flux of a rendered
//!   mixture is `sum(image) * jacobian.area()`.
//! * Size is `T = <v²> + <u²>`; distortion is `e1 = (<u²> - <v²>) / T`, `e2 = 2 <uv> / T`.
//!
//! ## See also
//! * [`model`] – construction of mixtures from fit parameter vectors.
//! * [`shape`] – conversions between `g`, `e` and second moments.

pub mod model;
pub mod shape;

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::boot_errors::BootError;
use crate::jacobian::Jacobian;

/// Exponent below which a gaussian contributes nothing when rendering.
const MAX_CHI2: f64 = 25.0 * 2.0;

/// One elliptical gaussian component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gauss2D {
    pub p: f64,
    pub v: f64,
    pub u: f64,
    pub vv: f64,
    pub vu: f64,
    pub uu: f64,
    det: f64,
    // inverse covariance terms
    dvv: f64,
    dvu: f64,
    duu: f64,
    pnorm: f64,
}

impl Gauss2D {
    /// Build a component; fails if the covariance is not positive definite.
    pub fn new(p: f64, v: f64, u: f64, vv: f64, vu: f64, uu: f64) -> Result<Self, BootError> {
        let det = vv * uu - vu * vu;
        if !(det > 1.0e-200) || !vv.is_finite() || !uu.is_finite() || !p.is_finite() {
            return Err(BootError::GMixRange(format!(
                "bad covariance: vv={vv} vu={vu} uu={uu} det={det}"
            )));
        }
        let idet = 1.0 / det;
        Ok(Gauss2D {
            p,
            v,
            u,
            vv,
            vu,
            uu,
            det,
            dvv: uu * idet,
            dvu: vu * idet,
            duu: vv * idet,
            pnorm: p / (2.0 * PI * det.sqrt()),
        })
    }

    /// Size `T = Ivv + Iuu`.
    pub fn t(&self) -> f64 {
        self.vv + self.uu
    }

    pub fn det(&self) -> f64 {
        self.det
    }

    /// Surface brightness of this component at `(v, u)`.
    #[inline]
    pub fn eval(&self, v: f64, u: f64) -> f64 {
        let dv = v - self.v;
        let du = u - self.u;
        let chi2 = self.dvv * dv * dv + self.duu * du * du - 2.0 * self.dvu * dv * du;
        if chi2 < MAX_CHI2 {
            self.pnorm * (-0.5 * chi2).exp()
        } else {
            0.0
        }
    }

    /// Normalized density (unit flux) at `(v, u)`.
    #[inline]
    pub(crate) fn density(&self, v: f64, u: f64) -> f64 {
        if self.p == 0.0 {
            return 0.0;
        }
        self.eval(v, u) / self.p
    }
}

/// A weighted sum of [`Gauss2D`] components.
#[derive(Debug, Clone, PartialEq)]
pub struct GMix {
    comps: Vec<Gauss2D>,
}

impl GMix {
    /// Mixture of `comps`; an empty list is a range error.
    pub fn from_components(comps: Vec<Gauss2D>) -> Result<Self, BootError> {
        if comps.is_empty() {
            return Err(BootError::GMixRange("mixture has no components".into()));
        }
        Ok(GMix { comps })
    }

    /// Build from the flat `[p, v, u, vv, vu, uu] * ngauss` layout.
    pub fn from_full_pars(pars: &[f64]) -> Result<Self, BootError> {
        if pars.is_empty() || pars.len() % 6 != 0 {
            return Err(BootError::GMixRange(format!(
                "full mixture parameters must be a multiple of 6, got {}",
                pars.len()
            )));
        }
        let comps = pars
            .chunks_exact(6)
            .map(|c| Gauss2D::new(c[0], c[1], c[2], c[3], c[4], c[5]))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_components(comps)
    }

    /// Flat `[p, v, u, vv, vu, uu] * ngauss` layout.
    pub fn full_pars(&self) -> Vec<f64> {
        self.comps
            .iter()
            .flat_map(|g| [g.p, g.v, g.u, g.vv, g.vu, g.uu])
            .collect()
    }

    /// Components in construction order.
    pub fn components(&self) -> &[Gauss2D] {
        &self.comps
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    /// Total flux.
    pub fn psum(&self) -> f64 {
        self.comps.iter().map(|g| g.p).sum()
    }

    /// Rescale every component so the total flux equals `psum`.
    pub fn set_psum(&mut self, psum: f64) -> Result<(), BootError> {
        let current = self.psum();
        if current == 0.0 {
            return Err(BootError::GMixRange("cannot rescale a zero-flux mixture".into()));
        }
        let fac = psum / current;
        for g in self.comps.iter_mut() {
            *g = Gauss2D::new(g.p * fac, g.v, g.u, g.vv, g.vu, g.uu)?;
        }
        Ok(())
    }

    /// Flux-weighted centroid `(v, u)`.
    pub fn cen(&self) -> (f64, f64) {
        let psum = self.psum();
        let v = self.comps.iter().map(|g| g.p * g.v).sum::<f64>() / psum;
        let u = self.comps.iter().map(|g| g.p * g.u).sum::<f64>() / psum;
        (v, u)
    }

    /// Move the centroid to `(v, u)`.
    pub fn set_cen(&mut self, v: f64, u: f64) -> Result<(), BootError> {
        let (cv, cu) = self.cen();
        for g in self.comps.iter_mut() {
            *g = Gauss2D::new(g.p, g.v - cv + v, g.u - cu + u, g.vv, g.vu, g.uu)?;
        }
        Ok(())
    }

    /// Total second moments `(vv, vu, uu)` about the centroid.
    pub fn moments(&self) -> (f64, f64, f64) {
        let psum = self.psum();
        let (cv, cu) = self.cen();
        let mut vv = 0.0;
        let mut vu = 0.0;
        let mut uu = 0.0;
        for g in &self.comps {
            vv += g.p * (g.vv + g.v * g.v);
            vu += g.p * (g.vu + g.v * g.u);
            uu += g.p * (g.uu + g.u * g.u);
        }
        (
            vv / psum - cv * cv,
            vu / psum - cv * cu,
            uu / psum - cu * cu,
        )
    }

    /// Size `T = <v²> + <u²>`.
    pub fn t(&self) -> f64 {
        let (vv, _, uu) = self.moments();
        vv + uu
    }

    /// Distortion and size `(e1, e2, T)`.
    pub fn e1e2t(&self) -> Result<(f64, f64, f64), BootError> {
        let (vv, vu, uu) = self.moments();
        let t = vv + uu;
        if !(t > 0.0) {
            return Err(BootError::GMixRange(format!("non-positive T: {t}")));
        }
        Ok(((uu - vv) / t, 2.0 * vu / t, t))
    }

    /// Reduced shear and size `(g1, g2, T)`.
    pub fn g1g2t(&self) -> Result<(f64, f64, f64), BootError> {
        let (e1, e2, t) = self.e1e2t()?;
        let (g1, g2) = shape::e1e2_to_g1g2(e1, e2)?;
        Ok((g1, g2, t))
    }

    /// Convolve with a PSF mixture.
    ///
    /// The PSF is taken relative to its own centroid, so the result stays centered on
    /// the object; component fluxes are scaled by the PSF normalization.
    pub fn convolve(&self, psf: &GMix) -> Result<GMix, BootError> {
        let psf_psum = psf.psum();
        if psf_psum == 0.0 {
            return Err(BootError::GMixRange("PSF mixture has zero flux".into()));
        }
        let (pv, pu) = psf.cen();
        let mut comps = Vec::with_capacity(self.len() * psf.len());
        for obj in &self.comps {
            for p in &psf.comps {
                comps.push(Gauss2D::new(
                    obj.p * p.p / psf_psum,
                    obj.v + p.v - pv,
                    obj.u + p.u - pu,
                    obj.vv + p.vv,
                    obj.vu + p.vu,
                    obj.uu + p.uu,
                )?);
            }
        }
        GMix::from_components(comps)
    }

    /// Surface brightness at `(v, u)`.
    #[inline]
    pub fn eval(&self, v: f64, u: f64) -> f64 {
        self.comps.iter().map(|g| g.eval(v, u)).sum()
    }

    /// Render onto an `nrow × ncol` grid through `jacobian`.
    pub fn make_image(&self, nrow: usize, ncol: usize, jacobian: &Jacobian) -> DMatrix<f64> {
        DMatrix::from_fn(nrow, ncol, |row, col| {
            let (v, u) = jacobian.vu(row as f64, col as f64);
            self.eval(v, u)
        })
    }
}
