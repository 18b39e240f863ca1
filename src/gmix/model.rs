//! Construction of mixtures from fit parameter vectors.
//!
//! Layouts:
//!
//! * simple: `[cen1, cen2, g1, g2, T, flux]`
//! * bdf: `[cen1, cen2, g1, g2, T, fracdev, flux]`
//! * bd: `[cen1, cen2, g1, g2, T, log10(Tbulge/T), fracdev, flux]`, `T` being the disk size
//! * coellip (n gaussians): `[cen1, cen2, g1, g2, T_1..T_n, F_1..F_n]`
//!
//! Multi-band vectors carry one flux per band after the shape block; use
//! [`galaxy_gmix`] to pick the band.

use crate::boot_errors::BootError;
use crate::gmix::shape::{g1g2_to_e1e2, moments_from_e};
use crate::gmix::{GMix, Gauss2D};
use crate::models::{GalaxyModel, SimpleModel};

fn push_profile(
    comps: &mut Vec<Gauss2D>,
    model: SimpleModel,
    cen: (f64, f64),
    e: (f64, f64),
    t: f64,
    flux: f64,
) -> Result<(), BootError> {
    let (pvals, fvals) = model.profile();
    for (&p, &f) in pvals.iter().zip(fvals) {
        let (vv, vu, uu) = moments_from_e(t * f, e.0, e.1);
        comps.push(Gauss2D::new(p * flux, cen.0, cen.1, vv, vu, uu)?);
    }
    Ok(())
}

fn check_t(t: f64) -> Result<(), BootError> {
    if !(t > 0.0) || !t.is_finite() {
        return Err(BootError::GMixRange(format!("T must be positive, got {t}")));
    }
    Ok(())
}

/// Mixture of a simple model from `[cen1, cen2, g1, g2, T, flux]`.
pub fn simple_gmix(model: SimpleModel, pars: &[f64]) -> Result<GMix, BootError> {
    if pars.len() < 6 {
        return Err(BootError::GMixRange(format!(
            "simple model needs 6 parameters, got {}",
            pars.len()
        )));
    }
    check_t(pars[4])?;
    let e = g1g2_to_e1e2(pars[2], pars[3])?;
    let mut comps = Vec::new();
    push_profile(&mut comps, model, (pars[0], pars[1]), e, pars[4], pars[5])?;
    GMix::from_components(comps)
}

/// Bulge + disk mixture from `[cen1, cen2, g1, g2, T, fracdev, flux]`.
pub fn bdf_gmix(pars: &[f64]) -> Result<GMix, BootError> {
    if pars.len() < 7 {
        return Err(BootError::GMixRange(format!(
            "bdf model needs 7 parameters, got {}",
            pars.len()
        )));
    }
    check_t(pars[4])?;
    let e = g1g2_to_e1e2(pars[2], pars[3])?;
    let fracdev = pars[5];
    let flux = pars[6];
    let cen = (pars[0], pars[1]);
    let mut comps = Vec::new();
    push_profile(&mut comps, SimpleModel::Exp, cen, e, pars[4], (1.0 - fracdev) * flux)?;
    push_profile(&mut comps, SimpleModel::Dev, cen, e, pars[4], fracdev * flux)?;
    GMix::from_components(comps)
}

/// Bulge + disk mixture with a separate bulge size, from
/// `[cen1, cen2, g1, g2, T, log10(Tbulge/T), fracdev, flux]`.
pub fn bd_gmix(pars: &[f64]) -> Result<GMix, BootError> {
    if pars.len() < 8 {
        return Err(BootError::GMixRange(format!(
            "bd model needs 8 parameters, got {}",
            pars.len()
        )));
    }
    let t_disk = pars[4];
    let t_bulge = t_disk * 10f64.powf(pars[5]);
    check_t(t_disk)?;
    check_t(t_bulge)?;
    let e = g1g2_to_e1e2(pars[2], pars[3])?;
    let fracdev = pars[6];
    let flux = pars[7];
    let cen = (pars[0], pars[1]);
    let mut comps = Vec::new();
    push_profile(&mut comps, SimpleModel::Exp, cen, e, t_disk, (1.0 - fracdev) * flux)?;
    push_profile(&mut comps, SimpleModel::Dev, cen, e, t_bulge, fracdev * flux)?;
    GMix::from_components(comps)
}

/// Coelliptical mixture of `ngauss` components.
pub fn coellip_gmix(ngauss: usize, pars: &[f64]) -> Result<GMix, BootError> {
    if pars.len() != coellip_npars(ngauss) {
        return Err(BootError::GMixRange(format!(
            "coellip{ngauss} needs {} parameters, got {}",
            coellip_npars(ngauss),
            pars.len()
        )));
    }
    let e = g1g2_to_e1e2(pars[2], pars[3])?;
    let ts = &pars[4..4 + ngauss];
    let fs = &pars[4 + ngauss..];
    let comps = ts
        .iter()
        .zip(fs)
        .map(|(&t, &f)| {
            check_t(t)?;
            let (vv, vu, uu) = moments_from_e(t, e.0, e.1);
            Gauss2D::new(f, pars[0], pars[1], vv, vu, uu)
        })
        .collect::<Result<Vec<_>, _>>()?;
    GMix::from_components(comps)
}

/// Parameter count of a coelliptical model.
pub fn coellip_npars(ngauss: usize) -> usize {
    4 + 2 * ngauss
}

/// Mixture of a galaxy model for one band of a multi-band parameter vector.
pub fn galaxy_gmix(model: GalaxyModel, pars: &[f64], band: usize) -> Result<GMix, BootError> {
    let nshape = model.nshape();
    let flux = *pars.get(nshape + band).ok_or_else(|| {
        BootError::GMixRange(format!("no flux parameter for band {band}"))
    })?;
    let mut band_pars = pars[..nshape].to_vec();
    band_pars.push(flux);
    match model {
        GalaxyModel::Simple(m) => simple_gmix(m, &band_pars),
        GalaxyModel::Bdf => bdf_gmix(&band_pars),
        GalaxyModel::Bd => bd_gmix(&band_pars),
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_models_preserve_t_and_flux() {
        for model in [
            SimpleModel::Gauss,
            SimpleModel::Turb,
            SimpleModel::Exp,
            SimpleModel::Dev,
        ] {
            let gm = simple_gmix(model, &[0.0, 0.0, 0.0, 0.0, 0.5, 10.0]).unwrap();
            assert_relative_eq!(gm.psum(), 10.0, max_relative = 1e-3);
            assert_relative_eq!(gm.t(), 0.5, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_simple_shape_round_trip() {
        let gm = simple_gmix(SimpleModel::Gauss, &[0.1, -0.2, 0.1, 0.05, 0.3, 1.0]).unwrap();
        let (g1, g2, t) = gm.g1g2t().unwrap();
        assert_relative_eq!(g1, 0.1, epsilon = 1e-12);
        assert_relative_eq!(g2, 0.05, epsilon = 1e-12);
        assert_relative_eq!(t, 0.3, epsilon = 1e-12);
        let (v, u) = gm.cen();
        assert_relative_eq!(v, 0.1, epsilon = 1e-14);
        assert_relative_eq!(u, -0.2, epsilon = 1e-14);
    }

    #[test]
    fn test_galaxy_gmix_picks_band_flux() {
        let pars = [0.0, 0.0, 0.0, 0.0, 0.4, 3.0, 7.0];
        let gm = galaxy_gmix(GalaxyModel::Simple(SimpleModel::Gauss), &pars, 1).unwrap();
        assert_relative_eq!(gm.psum(), 7.0, epsilon = 1e-14);
        assert!(galaxy_gmix(GalaxyModel::Simple(SimpleModel::Gauss), &pars, 2).is_err());
    }

    #[test]
    fn test_bd_bulge_size_ratio() {
        // bulge twice the disk size, half the light in each
        let pars = [0.0, 0.0, 0.0, 0.0, 0.4, 2f64.log10(), 0.5, 10.0];
        let gm = bd_gmix(&pars).unwrap();
        assert_relative_eq!(gm.psum(), 10.0, max_relative = 1e-3);
        assert_relative_eq!(gm.t(), 0.6, max_relative = 1e-3);

        // a zero log ratio is the bdf model
        let bd = bd_gmix(&[0.0, 0.0, 0.1, 0.0, 0.4, 0.0, 0.3, 5.0]).unwrap();
        let bdf = bdf_gmix(&[0.0, 0.0, 0.1, 0.0, 0.4, 0.3, 5.0]).unwrap();
        assert_relative_eq!(bd.t(), bdf.t(), epsilon = 1e-12);
        assert_relative_eq!(bd.psum(), bdf.psum(), epsilon = 1e-12);

        let multi = [0.0, 0.0, 0.0, 0.0, 0.4, 0.0, 0.5, 1.0, 4.0];
        let gm = galaxy_gmix(GalaxyModel::Bd, &multi, 1).unwrap();
        assert_relative_eq!(gm.psum(), 4.0, max_relative = 1e-3);
        assert!(bd_gmix(&pars[..7]).is_err());
    }

    #[test]
    fn test_coellip_layout() {
        let pars = [0.0, 0.0, 0.0, 0.0, 0.2, 0.6, 0.5, 0.5];
        let gm = coellip_gmix(2, &pars).unwrap();
        assert_eq!(gm.len(), 2);
        assert_relative_eq!(gm.t(), 0.4, epsilon = 1e-14);
        assert!(coellip_gmix(3, &pars).is_err());
    }

    #[test]
    fn test_negative_t_is_range_error() {
        let err = simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, -0.1, 1.0]).unwrap_err();
        assert!(matches!(err, BootError::GMixRange(_)));
    }
}
