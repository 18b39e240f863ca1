//! # Masked-pixel repair
//!
//! Downstream measurements (metacal shearing in particular) cannot work around holes in
//! an image. Once a galaxy fit exists, pixels flagged in `bmask` or carrying zero
//! weight are overwritten with the PSF-convolved best-fit model of their epoch.
//!
//! The repair is per observation:
//!
//! * observations without bad pixels keep their image and get `image_orig = None`,
//! * the others keep a copy of the pre-repair image in `image_orig`,
//! * weights and masks are never modified, so the repaired pixels stay identifiable.
//!
//! Noise can be added to the replaced values at the median level of the good pixels,
//! so the repaired region does not look noiseless to a later fit.

use log::{info, warn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::boot_errors::BootError;
use crate::constants::MultiBandObsList;
use crate::fitting::traits::GalaxySolver;
use crate::observation::Observation;

/// Splice the fitter's PSF-convolved model into every masked or zero-weight pixel.
///
/// The image before replacement is kept in `image_orig`; observations without bad
/// pixels are left untouched with `image_orig = None`. With `add_noise`, gaussian noise
/// at the median level of the good pixels is added to the replaced values.
///
/// Returns the number of replaced pixels.
pub fn replace_masked_pixels<R: Rng + ?Sized>(
    mbo: &mut MultiBandObsList,
    fitter: &dyn GalaxySolver,
    add_noise: bool,
    rng: &mut R,
) -> Result<usize, BootError> {
    let mut ntot = 0;
    for band in 0..mbo.len() {
        for epoch in 0..mbo[band].len() {
            let bad = mbo[band][epoch].masked_pixels();
            if bad.is_empty() {
                mbo[band][epoch].image_orig = None;
                continue;
            }

            let gm = fitter.convolved_gmix(&mbo[..], band, epoch)?;
            let obs = &mut mbo[band][epoch];
            let (nrow, ncol) = obs.image.shape();
            let model = gm.make_image(nrow, ncol, &obs.jacobian);

            let sigma = if add_noise {
                let sigma = noise_level(obs);
                if sigma.is_none() {
                    warn!("band {band} obs {epoch}: no good pixels to set the noise level");
                }
                sigma
            } else {
                None
            };

            obs.image_orig = Some(obs.image.clone());
            for &(row, col) in &bad {
                let mut value = model[(row, col)];
                if let Some(sigma) = sigma {
                    let z: f64 = StandardNormal.sample(rng);
                    value += sigma * z;
                }
                obs.image[(row, col)] = value;
            }

            info!("band {band} obs {epoch}: replaced {} masked pixels", bad.len());
            ntot += bad.len();
        }
    }
    Ok(ntot)
}

/// `sqrt(median(1 / w))` over the unmasked pixels with positive weight.
fn noise_level(obs: &Observation) -> Option<f64> {
    let mut variances: Vec<f64> = obs
        .weight
        .iter()
        .enumerate()
        .filter(|(idx, w)| {
            let (row, col) = (idx % obs.weight.nrows(), idx / obs.weight.nrows());
            **w > 0.0 && obs.bmask.as_ref().map_or(true, |m| m[(row, col)] == 0)
        })
        .map(|(_, w)| 1.0 / w)
        .collect();
    if variances.is_empty() {
        return None;
    }
    variances.sort_by(f64::total_cmp);
    let n = variances.len();
    let median = if n % 2 == 1 {
        variances[n / 2]
    } else {
        0.5 * (variances[n / 2 - 1] + variances[n / 2])
    };
    Some(median.sqrt())
}

#[cfg(test)]
mod masked_tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::fitting::lm::LmGalaxySolver;
    use crate::fitting::pars::LmPars;
    use crate::fitting::traits::Solver;
    use crate::gmix::model::simple_gmix;
    use crate::gmix::GMix;
    use crate::jacobian::Jacobian;
    use crate::models::{GalaxyModel, SimpleModel};

    fn gauss(t: f64, flux: f64) -> GMix {
        simple_gmix(SimpleModel::Gauss, &[0.0, 0.0, 0.0, 0.0, t, flux]).unwrap()
    }

    fn fitted_obs() -> (MultiBandObsList, LmGalaxySolver) {
        let jac = Jacobian::diagonal(0.263, 10.0, 10.0);
        let mut psf = Observation::new(gauss(0.27, 1.0).make_image(21, 21, &jac), jac);
        psf.gmix = Some(gauss(0.27, 1.0));
        let image = gauss(0.4, 50.0)
            .convolve(&gauss(0.27, 1.0))
            .unwrap()
            .make_image(21, 21, &jac);
        let obs = Observation::new(image, jac).with_psf(psf);
        let mbo = vec![vec![obs]];

        let mut fitter = LmGalaxySolver::new(
            GalaxyModel::Simple(SimpleModel::Gauss),
            LmPars::default(),
            None,
            Vec::new(),
        );
        let guess = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0, 0.4, 50.0]);
        fitter.go(&mbo, &guess).unwrap();
        (mbo, fitter)
    }

    #[test]
    fn test_clean_observation_untouched() {
        let (mut mbo, fitter) = fitted_obs();
        let before = mbo[0][0].image.clone();
        let mut rng = StdRng::seed_from_u64(1);

        let n = replace_masked_pixels(&mut mbo, &fitter, true, &mut rng).unwrap();
        assert_eq!(n, 0);
        assert_eq!(mbo[0][0].image, before);
        assert!(mbo[0][0].image_orig.is_none());
    }

    #[test]
    fn test_masked_pixels_take_model_values() {
        let (mut mbo, fitter) = fitted_obs();
        let truth = mbo[0][0].image.clone();
        let mut bmask = DMatrix::zeros(21, 21);
        bmask[(10, 10)] = 1;
        bmask[(3, 4)] = 2;
        {
            let obs = &mut mbo[0][0];
            obs.image[(10, 10)] = 1.0e6;
            obs.image[(3, 4)] = -1.0e6;
            obs.bmask = Some(bmask);
        }
        let mut rng = StdRng::seed_from_u64(1);

        let n = replace_masked_pixels(&mut mbo, &fitter, false, &mut rng).unwrap();
        assert_eq!(n, 2);
        let obs = &mbo[0][0];
        assert_eq!(obs.image_orig.as_ref().unwrap()[(10, 10)], 1.0e6);
        approx::assert_relative_eq!(obs.image[(10, 10)], truth[(10, 10)], max_relative = 1e-3);
        approx::assert_relative_eq!(obs.image[(3, 4)], truth[(3, 4)], epsilon = 1e-3);
        assert_eq!(obs.image[(0, 0)], truth[(0, 0)]);
    }

    #[test]
    fn test_noise_level_uses_good_pixels() {
        let jac = Jacobian::diagonal(1.0, 1.0, 1.0);
        let weight = DMatrix::from_row_slice(3, 3, &[4.0, 4.0, 4.0, 4.0, 0.0, 4.0, 1.0, 1.0, 1.0]);
        let obs = Observation::new(DMatrix::zeros(3, 3), jac)
            .with_weight(weight)
            .unwrap();
        assert_eq!(noise_level(&obs), Some(0.5));

        let empty = Observation::new(DMatrix::zeros(2, 2), jac)
            .with_weight(DMatrix::zeros(2, 2))
            .unwrap();
        assert_eq!(noise_level(&empty), None);
    }
}
