//! # Observations
//!
//! An [`Observation`] is one exposure of a source: the pixel image, its inverse-variance
//! weight map, an optional bad-pixel mask, the [`Jacobian`] into the sky plane, an
//! optional nested PSF observation and, once fitted, the mixture describing it.
//!
//! Observations are grouped per band into an [`ObsList`] (epochs, in order) and per
//! object into a [`MultiBandObsList`] (bands, in order). [`ObsInput`] accepts any of the
//! three shapes and normalizes to the multi-band form.
//!
//! ## Annotations written by the bootstrapper
//!
//! Fitting the PSF of an observation records two things on the PSF observation:
//!
//! * `gmix` – the fitted mixture (only on success),
//! * `fit_result` – the final [`FitResult`] of the PSF runner (success or failure).
//!
//! Both are plain fields; the bootstrapper owns its working copy of the observations, so
//! these annotations never leak into caller-held data.

use ahash::AHashMap;
use nalgebra::DMatrix;

use crate::boot_errors::BootError;
use crate::constants::{MultiBandObsList, ObsList};
use crate::fitting::FitResult;
use crate::gmix::GMix;
use crate::jacobian::Jacobian;

/// Free-form numeric metadata attached to an observation (e.g. `Tguess`, `norm`).
pub type Meta = AHashMap<String, f64>;

/// One exposure: pixels, inverse-variance weights, the pixel-to-sky [`Jacobian`] and
/// optionally its PSF observation.
///
/// Fitting stages attach their products in place: `gmix` and `fit_result` on the PSF
/// observation, the best-fit galaxy mixture on the galaxy observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub image: DMatrix<f64>,
    pub weight: DMatrix<f64>,
    pub bmask: Option<DMatrix<i32>>,
    pub jacobian: Jacobian,
    pub psf: Option<Box<Observation>>,
    pub gmix: Option<GMix>,
    pub meta: Meta,
    /// Last fit result recorded for this observation.
    pub fit_result: Option<FitResult>,
    /// Image before masked-pixel replacement. `None` when no pixel was replaced.
    pub image_orig: Option<DMatrix<f64>>,
}

impl Observation {
    /// Observation with unit weights and no PSF.
    pub fn new(image: DMatrix<f64>, jacobian: Jacobian) -> Self {
        let weight = DMatrix::from_element(image.nrows(), image.ncols(), 1.0);
        Observation {
            image,
            weight,
            bmask: None,
            jacobian,
            psf: None,
            gmix: None,
            meta: Meta::default(),
            fit_result: None,
            image_orig: None,
        }
    }

    /// Set the weight map; its shape must match the image.
    pub fn with_weight(mut self, weight: DMatrix<f64>) -> Result<Self, BootError> {
        self.check_shape("weight", weight.shape())?;
        if weight.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(BootError::InvalidParameter(
                "weights must be finite and non-negative".into(),
            ));
        }
        self.weight = weight;
        Ok(self)
    }

    /// Set the bad-pixel mask; its shape must match the image.
    pub fn with_bmask(mut self, bmask: DMatrix<i32>) -> Result<Self, BootError> {
        self.check_shape("bmask", bmask.shape())?;
        self.bmask = Some(bmask);
        Ok(self)
    }

    /// Attach the PSF observation the PSF stage fits.
    pub fn with_psf(mut self, psf: Observation) -> Self {
        self.psf = Some(Box::new(psf));
        self
    }

    /// Store a metadata value, e.g. a size guess read through
    /// [`PsfFitParams::tguess_key`](crate::bootstrap::PsfFitParams::tguess_key).
    pub fn with_meta(mut self, key: impl Into<String>, value: f64) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    fn check_shape(&self, what: &str, shape: (usize, usize)) -> Result<(), BootError> {
        if shape != self.image.shape() {
            return Err(BootError::InvalidParameter(format!(
                "{what} shape {shape:?} does not match image shape {:?}",
                self.image.shape()
            )));
        }
        Ok(())
    }

    pub fn has_psf(&self) -> bool {
        self.psf.is_some()
    }

    /// `true` once a mixture is attached.
    pub fn has_gmix(&self) -> bool {
        self.gmix.is_some()
    }

    pub fn has_psf_gmix(&self) -> bool {
        self.psf.as_ref().is_some_and(|p| p.has_gmix())
    }

    /// The fitted PSF mixture, if any.
    pub fn psf_gmix(&self) -> Option<&GMix> {
        self.psf.as_ref().and_then(|p| p.gmix.as_ref())
    }

    /// Metadata value for `key`, failing loudly when absent.
    pub fn meta_value(&self, key: &str) -> Result<f64, BootError> {
        self.meta.get(key).copied().ok_or_else(|| {
            BootError::InvalidParameter(format!("metadata key '{key}' not found"))
        })
    }

    /// Sum of the weight map.
    pub fn weight_sum(&self) -> f64 {
        self.weight.sum()
    }

    /// Total flux in the image, `sum(image) * pixel area`.
    pub fn image_flux(&self) -> f64 {
        self.image.sum() * self.jacobian.area()
    }

    /// Indices `(row, col)` of pixels flagged in the bad-pixel mask or with zero weight.
    pub fn masked_pixels(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for col in 0..self.image.ncols() {
            for row in 0..self.image.nrows() {
                let flagged = self
                    .bmask
                    .as_ref()
                    .is_some_and(|mask| mask[(row, col)] != 0);
                if flagged || self.weight[(row, col)] == 0.0 {
                    out.push((row, col));
                }
            }
        }
        out
    }
}

/// Any of the accepted observation shapes.
#[derive(Debug, Clone)]
pub enum ObsInput {
    Single(Observation),
    List(ObsList),
    MultiBand(MultiBandObsList),
}

impl ObsInput {
    /// Normalize to `[band][epoch]`.
    pub fn into_multi_band(self) -> MultiBandObsList {
        match self {
            ObsInput::Single(obs) => vec![vec![obs]],
            ObsInput::List(list) => vec![list],
            ObsInput::MultiBand(mbo) => mbo,
        }
    }
}

impl From<Observation> for ObsInput {
    fn from(obs: Observation) -> Self {
        ObsInput::Single(obs)
    }
}

impl From<ObsList> for ObsInput {
    fn from(list: ObsList) -> Self {
        ObsInput::List(list)
    }
}

impl From<MultiBandObsList> for ObsInput {
    fn from(mbo: MultiBandObsList) -> Self {
        ObsInput::MultiBand(mbo)
    }
}

#[cfg(test)]
mod observation_tests {
    use super::*;

    fn small_obs() -> Observation {
        Observation::new(DMatrix::from_element(4, 5, 1.0), Jacobian::identity(1.5, 2.0))
    }

    #[test]
    fn test_weight_shape_is_checked() {
        let err = small_obs()
            .with_weight(DMatrix::from_element(5, 4, 1.0))
            .unwrap_err();
        assert!(matches!(err, BootError::InvalidParameter(_)));
    }

    #[test]
    fn test_masked_pixels_union_of_mask_and_zero_weight() {
        let mut weight = DMatrix::from_element(4, 5, 1.0);
        weight[(0, 0)] = 0.0;
        let mut bmask = DMatrix::from_element(4, 5, 0);
        bmask[(3, 4)] = 2;
        bmask[(0, 0)] = 1;
        let obs = small_obs()
            .with_weight(weight)
            .unwrap()
            .with_bmask(bmask)
            .unwrap();
        assert_eq!(obs.masked_pixels(), vec![(0, 0), (3, 4)]);
    }

    #[test]
    fn test_obs_input_shapes() {
        assert_eq!(ObsInput::from(small_obs()).into_multi_band().len(), 1);
        let list: ObsList = vec![small_obs(), small_obs()];
        let mbo = ObsInput::from(list).into_multi_band();
        assert_eq!(mbo.len(), 1);
        assert_eq!(mbo[0].len(), 2);
    }

    #[test]
    fn test_missing_meta_key() {
        let obs = small_obs().with_meta("Tguess", 0.3);
        assert_eq!(obs.meta_value("Tguess").unwrap(), 0.3);
        assert!(obs.meta_value("norm").is_err());
    }
}
