//! # Pixel to sky-plane coordinate map
//!
//! A [`Jacobian`] is the local linear map between pixel coordinates `(row, col)` and
//! sky-plane offsets `(v, u)` (arcsec) measured from a reference pixel. Every mixture in
//! this crate lives in the sky plane; images are rendered by sampling the mixture at the
//! `(v, u)` position of each pixel center.
//!
//! ```text
//! v = dvdrow (row - row0) + dvdcol (col - col0)
//! u = dudrow (row - row0) + dudcol (col - col0)
//! ```

use serde::{Deserialize, Serialize};

use crate::boot_errors::BootError;

/// Affine map from pixel `(row, col)` to sky `(v, u)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Jacobian {
    pub row0: f64,
    pub col0: f64,
    pub dvdrow: f64,
    pub dvdcol: f64,
    pub dudrow: f64,
    pub dudcol: f64,
}

impl Jacobian {
    /// Build a general jacobian. Fails if the map is singular.
    pub fn new(
        row0: f64,
        col0: f64,
        dvdrow: f64,
        dvdcol: f64,
        dudrow: f64,
        dudcol: f64,
    ) -> Result<Self, BootError> {
        let jac = Jacobian {
            row0,
            col0,
            dvdrow,
            dvdcol,
            dudrow,
            dudcol,
        };
        if jac.det() == 0.0 || !jac.det().is_finite() {
            return Err(BootError::InvalidParameter(format!(
                "singular jacobian: {jac:?}"
            )));
        }
        Ok(jac)
    }

    /// Diagonal jacobian with a single pixel scale, centered on `(row0, col0)`.
    pub fn diagonal(scale: f64, row0: f64, col0: f64) -> Self {
        Jacobian {
            row0,
            col0,
            dvdrow: scale,
            dvdcol: 0.0,
            dudrow: 0.0,
            dudcol: scale,
        }
    }

    /// Unit-scale jacobian centered on `(row0, col0)`.
    pub fn identity(row0: f64, col0: f64) -> Self {
        Self::diagonal(1.0, row0, col0)
    }

    pub fn det(&self) -> f64 {
        self.dvdrow * self.dudcol - self.dvdcol * self.dudrow
    }

    /// Linear pixel scale, `sqrt(|det|)`.
    pub fn scale(&self) -> f64 {
        self.det().abs().sqrt()
    }

    /// Sky area of one pixel.
    pub fn area(&self) -> f64 {
        self.det().abs()
    }

    /// Sky-plane offset `(v, u)` of a pixel position.
    #[inline]
    pub fn vu(&self, row: f64, col: f64) -> (f64, f64) {
        let drow = row - self.row0;
        let dcol = col - self.col0;
        (
            self.dvdrow * drow + self.dvdcol * dcol,
            self.dudrow * drow + self.dudcol * dcol,
        )
    }

    /// Pixel position of a sky-plane offset.
    pub fn rowcol(&self, v: f64, u: f64) -> (f64, f64) {
        let idet = 1.0 / self.det();
        let drow = idet * (self.dudcol * v - self.dvdcol * u);
        let dcol = idet * (-self.dudrow * v + self.dvdrow * u);
        (drow + self.row0, dcol + self.col0)
    }
}
