//! Conversions between reduced shear `g`, distortion `e` and second moments.

use crate::boot_errors::BootError;

/// Convert a reduced shear `(g1, g2)` into a distortion `(e1, e2)`.
///
/// Fails when `|g| >= 1`, where the mapping diverges.
pub fn g1g2_to_e1e2(g1: f64, g2: f64) -> Result<(f64, f64), BootError> {
    let g = (g1 * g1 + g2 * g2).sqrt();
    if !g.is_finite() || g >= 1.0 {
        return Err(BootError::GMixRange(format!("g out of bounds: {g}")));
    }
    if g == 0.0 {
        return Ok((0.0, 0.0));
    }
    let e = 2.0 * g / (1.0 + g * g);
    let fac = e / g;
    Ok((fac * g1, fac * g2))
}

/// Convert a distortion `(e1, e2)` into a reduced shear `(g1, g2)`.
pub fn e1e2_to_g1g2(e1: f64, e2: f64) -> Result<(f64, f64), BootError> {
    let e = (e1 * e1 + e2 * e2).sqrt();
    if !e.is_finite() || e >= 1.0 {
        return Err(BootError::GMixRange(format!("e out of bounds: {e}")));
    }
    if e == 0.0 {
        return Ok((0.0, 0.0));
    }
    let g = e / (1.0 + (1.0 - e * e).sqrt());
    let fac = g / e;
    Ok((fac * e1, fac * e2))
}

/// Second moments `(vv, vu, uu)` of size `T` and distortion `(e1, e2)`.
#[inline]
pub fn moments_from_e(t: f64, e1: f64, e2: f64) -> (f64, f64, f64) {
    (0.5 * t * (1.0 - e1), 0.5 * t * e2, 0.5 * t * (1.0 + e1))
}
