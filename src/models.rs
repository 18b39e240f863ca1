//! # Model identifiers
//!
//! Model names arrive as strings (`"em3"`, `"coellip5"`, `"am"`, `"gauss"`, `"bdf"`, ...).
//! They are decoded **once**, at the API boundary, into the enums of this module; the
//! rest of the crate dispatches on the enum and never re-parses the name.
//!
//! | string          | decoded as                                  |
//! |-----------------|---------------------------------------------|
//! | `emN`           | [`PsfModel::Em`] with `N` gaussians (1..=5) |
//! | `coellipN`      | [`PsfModel::Coellip`] with `N` gaussians    |
//! | `am`            | [`PsfModel::AdaptiveMoment`]                |
//! | `gauss`, `turb` | [`PsfModel::LeastSquares`]                  |
//! | `gauss`, `exp`, `dev` | [`GalaxyModel::Simple`]               |
//! | `bdf`           | [`GalaxyModel::Bdf`]                        |
//! | `bd`            | [`GalaxyModel::Bd`]                         |

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::boot_errors::BootError;
use crate::constants::{
    DEV_FVALS, DEV_PVALS, EM_FGUESS, EM_PGUESS, EXP_FVALS, EXP_PVALS, GAUSS_FVALS, GAUSS_PVALS,
    MOFFAT_FGUESS, MOFFAT_PGUESS, TURB_FVALS, TURB_PVALS,
};

static EM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^em(\d+)$").expect("static regex"));
static COELLIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^coellip(\d+)$").expect("static regex"));

/// Number of gaussians of a multi-component PSF model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaussCount {
    One,
    Two,
    Three,
    Four,
    Five,
}

impl GaussCount {
    /// Count as a plain integer.
    pub fn get(self) -> usize {
        match self {
            GaussCount::One => 1,
            GaussCount::Two => 2,
            GaussCount::Three => 3,
            GaussCount::Four => 4,
            GaussCount::Five => 5,
        }
    }

    /// Flux fractions and size multipliers used to seed EM guesses.
    pub(crate) fn em_table(self) -> (&'static [f64], &'static [f64]) {
        match self {
            GaussCount::One => (&GAUSS_PVALS, &GAUSS_FVALS),
            n => (EM_PGUESS[n.get() - 2], EM_FGUESS[n.get() - 2]),
        }
    }

    /// Flux fractions and size multipliers used to seed coelliptical guesses.
    pub(crate) fn moffat_table(self) -> (&'static [f64], &'static [f64]) {
        match self {
            GaussCount::One => (&GAUSS_PVALS, &GAUSS_FVALS),
            n => (MOFFAT_PGUESS[n.get() - 2], MOFFAT_FGUESS[n.get() - 2]),
        }
    }
}

impl TryFrom<usize> for GaussCount {
    type Error = BootError;

    fn try_from(n: usize) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(GaussCount::One),
            2 => Ok(GaussCount::Two),
            3 => Ok(GaussCount::Three),
            4 => Ok(GaussCount::Four),
            5 => Ok(GaussCount::Five),
            _ => Err(BootError::InvalidModel(format!(
                "number of gaussians must be in 1..=5, got {n}"
            ))),
        }
    }
}

/// Fixed-profile models with the `[cen1, cen2, g1, g2, T, flux...]` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleModel {
    Gauss,
    Turb,
    Exp,
    Dev,
}

impl SimpleModel {
    /// Flux fractions and size multipliers of the gaussian approximation.
    pub(crate) fn profile(self) -> (&'static [f64], &'static [f64]) {
        match self {
            SimpleModel::Gauss => (&GAUSS_PVALS, &GAUSS_FVALS),
            SimpleModel::Turb => (&TURB_PVALS, &TURB_FVALS),
            SimpleModel::Exp => (&EXP_PVALS, &EXP_FVALS),
            SimpleModel::Dev => (&DEV_PVALS, &DEV_FVALS),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SimpleModel::Gauss => "gauss",
            SimpleModel::Turb => "turb",
            SimpleModel::Exp => "exp",
            SimpleModel::Dev => "dev",
        }
    }
}

impl FromStr for SimpleModel {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauss" => Ok(SimpleModel::Gauss),
            "turb" => Ok(SimpleModel::Turb),
            "exp" => Ok(SimpleModel::Exp),
            "dev" => Ok(SimpleModel::Dev),
            _ => Err(BootError::InvalidModel(s.to_string())),
        }
    }
}

impl fmt::Display for SimpleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Solver family selected for a PSF fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PsfModel {
    /// Expectation-maximization with `n` free gaussians
    Em(GaussCount),
    /// Least-squares fit of `n` coelliptical gaussians
    Coellip(GaussCount),
    /// Adaptive moments
    AdaptiveMoment,
    /// Least-squares fit of a fixed profile (`gauss` or `turb`)
    LeastSquares(SimpleModel),
}

impl FromStr for PsfModel {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = EM_RE.captures(s) {
            return Ok(PsfModel::Em(parse_count(s, &caps[1])?));
        }
        if let Some(caps) = COELLIP_RE.captures(s) {
            return Ok(PsfModel::Coellip(parse_count(s, &caps[1])?));
        }
        match s {
            "am" => Ok(PsfModel::AdaptiveMoment),
            "gauss" | "turb" => Ok(PsfModel::LeastSquares(s.parse()?)),
            _ => Err(BootError::InvalidModel(format!(
                "psf model should be emN, coellipN, am, gauss or turb, got '{s}'"
            ))),
        }
    }
}

impl fmt::Display for PsfModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsfModel::Em(n) => write!(f, "em{}", n.get()),
            PsfModel::Coellip(n) => write!(f, "coellip{}", n.get()),
            PsfModel::AdaptiveMoment => f.write_str("am"),
            PsfModel::LeastSquares(m) => write!(f, "{m}"),
        }
    }
}

fn parse_count(name: &str, digits: &str) -> Result<GaussCount, BootError> {
    let n: usize = digits
        .parse()
        .map_err(|_| BootError::InvalidModel(name.to_string()))?;
    GaussCount::try_from(n)
}

/// Galaxy model fitted by the maximum-likelihood stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GalaxyModel {
    Simple(SimpleModel),
    /// Bulge + disk with a shared size: `[cen1, cen2, g1, g2, T, fracdev, flux...]`
    Bdf,
    /// Bulge + disk with independent sizes:
    /// `[cen1, cen2, g1, g2, T, log10(Tbulge/T), fracdev, flux...]`
    Bd,
}

impl GalaxyModel {
    /// Number of parameters preceding the per-band fluxes.
    pub fn nshape(self) -> usize {
        match self {
            GalaxyModel::Simple(_) => 5,
            GalaxyModel::Bdf => 6,
            GalaxyModel::Bd => 7,
        }
    }

    /// Total parameter count for `nband` bands.
    pub fn npars(self, nband: usize) -> usize {
        self.nshape() + nband
    }
}

impl FromStr for GalaxyModel {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bdf" => Ok(GalaxyModel::Bdf),
            "bd" => Ok(GalaxyModel::Bd),
            "gauss" | "exp" | "dev" => Ok(GalaxyModel::Simple(s.parse()?)),
            _ => Err(BootError::InvalidModel(format!(
                "model should be exp, dev, gauss, bdf or bd, got '{s}'"
            ))),
        }
    }
}

impl fmt::Display for GalaxyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GalaxyModel::Simple(m) => write!(f, "{m}"),
            GalaxyModel::Bdf => f.write_str("bdf"),
            GalaxyModel::Bd => f.write_str("bd"),
        }
    }
}

#[cfg(test)]
mod models_tests {
    use super::*;

    #[test]
    fn test_decode_psf_models() {
        assert_eq!("em3".parse::<PsfModel>().unwrap(), PsfModel::Em(GaussCount::Three));
        assert_eq!(
            "coellip5".parse::<PsfModel>().unwrap(),
            PsfModel::Coellip(GaussCount::Five)
        );
        assert_eq!("am".parse::<PsfModel>().unwrap(), PsfModel::AdaptiveMoment);
        assert_eq!(
            "turb".parse::<PsfModel>().unwrap(),
            PsfModel::LeastSquares(SimpleModel::Turb)
        );
    }

    #[test]
    fn test_reject_bad_psf_models() {
        for name in ["em0", "em6", "coellip", "emx", "exp", ""] {
            assert!(name.parse::<PsfModel>().is_err(), "{name} should fail");
        }
    }

    #[test]
    fn test_display_round_trips_name() {
        for name in ["em1", "em4", "coellip2", "am", "gauss"] {
            assert_eq!(name.parse::<PsfModel>().unwrap().to_string(), name);
        }
    }

    #[test]
    fn test_galaxy_model_layout() {
        let bdf: GalaxyModel = "bdf".parse().unwrap();
        assert_eq!(bdf.npars(3), 9);
        let exp: GalaxyModel = "exp".parse().unwrap();
        assert_eq!(exp.npars(1), 6);
        let bd: GalaxyModel = "bd".parse().unwrap();
        assert_eq!(bd.nshape(), 7);
        assert_eq!(bd.npars(2), 9);
        assert_eq!(bd.to_string(), "bd");
        assert!("turb".parse::<GalaxyModel>().is_err());
    }

    #[test]
    fn test_tables_match_component_count() {
        for n in 1..=5 {
            let count = GaussCount::try_from(n).unwrap();
            let (p, f) = count.em_table();
            assert_eq!(p.len(), n);
            assert_eq!(f.len(), n);
            let (p, f) = count.moffat_table();
            assert_eq!(p.len(), n);
            assert_eq!(f.len(), n);
        }
    }
}
