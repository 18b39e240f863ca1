mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use gmix_bootstrap::admom_boot::AdmomMetacalBootstrapper;
use gmix_bootstrap::boot_errors::BootError;
use gmix_bootstrap::bootstrap::{AdmomParams, MaxFitParams, MetacalParams, PsfFitParams};
use gmix_bootstrap::constants::{LM_MAXFEV, NOSHEAR};
use gmix_bootstrap::metacal::MaxMetacalBootstrapper;

use crate::common::{reference_obs, CopyShearer, RecordingBackend, StubBackend};

fn psf_params() -> PsfFitParams {
    PsfFitParams::builder().tguess(0.3).ntry(4).build().unwrap()
}

#[test]
fn test_max_metacal_processes_noshear_first() {
    let mut boot = MaxMetacalBootstrapper::new(reference_obs(100.0), MetacalParams::default())
        .unwrap()
        .with_seed(21);
    assert!(boot.metacal_result().is_err());

    boot.fit_metacal(
        &CopyShearer,
        "em2".parse().unwrap(),
        "gauss".parse().unwrap(),
        &psf_params(),
        &MaxFitParams::default(),
        None,
    )
    .unwrap();

    let res = boot.metacal_result().unwrap();
    let keys: Vec<_> = res.keys().collect();
    assert_eq!(keys, [NOSHEAR, "1m", "1p", "2m", "2p"]);
    assert_eq!(res.mcal_flags, 0);

    let tpsf = res.get(NOSHEAR).unwrap().tpsf.unwrap();
    assert_relative_eq!(tpsf, 0.27, max_relative = 1e-2);
    for (_, r) in &res.results {
        assert_eq!(r.flags, 0);
        assert_relative_eq!(r.tpsf.unwrap(), tpsf, max_relative = 1e-3);
        assert!(r.gpsf.is_some());
    }
}

#[test]
fn test_sheared_psf_fits_start_from_noshear_size() {
    let backend = RecordingBackend::default();
    let mut boot = MaxMetacalBootstrapper::new(reference_obs(100.0), MetacalParams::default())
        .unwrap()
        .with_backend(Arc::new(backend.clone()))
        .with_seed(25);

    // a deliberately poor starting size for the unsheared PSF
    let psf_params = PsfFitParams::builder().tguess(1.0).ntry(4).build().unwrap();
    boot.fit_metacal(
        &CopyShearer,
        "gauss".parse().unwrap(),
        "gauss".parse().unwrap(),
        &psf_params,
        &MaxFitParams::default(),
        None,
    )
    .unwrap();

    let tpsf = boot.metacal_result().unwrap().get(NOSHEAR).unwrap().tpsf.unwrap();
    assert_relative_eq!(tpsf, 0.27, max_relative = 2e-2);

    let sizes = backend.sizes();
    let nfirst = sizes.iter().take_while(|t| **t > 0.5).count();
    assert!(nfirst >= 1);
    for t in &sizes[..nfirst] {
        assert!((t / 1.0 - 1.0).abs() <= 0.1, "noshear guess {t}");
    }
    let rest = &sizes[nfirst..];
    assert!(rest.len() >= 4, "{sizes:?}");
    for t in rest {
        assert!((t / tpsf - 1.0).abs() <= 0.1, "sheared guess {t} vs {tpsf}");
    }
}

#[test]
fn test_max_metacal_galaxy_failures_are_flagged() {
    let backend = Arc::new(StubBackend {
        failing_galaxy: true,
        ..Default::default()
    });
    let params = MetacalParams::builder()
        .types(["1p", NOSHEAR])
        .build()
        .unwrap();
    let mut boot = MaxMetacalBootstrapper::new(reference_obs(100.0), params)
        .unwrap()
        .with_backend(backend)
        .with_seed(22);

    boot.fit_metacal(
        &CopyShearer,
        "em2".parse().unwrap(),
        "gauss".parse().unwrap(),
        &psf_params(),
        &MaxFitParams::default(),
        None,
    )
    .unwrap();

    let res = boot.metacal_result().unwrap();
    assert_eq!(res.results.len(), 2);
    assert_eq!(res.mcal_flags, LM_MAXFEV);
    assert_eq!(res.get("1p").unwrap().flags, LM_MAXFEV);
}

#[test]
fn test_analytic_psf_reaches_every_variant() {
    let params = MetacalParams::builder().analytic_psf(0.4).build().unwrap();
    let mut boot = MaxMetacalBootstrapper::new(reference_obs(100.0), params)
        .unwrap()
        .with_seed(24);

    boot.fit_metacal(
        &CopyShearer,
        "em2".parse().unwrap(),
        "gauss".parse().unwrap(),
        &psf_params(),
        &MaxFitParams::default(),
        None,
    )
    .unwrap();

    let res = boot.metacal_result().unwrap();
    assert_eq!(res.results.len(), 5);
    for (key, r) in &res.results {
        assert_eq!(r.flags, 0, "{key}");
        assert_relative_eq!(r.tpsf.unwrap(), 0.4, max_relative = 1e-2);
    }
}

#[test]
fn test_metacal_types_need_noshear() {
    let params = MetacalParams {
        types: vec!["1p".into()],
        ..Default::default()
    };
    let err = MaxMetacalBootstrapper::new(reference_obs(100.0), params).unwrap_err();
    assert!(matches!(err, BootError::InvalidParameter(_)));
}

#[test]
fn test_admom_metacal_seeds_siblings_from_noshear() {
    let mut boot = AdmomMetacalBootstrapper::new(
        reference_obs(100.0),
        AdmomParams::default(),
        MetacalParams::default(),
    )
    .unwrap()
    .with_seed(23);

    boot.fit_metacal(&CopyShearer, None, None, None).unwrap();

    let res = boot.metacal_result().unwrap();
    assert_eq!(res.keys().next(), Some(NOSHEAR));
    assert_eq!(res.results.len(), 5);

    let noshear = res.get(NOSHEAR).unwrap();
    assert!(noshear.tpsf.is_some());
    assert_eq!(noshear.g, noshear.e);
    assert!(res.get("1p").unwrap().tpsf.is_none());
    assert_relative_eq!(
        res.get("2m").unwrap().t.unwrap(),
        noshear.t.unwrap(),
        max_relative = 1e-2
    );
}
