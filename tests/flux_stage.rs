mod common;

use std::sync::Arc;

use gmix_bootstrap::boot_errors::BootError;
use gmix_bootstrap::bootstrap::{Bootstrapper, PsfFitParams, Stage};
use gmix_bootstrap::constants::{FLUX_ERR_SENTINEL, FLUX_SENTINEL};
use gmix_bootstrap::models::PsfModel;

use crate::common::{broken, reference_obs, StubBackend};

fn em2() -> PsfModel {
    "em2".parse().unwrap()
}

fn params() -> PsfFitParams {
    PsfFitParams::builder().tguess(0.3).ntry(2).build().unwrap()
}

fn flaky() -> Arc<StubBackend> {
    Arc::new(StubBackend {
        flaky_em: true,
        ..Default::default()
    })
}

#[test]
fn test_one_flux_per_band() {
    let mbo = vec![
        vec![reference_obs(100.0)],
        vec![reference_obs(50.0), reference_obs(50.0)],
        vec![reference_obs(10.0)],
    ];
    let mut boot = Bootstrapper::new(mbo).unwrap().with_seed(1);
    boot.fit_psfs(em2(), &params()).unwrap();
    boot.fit_gal_psf_flux(true).unwrap();
    assert_eq!(boot.stage(), Stage::FluxMeasured);

    let res = boot.psf_flux_result().unwrap();
    assert_eq!(res.flags, vec![0, 0, 0]);
    assert_eq!(res.psf_flux.len(), 3);
    assert!(res.psf_flux[0] > res.psf_flux[1]);
    assert!(res.psf_flux[1] > res.psf_flux[2]);
    assert!(res.psf_flux_err.iter().all(|e| *e > 0.0 && *e < FLUX_ERR_SENTINEL));
}

#[test]
fn test_partial_epoch_loss_still_measures_band() {
    let mbo = vec![
        vec![broken(reference_obs(100.0)), reference_obs(100.0)],
        vec![reference_obs(30.0)],
    ];
    let mut boot = Bootstrapper::new(mbo)
        .unwrap()
        .with_backend(flaky())
        .with_seed(2);
    boot.fit_psfs(em2(), &params()).unwrap();
    assert_eq!(boot.mb_obs_list()[0].len(), 1);

    boot.fit_gal_psf_flux(true).unwrap();
    let res = boot.psf_flux_result().unwrap();
    assert_eq!(res.flags, vec![0, 0]);
    assert!(res.psf_flux[0] != FLUX_SENTINEL);
}

#[test]
fn test_band_without_epochs_is_fatal() {
    let mbo = vec![
        vec![reference_obs(100.0)],
        vec![broken(reference_obs(30.0)), broken(reference_obs(30.0))],
    ];
    let mut boot = Bootstrapper::new(mbo)
        .unwrap()
        .with_backend(flaky())
        .with_seed(3);
    boot.fit_psfs(em2(), &params()).unwrap();
    assert!(boot.mb_obs_list()[1].is_empty());

    assert_eq!(
        boot.fit_gal_psf_flux(true),
        Err(BootError::PsfFailure("no epochs for band 1".into()))
    );
}

#[test]
fn test_failed_psf_raises_without_skipping() {
    let mbo = vec![vec![reference_obs(100.0), broken(reference_obs(100.0))]];
    let mut boot = Bootstrapper::new(mbo)
        .unwrap()
        .with_backend(flaky())
        .with_seed(4);
    let strict = PsfFitParams::builder()
        .tguess(0.3)
        .skip_failed(false)
        .build()
        .unwrap();
    let err = boot.fit_psfs(em2(), &strict).unwrap_err();
    assert!(matches!(err, BootError::PsfFailure(_)));
    assert_eq!(boot.stage(), Stage::Created);
    assert_eq!(boot.mb_obs_list()[0].len(), 2);
}

#[test]
fn test_no_surviving_psf_is_fatal() {
    let mut boot = Bootstrapper::new(broken(reference_obs(100.0)))
        .unwrap()
        .with_backend(flaky());
    assert_eq!(
        boot.fit_psfs(em2(), &params()),
        Err(BootError::PsfFailure("no psf fits succeeded".into()))
    );
}
