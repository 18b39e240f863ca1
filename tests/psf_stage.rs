mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use gmix_bootstrap::boot_errors::BootError;
use gmix_bootstrap::bootstrap::{Bootstrapper, PsfFitParams, Stage};
use gmix_bootstrap::constants::EM_MAXITER;
use gmix_bootstrap::fitting::{flagstr, FitResult};
use gmix_bootstrap::models::PsfModel;
use gmix_bootstrap::observation::Observation;

use crate::common::{gauss, reference_obs, RecordingBackend};

fn params() -> PsfFitParams {
    PsfFitParams::builder().tguess(0.3).ntry(4).build().unwrap()
}

fn fit_single(model: &str, params: &PsfFitParams, seed: u64) -> Bootstrapper {
    let model: PsfModel = model.parse().unwrap();
    let mut boot = Bootstrapper::new(reference_obs(100.0)).unwrap().with_seed(seed);
    boot.fit_psfs(model, params).unwrap();
    boot
}

fn psf(boot: &Bootstrapper, band: usize, epoch: usize) -> &Observation {
    boot.mb_obs_list()[band][epoch].psf.as_deref().unwrap()
}

#[test]
fn test_every_family_recovers_the_psf_size() {
    for (i, name) in ["em1", "em5", "coellip2", "gauss"].into_iter().enumerate() {
        let boot = fit_single(name, &params(), 30 + i as u64);
        assert_eq!(boot.stage(), Stage::PsfFit);

        let p = psf(&boot, 0, 0);
        assert_eq!(p.fit_result.as_ref().unwrap().flags, 0, "{name}");
        assert_relative_eq!(p.gmix.as_ref().unwrap().t(), 0.27, max_relative = 2e-2);
    }
}

#[test]
fn test_turbulent_profile_fits() {
    let boot = fit_single("turb", &params(), 35);
    let p = psf(&boot, 0, 0);
    assert_eq!(p.fit_result.as_ref().unwrap().flags, 0);
    let t = p.gmix.as_ref().unwrap().t();
    assert!(t > 0.1 && t < 0.6, "T={t}");
}

#[test]
fn test_metadata_size_overrides_the_fixed_guess() {
    let backend = RecordingBackend::default();
    let mut obs = reference_obs(100.0);
    obs.psf.as_mut().unwrap().meta.insert("psf_t".into(), 0.3);

    let keyed = PsfFitParams::builder()
        .tguess(5.0)
        .tguess_key("psf_t")
        .build()
        .unwrap();
    let mut boot = Bootstrapper::new(obs)
        .unwrap()
        .with_backend(Arc::new(backend.clone()))
        .with_seed(36);
    boot.fit_psfs("gauss".parse().unwrap(), &keyed).unwrap();

    let sizes = backend.sizes();
    assert!(!sizes.is_empty());
    for t in sizes {
        assert!((t / 0.3 - 1.0).abs() <= 0.1, "guess {t}");
    }
}

#[test]
fn test_missing_metadata_size_is_an_error() {
    let keyed = PsfFitParams::builder().tguess_key("psf_t").build().unwrap();
    let mut boot = Bootstrapper::new(reference_obs(100.0)).unwrap().with_seed(37);
    let err = boot.fit_psfs("em2".parse().unwrap(), &keyed).unwrap_err();
    assert!(matches!(err, BootError::InvalidParameter(_)));
    assert_eq!(boot.stage(), Stage::Created);
}

#[test]
fn test_psf_mixture_rescaled_to_metadata_flux() {
    let mut obs = reference_obs(100.0);
    obs.psf.as_mut().unwrap().meta.insert("psf_norm".into(), 2.0);
    let normed = PsfFitParams::builder()
        .tguess(0.3)
        .norm_key("psf_norm")
        .build()
        .unwrap();

    let mut boot = Bootstrapper::new(obs).unwrap().with_seed(38);
    boot.fit_psfs("em2".parse().unwrap(), &normed).unwrap();
    let gm = psf(&boot, 0, 0).gmix.as_ref().unwrap();
    assert_relative_eq!(gm.psum(), 2.0, epsilon = 1e-12);
    assert_relative_eq!(gm.t(), 0.27, max_relative = 2e-2);
}

#[test]
fn test_already_done_epochs_are_kept_or_dropped() {
    let mut done = reference_obs(100.0);
    done.psf.as_mut().unwrap().gmix = Some(gauss(0.5, 0.0, 0.0, 1.0));

    let mut failed = reference_obs(100.0);
    failed.psf.as_mut().unwrap().fit_result =
        Some(FitResult::failed("em", EM_MAXITER, flagstr(EM_MAXITER)));

    let mbo = vec![vec![done, failed, reference_obs(100.0)]];
    let mut boot = Bootstrapper::new(mbo.clone()).unwrap().with_seed(39);
    boot.fit_psfs("em2".parse().unwrap(), &params()).unwrap();

    assert_eq!(boot.mb_obs_list()[0].len(), 2);
    assert_eq!(psf(&boot, 0, 0).gmix.as_ref().unwrap().t(), 0.5);
    assert_relative_eq!(
        psf(&boot, 0, 1).gmix.as_ref().unwrap().t(),
        0.27,
        max_relative = 2e-2
    );

    // refitting everything ignores the earlier state
    let refit = PsfFitParams::builder()
        .tguess(0.3)
        .skip_already_done(false)
        .build()
        .unwrap();
    let mut boot = Bootstrapper::new(mbo).unwrap().with_seed(40);
    boot.fit_psfs("em2".parse().unwrap(), &refit).unwrap();
    assert_eq!(boot.mb_obs_list()[0].len(), 3);
    assert_relative_eq!(
        psf(&boot, 0, 0).gmix.as_ref().unwrap().t(),
        0.27,
        max_relative = 2e-2
    );
}

#[test]
fn test_psf_flux_s2n_threshold() {
    let lenient = PsfFitParams::builder()
        .tguess(0.3)
        .min_s2n(1e-3)
        .build()
        .unwrap();
    let boot = fit_single("gauss", &lenient, 41);
    assert!(psf(&boot, 0, 0).has_gmix());

    let strict = PsfFitParams::builder()
        .tguess(0.3)
        .min_s2n(1e12)
        .skip_failed(false)
        .build()
        .unwrap();
    let mut boot = Bootstrapper::new(reference_obs(100.0)).unwrap().with_seed(42);
    let err = boot.fit_psfs("gauss".parse().unwrap(), &strict).unwrap_err();
    assert!(matches!(err, BootError::PsfLowS2n { min_s2n, .. } if min_s2n == 1e12));

    let skipping = PsfFitParams {
        skip_failed: true,
        ..strict
    };
    assert_eq!(
        boot.fit_psfs("gauss".parse().unwrap(), &skipping),
        Err(BootError::PsfFailure("no psf fits succeeded".into()))
    );
}
