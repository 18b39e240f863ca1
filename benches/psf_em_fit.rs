//! Benchmarks for the PSF and galaxy stages of the bootstrapper.
//!
//!   cargo bench --bench psf_em_fit
//!   cargo bench psf_em_fit -- psf_em_fit/em3

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use gmix_bootstrap::bootstrap::{Bootstrapper, MaxFitParams, PsfFitParams};
use gmix_bootstrap::fitting::pars::{EmPars, SolverPars};
use gmix_bootstrap::gmix::shape::moments_from_e;
use gmix_bootstrap::gmix::{GMix, Gauss2D};
use gmix_bootstrap::jacobian::Jacobian;
use gmix_bootstrap::observation::Observation;

const SCALE: f64 = 0.263;
const DIM: usize = 25;
const CEN: f64 = 12.0;

fn gauss(t: f64, e1: f64, e2: f64, flux: f64) -> GMix {
    let (vv, vu, uu) = moments_from_e(t, e1, e2);
    GMix::from_components(vec![Gauss2D::new(flux, 0.0, 0.0, vv, vu, uu).expect("gaussian")])
        .expect("mixture")
}

/// Noise-free 25x25 exposure with its PSF image attached.
fn make_fixture_obs() -> Observation {
    let jac = Jacobian::diagonal(SCALE, CEN, CEN);
    let psf_gm = gauss(0.27, 0.02, -0.01, 1.0);
    let psf = Observation::new(psf_gm.make_image(DIM, DIM, &jac), jac);
    let image = gauss(0.28, 0.1, 0.05, 100.0)
        .convolve(&psf_gm)
        .expect("convolution")
        .make_image(DIM, DIM, &jac);
    Observation::new(image, jac).with_psf(psf)
}

fn bench_psf_em_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("psf_em_fit");

    let obs = make_fixture_obs();
    let params = PsfFitParams::builder()
        .tguess(0.3)
        .ntry(4)
        .fit_pars(SolverPars::Em(EmPars::default()))
        .build()
        .expect("psf params");

    // 1) EM with three components on a single epoch
    group.bench_function("em3", |b| {
        b.iter_batched(
            || {
                Bootstrapper::new(obs.clone())
                    .expect("bootstrapper")
                    .with_seed(42)
            },
            |mut boot| {
                let res = boot.fit_psfs(black_box("em3".parse().expect("model")), &params);
                black_box(&res);
            },
            BatchSize::SmallInput,
        )
    });

    // 2) PSF stage followed by the maximum-likelihood gauss fit
    group.bench_function("em3_then_gauss", |b| {
        b.iter_batched(
            || {
                Bootstrapper::new(obs.clone())
                    .expect("bootstrapper")
                    .with_seed(42)
            },
            |mut boot| {
                if let Err(e) = boot.fit_psfs("em3".parse().expect("model"), &params) {
                    panic!("fit_psfs failed: {e:?}");
                }
                let res = boot.fit_max(
                    "gauss".parse().expect("model"),
                    &MaxFitParams::default(),
                    None,
                );
                black_box(&res);
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(psf_benches, bench_psf_em_fit);
criterion_main!(psf_benches);
