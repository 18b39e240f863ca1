//! # gmix_bootstrap
//!
//! Staged fitting of galaxy images with gaussian mixtures.
//!
//! A [`Bootstrapper`](bootstrap::Bootstrapper) takes the exposures of one object,
//! fits the PSF of each epoch, measures per-band fluxes with the PSF as template and runs
//! a maximum-likelihood galaxy fit seeded from those measurements. Variants cover
//! adaptive moments ([`admom_boot`]) and metacalibration ([`metacal`]).
//!
//! The numerical solvers are reached through the [`FitBackend`](fitting::traits::FitBackend)
//! trait; [`NativeBackend`](fitting::NativeBackend) is the default.

pub mod admom_boot;
pub mod boot_errors;
pub mod bootstrap;
pub mod constants;
pub mod fitting;
pub mod gmix;
pub mod guessers;
pub mod jacobian;
pub mod metacal;
pub mod models;
pub mod observation;
pub mod priors;
pub mod runners;
