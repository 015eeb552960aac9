//! Rebuilder Scheduler
//!
//! The client side of the system: for every candidate package it runs a
//! small state machine that acquires a build lease (directly or through
//! the balancer), uploads the extra artifacts, starts the build, waits,
//! downloads the produced tree, releases the lease and classifies the
//! result. Total in-flight work is bounded by the worker pool's
//! advertised capacity; transient admission failures are retried on a
//! delay shared across all packages.

pub mod birdseye;
pub mod job;
pub mod report;
pub mod scheduler;

pub use birdseye::{Birdseye, SlotState};
pub use job::BuildJob;
pub use report::{classify, Outcome, PackageResult, Report};
pub use scheduler::{Scheduler, SchedulerConfig};
