#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown
)]
//! Staged-vehicle fuel flow simulation.
//!
//! Consumes a vehicle topology snapshot ([`vessel::VesselSnapshot`]) and
//! flight conditions, and predicts per-stage propulsive performance
//! (delta-v, burn time, thrust-to-weight, staging timing) by simulating
//! propellant depletion through the vehicle's crossfeed graph. Nothing
//! here moves the vehicle or integrates a trajectory.

pub mod arena;
pub mod curve;
pub mod engine;
pub mod node;
pub mod sim;
pub mod topology;
pub mod vessel;

/// Standard gravity, m/s^2.
pub const G0: f64 = 9.80665;

/// Resource amounts at or below this are considered drained.
pub const MINIMUM_DETECTABLE_AMOUNT: f64 = 1e-4;
