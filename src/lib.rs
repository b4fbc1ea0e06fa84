//! Real-time power dispatch for fleets of battery storage units.
//!
//! Upstream controllers express their intent as linear constraints over the
//! fleet's per-phase active/reactive power variables; once per control cycle
//! the [`solver::PowerDispatcher`] turns the accumulated constraint set into
//! one setpoint per inverter phase, respecting hardware limits and spreading
//! free capacity by state of charge.

pub mod config;
pub mod domain;
pub mod solver;
pub mod telemetry;

#[cfg(feature = "sim")]
pub mod simulation;

pub use solver::{DispatchError, DispatchSolution, PowerDispatcher};
