//! Per-cycle power dispatch pipeline.
//!
//! Each control cycle follows the same sequence: `initialize_cycle` rebuilds
//! the variable space from the current storage-unit snapshots and registers
//! every unit's apparent-power envelope, controllers append their constraints,
//! and `solve` produces one setpoint per inverter phase. Constraint
//! registration can fail (referencing an inactive unit, contradicting an
//! existing pin); the solve itself cannot. An over-constrained cycle degrades
//! to the closest feasible dispatch and reports the residual as a violation.

pub mod apparent_power;
pub mod coefficients;
pub mod constraint;
pub mod direction;
pub mod linear;
pub mod weights;

pub use apparent_power::DEFAULT_CIRCLE_POINTS;
pub use coefficients::{CoefficientKey, Coefficients};
pub use constraint::{Constraint, LinearCoefficient, Relationship};
pub use direction::TargetDirection;
pub use linear::{ActivePowerBand, DispatchSolution, Setpoint};
pub use weights::{FairnessState, DEFAULT_SORT_HYSTERESIS};

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::config::SolverConfig;
use crate::domain::{Inverter, Phase, PowerKind, StorageUnitSnapshot};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no coefficient registered this cycle for unit '{unit_id}' phase {phase} kind {kind}")]
    UnregisteredCoefficient {
        unit_id: String,
        phase: Phase,
        kind: PowerKind,
    },
    #[error("constraint '{0}' has a right-hand side but no terms")]
    EmptyConstraint(String),
    #[error("constraint '{0}' contradicts constraints already registered this cycle")]
    InfeasibleConstraint(String),
    #[error("unknown storage unit '{0}'")]
    UnknownUnit(String),
}

struct DispatcherState {
    coefficients: Coefficients,
    constraints: Vec<Constraint>,
    units: HashMap<String, StorageUnitSnapshot>,
    inverters: Vec<Inverter>,
    fairness: FairnessState,
}

/// The coordinator-facing entry point. One instance lives for the process
/// lifetime; everything except the fairness ordering is rebuilt per cycle.
pub struct PowerDispatcher {
    symmetric_mode: bool,
    circle_points: usize,
    state: Mutex<DispatcherState>,
}

impl PowerDispatcher {
    pub fn new(
        symmetric_mode: bool,
        circle_points: usize,
        sort_hysteresis: f64,
        weight_scale: f64,
    ) -> Self {
        Self {
            symmetric_mode,
            circle_points,
            state: Mutex::new(DispatcherState {
                coefficients: Coefficients::new(),
                constraints: Vec::new(),
                units: HashMap::new(),
                inverters: Vec::new(),
                fairness: FairnessState::new(sort_hysteresis, weight_scale),
            }),
        }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(
            config.symmetric_mode,
            config.circle_points,
            config.sort_hysteresis,
            config.weight_scale,
        )
    }

    /// Starts a new control cycle: rebuilds the variable space from the given
    /// snapshots, refreshes the fairness ordering, drops last cycle's
    /// constraints and registers every unit's apparent-power envelope.
    pub fn initialize_cycle(&self, units: Vec<StorageUnitSnapshot>) -> Result<(), DispatchError> {
        let mut state = self.state.lock();

        let built: Vec<Inverter> = units
            .iter()
            .map(|u| {
                if self.symmetric_mode {
                    Inverter::single(u.id.as_str())
                } else {
                    Inverter::three(u.id.as_str())
                }
            })
            .collect();
        let mut inverters = state.fairness.apply_remembered_order(built);
        state.fairness.rank(&mut inverters, &units);

        state
            .coefficients
            .initialize(self.symmetric_mode, units.iter().map(|u| u.id.clone()));
        state.constraints.clear();
        state.units = units.into_iter().map(|u| (u.id.clone(), u)).collect();
        state.inverters = inverters;

        for inverter in state.inverters.clone() {
            let Some(unit) = state.units.get(inverter.unit_id()).cloned() else {
                continue;
            };
            let legs = inverter.phases().len() as f64;
            for &phase in inverter.phases() {
                register_apparent_envelope(
                    &mut state,
                    &unit.id,
                    phase,
                    unit.apparent_power_va() / legs,
                    self.circle_points,
                )?;
            }
        }
        Ok(())
    }

    /// Appends a constraint without any feasibility probe. Placeholders are
    /// accepted and solved as if absent.
    pub fn add_constraint(&self, constraint: Constraint) {
        self.state.lock().constraints.push(constraint);
    }

    /// Appends a constraint only if it is consistent with the equality
    /// constraints already registered this cycle. On rejection the cycle's
    /// constraint set is unchanged.
    pub fn add_checked_constraint(&self, constraint: Constraint) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        if constraint.value.is_some() && constraint.coefficients.is_empty() {
            return Err(DispatchError::EmptyConstraint(constraint.description));
        }

        let mut candidate = state.constraints.clone();
        candidate.push(constraint.clone());
        if !linear::equalities_consistent(&state.coefficients, &candidate) {
            return Err(DispatchError::InfeasibleConstraint(constraint.description));
        }
        state.constraints.push(constraint);
        Ok(())
    }

    /// One-term constraint on a single unit's power variable.
    ///
    /// In asymmetric mode a `Phase::All` request expands to a sum over the
    /// three legs plus balance couplings (L1 = L2, L1 = L3), so a symmetric
    /// request to a per-leg unit dispatches evenly.
    pub fn add_simple_constraint(
        &self,
        description: impl Into<String>,
        unit_id: &str,
        phase: Phase,
        kind: PowerKind,
        relationship: Relationship,
        value: f64,
    ) -> Result<(), DispatchError> {
        let description = description.into();
        let mut state = self.state.lock();

        if !self.symmetric_mode && phase == Phase::All {
            let terms = Phase::LEGS
                .iter()
                .map(|&leg| {
                    let index = state.coefficients.index_of(unit_id, leg, kind)?;
                    Ok(LinearCoefficient::new(index, 1.0))
                })
                .collect::<Result<Vec<_>, DispatchError>>()?;
            state
                .constraints
                .push(Constraint::new(description, terms, relationship, value));

            let l1 = state.coefficients.index_of(unit_id, Phase::L1, kind)?;
            for leg in [Phase::L2, Phase::L3] {
                let other = state.coefficients.index_of(unit_id, leg, kind)?;
                state.constraints.push(Constraint::new(
                    format!("{unit_id}: balance L1/{leg} {kind}"),
                    vec![
                        LinearCoefficient::new(l1, 1.0),
                        LinearCoefficient::new(other, -1.0),
                    ],
                    Relationship::Equals,
                    0.0,
                ));
            }
            return Ok(());
        }

        let constraint = Constraint::simple(
            &state.coefficients,
            description,
            unit_id,
            phase,
            kind,
            relationship,
            value,
        )?;
        state.constraints.push(constraint);
        Ok(())
    }

    /// Constraint over the summed power of the whole fleet, the shape grid
    /// setpoint controllers use.
    pub fn add_fleet_sum_constraint(
        &self,
        description: impl Into<String>,
        kind: PowerKind,
        relationship: Relationship,
        value: f64,
    ) -> Result<(), DispatchError> {
        let description = description.into();
        let mut state = self.state.lock();
        let terms: Vec<LinearCoefficient> = state
            .coefficients
            .keys()
            .enumerate()
            .filter(|(_, key)| key.kind == kind)
            .map(|(index, _)| LinearCoefficient::new(index, 1.0))
            .collect();
        if terms.is_empty() {
            return Err(DispatchError::EmptyConstraint(description));
        }
        state
            .constraints
            .push(Constraint::new(description, terms, relationship, value));
        Ok(())
    }

    /// Registers an additional apparent-power polygon for one
    /// `(unit, phase)`, for controllers that tighten a unit's envelope
    /// mid-cycle. The limit is clamped to the unit's hardware capability; a
    /// request looser than the hardware envelope is a no-op in effect.
    pub fn add_apparent_power_constraint(
        &self,
        unit_id: &str,
        phase: Phase,
        limit_va: f64,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        let unit = state
            .units
            .get(unit_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownUnit(unit_id.to_string()))?;
        let legs = if phase == Phase::All { 1.0 } else { 3.0 };
        register_apparent_envelope(
            &mut state,
            unit_id,
            phase,
            limit_va.min(unit.apparent_power_va() / legs),
            self.circle_points,
        )
    }

    /// Solves the cycle. Never fails: an over-constrained cycle produces the
    /// closest feasible dispatch with a nonzero violation.
    pub fn solve(&self) -> DispatchSolution {
        let state = self.state.lock();
        let direction = TargetDirection::from_constraints(
            &state.inverters,
            &state.coefficients,
            &state.constraints,
        );
        let solution = linear::solve(
            &state.coefficients,
            &state.constraints,
            &state.inverters,
            &state.units,
            direction,
        );
        info!(
            direction = ?solution.direction,
            setpoints = solution.setpoints.len(),
            violation = solution.violation,
            "dispatch cycle solved"
        );
        solution
    }

    /// Feasible total active power under the current cycle's constraints.
    pub fn active_power_band(&self) -> ActivePowerBand {
        let state = self.state.lock();
        linear::active_power_extrema(
            &state.coefficients,
            &state.constraints,
            &state.inverters,
            &state.units,
        )
    }

    pub fn max_active_power(&self) -> f64 {
        self.active_power_band().max_w
    }

    pub fn min_active_power(&self) -> f64 {
        self.active_power_band().min_w
    }

    /// Current fairness ordering, highest dispatch priority first.
    pub fn inverters(&self) -> Vec<Inverter> {
        self.state.lock().inverters.clone()
    }

    /// Constraints registered so far this cycle.
    pub fn constraints(&self) -> Vec<Constraint> {
        self.state.lock().constraints.clone()
    }

    /// Width of this cycle's variable space.
    pub fn column_count(&self) -> usize {
        self.state.lock().coefficients.len()
    }

    /// This cycle's column layout, in index order. Diagnostics only.
    pub fn coefficient_keys(&self) -> Vec<CoefficientKey> {
        self.state.lock().coefficients.keys().cloned().collect()
    }
}

fn register_apparent_envelope(
    state: &mut DispatcherState,
    unit_id: &str,
    phase: Phase,
    limit_va: f64,
    points: usize,
) -> Result<(), DispatchError> {
    let envelope =
        apparent_power::generate_constraints(&state.coefficients, unit_id, phase, limit_va, points)?;
    state.constraints.extend(envelope);
    Ok(())
}
