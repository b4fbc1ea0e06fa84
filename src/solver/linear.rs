//! The numeric core: turns the cycle's constraint set into one active/reactive
//! setpoint per inverter phase.
//!
//! Shape of the algorithm:
//! 1. Pin every column untouched by a nonzero equality constraint to zero
//!    (standby default: unreferenced units must not drift).
//! 2. Solve the equality subsystem by SVD with per-column weight scaling, so
//!    an under-determined system (the usual fleet-sum case) spreads the free
//!    capacity proportionally to the fairness weights. Conflicting equality
//!    rows resolve in favor of the latest registered row; dropped rows
//!    surface in the violation metric.
//! 3. Walk the inverters in fairness order, clipping each setpoint to its
//!    hardware range, then the registered inequality caps, then the
//!    apparent-power envelope, carrying the clipped remainder to the next
//!    unit in the walk.
//! 4. Report the remaining residual as a violation metric. Infeasibility is
//!    data, never an error.
//!
//! Every loop is bounded by the fleet or constraint count; the solve holds no
//! internal timeout and performs no I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, trace};

use crate::domain::{Inverter, Phase, PowerKind, StorageUnitSnapshot};

use super::coefficients::Coefficients;
use super::constraint::{convert_to_linear_constraints, Constraint, LinearRow, Relationship};
use super::direction::TargetDirection;

/// Weights at or below zero would collapse the column scaling, so every
/// effective weight is floored here.
const WEIGHT_FLOOR: f64 = 1.0;

/// Singular values below this cutoff are treated as rank deficiency.
const SVD_EPSILON: f64 = 1e-9;

/// Absolute tolerance (in watts) for the registration-time consistency probe.
const CONSISTENCY_TOLERANCE: f64 = 1e-3;

/// Dispatch result for one inverter phase.
#[derive(Debug, Clone, Serialize)]
pub struct Setpoint {
    pub unit_id: String,
    pub phase: Phase,
    pub active_power_w: f64,
    pub reactive_power_w: f64,
}

/// Per-cycle dispatch result, consumed by the hardware-write layer.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSolution {
    pub setpoints: Vec<Setpoint>,
    pub direction: TargetDirection,
    /// Total absolute residual of the registered constraints after clipping
    /// (W). Zero when the requested dispatch was feasible; positive residual
    /// is a normal operating condition near hardware limits.
    pub violation: f64,
    pub solved_at: DateTime<Utc>,
}

impl DispatchSolution {
    pub fn empty(direction: TargetDirection) -> Self {
        Self {
            setpoints: Vec::new(),
            direction,
            violation: 0.0,
            solved_at: Utc::now(),
        }
    }

    pub fn setpoint(&self, unit_id: &str, phase: Phase) -> Option<&Setpoint> {
        self.setpoints
            .iter()
            .find(|s| s.unit_id == unit_id && s.phase == phase)
    }

    pub fn total_active_power_w(&self) -> f64 {
        self.setpoints.iter().map(|s| s.active_power_w).sum()
    }
}

/// Feasible total active power, derived from hardware bounds, apparent-power
/// limits and single-term inequality constraints. Upstream controllers use
/// this to pre-scale their requests before registering them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ActivePowerBand {
    pub min_w: f64,
    pub max_w: f64,
}

pub fn solve(
    coefficients: &Coefficients,
    constraints: &[Constraint],
    inverters: &[Inverter],
    units: &HashMap<String, StorageUnitSnapshot>,
    direction: TargetDirection,
) -> DispatchSolution {
    let width = coefficients.len();
    if width == 0 || inverters.is_empty() {
        return DispatchSolution::empty(direction);
    }

    let rows = convert_to_linear_constraints(constraints, width);
    let standby = standby_pins(&rows, width);

    let mut x = solve_equalities(&rows, &standby, width, coefficients, inverters, direction);

    let setpoints = clip_and_redistribute(&mut x, &rows, coefficients, inverters, units, direction);

    let violation = residual(&rows, &x);
    trace!(
        setpoints = setpoints.len(),
        violation,
        "linear constraints solved"
    );

    DispatchSolution {
        setpoints,
        direction,
        violation,
        solved_at: Utc::now(),
    }
}

/// Checks that the equality subsystem of `constraints` is internally
/// consistent (a least-squares solution exists with negligible residual).
/// Used by the registration API to reject a constraint that contradicts pins
/// already registered this cycle.
pub fn equalities_consistent(coefficients: &Coefficients, constraints: &[Constraint]) -> bool {
    let width = coefficients.len();
    if width == 0 {
        return true;
    }
    let rows = convert_to_linear_constraints(constraints, width);
    let eq_rows: Vec<&LinearRow> = rows
        .iter()
        .filter(|r| r.relationship == Relationship::Equals)
        .collect();
    if eq_rows.is_empty() {
        return true;
    }
    rows_consistent(&eq_rows, width)
}

/// Least-squares consistency of a set of equality rows.
fn rows_consistent(rows: &[&LinearRow], width: usize) -> bool {
    let m = rows.len();
    let mut a = DMatrix::zeros(m, width);
    let mut b = DVector::zeros(m);
    for (r, row) in rows.iter().enumerate() {
        for (j, &value) in row.coefficients.iter().enumerate() {
            a[(r, j)] = value;
        }
        b[r] = row.value;
    }

    let svd = a.clone().svd(true, true);
    let x = match svd.solve(&b, SVD_EPSILON) {
        Ok(x) => x,
        Err(_) => return false,
    };
    let residual = (&a * &x - &b).abs().max();
    residual <= CONSISTENCY_TOLERANCE * (1.0 + b.abs().max())
}

/// Lower/upper bounds on total active power under the current cycle's
/// envelope constraints.
pub fn active_power_extrema(
    coefficients: &Coefficients,
    constraints: &[Constraint],
    inverters: &[Inverter],
    units: &HashMap<String, StorageUnitSnapshot>,
) -> ActivePowerBand {
    let width = coefficients.len();
    let rows = convert_to_linear_constraints(constraints, width);
    let (cap_lower, cap_upper) = column_caps(&rows, width);

    let mut min_w = 0.0;
    let mut max_w = 0.0;
    for inverter in inverters {
        let Some(unit) = units.get(inverter.unit_id()) else {
            continue;
        };
        let legs = inverter.phases().len() as f64;
        for &phase in inverter.phases() {
            let Ok(p_index) = coefficients.index_of(inverter.unit_id(), phase, PowerKind::Active)
            else {
                continue;
            };
            let s_limit = unit.apparent_power_va() / legs;
            let lo = (unit.charge_bound_w() / legs)
                .max(-s_limit)
                .max(cap_lower[p_index]);
            let hi = (unit.discharge_bound_w() / legs)
                .min(s_limit)
                .min(cap_upper[p_index]);

            if lo <= hi {
                min_w += lo;
                max_w += hi;
            }
        }
    }
    ActivePowerBand { min_w, max_w }
}

/// Per-column bounds implied by single-term inequality rows.
fn column_caps(rows: &[LinearRow], width: usize) -> (Vec<f64>, Vec<f64>) {
    let mut lower = vec![f64::NEG_INFINITY; width];
    let mut upper = vec![f64::INFINITY; width];
    for row in rows {
        if row.relationship == Relationship::Equals {
            continue;
        }
        let mut nonzero = row
            .coefficients
            .iter()
            .enumerate()
            .filter(|(_, v)| v.abs() > f64::EPSILON);
        let Some((j, &a)) = nonzero.next() else {
            continue;
        };
        if nonzero.next().is_some() {
            continue;
        }
        let bound = row.value / a;
        if (row.relationship == Relationship::LessOrEquals) == (a > 0.0) {
            upper[j] = upper[j].min(bound);
        } else {
            lower[j] = lower[j].max(bound);
        }
    }
    (lower, upper)
}

/// Columns not covered by any nonzero-valued equality constraint are pinned
/// to zero: no controller asked for power from them, and the physically safe
/// default is standby.
fn standby_pins(rows: &[LinearRow], width: usize) -> Vec<usize> {
    let mut covered = vec![false; width];
    for row in rows {
        if row.relationship != Relationship::Equals || row.value == 0.0 {
            continue;
        }
        for (j, &value) in row.coefficients.iter().enumerate() {
            if value.abs() > f64::EPSILON {
                covered[j] = true;
            }
        }
    }
    (0..width).filter(|&j| !covered[j]).collect()
}

fn solve_equalities(
    rows: &[LinearRow],
    standby: &[usize],
    width: usize,
    coefficients: &Coefficients,
    inverters: &[Inverter],
    direction: TargetDirection,
) -> DVector<f64> {
    // Registration order is priority order, lowest first: standby pins, then
    // controller equalities oldest to newest.
    let mut ordered: Vec<LinearRow> = standby
        .iter()
        .map(|&j| {
            let mut pin = vec![0.0; width];
            pin[j] = 1.0;
            LinearRow {
                description: "standby".to_string(),
                coefficients: pin,
                relationship: Relationship::Equals,
                value: 0.0,
            }
        })
        .collect();
    ordered.extend(
        rows.iter()
            .filter(|r| r.relationship == Relationship::Equals)
            .cloned(),
    );
    if ordered.is_empty() {
        return DVector::zeros(width);
    }

    // Later-registered rows take precedence: walk from the newest row back,
    // keeping each row only while the kept set stays consistent. A dropped
    // row is not an error here; it shows up in the violation metric.
    let mut kept: Vec<&LinearRow> = Vec::new();
    for row in ordered.iter().rev() {
        kept.push(row);
        if !rows_consistent(&kept, width) {
            kept.pop();
            debug!(
                constraint = %row.description,
                "equality row conflicts with later-registered rows, dropping"
            );
        }
    }

    let m = kept.len();
    let mut a = DMatrix::zeros(m, width);
    let mut b = DVector::zeros(m);
    for (r, row) in kept.iter().enumerate() {
        for (j, &value) in row.coefficients.iter().enumerate() {
            a[(r, j)] = value;
        }
        b[r] = row.value;
    }

    // Column scaling: substituting x_j = sqrt(w_j) * y_j and solving for the
    // minimum-norm y makes the free capacity of an under-determined system
    // land proportionally to w_j.
    let scales: Vec<f64> = effective_weights(coefficients, inverters, direction)
        .into_iter()
        .map(f64::sqrt)
        .collect();
    let mut a_scaled = a;
    for j in 0..width {
        for r in 0..m {
            a_scaled[(r, j)] *= scales[j];
        }
    }

    let svd = a_scaled.svd(true, true);
    let y = svd.solve(&b, SVD_EPSILON).unwrap_or_else(|_| DVector::zeros(width));

    DVector::from_fn(width, |j, _| scales[j] * y[j])
}

/// Per-column effective weight under the cycle's target direction: discharge
/// prefers high-weight (full) units, charge prefers low-weight (empty) units
/// by reflecting the weight across the fleet's range, hold-zero treats
/// everyone equally.
fn effective_weights(
    coefficients: &Coefficients,
    inverters: &[Inverter],
    direction: TargetDirection,
) -> Vec<f64> {
    let weight_by_id: HashMap<&str, f64> = inverters
        .iter()
        .map(|inv| (inv.unit_id(), inv.weight()))
        .collect();
    let min_w = weight_by_id.values().copied().fold(f64::INFINITY, f64::min);
    let max_w = weight_by_id
        .values()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    (0..coefficients.len())
        .map(|j| {
            let base = coefficients
                .key_of(j)
                .and_then(|key| weight_by_id.get(key.unit_id.as_str()).copied())
                .unwrap_or(WEIGHT_FLOOR);
            let effective = match direction {
                TargetDirection::Discharge => base,
                TargetDirection::Charge => (min_w + max_w) - base,
                TargetDirection::KeepZero | TargetDirection::Undefined => WEIGHT_FLOOR,
            };
            effective.max(WEIGHT_FLOOR)
        })
        .collect()
}

/// Clips every setpoint to its hardware range, the registered per-column
/// inequality caps and the apparent-power envelope, in that order, pushing
/// clipped power to the next inverter in the walk. The walk follows fairness
/// order for discharge and reverses it for charge, so overflow lands on the
/// next-preferred unit for the requested direction.
fn clip_and_redistribute(
    x: &mut DVector<f64>,
    rows: &[LinearRow],
    coefficients: &Coefficients,
    inverters: &[Inverter],
    units: &HashMap<String, StorageUnitSnapshot>,
    direction: TargetDirection,
) -> Vec<Setpoint> {
    let (cap_lower, cap_upper) = column_caps(rows, x.len());
    // Multi-term inequality rows, with their nonzero column support.
    let pair_rows: Vec<(Vec<usize>, &LinearRow)> = rows
        .iter()
        .filter(|r| r.relationship != Relationship::Equals)
        .filter_map(|r| {
            let support: Vec<usize> = r
                .coefficients
                .iter()
                .enumerate()
                .filter(|(_, v)| v.abs() > f64::EPSILON)
                .map(|(j, _)| j)
                .collect();
            (support.len() >= 2).then_some((support, r))
        })
        .collect();

    let walk: Vec<&Inverter> = match direction {
        TargetDirection::Charge => inverters.iter().rev().collect(),
        _ => inverters.iter().collect(),
    };

    let mut residual_p = 0.0;
    let mut residual_q = 0.0;
    let mut setpoints = Vec::new();

    for inverter in walk {
        let Some(unit) = units.get(inverter.unit_id()) else {
            continue;
        };
        let legs = inverter.phases().len() as f64;
        let lo = unit.charge_bound_w() / legs;
        let hi = unit.discharge_bound_w() / legs;
        let s_limit = unit.apparent_power_va() / legs;

        for &phase in inverter.phases() {
            let (Ok(p_index), Ok(q_index)) = (
                coefficients.index_of(inverter.unit_id(), phase, PowerKind::Active),
                coefficients.index_of(inverter.unit_id(), phase, PowerKind::Reactive),
            ) else {
                continue;
            };

            let desired_p = x[p_index] + residual_p;
            let clipped_p = clamp_with_caps(
                desired_p,
                lo,
                hi,
                cap_lower[p_index],
                cap_upper[p_index],
            );
            residual_p = desired_p - clipped_p;

            let desired_q = x[q_index] + residual_q;
            let clipped_q = clamp_caps_only(desired_q, cap_lower[q_index], cap_upper[q_index]);
            let (scaled_p, scaled_q) = clip_to_apparent_power(clipped_p, clipped_q, s_limit);
            let envelope_scale = pair_feasibility_scale(&pair_rows, p_index, q_index, scaled_p, scaled_q);
            let final_p = scaled_p * envelope_scale;
            let final_q = scaled_q * envelope_scale;
            residual_p += clipped_p - final_p;
            residual_q = desired_q - final_q;

            x[p_index] = final_p;
            x[q_index] = final_q;
            setpoints.push(Setpoint {
                unit_id: inverter.unit_id().to_string(),
                phase,
                active_power_w: final_p,
                reactive_power_w: final_q,
            });
        }
    }

    // Keep output order stable (fairness order) regardless of walk direction
    if matches!(direction, TargetDirection::Charge) {
        setpoints.reverse();
    }
    setpoints
}

/// Radially scales `(p, q)` back onto the apparent-power circle. The polygon
/// is inscribed in the circle, so a point on the circle boundary is within
/// rounding distance of the polygon.
fn clip_to_apparent_power(p: f64, q: f64, s_limit: f64) -> (f64, f64) {
    if s_limit <= 0.0 {
        return (0.0, 0.0);
    }
    let magnitude = p.hypot(q);
    if magnitude <= s_limit {
        return (p, q);
    }
    let factor = s_limit / magnitude;
    (p * factor, q * factor)
}

/// Clamps into the intersection of the hardware range and the registered
/// per-column caps. Caps that conflict with each other fall back to the
/// hardware range alone; hardware limits always win.
fn clamp_with_caps(value: f64, lo: f64, hi: f64, cap_lo: f64, cap_hi: f64) -> f64 {
    let lower = lo.max(cap_lo);
    let upper = hi.min(cap_hi);
    if lower <= upper {
        value.clamp(lower, upper)
    } else {
        value.clamp(lo, hi)
    }
}

fn clamp_caps_only(value: f64, cap_lo: f64, cap_hi: f64) -> f64 {
    if cap_lo <= cap_hi {
        value.clamp(cap_lo, cap_hi)
    } else {
        value
    }
}

/// Largest factor in [0, 1] that scales `(p, q)` toward the origin until
/// every registered inequality row over exactly these two columns holds.
/// Rows whose feasible side excludes the origin cannot be repaired by
/// scaling and are left to the violation metric.
fn pair_feasibility_scale(
    pair_rows: &[(Vec<usize>, &LinearRow)],
    p_index: usize,
    q_index: usize,
    p: f64,
    q: f64,
) -> f64 {
    let mut scale: f64 = 1.0;
    for (support, row) in pair_rows {
        if !support.iter().all(|&j| j == p_index || j == q_index) {
            continue;
        }
        let lhs = row.coefficients[p_index] * p + row.coefficients[q_index] * q;
        let (lhs, limit) = match row.relationship {
            Relationship::LessOrEquals => (lhs, row.value),
            Relationship::GreaterOrEquals => (-lhs, -row.value),
            Relationship::Equals => continue,
        };
        if lhs > limit && lhs > 0.0 && limit >= 0.0 {
            scale = scale.min(limit / lhs);
        }
    }
    scale.max(0.0)
}

/// Total absolute residual over the registered constraints: |a.x - b| for
/// equalities, the overshoot only for inequalities.
fn residual(rows: &[LinearRow], x: &DVector<f64>) -> f64 {
    let mut total = 0.0;
    for row in rows {
        let lhs: f64 = row
            .coefficients
            .iter()
            .enumerate()
            .map(|(j, &value)| value * x[j])
            .sum();
        total += match row.relationship {
            Relationship::Equals => (lhs - row.value).abs(),
            Relationship::LessOrEquals => (lhs - row.value).max(0.0),
            Relationship::GreaterOrEquals => (row.value - lhs).max(0.0),
        };
    }
    total
}
