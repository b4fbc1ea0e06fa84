//! Linearization of the apparent-power circle `P^2 + Q^2 <= S^2`.
//!
//! The numeric solver only understands linear constraints, so the disk is
//! approximated by its inscribed polygon: N points sampled evenly around the
//! circle, one `LessOrEquals` supporting-line constraint per adjacent pair.
//! Every vertex lies on the circle, so the polygon is a subset of the disk and
//! the approximation errs on the safe side of the hardware limit.

use itertools::Itertools;

use crate::domain::{Phase, PowerKind};

use super::coefficients::Coefficients;
use super::constraint::{Constraint, LinearCoefficient, Relationship};
use super::DispatchError;

/// Default polygon density. 32 edges keep the polygon/circle area error below
/// one percent while staying cheap to rebuild every cycle.
pub const DEFAULT_CIRCLE_POINTS: usize = 32;

/// Below this delta-x two adjacent sample points count as a vertical edge.
/// The slope of such an edge would blow up numerically, so it is emitted as a
/// vertical-line constraint instead of slope-intercept form.
const VERTICAL_EDGE_EPSILON: f64 = 1e-6;

/// Builds the polygon constraints for one `(unit, phase)` pair.
///
/// A limit of zero (or a physically meaningless negative limit) produces
/// exactly two degenerate constraints pinning `P <= 0` and `Q <= 0`, which
/// together with the solver's standby default hold the unit at zero.
pub fn generate_constraints(
    coefficients: &Coefficients,
    unit_id: &str,
    phase: Phase,
    limit_va: f64,
    points: usize,
) -> Result<Vec<Constraint>, DispatchError> {
    let p_index = coefficients.index_of(unit_id, phase, PowerKind::Active)?;
    let q_index = coefficients.index_of(unit_id, phase, PowerKind::Reactive)?;

    if limit_va <= 0.0 {
        return Ok(vec![
            Constraint::new(
                format!("{unit_id} {phase}: no apparent power, P = 0"),
                vec![LinearCoefficient::new(p_index, 1.0)],
                Relationship::LessOrEquals,
                0.0,
            ),
            Constraint::new(
                format!("{unit_id} {phase}: no apparent power, Q = 0"),
                vec![LinearCoefficient::new(q_index, 1.0)],
                Relationship::LessOrEquals,
                0.0,
            ),
        ]);
    }

    let points = points.max(4);
    let samples: Vec<(f64, f64)> = (0..points)
        .map(|k| {
            let angle = 2.0 * std::f64::consts::PI * k as f64 / points as f64;
            (limit_va * angle.cos(), limit_va * angle.sin())
        })
        .collect();

    let mut constraints = Vec::with_capacity(points);
    for ((x1, y1), (x2, y2)) in samples.iter().copied().circular_tuple_windows() {
        let description = format!("{unit_id} {phase}: apparent power <= {limit_va} VA");

        if (x2 - x1).abs() < VERTICAL_EDGE_EPSILON {
            // Vertical edge. The feasible side is toward the origin: P <= x on
            // the right half of the circle, P >= x on the left half.
            let constraint = if x1 > 0.0 {
                Constraint::new(
                    description,
                    vec![LinearCoefficient::new(p_index, 1.0)],
                    Relationship::LessOrEquals,
                    x1,
                )
            } else {
                Constraint::new(
                    description,
                    vec![LinearCoefficient::new(p_index, -1.0)],
                    Relationship::LessOrEquals,
                    -x1,
                )
            };
            constraints.push(constraint);
            continue;
        }

        // Slope-intercept form of the chord: Q = m*P + b. The chord of a
        // circle centered at the origin never passes through the origin, so
        // the sign of b decides which side is feasible.
        let m = (y2 - y1) / (x2 - x1);
        let b = y1 - m * x1;
        let constraint = if b >= 0.0 {
            // Chord above the origin: Q <= m*P + b
            Constraint::new(
                description,
                vec![
                    LinearCoefficient::new(p_index, -m),
                    LinearCoefficient::new(q_index, 1.0),
                ],
                Relationship::LessOrEquals,
                b,
            )
        } else {
            // Chord below the origin: Q >= m*P + b
            Constraint::new(
                description,
                vec![
                    LinearCoefficient::new(p_index, m),
                    LinearCoefficient::new(q_index, -1.0),
                ],
                Relationship::LessOrEquals,
                -b,
            )
        };
        constraints.push(constraint);
    }

    Ok(constraints)
}
