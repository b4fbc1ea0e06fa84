//! Linear constraints over the per-cycle column space.
//!
//! A constraint is a linear expression `sum(value_i * x_index_i)` related to a
//! right-hand side by `Equals` / `LessOrEquals` / `GreaterOrEquals`. Constraints
//! are append-only for the duration of a cycle and discarded at the next
//! `initialize_cycle`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{Phase, PowerKind};

use super::coefficients::Coefficients;
use super::DispatchError;

/// One term of a linear expression: `value * x[index]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearCoefficient {
    pub index: usize,
    pub value: f64,
}

impl LinearCoefficient {
    pub fn new(index: usize, value: f64) -> Self {
        Self { index, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    Equals,
    LessOrEquals,
    GreaterOrEquals,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relationship::Equals => write!(f, "="),
            Relationship::LessOrEquals => write!(f, "<="),
            Relationship::GreaterOrEquals => write!(f, ">="),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub description: String,
    pub coefficients: Vec<LinearCoefficient>,
    pub relationship: Relationship,
    pub value: Option<f64>,
}

impl Constraint {
    pub fn new(
        description: impl Into<String>,
        coefficients: Vec<LinearCoefficient>,
        relationship: Relationship,
        value: f64,
    ) -> Self {
        Self {
            description: description.into(),
            coefficients,
            relationship,
            value: Some(value),
        }
    }

    /// No-op placeholder: zero terms, no value. Accepted everywhere, solved
    /// as if absent.
    pub fn placeholder(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            coefficients: Vec::new(),
            relationship: Relationship::Equals,
            value: None,
        }
    }

    /// One-term constraint on a single unit's power variable, the basic
    /// building block controllers use ("this unit's active power on this
    /// phase must equal / be at most / be at least V").
    pub fn simple(
        coefficients: &Coefficients,
        description: impl Into<String>,
        unit_id: &str,
        phase: Phase,
        kind: PowerKind,
        relationship: Relationship,
        value: f64,
    ) -> Result<Self, DispatchError> {
        let index = coefficients.index_of(unit_id, phase, kind)?;
        Ok(Self::new(
            description,
            vec![LinearCoefficient::new(index, 1.0)],
            relationship,
            value,
        ))
    }

    pub fn is_noop(&self) -> bool {
        self.coefficients.is_empty() && self.value.is_none()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .coefficients
            .iter()
            .map(|c| format!("{:+}*x{}", c.value, c.index))
            .collect();
        write!(
            f,
            "[{}] {} {} {}",
            self.description,
            terms.join(" "),
            self.relationship,
            self.value.map_or_else(|| "-".to_string(), |v| v.to_string()),
        )
    }
}

/// Dense row form consumed by the numeric solver.
#[derive(Debug, Clone)]
pub struct LinearRow {
    pub description: String,
    pub coefficients: Vec<f64>,
    pub relationship: Relationship,
    pub value: f64,
}

/// Converts constraints to dense rows over `width` columns. Degenerate
/// constraints (zero terms, or no right-hand side) are skipped rather than
/// rejected; terms referencing columns beyond `width` are dropped from the row.
pub fn convert_to_linear_constraints(constraints: &[Constraint], width: usize) -> Vec<LinearRow> {
    let mut rows = Vec::with_capacity(constraints.len());
    for constraint in constraints {
        let value = match constraint.value {
            Some(v) => v,
            None => continue,
        };
        if constraint.coefficients.is_empty() {
            continue;
        }
        let mut row = vec![0.0; width];
        for term in &constraint.coefficients {
            if term.index < width {
                row[term.index] += term.value;
            }
        }
        rows.push(LinearRow {
            description: constraint.description.clone(),
            coefficients: row,
            relationship: constraint.relationship,
            value,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coefficients_for(units: &[&str]) -> Coefficients {
        let mut coefficients = Coefficients::new();
        coefficients.initialize(true, units.iter().copied());
        coefficients
    }

    #[test]
    fn test_simple_constraint_single_term() {
        let coefficients = coefficients_for(&["ess0", "ess1"]);
        let constraint = Constraint::simple(
            &coefficients,
            "ess1 active = 500",
            "ess1",
            Phase::All,
            PowerKind::Active,
            Relationship::Equals,
            500.0,
        )
        .unwrap();

        assert_eq!(constraint.coefficients.len(), 1);
        assert_eq!(constraint.coefficients[0].index, 2);
        assert_eq!(constraint.coefficients[0].value, 1.0);
        assert_eq!(constraint.value, Some(500.0));
    }

    #[test]
    fn test_simple_constraint_uninitialized_coefficients_fails() {
        let coefficients = Coefficients::new();
        let err = Constraint::simple(
            &coefficients,
            "ess0 active = 0",
            "ess0",
            Phase::All,
            PowerKind::Active,
            Relationship::Equals,
            0.0,
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::UnregisteredCoefficient { .. }));
    }

    #[test]
    fn test_convert_skips_empty_constraint_without_crashing() {
        let placeholder = Constraint::placeholder("nothing to do");
        let rows = convert_to_linear_constraints(&[placeholder], 4);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_convert_builds_dense_rows() {
        let constraint = Constraint::new(
            "sum",
            vec![
                LinearCoefficient::new(0, 1.0),
                LinearCoefficient::new(2, 1.0),
            ],
            Relationship::Equals,
            3000.0,
        );
        let rows = convert_to_linear_constraints(&[constraint], 4);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].coefficients, vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(rows[0].value, 3000.0);
    }

    #[test]
    fn test_convert_accumulates_repeated_indices() {
        let constraint = Constraint::new(
            "double",
            vec![
                LinearCoefficient::new(1, 1.0),
                LinearCoefficient::new(1, 0.5),
            ],
            Relationship::LessOrEquals,
            10.0,
        );
        let rows = convert_to_linear_constraints(&[constraint], 2);
        assert_eq!(rows[0].coefficients, vec![0.0, 1.5]);
    }

    #[test]
    fn test_display_formats_terms() {
        let constraint = Constraint::new(
            "demo",
            vec![LinearCoefficient::new(0, -1.0)],
            Relationship::GreaterOrEquals,
            -100.0,
        );
        assert_eq!(format!("{constraint}"), "[demo] -1*x0 >= -100");
    }
}
