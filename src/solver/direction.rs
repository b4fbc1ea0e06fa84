//! Fleet-level classification of the requested power-flow direction.

use serde::{Deserialize, Serialize};

use crate::domain::{Inverter, PowerKind};

use super::coefficients::Coefficients;
use super::constraint::{Constraint, Relationship};

/// Aggregate intent of the constraints registered this cycle. Advisory only:
/// it selects the fairness ordering (discharge drains high-weight units first,
/// charge fills low-weight units first) before the numeric solve; it is never
/// itself a hard constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetDirection {
    Undefined,
    KeepZero,
    Charge,
    Discharge,
}

impl TargetDirection {
    /// Classifies from every `Equals` constraint that pins active power:
    /// single-unit pins ("dispatch exactly X watts") and uniform fleet-sum
    /// constraints both count; mixed or reactive rows do not.
    ///
    /// Sign convention: negative = power flowing into storage. No such
    /// constraint, or pins netting to zero, means `KeepZero`; an empty fleet
    /// is `Undefined`.
    pub fn from_constraints(
        inverters: &[Inverter],
        coefficients: &Coefficients,
        constraints: &[Constraint],
    ) -> Self {
        if inverters.is_empty() {
            return TargetDirection::Undefined;
        }

        let mut net_setpoint = 0.0;
        for constraint in constraints {
            if constraint.relationship != Relationship::Equals {
                continue;
            }
            let value = match constraint.value {
                Some(v) => v,
                None => continue,
            };
            let terms: Vec<_> = constraint
                .coefficients
                .iter()
                .filter(|t| t.value.abs() > f64::EPSILON)
                .collect();
            let Some(first) = terms.first() else {
                continue;
            };
            let uniform_active = terms.iter().all(|t| {
                (t.value - first.value).abs() < f64::EPSILON
                    && coefficients
                        .key_of(t.index)
                        .is_some_and(|key| key.kind == PowerKind::Active)
            });
            if uniform_active {
                net_setpoint += value / first.value;
            }
        }

        if net_setpoint < 0.0 {
            TargetDirection::Charge
        } else if net_setpoint > 0.0 {
            TargetDirection::Discharge
        } else {
            TargetDirection::KeepZero
        }
    }
}
