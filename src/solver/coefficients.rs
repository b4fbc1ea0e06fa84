//! Column-index registry for the per-cycle variable set.
//!
//! Every physically realizable `(unit, phase, power-kind)` tuple of the
//! active storage-unit set maps to exactly one column index. The registry is
//! rebuilt from scratch at `initialize_cycle`; looking up a tuple that was
//! never registered this cycle is a configuration error (a controller is
//! referencing a unit the coordinator did not activate) and fails fast.

use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::domain::{Phase, PowerKind};

use super::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoefficientKey {
    pub unit_id: String,
    pub phase: Phase,
    pub kind: PowerKind,
}

#[derive(Debug, Clone, Default)]
pub struct Coefficients {
    indices: HashMap<CoefficientKey, usize>,
    keys: Vec<CoefficientKey>,
}

impl Coefficients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears and rebuilds the index space for the given active unit set.
    ///
    /// Symmetric mode registers one `(All, Active)`/`(All, Reactive)` pair per
    /// unit; asymmetric mode registers six entries (`L1/L2/L3 x Active/Reactive`).
    /// Indices are assigned in unit order, so the layout is deterministic for
    /// a given unit list.
    pub fn initialize<I, S>(&mut self, symmetric_mode: bool, unit_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices.clear();
        self.keys.clear();

        for unit_id in unit_ids {
            let unit_id = unit_id.into();
            let phases: &[Phase] = if symmetric_mode {
                &[Phase::All]
            } else {
                &Phase::LEGS
            };
            for &phase in phases {
                for kind in PowerKind::iter() {
                    let key = CoefficientKey {
                        unit_id: unit_id.clone(),
                        phase,
                        kind,
                    };
                    self.indices.insert(key.clone(), self.keys.len());
                    self.keys.push(key);
                }
            }
        }
    }

    /// Number of columns registered this cycle.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Column index for `(unit, phase, kind)`, or a configuration error if the
    /// tuple was not registered this cycle. Never silently zero.
    pub fn index_of(
        &self,
        unit_id: &str,
        phase: Phase,
        kind: PowerKind,
    ) -> Result<usize, DispatchError> {
        let key = CoefficientKey {
            unit_id: unit_id.to_string(),
            phase,
            kind,
        };
        self.indices
            .get(&key)
            .copied()
            .ok_or(DispatchError::UnregisteredCoefficient {
                unit_id: key.unit_id,
                phase,
                kind,
            })
    }

    /// Reverse lookup, used for constraint classification and diagnostics.
    pub fn key_of(&self, index: usize) -> Option<&CoefficientKey> {
        self.keys.get(index)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CoefficientKey> {
        self.keys.iter()
    }
}
