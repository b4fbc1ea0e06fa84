//! Inverter model for the dispatch solver.
//!
//! A `SinglePhaseInverter` controls one storage unit symmetrically (one
//! active/reactive variable pair, `Phase::All`). A `ThreePhaseInverter`
//! controls one unit per-leg (L1/L2/L3, six variables). Both carry a mutable
//! fairness weight derived from the unit's SoC; the weight only biases how the
//! solver distributes free capacity, it never changes hardware limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::EnumIter;

/// One leg of the AC connection, or `All` for a symmetric (single-variable) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum Phase {
    L1,
    L2,
    L3,
    All,
}

impl Phase {
    /// The three physical legs of an asymmetric unit.
    pub const LEGS: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::L1 => write!(f, "L1"),
            Phase::L2 => write!(f, "L2"),
            Phase::L3 => write!(f, "L3"),
            Phase::All => write!(f, "ALL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
pub enum PowerKind {
    Active,
    Reactive,
}

impl fmt::Display for PowerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerKind::Active => write!(f, "P"),
            PowerKind::Reactive => write!(f, "Q"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinglePhaseInverter {
    pub unit_id: String,
    pub phase: Phase,
    weight: f64,
}

impl SinglePhaseInverter {
    pub fn new(unit_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            unit_id: unit_id.into(),
            phase,
            weight: 0.0,
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreePhaseInverter {
    pub unit_id: String,
    weight: f64,
    pub legs: [SinglePhaseInverter; 3],
}

impl ThreePhaseInverter {
    pub fn new(unit_id: impl Into<String>) -> Self {
        let unit_id = unit_id.into();
        let legs = Phase::LEGS.map(|phase| SinglePhaseInverter::new(unit_id.clone(), phase));
        Self {
            unit_id,
            weight: 0.0,
            legs,
        }
    }
}

/// Tagged variant over the two inverter shapes. Solver code matches on the
/// variant only where phase count changes behavior (constraint expansion);
/// the core solve is phase-count-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Inverter {
    Single(SinglePhaseInverter),
    Three(ThreePhaseInverter),
}

impl Inverter {
    /// Symmetric inverter for one storage unit (`Phase::All`).
    pub fn single(unit_id: impl Into<String>) -> Self {
        Inverter::Single(SinglePhaseInverter::new(unit_id, Phase::All))
    }

    /// Asymmetric inverter with one sub-inverter per leg.
    pub fn three(unit_id: impl Into<String>) -> Self {
        Inverter::Three(ThreePhaseInverter::new(unit_id))
    }

    pub fn unit_id(&self) -> &str {
        match self {
            Inverter::Single(inv) => &inv.unit_id,
            Inverter::Three(inv) => &inv.unit_id,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Inverter::Single(inv) => inv.weight,
            Inverter::Three(inv) => inv.weight,
        }
    }

    /// Sets the fairness weight; a three-phase inverter propagates the weight
    /// to its legs so per-leg distribution stays consistent.
    pub fn set_weight(&mut self, weight: f64) {
        match self {
            Inverter::Single(inv) => inv.weight = weight,
            Inverter::Three(inv) => {
                inv.weight = weight;
                for leg in inv.legs.iter_mut() {
                    leg.set_weight(weight);
                }
            }
        }
    }

    /// The phases this inverter's setpoints are keyed by.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Inverter::Single(_) => &[Phase::All],
            Inverter::Three(_) => &Phase::LEGS,
        }
    }
}

impl fmt::Display for Inverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unit_id())
    }
}
