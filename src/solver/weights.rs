//! SoC-derived fairness weights and the hysteresis that keeps the dispatch
//! ordering stable.
//!
//! Weight is monotone in SoC: units with more stored energy rank higher, so
//! they are preferred for discharge and penalized for charge. Re-sorting every
//! cycle on raw weights would make two units whose SoCs drift past each other
//! swap dispatch priority every cycle, chattering setpoints on real hardware.
//! `adjust_sorting_by_weights` therefore only swaps an adjacent pair once the
//! weight gap reaches a fixed threshold.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use tracing::debug;

use crate::domain::{Inverter, StorageUnitSnapshot};

/// Default weight gap (in SoC points at the default scale) that triggers a
/// resort. A 1-point gap never does.
pub const DEFAULT_SORT_HYSTERESIS: f64 = 15.0;

/// Derives each inverter's weight from its storage unit's SoC:
/// `weight = soc_percent * scale`. Inverters whose unit is missing from the
/// snapshot set keep their previous weight.
pub fn update_weights_from_soc(
    inverters: &mut [Inverter],
    units: &[StorageUnitSnapshot],
    scale: f64,
) {
    let soc_by_id: HashMap<&str, f64> = units
        .iter()
        .map(|u| (u.id.as_str(), u.soc_percent))
        .collect();

    for inverter in inverters.iter_mut() {
        match soc_by_id.get(inverter.unit_id()) {
            Some(soc) => inverter.set_weight(soc * scale),
            None => debug!(
                unit_id = inverter.unit_id(),
                "no snapshot for inverter, keeping previous weight"
            ),
        }
    }
}

/// Stable descending sort by weight. Ties keep insertion order, so equal-SoC
/// units never flip arbitrarily.
pub fn sort_by_weights(inverters: &mut [Inverter]) {
    inverters.sort_by_key(|inv| std::cmp::Reverse(OrderedFloat(inv.weight())));
}

/// Re-sorts with hysteresis: an adjacent pair is swapped only when the later
/// inverter outweighs the earlier one by at least `hysteresis`. Bubble passes
/// repeat until no swap fires; each swap removes an inversion of at least the
/// threshold, so the loop is bounded by the number of pair inversions.
pub fn adjust_sorting_by_weights(inverters: &mut [Inverter], hysteresis: f64) {
    if inverters.len() < 2 {
        return;
    }
    let mut swapped = true;
    while swapped {
        swapped = false;
        for i in 0..inverters.len() - 1 {
            let gap = inverters[i + 1].weight() - inverters[i].weight();
            if gap >= hysteresis {
                inverters.swap(i, i + 1);
                swapped = true;
            }
        }
    }
}

/// The only state the solver carries across cycles: the remembered fairness
/// ordering (plus its hysteresis threshold). Owned by the dispatcher and
/// mutated only through these methods, so the per-cycle solve itself stays
/// stateless.
#[derive(Debug, Clone)]
pub struct FairnessState {
    remembered_order: Vec<String>,
    pub hysteresis: f64,
    pub weight_scale: f64,
}

impl FairnessState {
    pub fn new(hysteresis: f64, weight_scale: f64) -> Self {
        Self {
            remembered_order: Vec::new(),
            hysteresis,
            weight_scale,
        }
    }

    /// Orders a freshly built inverter list: units seen in earlier cycles keep
    /// their remembered relative order, new units append in arrival order.
    pub fn apply_remembered_order(&self, inverters: Vec<Inverter>) -> Vec<Inverter> {
        if self.remembered_order.is_empty() {
            return inverters;
        }
        let mut remaining = inverters;
        let mut ordered = Vec::with_capacity(remaining.len());
        for unit_id in &self.remembered_order {
            if let Some(pos) = remaining.iter().position(|inv| inv.unit_id() == unit_id) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        ordered
    }

    /// Refreshes weights from the cycle's snapshots and applies the hysteresis
    /// resort. A first cycle (nothing remembered yet) gets a full stable sort
    /// instead, so the initial ordering is deterministic.
    pub fn rank(&mut self, inverters: &mut Vec<Inverter>, units: &[StorageUnitSnapshot]) {
        update_weights_from_soc(inverters, units, self.weight_scale);
        if self.remembered_order.is_empty() {
            sort_by_weights(inverters);
        } else {
            adjust_sorting_by_weights(inverters, self.hysteresis);
        }
        self.remembered_order = inverters
            .iter()
            .map(|inv| inv.unit_id().to_string())
            .collect();
    }
}
