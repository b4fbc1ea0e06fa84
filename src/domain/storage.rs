use serde::{Deserialize, Serialize};

/// Read-only per-cycle snapshot of a storage unit (ESS), as published by the
/// device-driver layer before `initialize_cycle`.
///
/// Sign convention: negative active power = charging (power flowing into the
/// battery), positive = discharging. `allowed_charge_power_w` is therefore
/// always <= 0 and `allowed_discharge_power_w` always >= 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageUnitSnapshot {
    pub id: String,
    /// Measured state of charge, 0..100 %
    pub soc_percent: f64,
    /// Maximum charge power this cycle (W, <= 0)
    pub allowed_charge_power_w: i64,
    /// Maximum discharge power this cycle (W, >= 0)
    pub allowed_discharge_power_w: i64,
    /// Hardware apparent-power capability (VA)
    pub max_apparent_power_va: u64,
}

impl StorageUnitSnapshot {
    /// Builds a snapshot, normalizing out-of-range driver values: SoC is
    /// clamped to 0..100 and power limits that carry the wrong sign are
    /// clamped to zero (no capability) rather than silently flipped.
    pub fn new(
        id: impl Into<String>,
        soc_percent: f64,
        allowed_charge_power_w: i64,
        allowed_discharge_power_w: i64,
        max_apparent_power_va: u64,
    ) -> Self {
        Self {
            id: id.into(),
            soc_percent: soc_percent.clamp(0.0, 100.0),
            allowed_charge_power_w: allowed_charge_power_w.min(0),
            allowed_discharge_power_w: allowed_discharge_power_w.max(0),
            max_apparent_power_va,
        }
    }

    /// Lower bound of the active-power range (W, <= 0).
    pub fn charge_bound_w(&self) -> f64 {
        self.allowed_charge_power_w as f64
    }

    /// Upper bound of the active-power range (W, >= 0).
    pub fn discharge_bound_w(&self) -> f64 {
        self.allowed_discharge_power_w as f64
    }

    pub fn apparent_power_va(&self) -> f64 {
        self.max_apparent_power_va as f64
    }
}
