//! Offline fleet model backing the demo coordinator.
//!
//! Each simulated unit integrates the solver's active-power setpoints into its
//! state of charge and publishes BMS-style snapshots: the allowed power range
//! tapers to zero near full and empty, and the reported SoC carries a little
//! measurement noise.

use rand::Rng;
use tracing::debug;

use crate::config::{FleetConfig, UnitConfig};
use crate::domain::StorageUnitSnapshot;
use crate::solver::DispatchSolution;

/// SoC band (percent) over which the allowed power tapers linearly to zero.
const TAPER_BAND_PERCENT: f64 = 5.0;

/// Amplitude of the SoC measurement noise (percent).
const SOC_NOISE_PERCENT: f64 = 0.05;

#[derive(Debug)]
pub struct SimulatedUnit {
    id: String,
    capacity_kwh: f64,
    soc_percent: f64,
    max_charge_power_w: i64,
    max_discharge_power_w: i64,
    max_apparent_power_va: u64,
    efficiency: f64,
}

impl SimulatedUnit {
    fn from_config(config: &UnitConfig) -> Self {
        Self {
            id: config.id.clone(),
            capacity_kwh: config.capacity_kwh,
            soc_percent: config.initial_soc_percent.clamp(0.0, 100.0),
            max_charge_power_w: config.max_charge_power_w,
            max_discharge_power_w: config.max_discharge_power_w,
            max_apparent_power_va: config.max_apparent_power_va,
            efficiency: config.efficiency.clamp(0.0, 1.0),
        }
    }

    fn allowed_discharge_w(&self) -> i64 {
        let factor = (self.soc_percent / TAPER_BAND_PERCENT).clamp(0.0, 1.0);
        (self.max_discharge_power_w as f64 * factor) as i64
    }

    fn allowed_charge_w(&self) -> i64 {
        let factor = ((100.0 - self.soc_percent) / TAPER_BAND_PERCENT).clamp(0.0, 1.0);
        (self.max_charge_power_w as f64 * factor) as i64
    }

    /// Integrates one cycle of dispatched active power into the SoC.
    /// Charging loses `1 - efficiency` on the way in, discharging on the way
    /// out.
    fn integrate(&mut self, active_power_w: f64, dt_seconds: f64) {
        let energy_kwh = active_power_w * dt_seconds / 3_600_000.0;
        let stored_delta_kwh = if active_power_w < 0.0 {
            -energy_kwh * self.efficiency
        } else {
            -energy_kwh / self.efficiency.max(f64::MIN_POSITIVE)
        };
        self.soc_percent =
            (self.soc_percent + stored_delta_kwh / self.capacity_kwh * 100.0).clamp(0.0, 100.0);
    }
}

#[derive(Debug)]
pub struct SimulatedFleet {
    units: Vec<SimulatedUnit>,
}

impl SimulatedFleet {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            units: config.units.iter().map(SimulatedUnit::from_config).collect(),
        }
    }

    /// Per-cycle snapshot set the dispatcher is initialized with.
    pub fn snapshots(&self) -> Vec<StorageUnitSnapshot> {
        let mut rng = rand::thread_rng();
        self.units
            .iter()
            .map(|unit| {
                let measured_soc =
                    unit.soc_percent + rng.gen_range(-SOC_NOISE_PERCENT..=SOC_NOISE_PERCENT);
                StorageUnitSnapshot::new(
                    unit.id.as_str(),
                    measured_soc,
                    unit.allowed_charge_w(),
                    unit.allowed_discharge_w(),
                    unit.max_apparent_power_va,
                )
            })
            .collect()
    }

    /// Applies a dispatch solution for `dt_seconds` of simulated time.
    pub fn apply(&mut self, solution: &DispatchSolution, dt_seconds: f64) {
        for unit in &mut self.units {
            let active_power_w: f64 = solution
                .setpoints
                .iter()
                .filter(|sp| sp.unit_id == unit.id)
                .map(|sp| sp.active_power_w)
                .sum();
            unit.integrate(active_power_w, dt_seconds);
            debug!(
                unit_id = unit.id,
                active_power_w,
                soc_percent = unit.soc_percent,
                "simulated unit advanced"
            );
        }
    }

    pub fn mean_soc_percent(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        self.units.iter().map(|u| u.soc_percent).sum::<f64>() / self.units.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_config(id: &str, soc: f64) -> UnitConfig {
        UnitConfig {
            id: id.to_string(),
            capacity_kwh: 10.0,
            initial_soc_percent: soc,
            max_charge_power_w: -10_000,
            max_discharge_power_w: 10_000,
            max_apparent_power_va: 12_000,
            efficiency: 1.0,
        }
    }

    #[test]
    fn test_discharge_drains_soc() {
        let mut unit = SimulatedUnit::from_config(&unit_config("ess0", 50.0));
        // 10 kW for 1/10 h out of a 10 kWh pack: 10 SoC points
        unit.integrate(10_000.0, 360.0);
        assert_relative_eq!(unit.soc_percent, 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_charge_efficiency_loses_energy() {
        let mut config = unit_config("ess0", 50.0);
        config.efficiency = 0.9;
        let mut unit = SimulatedUnit::from_config(&config);
        unit.integrate(-10_000.0, 360.0);
        assert_relative_eq!(unit.soc_percent, 59.0, epsilon = 1e-9);
    }

    #[test]
    fn test_allowed_power_tapers_near_limits() {
        let mut unit = SimulatedUnit::from_config(&unit_config("ess0", 2.5));
        assert_eq!(unit.allowed_discharge_w(), 5000);
        assert_eq!(unit.allowed_charge_w(), -10_000);

        unit.soc_percent = 100.0;
        assert_eq!(unit.allowed_charge_w(), 0);
        assert_eq!(unit.allowed_discharge_w(), 10_000);
    }

    #[test]
    fn test_snapshots_match_fleet() {
        let fleet = SimulatedFleet::from_config(&FleetConfig {
            peak_demand_w: 10_000.0,
            units: vec![unit_config("ess0", 30.0), unit_config("ess1", 70.0)],
        });
        let snapshots = fleet.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].id, "ess0");
        assert!((snapshots[1].soc_percent - 70.0).abs() <= SOC_NOISE_PERCENT + 1e-9);
    }
}
