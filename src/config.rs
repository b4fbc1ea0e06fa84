use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cycle: CycleConfig,
    pub solver: SolverConfig,
    pub fleet: FleetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    pub period_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    /// One variable pair per unit when true, one per leg when false.
    pub symmetric_mode: bool,
    /// Sample count for the apparent-power polygon.
    pub circle_points: usize,
    /// Weight gap before two adjacent units swap dispatch priority.
    pub sort_hysteresis: f64,
    /// Multiplier from SoC percent to fairness weight.
    pub weight_scale: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Amplitude of the simulated grid demand the demo coordinator tracks.
    pub peak_demand_w: f64,
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub id: String,
    pub capacity_kwh: f64,
    pub initial_soc_percent: f64,
    /// Negative: power flowing into the unit.
    pub max_charge_power_w: i64,
    pub max_discharge_power_w: i64,
    pub max_apparent_power_va: u64,
    pub efficiency: f64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("FLEET__").split("__"));
        Ok(figment.extract()?)
    }
}
