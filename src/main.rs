use std::time::Duration;

use anyhow::Result;
use fleet_dispatch::config::Config;
use fleet_dispatch::domain::PowerKind;
use fleet_dispatch::simulation::SimulatedFleet;
use fleet_dispatch::solver::{PowerDispatcher, Relationship};
use fleet_dispatch::telemetry::{init_tracing, shutdown_signal};
use tracing::{info, warn};

/// Period of the simulated grid demand swing.
const DEMAND_PERIOD_SECONDS: f64 = 900.0;

/// Residuals below this are floating-point noise from the clip stage, not a
/// real shortfall (W).
const VIOLATION_EPSILON_W: f64 = 1e-6;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    if cfg.fleet.units.is_empty() {
        anyhow::bail!("no storage units configured, nothing to dispatch");
    }

    info!(
        units = cfg.fleet.units.len(),
        period_seconds = cfg.cycle.period_seconds,
        symmetric = cfg.solver.symmetric_mode,
        "starting fleet dispatch"
    );

    let dispatcher = PowerDispatcher::from_config(&cfg.solver);
    let mut fleet = SimulatedFleet::from_config(&cfg.fleet);

    let period = Duration::from_secs(cfg.cycle.period_seconds.max(1));
    let mut interval = tokio::time::interval(period);
    let mut elapsed_seconds = 0.0;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                dispatcher.initialize_cycle(fleet.snapshots())?;

                // Demo intent: track a sinusoidal grid demand, clamped to
                // what the fleet can actually deliver this cycle.
                let demand_w = cfg.fleet.peak_demand_w
                    * (2.0 * std::f64::consts::PI * elapsed_seconds / DEMAND_PERIOD_SECONDS).sin();
                let target_w = demand_w
                    .clamp(dispatcher.min_active_power(), dispatcher.max_active_power());
                dispatcher.add_fleet_sum_constraint(
                    "grid setpoint",
                    PowerKind::Active,
                    Relationship::Equals,
                    target_w,
                )?;

                let solution = dispatcher.solve();
                if solution.violation > VIOLATION_EPSILON_W {
                    warn!(violation = solution.violation, "dispatch degraded, hardware limits bind");
                }

                fleet.apply(&solution, period.as_secs_f64());
                elapsed_seconds += period.as_secs_f64();
                info!(
                    target_w,
                    dispatched_w = solution.total_active_power_w(),
                    mean_soc = fleet.mean_soc_percent(),
                    "cycle complete"
                );
            }
            _ = &mut shutdown => break,
        }
    }

    warn!("shutdown complete");
    Ok(())
}
