//! # vs_loop
//!
//! Fixed-cadence driver for one virtual-slope leg: derives the leg's step
//! parameters, builds a [`DepthController`] and ticks it every
//! `command_period` seconds with the freshest navigation snapshot.
//!
//! The loop runs as a spawned task and is cancelled by the phase manager via
//! `JoinHandle::abort`. Whatever way the task ends — leg flown to the end,
//! altitude-source failure, cancellation — the [`StepHandoff`] guard writes
//! the controller's final step (including any error compensation in flight)
//! back to the manager's continuity cell, so the next leg smooths from it.

use std::sync::{Arc, Mutex};

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::altitude::AltitudeSource;
use crate::controller::{ControllerSettings, DepthController, SetpointSink};
use crate::geo::distance_m;
use crate::mission::SubphasePlan;
use crate::navigation::NavigationStore;

/// Depth delta per control tick that follows the leg's slope at its speed.
pub fn calculate_step(
    start_z: f64,
    end_z: f64,
    speed: f64,
    distance: f64,
    command_period: f64,
) -> f64 {
    (((end_z - start_z) * speed) / distance) * command_period
}

/// Per-leg control parameters, derived once when the leg starts.
#[derive(Debug, Clone, Copy)]
pub struct LegParameters {
    pub start_z: f64,
    pub end_z: f64,
    pub distance: f64,
    pub step: f64,
    pub max_angle_step: f64,
    pub trajectory_down: bool,
}

impl LegParameters {
    /// Derive from the plan and the vehicle's live depth. `START_Z` stands in
    /// when the depth sensor is silent.
    pub fn derive(
        plan: &SubphasePlan,
        actual_start_z: Option<f64>,
        max_angle_deg: f64,
        command_period: f64,
    ) -> Self {
        let start_z = actual_start_z.unwrap_or(plan.start_z);
        let distance = distance_m(plan.start_lat, plan.start_lon, plan.end_lat, plan.end_lon);
        let step = calculate_step(start_z, plan.end_z, plan.speed, distance, command_period);
        let max_angle_step = plan.speed * max_angle_deg.to_radians().sin() * command_period;
        let trajectory_down = plan.end_z > start_z;
        Self {
            start_z,
            end_z: plan.end_z,
            distance,
            step,
            max_angle_step,
            trajectory_down,
        }
    }
}

/// Writes the last recorded controller step into the manager's continuity
/// cell when dropped. Dropping happens on every exit path of the loop,
/// cancellation included.
struct StepHandoff {
    cell: Arc<Mutex<f64>>,
    step: f64,
}

impl StepHandoff {
    fn new(cell: Arc<Mutex<f64>>, initial_step: f64) -> Self {
        Self {
            cell,
            step: initial_step,
        }
    }

    fn record(&mut self, step: f64) {
        self.step = step;
    }
}

impl Drop for StepHandoff {
    fn drop(&mut self) {
        if let Ok(mut last_step) = self.cell.lock() {
            *last_step = self.step;
        }
        debug!("Saved final step {:.6} for next subphase", self.step);
    }
}

/// Everything the loop needs besides the leg itself.
pub struct VsLoopContext {
    pub nav: NavigationStore,
    pub sink: Arc<dyn SetpointSink>,
    pub altitude_source: Arc<dyn AltitudeSource>,
    pub settings: ControllerSettings,
    pub command_period: f64,
    pub last_step: Arc<Mutex<f64>>,
}

pub async fn virtual_slope_loop(
    subphase_id: String,
    plan: SubphasePlan,
    leg: LegParameters,
    previous_step: f64,
    ctx: VsLoopContext,
) {
    info!("START - Subphase {subphase_id}");
    info!(
        "Parameters: START_Z={:.2} END_Z={:.2} SPEED={} DISTANCE={:.2} m STEP={:.4} TRAJECTORY={}",
        leg.start_z,
        leg.end_z,
        plan.speed,
        leg.distance,
        leg.step,
        if leg.trajectory_down { "DOWN" } else { "UP" }
    );
    info!(
        "Coordinates: START({:.6},{:.6}) END({:.6},{:.6})",
        plan.start_lat, plan.start_lon, plan.end_lat, plan.end_lon
    );
    info!("MAX_ANGLE_STEP={:.4} m", leg.max_angle_step);

    let mut controller = DepthController::new(
        leg.start_z,
        leg.end_z,
        leg.step,
        leg.max_angle_step,
        leg.trajectory_down,
        previous_step,
        ctx.settings,
        ctx.sink,
    );

    let mut handoff = StepHandoff::new(ctx.last_step, controller.current_step());

    let mut ticker = interval(Duration::from_secs_f64(ctx.command_period));
    // When a tick overruns, proceed immediately instead of bursting
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let nav = ctx.nav.get().await;
        let altitude = match ctx.altitude_source.altitude(nav.as_ref()) {
            Ok(altitude) => altitude,
            Err(e) => {
                error!("Subphase {subphase_id} altitude source failure: {e}");
                break;
            }
        };

        controller.update(altitude).await;
        handoff.record(controller.current_step());
    }
    // handoff drops here and publishes the final step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg_plan() -> SubphasePlan {
        SubphasePlan {
            start_lat: 0.0,
            start_lon: 0.0,
            start_z: 10.0,
            end_lat: 0.0,
            end_lon: 0.00045, // ≈ 50 m along the equator
            end_z: 20.0,
            speed: 1.0,
        }
    }

    #[test]
    fn step_follows_slope_and_speed() {
        // 10 m of depth over 50 m of track at 1 m/s: 0.2 m per 1 s tick
        let step = calculate_step(10.0, 20.0, 1.0, 50.0, 1.0);
        assert!((step - 0.2).abs() < 1e-12);

        // Upward leg yields a negative step
        let up = calculate_step(20.0, 10.0, 1.0, 50.0, 1.0);
        assert!((up + 0.2).abs() < 1e-12);

        // Faster ticks shrink the per-tick delta proportionally
        let fast = calculate_step(10.0, 20.0, 1.0, 50.0, 0.5);
        assert!((fast - 0.1).abs() < 1e-12);
    }

    #[test]
    fn leg_parameters_prefer_live_depth() {
        let plan = leg_plan();
        let leg = LegParameters::derive(&plan, Some(12.0), 15.0, 1.0);
        assert_eq!(leg.start_z, 12.0);
        assert!(leg.trajectory_down);

        let fallback = LegParameters::derive(&plan, None, 15.0, 1.0);
        assert_eq!(fallback.start_z, 10.0);
    }

    #[test]
    fn max_angle_step_bounds_safety_rate() {
        let plan = leg_plan();
        let leg = LegParameters::derive(&plan, None, 15.0, 1.0);
        let expected = 1.0 * 15.0_f64.to_radians().sin() * 1.0;
        assert!((leg.max_angle_step - expected).abs() < 1e-12);
    }

    #[test]
    fn handoff_publishes_on_drop() {
        let cell = Arc::new(Mutex::new(0.0));
        {
            let mut handoff = StepHandoff::new(cell.clone(), 0.1);
            handoff.record(0.2111);
        }
        assert_eq!(*cell.lock().unwrap(), 0.2111);
    }

    #[test]
    fn handoff_publishes_initial_step_when_never_recorded() {
        let cell = Arc::new(Mutex::new(0.5));
        drop(StepHandoff::new(cell.clone(), 0.1));
        assert_eq!(*cell.lock().unwrap(), 0.1);
    }
}
