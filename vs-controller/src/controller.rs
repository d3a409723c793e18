//! # controller
//!
//! Per-tick depth controller for one virtual-slope leg.
//!
//! Each tick advances a planned trajectory clock (`current_z`) toward the
//! leg's end depth and emits one depth setpoint. A five-state safety
//! automaton supervises the emission: when the altitude above the seafloor
//! falls below the configured thresholds the commanded depth is held
//! (`HOLD`), reduced (`ASCEND`), stabilized (`WAIT`) and finally steered back
//! onto the slope (`RETURN`). The trajectory clock keeps ticking throughout
//! so that, once safety disengages, the vehicle rejoins the slope at the
//! depth it would have reached anyway.
//!
//! Step changes between legs are smoothed over `transition_time` ticks; the
//! depth deficit the smoothing causes is spread over the remaining ticks of
//! the leg so arrival at `end_z` stays on schedule.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::VsConfig;

// ── Setpoint dispatch seam ────────────────────────────────────────────────────

/// Where emitted depth setpoints go. Implemented by the Backseat client in
/// production and by recording stubs in tests.
#[async_trait]
pub trait SetpointSink: Send + Sync {
    /// Returns false when the command was rejected or could not be delivered.
    /// Delivery failures never alter controller state.
    async fn send_depth(&self, z: f64) -> bool;
}

// ── Safety automaton ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    Hold,
    Ascend,
    Wait,
    Return,
}

impl ControllerState {
    fn as_str(self) -> &'static str {
        match self {
            ControllerState::Normal => "NORMAL",
            ControllerState::Hold => "HOLD",
            ControllerState::Ascend => "ASCEND",
            ControllerState::Wait => "WAIT",
            ControllerState::Return => "RETURN",
        }
    }
}

/// Safety and smoothing parameters, fixed for the controller's lifetime.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub altitude_threshold_level: f64,
    pub altitude_threshold_ascend: f64,
    /// Seconds spent in WAIT before returning to the slope
    pub wait_time: f64,
    /// Step-transition length, ticks
    pub transition_time: usize,
    pub min_depth: f64,
    pub max_depth: f64,
}

impl ControllerSettings {
    pub fn from_config(cfg: &VsConfig) -> Self {
        Self {
            altitude_threshold_level: cfg.altitude_threshold_level,
            altitude_threshold_ascend: cfg.altitude_threshold_ascend,
            wait_time: cfg.wait_time,
            transition_time: cfg.transition_time,
            min_depth: cfg.min_depth,
            max_depth: cfg.max_depth,
        }
    }
}

/// `n` linearly spaced values from `start` to `end` inclusive.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

// ── Depth controller ──────────────────────────────────────────────────────────

pub struct DepthController {
    // Planned trajectory
    start_z: f64,
    current_z: f64,
    end_z: f64,
    end_z_reached: bool,
    trajectory_down: bool,

    // Step schedule
    target_step: f64,
    current_step: f64,
    original_target_step: f64,
    transition: Vec<f64>,
    transition_cursor: usize,
    step_transition_active: bool,
    error_compensation_active: bool,

    // Safety
    max_angle_step: f64,
    state: ControllerState,
    state_start_time: Option<Instant>,
    wait_from_ascend: bool,

    // Command
    command_depth: f64,

    settings: ControllerSettings,
    sink: Arc<dyn SetpointSink>,
}

impl DepthController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start_z: f64,
        end_z: f64,
        step: f64,
        max_angle_step: f64,
        trajectory_down: bool,
        previous_step: f64,
        settings: ControllerSettings,
        sink: Arc<dyn SetpointSink>,
    ) -> Self {
        let transition = linspace(previous_step, step, settings.transition_time);
        let step_transition_active = previous_step != step;

        info!("DepthController initialized: {start_z}m → {end_z}m, step={step:.4}m");
        info!(
            "Trajectory: {}",
            if trajectory_down { "DOWN (safety enabled)" } else { "UP" }
        );
        if trajectory_down {
            info!("Max angle step: {max_angle_step:.4}m");
        }
        if step_transition_active {
            info!(
                "Step transition: {previous_step:.4} → {step:.4} over {} steps",
                transition.len()
            );
        } else {
            info!("No step transition needed: step={step:.4}");
        }

        Self {
            start_z,
            current_z: start_z,
            end_z,
            end_z_reached: false,
            trajectory_down,
            target_step: step,
            current_step: previous_step,
            original_target_step: step,
            transition,
            transition_cursor: 0,
            step_transition_active,
            error_compensation_active: false,
            max_angle_step,
            state: ControllerState::Normal,
            state_start_time: None,
            wait_from_ascend: false,
            command_depth: start_z,
            settings,
            sink,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn current_z(&self) -> f64 {
        self.current_z
    }

    pub fn current_step(&self) -> f64 {
        self.current_step
    }

    pub fn target_step(&self) -> f64 {
        self.target_step
    }

    pub fn command_depth(&self) -> f64 {
        self.command_depth
    }

    pub fn end_z_reached(&self) -> bool {
        self.end_z_reached
    }

    pub fn error_compensation_active(&self) -> bool {
        self.error_compensation_active
    }

    /// One control tick. Emits exactly one depth setpoint and returns whether
    /// the planned trajectory has reached `end_z`.
    pub async fn update(&mut self, altitude: Option<f64>) -> bool {
        self.advance_step_transition();
        self.handle_transitions(altitude);

        let active_state = self.state;
        self.execute_state(active_state).await;

        // The planned clock ticks in every state so RETURN has a live rejoin
        // target.
        self.advance_trajectory();

        // Upward RETURN rejoins when the slope has caught up with the held
        // command depth.
        if active_state == ControllerState::Return
            && !self.trajectory_down
            && self.current_z <= self.command_depth
        {
            self.set_state(ControllerState::Normal);
        }

        self.end_z_reached
    }

    // ── Transition rules ──────────────────────────────────────────────────

    fn handle_transitions(&mut self, altitude: Option<f64>) {
        // Altitude unavailable: no safety supervision possible, resume NORMAL
        let Some(altitude) = altitude else {
            if self.state != ControllerState::Normal {
                self.set_state(ControllerState::Normal);
            }
            return;
        };

        // Altitude-priority rules: these interrupt any state
        if altitude < self.settings.altitude_threshold_ascend {
            if matches!(
                self.state,
                ControllerState::Wait | ControllerState::Return | ControllerState::Hold
            ) {
                warn!(
                    "{} INTERRUPTED: altitude dropped to {altitude:.1}m (critical)",
                    self.state.as_str()
                );
            }
            self.set_state(ControllerState::Ascend);
            return;
        }

        if self.trajectory_down && altitude < self.settings.altitude_threshold_level {
            if matches!(
                self.state,
                ControllerState::Wait | ControllerState::Return | ControllerState::Hold
            ) {
                warn!(
                    "{} INTERRUPTED: altitude dropped to {altitude:.1}m (warning)",
                    self.state.as_str()
                );
            }
            self.set_state(ControllerState::Hold);
            return;
        }

        // State-driven rules, applied only when altitude forced nothing.
        // ASCEND and HOLD hand over to WAIT on the next tick regardless of
        // how far the altitude has recovered: one-shot maneuver, then
        // stabilize.
        match self.state {
            ControllerState::Ascend | ControllerState::Hold => {
                self.set_state(ControllerState::Wait);
            }
            ControllerState::Wait => {
                if self.wait_finished() {
                    self.set_state(ControllerState::Return);
                }
            }
            ControllerState::Return => {
                if self.return_caught_slope() {
                    self.set_state(ControllerState::Normal);
                }
            }
            ControllerState::Normal => {}
        }
    }

    fn set_state(&mut self, new_state: ControllerState) {
        if self.state == new_state {
            return;
        }
        let old_state = self.state;
        self.state = new_state;
        self.on_enter_state(new_state, old_state);
        info!(
            "→ State transition: {} → {}",
            old_state.as_str(),
            new_state.as_str()
        );
    }

    fn on_enter_state(&mut self, state: ControllerState, from: ControllerState) {
        match state {
            ControllerState::Ascend => {
                self.state_start_time = None;
                // Freeze the command at the present planned depth before
                // reducing it
                self.command_depth = self.current_z;
                warn!(
                    "CRITICAL SAFETY ASCEND starting from current depth {:.1}m",
                    self.command_depth
                );
            }
            ControllerState::Hold => {
                self.state_start_time = None;
                info!("SAFETY HOLD at {:.1}m", self.command_depth);
            }
            ControllerState::Wait => {
                self.state_start_time = Some(Instant::now());
                self.wait_from_ascend = from == ControllerState::Ascend;
                if self.wait_from_ascend {
                    info!(
                        "WAIT after ASCEND - continuing ascent for {}s",
                        self.settings.wait_time
                    );
                } else {
                    info!("WAIT after HOLD - holding for {}s", self.settings.wait_time);
                }
            }
            ControllerState::Return => {
                self.state_start_time = None;
                info!(
                    "RETURN from {:.1}m to slope trajectory {:.1}m",
                    self.command_depth, self.current_z
                );
            }
            ControllerState::Normal => {
                self.state_start_time = None;
                info!("Safety deactivated - resuming normal slope operation");
            }
        }
    }

    // ── Per-state behavior ────────────────────────────────────────────────

    async fn execute_state(&mut self, state: ControllerState) {
        match state {
            ControllerState::Normal => self.state_normal().await,
            ControllerState::Hold => self.state_hold().await,
            ControllerState::Ascend => self.state_ascend().await,
            ControllerState::Wait => self.state_wait().await,
            ControllerState::Return => self.state_return().await,
        }
    }

    async fn state_normal(&mut self) {
        let command_z = if self.end_z_reached {
            self.end_z
        } else {
            // Look one step ahead: never command past end_z
            let next_z = self.current_z + self.current_step;
            let crossing = if self.trajectory_down {
                next_z >= self.end_z
            } else {
                next_z <= self.end_z
            };
            if crossing {
                debug!(
                    "Next step would cross end_z ({next_z:.2} vs {:.2}), holding end_z",
                    self.end_z
                );
                self.current_z = self.end_z;
                self.end_z_reached = true;
                self.end_z
            } else {
                self.current_z
            }
        };

        self.command_depth = command_z;
        debug!(
            "NORMAL: commanding depth={command_z:.2}m (current_z={:.2}m, end_z_reached={})",
            self.current_z, self.end_z_reached
        );
        self.dispatch(command_z).await;
    }

    async fn state_hold(&mut self) {
        self.dispatch(self.command_depth).await;
        debug!("HOLD safety: depth={:.2}m", self.command_depth);
    }

    async fn state_ascend(&mut self) {
        // Gain altitude by reducing the commanded depth
        self.command_depth = self.clamp_depth(self.command_depth - self.max_angle_step);
        self.dispatch(self.command_depth).await;
        debug!(
            "ASCEND: {:.2}m (slope: {:.2}m)",
            self.command_depth, self.current_z
        );
    }

    async fn state_wait(&mut self) {
        let elapsed = self
            .state_start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        if self.wait_from_ascend {
            // Entered from ASCEND: keep opening the gap to the seafloor
            self.command_depth = self.clamp_depth(self.command_depth - self.max_angle_step);
            debug!(
                "WAIT: {elapsed:.1}s/{:.1}s (ascending: {:.2}m)",
                self.settings.wait_time, self.command_depth
            );
        } else {
            debug!(
                "WAIT: {elapsed:.1}s/{:.1}s (holding: {:.2}m)",
                self.settings.wait_time, self.command_depth
            );
        }

        self.dispatch(self.command_depth).await;
    }

    async fn state_return(&mut self) {
        if self.trajectory_down {
            // Descend gradually until the next step would catch the slope,
            // then align exactly
            let next_return_depth = self.clamp_depth(self.command_depth + self.max_angle_step);
            if next_return_depth >= self.current_z {
                self.command_depth = self.current_z;
                self.dispatch(self.command_depth).await;
                info!(
                    "RETURN COMPLETE: aligned at {:.2}m (slope: {:.2}m)",
                    self.command_depth, self.current_z
                );
                self.set_state(ControllerState::Normal);
            } else {
                self.command_depth = next_return_depth;
                self.dispatch(self.command_depth).await;
                debug!(
                    "RETURN: {:.2}m → slope {:.2}m (gap: {:.2}m)",
                    self.command_depth,
                    self.current_z,
                    self.current_z - self.command_depth
                );
            }
            return;
        }

        // Upward trajectory: hold the command depth until the slope catches up
        self.dispatch(self.command_depth).await;
        debug!(
            "RETURN (UP) holding at {:.2}m until slope <= {:.2}m",
            self.command_depth, self.command_depth
        );
        if self.current_z <= self.command_depth {
            self.set_state(ControllerState::Normal);
        }
    }

    // ── Step transition and error compensation ────────────────────────────

    fn advance_step_transition(&mut self) {
        if !self.step_transition_active {
            return;
        }

        if self.transition_cursor < self.transition.len() {
            self.current_step = self.transition[self.transition_cursor];
            self.transition_cursor += 1;
            debug!("Step transition: {:.4}", self.current_step);
        } else {
            self.step_transition_active = false;
            self.apply_error_compensation();
            info!("Step transition completed, starting error compensation");
        }
    }

    fn apply_error_compensation(&mut self) {
        let smoothed_movement: f64 = self.transition.iter().sum();
        let linear_movement = self.original_target_step * self.transition.len() as f64;
        let accumulated_error = linear_movement - smoothed_movement;

        let total_trajectory = self.end_z - self.start_z;
        let remaining_trajectory = total_trajectory - linear_movement;

        if remaining_trajectory.abs() > 0.0 && self.original_target_step.abs() > 0.0 {
            let remaining_steps = (remaining_trajectory / self.original_target_step).abs().ceil();
            if remaining_steps > 0.0 {
                let per_step = accumulated_error / remaining_steps;
                self.current_step = self.original_target_step + per_step;
                self.target_step = self.current_step;
                self.error_compensation_active = true;
                info!(
                    "Error compensation: {accumulated_error:.4}m over {remaining_steps:.0} steps \
                     ({:.4}m/step → {:.4}m/step)",
                    self.original_target_step, self.current_step
                );
                debug!(
                    "Movements: linear={linear_movement:.4}, smoothed={smoothed_movement:.4}, \
                     remaining trajectory={remaining_trajectory:.4}"
                );
            } else {
                self.current_step = self.original_target_step;
                info!("No error compensation needed - end of leg");
            }
        } else {
            self.current_step = self.original_target_step;
            info!(
                "No error compensation possible - using original step: {:.4}",
                self.original_target_step
            );
        }
    }

    // ── Planned-trajectory advancement ────────────────────────────────────

    fn advance_trajectory(&mut self) {
        if self.end_z_reached {
            return;
        }

        let end_reached = if self.trajectory_down {
            self.current_z >= self.end_z
        } else {
            self.current_z <= self.end_z
        };

        if end_reached {
            self.current_z = self.end_z;
            self.end_z_reached = true;
            debug!(
                "END_Z reached: {:.2}m (trajectory={})",
                self.end_z,
                if self.trajectory_down { "DOWN" } else { "UP" }
            );
            return;
        }

        // The step already carries the correct sign
        self.current_z += self.current_step;
    }

    // ── Predicates and helpers ────────────────────────────────────────────

    fn wait_finished(&self) -> bool {
        match self.state_start_time {
            Some(start) => start.elapsed().as_secs_f64() >= self.settings.wait_time,
            None => false,
        }
    }

    fn return_caught_slope(&self) -> bool {
        self.command_depth >= self.current_z
    }

    fn clamp_depth(&self, depth: f64) -> f64 {
        depth.clamp(self.settings.min_depth, self.settings.max_depth)
    }

    async fn dispatch(&self, z: f64) {
        if !self.sink.send_depth(z).await {
            debug!("Depth command {z:.2}m was not accepted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every commanded depth.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<f64>>,
    }

    impl RecordingSink {
        fn commands(&self) -> Vec<f64> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SetpointSink for RecordingSink {
        async fn send_depth(&self, z: f64) -> bool {
            self.sent.lock().unwrap().push(z);
            true
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            altitude_threshold_level: 5.0,
            altitude_threshold_ascend: 3.0,
            wait_time: 0.0,
            transition_time: 1,
            min_depth: 0.0,
            max_depth: 100.0,
        }
    }

    fn descent_controller(sink: Arc<RecordingSink>) -> DepthController {
        // 10 m → 20 m over a 50 m leg at 1 m/s, 1 s ticks: step = 0.2 m
        DepthController::new(10.0, 20.0, 0.2, 0.5, true, 0.2, settings(), sink)
    }

    #[test]
    fn linspace_matches_inclusive_endpoints() {
        assert_eq!(linspace(0.0, 0.2, 5), vec![0.0, 0.05, 0.1, 0.15, 0.2]);
        assert_eq!(linspace(0.3, 0.3, 1), vec![0.3]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[tokio::test]
    async fn clean_descent_reaches_end_depth_exactly() {
        let sink = Arc::new(RecordingSink::default());
        let mut controller = descent_controller(sink.clone());

        let mut ticks = 0;
        while !controller.update(Some(8.0)).await {
            assert_eq!(controller.state(), ControllerState::Normal);
            ticks += 1;
            assert!(ticks < 60, "descent never completed");
        }

        // ~50 ticks of 0.2 m; float accumulation may cost one extra tick
        assert!((50..=52).contains(&(ticks + 1)), "took {} ticks", ticks + 1);
        assert_eq!(controller.current_z(), 20.0);
        assert!(controller.end_z_reached());
        assert_eq!(*sink.commands().last().unwrap(), 20.0);

        // Once reached, the controller keeps commanding end_z
        controller.update(Some(8.0)).await;
        assert_eq!(controller.current_z(), 20.0);
        assert_eq!(*sink.commands().last().unwrap(), 20.0);
    }

    #[tokio::test]
    async fn commands_stay_inside_envelope() {
        let sink = Arc::new(RecordingSink::default());
        let mut s = settings();
        s.min_depth = 5.0;
        // Start shallow so a long ASCEND runs into the floor of the envelope
        let mut controller = DepthController::new(8.0, 20.0, 0.2, 1.0, true, 0.2, s, sink.clone());

        for _ in 0..30 {
            controller.update(Some(1.0)).await;
        }
        for &z in &sink.commands() {
            assert!((5.0..=100.0).contains(&z), "command {z} escaped envelope");
        }
        // Pinned at min_depth once the envelope clamps
        assert_eq!(*sink.commands().last().unwrap(), 5.0);
    }

    #[tokio::test]
    async fn critical_altitude_triggers_ascend_then_wait_then_return() {
        let sink = Arc::new(RecordingSink::default());
        let mut controller = descent_controller(sink.clone());

        for _ in 0..9 {
            controller.update(Some(8.0)).await;
        }
        let depth_before = controller.command_depth();

        // Altitude collapses below the critical threshold
        controller.update(Some(2.0)).await;
        assert_eq!(controller.state(), ControllerState::Ascend);
        // Command frozen at the planned depth, then reduced by one step
        assert!((controller.command_depth() - (depth_before + 0.2 - 0.5)).abs() < 1e-9);

        for _ in 0..4 {
            controller.update(Some(2.0)).await;
            assert_eq!(controller.state(), ControllerState::Ascend);
        }
        let ascend_commands = sink.commands();
        let n = ascend_commands.len();
        // Strictly decreasing by max_angle_step while ascending
        assert!((ascend_commands[n - 1] - (ascend_commands[n - 2] - 0.5)).abs() < 1e-9);

        // Altitude recovers: one stabilization tick that keeps ascending
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Wait);
        let after_wait = controller.command_depth();
        assert!((after_wait - (ascend_commands[n - 1] - 0.5)).abs() < 1e-9);

        // wait_time is zero, so the next tick starts the RETURN descent
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Return);

        let mut saw_normal = false;
        for _ in 0..40 {
            controller.update(Some(8.0)).await;
            if controller.state() == ControllerState::Normal {
                saw_normal = true;
                break;
            }
            assert_eq!(controller.state(), ControllerState::Return);
        }
        assert!(saw_normal, "RETURN never rejoined the slope");
    }

    #[tokio::test]
    async fn warning_altitude_holds_depth() {
        let sink = Arc::new(RecordingSink::default());
        let mut controller = descent_controller(sink.clone());

        for _ in 0..19 {
            controller.update(Some(8.0)).await;
        }
        // Warning level but not critical: hold
        controller.update(Some(4.0)).await;
        assert_eq!(controller.state(), ControllerState::Hold);
        let held = controller.command_depth();

        controller.update(Some(4.0)).await;
        assert_eq!(controller.state(), ControllerState::Hold);
        assert_eq!(controller.command_depth(), held);

        // Recovered: WAIT after HOLD keeps holding, not ascending
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Wait);
        assert_eq!(controller.command_depth(), held);

        // Then RETURN descends back onto the advancing slope
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Return);
        let mut rejoined = false;
        for _ in 0..40 {
            controller.update(Some(8.0)).await;
            if controller.state() == ControllerState::Normal {
                rejoined = true;
                break;
            }
        }
        assert!(rejoined);
    }

    #[tokio::test]
    async fn upward_return_holds_until_slope_catches_up() {
        let sink = Arc::new(RecordingSink::default());
        // 20 m → 10 m: upward trajectory, negative step
        let mut controller =
            DepthController::new(20.0, 10.0, -0.2, 0.5, false, -0.2, settings(), sink.clone());

        for _ in 0..4 {
            controller.update(Some(8.0)).await;
            assert_eq!(controller.state(), ControllerState::Normal);
        }

        controller.update(Some(2.0)).await;
        assert_eq!(controller.state(), ControllerState::Ascend);

        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Wait);
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Return);

        let held = controller.command_depth();
        let mut rejoined = false;
        for _ in 0..60 {
            controller.update(Some(8.0)).await;
            if controller.state() == ControllerState::Normal {
                rejoined = true;
                break;
            }
            // Command depth is held while the slope keeps shoaling
            assert_eq!(controller.command_depth(), held);
        }
        assert!(rejoined, "upward RETURN never rejoined");
        assert!(controller.current_z() <= held);
    }

    #[tokio::test]
    async fn missing_altitude_forces_normal() {
        let sink = Arc::new(RecordingSink::default());
        let mut controller = descent_controller(sink.clone());

        controller.update(Some(2.0)).await;
        assert_eq!(controller.state(), ControllerState::Ascend);

        controller.update(None).await;
        assert_eq!(controller.state(), ControllerState::Normal);
    }

    #[tokio::test]
    async fn wait_time_is_respected_before_return() {
        let sink = Arc::new(RecordingSink::default());
        let mut s = settings();
        s.wait_time = 3600.0;
        let mut controller = DepthController::new(10.0, 20.0, 0.2, 0.5, true, 0.2, s, sink.clone());

        controller.update(Some(4.0)).await;
        assert_eq!(controller.state(), ControllerState::Hold);
        controller.update(Some(8.0)).await;
        assert_eq!(controller.state(), ControllerState::Wait);

        // With a long wait_time the controller stabilizes in WAIT
        for _ in 0..5 {
            controller.update(Some(8.0)).await;
            assert_eq!(controller.state(), ControllerState::Wait);
        }
    }

    #[tokio::test]
    async fn step_transition_applies_error_compensation() {
        let sink = Arc::new(RecordingSink::default());
        let mut s = settings();
        s.transition_time = 5;
        // previous_step 0.0 → target 0.2: smoothing loses 0.5 m over 5 ticks,
        // spread over the remaining ceil(9 / 0.2) = 45 steps
        let mut controller = DepthController::new(10.0, 20.0, 0.2, 0.5, true, 0.0, s, sink.clone());

        let expected_sequence = [0.0, 0.05, 0.1, 0.15, 0.2];
        for &expected in &expected_sequence {
            controller.update(Some(8.0)).await;
            assert!((controller.current_step() - expected).abs() < 1e-12);
            assert!(!controller.error_compensation_active());
        }

        controller.update(Some(8.0)).await;
        assert!(controller.error_compensation_active());
        let expected_step = 0.2 + 0.5 / 45.0;
        assert!((controller.current_step() - expected_step).abs() < 1e-9);
        // The compensated value becomes the new target
        assert!((controller.target_step() - expected_step).abs() < 1e-9);

        // The compensated step persists for the rest of the leg
        controller.update(Some(8.0)).await;
        assert!((controller.current_step() - expected_step).abs() < 1e-9);
    }

    #[tokio::test]
    async fn equal_steps_skip_transition_entirely() {
        let sink = Arc::new(RecordingSink::default());
        let mut controller = descent_controller(sink.clone());
        for _ in 0..10 {
            controller.update(Some(8.0)).await;
            assert_eq!(controller.current_step(), 0.2);
            assert!(!controller.error_compensation_active());
        }
    }

    #[tokio::test]
    async fn step_sign_matches_trajectory_direction() {
        let sink = Arc::new(RecordingSink::default());

        let mut down = descent_controller(sink.clone());
        for _ in 0..20 {
            down.update(Some(8.0)).await;
            assert!(down.current_step() >= 0.0);
        }

        let mut up =
            DepthController::new(20.0, 10.0, -0.2, 0.5, false, -0.2, settings(), sink.clone());
        for _ in 0..20 {
            up.update(Some(8.0)).await;
            assert!(up.current_step() <= 0.0);
        }
    }

    #[tokio::test]
    async fn step_continuity_across_controllers() {
        let sink = Arc::new(RecordingSink::default());
        let mut s = settings();
        s.transition_time = 5;
        let mut first = DepthController::new(10.0, 20.0, 0.2, 0.5, true, 0.0, s.clone(), sink.clone());
        for _ in 0..8 {
            first.update(Some(8.0)).await;
        }
        let handed_over = first.current_step();
        assert!(first.error_compensation_active());

        // The next leg starts from the compensated step with no discontinuity
        let second =
            DepthController::new(20.0, 30.0, 0.25, 0.5, true, handed_over, s, sink.clone());
        assert_eq!(second.current_step(), handed_over);
    }
}
