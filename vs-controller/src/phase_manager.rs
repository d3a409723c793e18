//! # phase_manager
//!
//! Mission / phase / subphase lifecycle. A single slow-cadence task calls
//! [`PhaseManager::update`]; each call reconciles the locally known state
//! with the Backseat mission server and the latest navigation snapshot, and
//! may hand back a `(subphase_id, plan)` pair for the caller to start a
//! virtual-slope task on.
//!
//! The manager owns the running slope task's handle and the `last_step`
//! continuity cell that carries the (possibly error-compensated) step of a
//! cancelled controller into the next one's smoothing.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backseat::BackseatClient;
use crate::config::VsConfig;
use crate::line_start::{check_line_start, check_point, LineStartTolerances};
use crate::mission::{subphase_sort_key, MissionPlan, PhasePlan, PlanStore, SubphasePlan};
use crate::navigation::{NavigationFrame, NavigationStore};

/// Seconds between repeated "no navigation data" warnings.
const NAV_WARNING_PERIOD_S: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingState {
    None,
    /// Armed: waiting for the vehicle to satisfy the line-start condition of
    /// the phase's first subphase
    LineStart,
    /// Waiting for the vehicle to reach the next subphase's start waypoint
    Subphase,
}

/// Subphase ids of a phase in (major, minor) order.
pub fn ordered_subphase_ids(phase: &PhasePlan) -> Vec<String> {
    let mut ids: Vec<String> = phase.keys().cloned().collect();
    ids.sort_by_key(|id| subphase_sort_key(id));
    ids
}

pub struct PhaseManager {
    backseat: BackseatClient,
    plans: Arc<PlanStore>,
    nav: NavigationStore,
    cfg: Arc<VsConfig>,

    // Mission state
    current_mission_name: Option<String>,
    phases_data: MissionPlan,

    // Phase state
    last_phase_id: Option<i64>,
    current_phase_id: Option<i64>,

    // Subphase state
    current_subphase_id: Option<String>,
    subphase_list: Vec<String>,
    current_subphase_index: Option<usize>,

    waiting_state: WaitingState,

    // Running slope task and step continuity
    vs_task: Option<JoinHandle<()>>,
    last_step: Arc<Mutex<f64>>,

    last_nav_warning: Option<Instant>,
}

impl PhaseManager {
    pub fn new(
        backseat: BackseatClient,
        plans: Arc<PlanStore>,
        nav: NavigationStore,
        cfg: Arc<VsConfig>,
    ) -> Self {
        Self {
            backseat,
            plans,
            nav,
            cfg,
            current_mission_name: None,
            phases_data: MissionPlan::new(),
            last_phase_id: None,
            current_phase_id: None,
            current_subphase_id: None,
            subphase_list: Vec::new(),
            current_subphase_index: None,
            waiting_state: WaitingState::None,
            vs_task: None,
            last_step: Arc::new(Mutex::new(0.0)),
            last_nav_warning: None,
        }
    }

    /// One orchestration pass. Returns a subphase to start, if any.
    pub async fn update(&mut self) -> Option<(String, SubphasePlan)> {
        // 1. Mission change?
        self.check_mission_change().await;

        // 2. Current phase
        self.current_phase_id = self.backseat.current_phase_id().await;
        if self.current_phase_id.is_none() {
            self.handle_no_connection();
            return None;
        }

        // 3. Should the running slope stop?
        if let Some(reason) = self.should_stop_vs().await {
            self.stop_vs(&reason).await;
        }

        // 4. Did the current subphase reach its END waypoint?
        if self.vs_task.is_some() && self.current_subphase_id.is_some() {
            if let Some(next) = self.check_subphase_end_reached().await {
                self.stop_vs("subphase transition").await;
                return Some(next);
            }
        }

        // 5. Phase change
        if self.current_phase_id != self.last_phase_id {
            self.handle_phase_change().await;
        }

        // 6. Start conditions
        if self.waiting_state != WaitingState::None {
            return self.check_start_conditions().await;
        }

        None
    }

    /// Cancel the running slope task and wait until its cleanup (including
    /// the step handoff) has finished.
    pub async fn stop_vs(&mut self, reason: &str) {
        if let Some(task) = self.vs_task.take() {
            info!("Stopping virtual slope ({reason})");
            task.abort();
            let _ = task.await;
        }
    }

    pub fn set_vs_task(&mut self, task: JoinHandle<()>) {
        self.vs_task = Some(task);
    }

    /// Step of the previous subphase, for smooth transitions.
    pub fn last_step(&self) -> f64 {
        *self.last_step.lock().unwrap()
    }

    pub fn set_last_step(&mut self, step: f64) {
        *self.last_step.lock().unwrap() = step;
    }

    /// Shared cell the slope task writes its final step into.
    pub fn last_step_cell(&self) -> Arc<Mutex<f64>> {
        self.last_step.clone()
    }

    pub async fn cleanup(&mut self) {
        self.stop_vs("shutdown").await;
    }

    // ── Internal steps ────────────────────────────────────────────────────

    async fn check_mission_change(&mut self) {
        let new_mission = self.backseat.current_mission_name().await;
        if new_mission == self.current_mission_name {
            return;
        }

        info!(
            "Mission changed: {:?} → {:?}",
            self.current_mission_name, new_mission
        );

        self.stop_vs("mission change").await;

        self.current_mission_name = new_mission.clone();
        self.waiting_state = WaitingState::None;
        self.current_subphase_id = None;
        self.current_subphase_index = None;
        self.subphase_list.clear();
        self.set_last_step(0.0);

        match new_mission {
            Some(name) if !name.is_empty() => {
                self.phases_data = self.plans.load_all_phases(&name, false);
                if !self.phases_data.is_empty() {
                    let mut phase_ids: Vec<i64> = self.phases_data.keys().copied().collect();
                    phase_ids.sort_unstable();
                    info!("Virtual slope phases for mission '{name}': {phase_ids:?}");
                }
            }
            _ => {
                info!("No mission active - virtual slope operations suspended");
                self.phases_data = MissionPlan::new();
            }
        }
    }

    async fn should_stop_vs(&self) -> Option<String> {
        if self.vs_task.is_none() {
            return None;
        }
        if self.current_phase_id != self.last_phase_id {
            return Some("phase changed".to_string());
        }
        if !self.backseat.is_phase_enabled().await {
            return Some("phase disabled".to_string());
        }
        None
    }

    async fn check_subphase_end_reached(&mut self) -> Option<(String, SubphasePlan)> {
        let phase_id = self.current_phase_id?;
        let subphase_id = self.current_subphase_id.clone()?;
        let phase = self.phases_data.get(&phase_id)?.clone();
        let subphase = phase.get(&subphase_id)?;

        let nav = self.navigation_with_logging().await?;
        if !check_point(
            subphase.end_lat,
            subphase.end_lon,
            &nav,
            &format!("{subphase_id}_END"),
            self.cfg.subphase_coordinates_tolerance_meters,
        ) {
            return None;
        }

        info!("Subphase {subphase_id} reached END coordinates");

        let next_index = self.current_subphase_index.map_or(0, |i| i + 1);
        self.current_subphase_index = Some(next_index);

        if next_index < self.subphase_list.len() {
            let next_id = self.subphase_list[next_index].clone();
            info!("Transitioning to next subphase: {next_id}");
            if let Some(plan) = phase.get(&next_id) {
                self.current_subphase_id = Some(next_id.clone());
                self.waiting_state = WaitingState::None;
                return Some((next_id, *plan));
            }
            error!("Next subphase {next_id} not found in phase plan");
        } else {
            // Deliberately keep the controller alive: it streams end_z as a
            // station-keeping command until the phase itself changes
            info!(
                "Last subphase {subphase_id} reached END - continuing with END_Z until phase \
                 changes"
            );
        }

        None
    }

    async fn handle_phase_change(&mut self) {
        info!(
            "Phase changed: {:?} → {:?}",
            self.last_phase_id, self.current_phase_id
        );

        self.current_subphase_id = None;
        self.current_subphase_index = None;
        self.subphase_list.clear();
        self.waiting_state = WaitingState::None;
        self.set_last_step(0.0);

        let Some(phase_id) = self.current_phase_id else {
            return;
        };

        let Some(phase) = self.phases_data.get(&phase_id) else {
            info!("Phase {phase_id} not found in parameter file - skipping");
            self.last_phase_id = self.current_phase_id;
            return;
        };

        if !self.backseat.is_phase_enabled().await {
            info!("Phase {phase_id} is DISABLED - skipping virtual slope");
            self.last_phase_id = self.current_phase_id;
            return;
        }

        let subphase_list = ordered_subphase_ids(phase);
        if subphase_list.is_empty() {
            error!("Phase {phase_id} has no subphases");
            self.last_phase_id = self.current_phase_id;
            return;
        }

        info!("Phase {phase_id} activated - subphases: {subphase_list:?}");
        info!(
            "Waiting for line start detection for first subphase {}",
            subphase_list[0]
        );

        self.subphase_list = subphase_list;
        self.waiting_state = WaitingState::LineStart;
        self.last_phase_id = self.current_phase_id;
    }

    async fn check_start_conditions(&mut self) -> Option<(String, SubphasePlan)> {
        let nav = self.navigation_with_logging().await?;

        let phase_id = self.current_phase_id?;
        let Some(phase) = self.phases_data.get(&phase_id).cloned() else {
            warn!("Current phase {phase_id} not in loaded plan during start check");
            self.waiting_state = WaitingState::None;
            return None;
        };

        match self.waiting_state {
            WaitingState::LineStart => {
                let first_id = self.subphase_list.first()?.clone();
                let Some(plan) = phase.get(&first_id) else {
                    error!("First subphase {first_id} not found in phase plan");
                    self.waiting_state = WaitingState::None;
                    return None;
                };

                if check_line_start(&first_id, plan, &nav, &self.line_start_tolerances()) {
                    info!("Line start detected for subphase {first_id}");
                    self.current_subphase_id = Some(first_id.clone());
                    self.current_subphase_index = Some(0);
                    self.waiting_state = WaitingState::None;
                    return Some((first_id, *plan));
                }
                None
            }
            WaitingState::Subphase => {
                let index = self.current_subphase_index?;
                if index >= self.subphase_list.len() {
                    warn!(
                        "Subphase index out of range: {index} >= {}",
                        self.subphase_list.len()
                    );
                    self.waiting_state = WaitingState::None;
                    return None;
                }

                let next_id = self.subphase_list[index].clone();
                let Some(plan) = phase.get(&next_id) else {
                    error!("Next subphase {next_id} not found in phase plan");
                    self.waiting_state = WaitingState::None;
                    return None;
                };

                if check_point(
                    plan.start_lat,
                    plan.start_lon,
                    &nav,
                    &next_id,
                    self.cfg.subphase_coordinates_tolerance_meters,
                ) {
                    info!("Subphase start coordinates reached for {next_id}");
                    self.current_subphase_id = Some(next_id.clone());
                    self.waiting_state = WaitingState::None;
                    return Some((next_id, *plan));
                }
                None
            }
            WaitingState::None => None,
        }
    }

    fn handle_no_connection(&mut self) {
        if self.last_phase_id.is_some() {
            warn!("Lost connection to Backseat API");
            self.last_phase_id = None;
        }
        self.waiting_state = WaitingState::None;
    }

    async fn navigation_with_logging(&mut self) -> Option<NavigationFrame> {
        let nav = self.nav.get().await;
        if nav.is_none() {
            let due = self
                .last_nav_warning
                .map_or(true, |t| t.elapsed().as_secs_f64() > NAV_WARNING_PERIOD_S);
            if due {
                warn!(
                    "No navigation data - operations paused (state: {:?})",
                    self.waiting_state
                );
                self.last_nav_warning = Some(Instant::now());
            }
        }
        nav
    }

    fn line_start_tolerances(&self) -> LineStartTolerances {
        LineStartTolerances {
            lat_lon_meters: self.cfg.line_start_tolerance_lat_lon_meters,
            depth_meters: self.cfg.line_start_tolerance_depth_meters,
            heading_degrees: self.cfg.line_start_tolerance_heading_degrees,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg() -> SubphasePlan {
        SubphasePlan {
            start_lat: 0.0,
            start_lon: 0.0,
            start_z: 0.0,
            end_lat: 0.0,
            end_lon: 0.0,
            end_z: 0.0,
            speed: 1.0,
        }
    }

    #[test]
    fn subphases_come_back_in_major_minor_order() {
        let mut phase = PhasePlan::new();
        for id in ["2-1", "1-10", "1-2", "1-1"] {
            phase.insert(id.to_string(), leg());
        }
        assert_eq!(ordered_subphase_ids(&phase), vec!["1-1", "1-2", "1-10", "2-1"]);
    }

    #[test]
    fn ill_formed_ids_sort_first_without_panicking() {
        let mut phase = PhasePlan::new();
        for id in ["1-1", "bogus", "0-5"] {
            phase.insert(id.to_string(), leg());
        }
        let ordered = ordered_subphase_ids(&phase);
        assert_eq!(ordered.last().unwrap(), "1-1");
        assert!(ordered.contains(&"bogus".to_string()));
    }
}
