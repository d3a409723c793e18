//! Mission plan store: locates and parses the per-mission virtual-slope
//! parameter file and caches the result by mission name.
//!
//! A mission's parameters live in exactly one YAML file under the configured
//! directory, named `WBMS-VS_params_*_<mission_name>.yaml`, with a top-level
//! `VS_params` mapping phaseId → subphaseId → leg fields. Zero matches or an
//! ambiguous match yield an empty plan: no phases become activatable until
//! the mission changes again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

// ── Plan types ────────────────────────────────────────────────────────────────

/// One virtual-slope leg between two geodetic waypoints. Depths are meters,
/// positive down.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SubphasePlan {
    pub start_lat: f64,
    pub start_lon: f64,
    pub start_z: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    pub end_z: f64,
    pub speed: f64,
}

/// Subphases of one phase, keyed by `"<major>-<minor>"` id.
pub type PhasePlan = HashMap<String, SubphasePlan>;

/// All phases of one mission, keyed by phase id.
pub type MissionPlan = HashMap<i64, PhasePlan>;

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(rename = "VS_params")]
    vs_params: MissionPlan,
}

/// Sort key for subphase ids: strict (major, minor) integer pair. Ill-formed
/// ids sort first and are reported, not fatal.
pub fn subphase_sort_key(subphase_id: &str) -> (i64, i64) {
    let mut parts = subphase_id.split('-');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor),
        _ => {
            warn!("Invalid subphase ID format: {subphase_id}");
            (0, 0)
        }
    }
}

// ── Plan store ────────────────────────────────────────────────────────────────

pub struct PlanStore {
    params_directory: PathBuf,
    cache: Mutex<HashMap<String, MissionPlan>>,
}

impl PlanStore {
    pub fn new(params_directory: &Path) -> Self {
        Self {
            params_directory: params_directory.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load every phase for `mission_name`. Returns an empty plan on any
    /// failure; the caller treats that as "no slope legs for this mission".
    pub fn load_all_phases(&self, mission_name: &str, use_cache: bool) -> MissionPlan {
        if use_cache {
            if let Some(cached) = self.cache.lock().unwrap().get(mission_name) {
                debug!("Using cached phases for mission '{mission_name}'");
                return cached.clone();
            }
        }

        let Some(path) = self.find_mission_file(mission_name) else {
            return MissionPlan::new();
        };

        info!(
            "Loading virtual slope parameters for mission '{mission_name}' from {}",
            path.display()
        );

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                error!("Error reading parameters for mission '{mission_name}': {e}");
                return MissionPlan::new();
            }
        };

        let file: PlanFile = match serde_yaml::from_str(&text) {
            Ok(file) => file,
            Err(e) => {
                error!("Error parsing parameters for mission '{mission_name}': {e}");
                return MissionPlan::new();
            }
        };

        info!("Loaded {} phases for mission '{mission_name}'", file.vs_params.len());

        self.cache
            .lock()
            .unwrap()
            .insert(mission_name.to_string(), file.vs_params.clone());
        file.vs_params
    }

    /// Resolve the single parameter file for a mission, or report why not.
    fn find_mission_file(&self, mission_name: &str) -> Option<PathBuf> {
        let pattern = self
            .params_directory
            .join(format!("WBMS-VS_params_*_{mission_name}.yaml"));
        let pattern = pattern.to_string_lossy();

        let matches: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                error!("Bad parameter file pattern {pattern}: {e}");
                return None;
            }
        };

        match matches.as_slice() {
            [] => {
                warn!("No parameter file found for mission '{mission_name}' (pattern: {pattern})");
                None
            }
            [single] => Some(single.clone()),
            many => {
                error!(
                    "Multiple parameter files found for mission '{mission_name}': {:?}",
                    many
                );
                None
            }
        }
    }
}
