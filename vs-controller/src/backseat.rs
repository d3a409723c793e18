//! # backseat
//!
//! Client for the autopilot ("backseat") mission server. Two concerns:
//!
//!   - mission/phase status: `GET /missions/current`, behind a short
//!     positive-TTL cache so the phase manager can poll without hammering
//!     the server; on failure the last known value is served
//!   - depth setpoints: `POST /missions/current/overload/parameters`, with
//!     an envelope clamp that falls back to the last accepted depth when a
//!     command strays outside `[min_depth, max_depth]`
//!
//! The client is cheap to clone; all clones share the cache and the
//! envelope memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::VsConfig;
use crate::controller::SetpointSink;

/// How long a fetched mission status stays fresh.
const PHASE_INFO_TTL: Duration = Duration::from_millis(500);

/// Mission status as reported by `GET /missions/current`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    #[serde(default)]
    pub current_phase_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Default)]
struct PhaseInfoCache {
    mission: Option<Mission>,
    fetched_at: Option<Instant>,
}

#[derive(Clone)]
pub struct BackseatClient {
    http: reqwest::Client,
    base_url: String,
    overload_command_duration: f64,
    min_depth: f64,
    max_depth: f64,
    cache: Arc<Mutex<PhaseInfoCache>>,
    last_valid_depth: Arc<Mutex<Option<f64>>>,
}

impl BackseatClient {
    pub fn new(cfg: &VsConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(cfg.backseat_connection_timeout))
            .timeout(Duration::from_secs_f64(cfg.backseat_response_timeout))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.backseat_base_url(),
            overload_command_duration: cfg.overload_command_duration,
            min_depth: cfg.min_depth,
            max_depth: cfg.max_depth,
            cache: Arc::new(Mutex::new(PhaseInfoCache::default())),
            last_valid_depth: Arc::new(Mutex::new(None)),
        })
    }

    /// Current mission status, served from cache while fresh. On fetch
    /// failure the last cached value (possibly `None`) is returned.
    pub async fn get_current_phase_info(&self, force_refresh: bool) -> Option<Mission> {
        let mut cache = self.cache.lock().await;

        if !force_refresh {
            if let (Some(mission), Some(fetched_at)) = (&cache.mission, cache.fetched_at) {
                if fetched_at.elapsed() < PHASE_INFO_TTL {
                    return Some(mission.clone());
                }
            }
        }

        let url = format!("{}/missions/current", self.base_url);
        let fetched = async {
            self.http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<Mission>()
                .await
        }
        .await;

        match fetched {
            Ok(mission) => {
                cache.mission = Some(mission.clone());
                cache.fetched_at = Some(Instant::now());
                Some(mission)
            }
            Err(e) => {
                warn!("Error fetching current phase info: {e}");
                cache.mission.clone()
            }
        }
    }

    pub async fn current_phase_id(&self) -> Option<i64> {
        self.get_current_phase_info(false).await?.current_phase_id
    }

    pub async fn current_mission_name(&self) -> Option<String> {
        self.get_current_phase_info(false).await?.name
    }

    pub async fn is_phase_enabled(&self) -> bool {
        match self.get_current_phase_info(false).await {
            Some(mission) => mission.state.as_deref() == Some("Enabled"),
            None => {
                warn!("Could not get phase info from Backseat API");
                false
            }
        }
    }

    /// Command the autopilot to the given depth. The command carries its own
    /// timeout so a stalled controller reverts to nominal mission control.
    pub async fn send_z_command(&self, z: f64) -> bool {
        let z = {
            let mut last_valid = self.last_valid_depth.lock().await;
            match resolve_setpoint(&mut last_valid, z, self.min_depth, self.max_depth) {
                Some(z) => z,
                None => return false,
            }
        };

        let url = format!("{}/missions/current/overload/parameters", self.base_url);
        let result = self
            .http
            .post(&url)
            .query(&[
                ("timeout", self.overload_command_duration.to_string()),
                ("zCmd", "Depth".to_string()),
                ("zSetpoint", z.to_string()),
            ])
            .send()
            .await;

        match result {
            Ok(response) => {
                let success = response.status() == StatusCode::OK;
                debug!(
                    "Z={z:.1}m -> Status: {} {}",
                    response.status().as_u16(),
                    if success { "OK" } else { "ERROR" }
                );
                success
            }
            Err(e) => {
                warn!("Z={z:.1}m -> Error: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl SetpointSink for BackseatClient {
    async fn send_depth(&self, z: f64) -> bool {
        self.send_z_command(z).await
    }
}

/// Envelope clamp with memory. In-envelope depths pass through and become
/// the new fallback; out-of-envelope depths are replaced by the last
/// accepted one, or rejected outright when none exists yet.
fn resolve_setpoint(
    last_valid: &mut Option<f64>,
    z: f64,
    min_depth: f64,
    max_depth: f64,
) -> Option<f64> {
    if z < min_depth || z > max_depth {
        match *last_valid {
            Some(previous) => {
                warn!(
                    "Depth {z:.1}m out of limits [{min_depth}-{max_depth}] - using last valid: \
                     {previous:.1}m"
                );
                Some(previous)
            }
            None => {
                warn!(
                    "Depth {z:.1}m out of limits [{min_depth}-{max_depth}] - command rejected \
                     (no previous valid depth)"
                );
                None
            }
        }
    } else {
        *last_valid = Some(z);
        Some(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_envelope_rejected_without_memory() {
        let mut last_valid = None;
        assert_eq!(resolve_setpoint(&mut last_valid, 120.0, 0.0, 100.0), None);
        assert_eq!(last_valid, None);
    }

    #[test]
    fn out_of_envelope_substitutes_last_valid() {
        let mut last_valid = None;
        assert_eq!(resolve_setpoint(&mut last_valid, 50.0, 0.0, 100.0), Some(50.0));
        assert_eq!(resolve_setpoint(&mut last_valid, 120.0, 0.0, 100.0), Some(50.0));
        // The substitute must not overwrite the memory
        assert_eq!(last_valid, Some(50.0));
        assert_eq!(resolve_setpoint(&mut last_valid, -3.0, 0.0, 100.0), Some(50.0));
    }

    #[test]
    fn in_envelope_updates_memory() {
        let mut last_valid = Some(50.0);
        assert_eq!(resolve_setpoint(&mut last_valid, 75.0, 0.0, 100.0), Some(75.0));
        assert_eq!(last_valid, Some(75.0));
    }

    #[test]
    fn envelope_bounds_are_inclusive() {
        let mut last_valid = None;
        assert_eq!(resolve_setpoint(&mut last_valid, 0.0, 0.0, 100.0), Some(0.0));
        assert_eq!(resolve_setpoint(&mut last_valid, 100.0, 0.0, 100.0), Some(100.0));
    }

    #[test]
    fn mission_json_deserializes_with_partial_fields() {
        let mission: Mission =
            serde_json::from_str(r#"{"currentPhaseId": 3, "name": "survey", "state": "Enabled"}"#)
                .unwrap();
        assert_eq!(mission.current_phase_id, Some(3));
        assert_eq!(mission.name.as_deref(), Some("survey"));
        assert_eq!(mission.state.as_deref(), Some("Enabled"));

        let sparse: Mission = serde_json::from_str(r#"{"name": "survey"}"#).unwrap();
        assert_eq!(sparse.current_phase_id, None);
        assert_eq!(sparse.state, None);
    }
}
