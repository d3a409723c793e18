//! Altitude source selection: real sensor altitude in operation, a
//! file-driven simulated seafloor in test mode.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::navigation::NavigationFrame;

const DEPTH_FILE: &str = "test_bottom_depth.txt";
const DEFAULT_BOTTOM_DEPTH_M: f64 = 20.0;

#[derive(Debug, Error)]
pub enum AltitudeError {
    #[error("navigation data unavailable - cannot calculate simulated altitude")]
    NavigationUnavailable,
    #[error("depth unavailable - cannot calculate simulated altitude")]
    DepthUnavailable,
}

/// Where each control tick gets its altitude from. Selected once at startup.
pub trait AltitudeSource: Send + Sync {
    fn altitude(&self, nav: Option<&NavigationFrame>) -> Result<Option<f64>, AltitudeError>;
}

/// Production source: altitude as reported by the navigation frame, absent
/// when the sensor says so.
pub struct RealAltitudeSource;

impl AltitudeSource for RealAltitudeSource {
    fn altitude(&self, nav: Option<&NavigationFrame>) -> Result<Option<f64>, AltitudeError> {
        Ok(nav.and_then(|frame| frame.altitude))
    }
}

/// Test-mode source: altitude derived from an operator-editable bottom depth
/// file, `bottom_depth − nav.depth`. Unlike the real source, missing
/// navigation here is a fatal error: the harness cannot run blind.
pub struct SimulatedAltitudeSource {
    depth_file: PathBuf,
}

impl SimulatedAltitudeSource {
    pub fn new() -> Self {
        Self {
            depth_file: PathBuf::from(DEPTH_FILE),
        }
    }

    /// Seed the bottom depth file so test runs start from a known seafloor.
    pub fn seed(&self, initial_bottom_depth: f64) {
        if let Err(e) = std::fs::write(&self.depth_file, initial_bottom_depth.to_string()) {
            warn!("TEST MODE: could not write depth file: {e}");
        } else {
            info!("TEST MODE: initial bottom depth set to {initial_bottom_depth:.2}m");
            info!(
                "TEST MODE: edit {} to move the simulated seafloor",
                self.depth_file.display()
            );
        }
    }

    fn bottom_depth(&self) -> f64 {
        match std::fs::read_to_string(&self.depth_file) {
            Ok(text) => text.trim().parse().unwrap_or(DEFAULT_BOTTOM_DEPTH_M),
            Err(_) => DEFAULT_BOTTOM_DEPTH_M,
        }
    }
}

impl Default for SimulatedAltitudeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AltitudeSource for SimulatedAltitudeSource {
    fn altitude(&self, nav: Option<&NavigationFrame>) -> Result<Option<f64>, AltitudeError> {
        let Some(nav) = nav else {
            warn!("TEST MODE: navigation data is None - cannot calculate simulated altitude");
            return Err(AltitudeError::NavigationUnavailable);
        };
        let Some(depth) = nav.depth else {
            warn!("TEST MODE: depth is None - cannot calculate simulated altitude");
            return Err(AltitudeError::DepthUnavailable);
        };

        let bottom_depth = self.bottom_depth();
        let simulated = bottom_depth - depth;
        info!(
            "TEST MODE: simulated altitude={simulated:.2}m (bottom={bottom_depth:.2}m, \
             depth={depth:.2}m)"
        );
        Ok(Some(simulated))
    }
}
