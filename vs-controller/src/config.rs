//! Service configuration, loaded once at startup from a single YAML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file '{path}' could not be read: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VsConfig {
    // Backseat API
    pub backseat_ip: String,
    pub backseat_port: u16,
    /// Connect timeout, seconds
    pub backseat_connection_timeout: f64,
    /// Response (read) timeout, seconds
    pub backseat_response_timeout: f64,
    /// `timeout` query parameter of the overload command, seconds. When the
    /// command stream stops, the autopilot reverts to nominal mission control
    /// after this long.
    pub overload_command_duration: f64,

    // Virtual slope
    /// Maximum dive/climb angle during safety maneuvers, degrees
    pub max_angle: f64,
    /// Control tick period, seconds
    pub command_period: f64,
    /// Step-transition smoothing length, ticks
    pub transition_time: usize,

    // Safety
    pub altitude_threshold_level: f64,
    pub altitude_threshold_ascend: f64,
    /// Stabilization period between leaving the danger zone and returning to
    /// the planned slope, seconds
    pub wait_time: f64,

    // Depth envelope
    pub min_depth: f64,
    pub max_depth: f64,

    // Monitoring
    pub monitoring_check_interval: f64,

    // DesBridge server
    pub desbridge_host: String,
    pub desbridge_port: u16,

    // Line start detection tolerances
    pub line_start_tolerance_lat_lon_meters: f64,
    pub line_start_tolerance_depth_meters: f64,
    pub line_start_tolerance_heading_degrees: f64,
    /// Tolerance for subphase START and END waypoints
    pub subphase_coordinates_tolerance_meters: f64,

    // Test mode
    pub test_mode: bool,
    pub test_initial_bottom_depth: f64,

    // Logging and paths
    pub log_directory: PathBuf,
    #[serde(default = "default_console_log_level")]
    pub console_log_level: String,
    #[serde(default = "default_file_log_level")]
    pub file_log_level: String,
    pub params_directory: PathBuf,
}

fn default_console_log_level() -> String {
    "INFO".to_string()
}

fn default_file_log_level() -> String {
    "DEBUG".to_string()
}

impl VsConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn backseat_base_url(&self) -> String {
        format!("http://{}:{}", self.backseat_ip, self.backseat_port)
    }
}
