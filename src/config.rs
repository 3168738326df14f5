//! TOML configuration.
//!
//! Section and key names mirror the instrument deployment sheets
//! (`[AutoPilot]`, `[Runner]`, `[DataLogger]`, one section per device).
//! Every key carries the documented fallback except the ones a deployment
//! cannot run without: device ports and the tower orientation limits.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SasError};
use crate::registry::SerialSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "AutoPilot")]
    pub auto_pilot: AutoPilotConfig,
    #[serde(rename = "Runner", default)]
    pub runner: RunnerConfig,
    #[serde(rename = "DataLogger", default)]
    pub data_logger: DataLoggerConfig,
    #[serde(rename = "GPS")]
    pub gps: DeviceConfig,
    #[serde(rename = "IndexingTable")]
    pub indexing_table: DeviceConfig,
    #[serde(rename = "HyperSAS")]
    pub hyper_sas: HyperSasConfig,
}

impl Config {
    /// Load and parse; a missing or malformed file is fatal at startup.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| {
            SasError::Config(format!("configuration file {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| SasError::Config(format!("unable to parse configuration: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoPilotConfig {
    /// Yaw offset of the two-antenna baseline from the bow.
    #[serde(default)]
    pub gps_orientation_on_ship: f64,
    /// Tower zero offset from the bow.
    #[serde(default)]
    pub indexing_table_orientation_on_ship: f64,
    /// Inclusive tower orientation limits; may be wrap-reversed.
    pub valid_indexing_table_orientation_limits: [f64; 2],
    #[serde(default = "default_target")]
    pub optimal_angle_away_from_sun: f64,
    #[serde(default = "default_target_limits")]
    pub valid_angle_away_from_sun_limits: [f64; 2],
    /// Hysteresis before switching between two valid orientations.
    #[serde(default = "default_min_dist_delta")]
    pub minimum_distance_delta: f64,
}

fn default_target() -> f64 {
    135.0
}

fn default_target_limits() -> [f64; 2] {
    [90.0, 135.0]
}

fn default_min_dist_delta() -> f64 {
    3.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingSource {
    /// Two-antenna RTK heading (RELPOSNED).
    GpsRelativePosition,
    /// Course over ground from PVT.
    GpsMotion,
    GpsVehicle,
    /// Tilt-sensor compass, declination corrected.
    ThsHeading,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub operation_mode: OperationMode,
    pub heading_source: HeadingSource,
    pub min_sun_elevation: f64,
    /// Loop period in seconds.
    pub refresh: u64,
    pub halt_host_on_exit: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::Auto,
            heading_source: HeadingSource::GpsRelativePosition,
            min_sun_elevation: 20.0,
            refresh: 5,
            halt_host_on_exit: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataLoggerConfig {
    /// Maximum file open time in minutes.
    pub file_length: u64,
    pub filename_prefix: String,
    pub filename_ext: String,
    pub path_to_data: PathBuf,
    pub reopen_delay: f64,
}

impl Default for DataLoggerConfig {
    fn default() -> Self {
        Self {
            file_length: 60,
            filename_prefix: "pySAS".into(),
            filename_ext: "raw".into(),
            path_to_data: PathBuf::from("data"),
            reopen_delay: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    pub baudrate: u32,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: f64,
    /// Blocking read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub xonxoff: bool,
    #[serde(default)]
    pub rtscts: bool,
    pub write_timeout: Option<f64>,
    #[serde(default)]
    pub dsrdtr: bool,
    pub relay_gpio_pin: Option<u8>,
    pub path_to_data: Option<PathBuf>,
    /// CSV log rotation in minutes.
    #[serde(default = "default_file_length")]
    pub file_length: u64,
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".into()
}

fn default_stopbits() -> f64 {
    1.0
}

fn default_timeout() -> f64 {
    10.0
}

fn default_file_length() -> u64 {
    60
}

impl DeviceConfig {
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baudrate,
            data_bits: self.bytesize,
            parity: self.parity.chars().next().unwrap_or('N'),
            stop_bits: self.stopbits,
            timeout: Duration::from_secs_f64(self.timeout),
            xonxoff: self.xonxoff,
            rtscts: self.rtscts,
        }
    }

    /// Per-device data directory, falling back to the shared one.
    pub fn data_path(&self, fallback: &Path) -> PathBuf {
        self.path_to_data
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HyperSasConfig {
    #[serde(flatten)]
    pub device: DeviceConfig,
    /// Calibration bundle (`.sip`, directory, or single `.cal`).
    pub sip: Option<PathBuf>,
    #[serde(default)]
    pub immersed: bool,
    pub path_to_device_files: Option<PathBuf>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const SAMPLE: &str = r#"
[AutoPilot]
gps_orientation_on_ship = 0.0
indexing_table_orientation_on_ship = 0.0
valid_indexing_table_orientation_limits = [-180.0, 180.0]
optimal_angle_away_from_sun = 135.0

[Runner]
operation_mode = "auto"
heading_source = "gps_relative_position"
min_sun_elevation = 20.0
refresh = 5

[DataLogger]
file_length = 60
filename_prefix = "pySAS001"

[GPS]
port = "/dev/ttySC0"
baudrate = 115200
timeout = 1.0
relay_gpio_pin = 24
file_length = 60

[IndexingTable]
port = "/dev/ttySC1"
baudrate = 9600
timeout = 0.5
relay_gpio_pin = 23

[HyperSAS]
port = "/dev/ttySC2"
baudrate = 115200
relay_gpio_pin = 25
immersed = false
"#;

    pub fn sample_config() -> Config {
        toml::from_str(SAMPLE).expect("sample config parses")
    }
}
