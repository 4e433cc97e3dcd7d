// Defaults, topics, and the tracker configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ephemeris::Target;
use crate::stage::{
    DEFAULT_SETTLE_TOLERANCE_DEG, HOME_TIMEOUT, MOVE_TIMEOUT, QUERY_TIMEOUT, ScaleFactors,
    StageSettings, TravelRange,
};

// Files
pub const DEFAULT_CONFIG_PATH: &str = "tracker.json";
pub const DEFAULT_OFFSETS_PATH: &str = "tracking_offsets.json";

// Zenoh topics
pub const TOPIC_CMD_TRACKER: &str = "tracker/cmd"; // offsets, stop
pub const TOPIC_STATE_AXES: &str = "tracker/state/axes"; // pointing state
pub const TOPIC_HEALTH: &str = "tracker/state/health"; // health status

// How far one key press moves an offset
pub const OFFSET_INCREMENT_DEG: f64 = 0.05;

// Longest any single stage operation may be allowed to wait
pub const MAX_TIMEOUT_S: f64 = 3600.0;

// Controllers on the telescope mount
pub const AZIMUTH_SERIAL: &str = "27005375";
pub const ELEVATION_SERIAL: &str = "27005349";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One stage of the mount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub serial_number: String,
    pub channel: u8,
    pub scale: ScaleFactors,
    pub travel: TravelRange,
    pub settle_tolerance_deg: f64,
    pub home_timeout_s: f64,
    pub move_timeout_s: f64,
    pub query_timeout_s: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            serial_number: String::new(),
            channel: 1,
            scale: ScaleFactors::default(),
            travel: TravelRange::default(),
            settle_tolerance_deg: DEFAULT_SETTLE_TOLERANCE_DEG,
            home_timeout_s: HOME_TIMEOUT.as_secs_f64(),
            move_timeout_s: MOVE_TIMEOUT.as_secs_f64(),
            query_timeout_s: QUERY_TIMEOUT.as_secs_f64(),
        }
    }
}

impl AxisConfig {
    fn with_serial(serial: &str) -> Self {
        Self {
            serial_number: serial.to_string(),
            ..Self::default()
        }
    }

    pub fn stage_settings(&self) -> StageSettings {
        StageSettings {
            channel: self.channel,
            scale: self.scale,
            travel: self.travel,
            settle_tolerance_deg: self.settle_tolerance_deg,
            home_timeout: Duration::from_secs_f64(self.home_timeout_s),
            move_timeout: Duration::from_secs_f64(self.move_timeout_s),
            query_timeout: Duration::from_secs_f64(self.query_timeout_s),
            ..StageSettings::default()
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(format!("{} axis: {}", name, what)));

        if self.serial_number.trim().is_empty() {
            return invalid("serial_number is empty");
        }
        if !self.travel.is_valid() {
            return invalid("travel range is empty or not finite");
        }
        if !(self.scale.position.is_finite() && self.scale.position > 0.0) {
            return invalid("position scale must be positive");
        }
        if !(self.settle_tolerance_deg.is_finite() && self.settle_tolerance_deg >= 0.0) {
            return invalid("settle_tolerance_deg must be non-negative");
        }
        let timeouts = [self.home_timeout_s, self.move_timeout_s, self.query_timeout_s];
        if timeouts.iter().any(|t| !(*t > 0.0 && *t <= MAX_TIMEOUT_S)) {
            return invalid("timeouts must be positive and at most an hour");
        }
        Ok(())
    }
}

/// Everything the tracker reads at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub target: Target,
    /// Degrees, east positive
    pub longitude: f64,
    /// Degrees, north positive
    pub latitude: f64,
    /// Informational; positions are computed in UTC
    pub time_zone: String,
    pub azimuth: AxisConfig,
    pub elevation: AxisConfig,
    pub offsets_path: PathBuf,
    /// Drive in-memory controllers instead of serial ports
    pub simulate: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            target: Target::Sun,
            longitude: -74.7527,
            latitude: 41.0582,
            time_zone: "US/Eastern".to_string(),
            azimuth: AxisConfig::with_serial(AZIMUTH_SERIAL),
            elevation: AxisConfig::with_serial(ELEVATION_SERIAL),
            offsets_path: PathBuf::from(DEFAULT_OFFSETS_PATH),
            simulate: false,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ConfigError::Invalid(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ConfigError::Invalid(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        self.azimuth.validate("azimuth")?;
        self.elevation.validate("elevation")?;
        if self.azimuth.serial_number == self.elevation.serial_number {
            return Err(ConfigError::Invalid(
                "azimuth and elevation share a controller serial number".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for whichever configured axis has `serial`, or defaults
    pub fn settings_for_serial(&self, serial: &str) -> StageSettings {
        [&self.azimuth, &self.elevation]
            .into_iter()
            .find(|axis| axis.serial_number == serial)
            .map(AxisConfig::stage_settings)
            .unwrap_or_default()
    }
}
