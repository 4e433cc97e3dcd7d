// Message types exchanged with the tracker over zenoh

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::offsets::TrackingOffsets;

/// Which stage of the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Azimuth,
    Elevation,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Azimuth => write!(f, "azimuth"),
            Axis::Elevation => write!(f, "elevation"),
        }
    }
}

// Command from the offset editor / CLI -> tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TrackerCommand {
    /// Add `delta_deg` to an axis offset
    Nudge { axis: Axis, delta_deg: f64 },
    /// Replace an axis offset
    SetOffset { axis: Axis, offset_deg: f64 },
    /// Zero both offsets
    ResetOffsets,
    SetUpdateRate { seconds: f64 },
    StopTracking,
}

/// What one axis worker last reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisState {
    pub axis: Axis,
    pub target_deg: Option<f64>,
    pub position_deg: Option<f64>,
    pub busy: bool,
    pub fault: Option<String>,
}

impl AxisState {
    pub fn idle(axis: Axis) -> Self {
        Self {
            axis,
            target_deg: None,
            position_deg: None,
            busy: false,
            fault: None,
        }
    }
}

// Published by the tracker every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerState {
    pub timestamp: DateTime<Utc>,
    /// Where the target is on the sky, before offsets
    pub sky_azimuth_deg: f64,
    pub sky_elevation_deg: f64,
    pub offsets: TrackingOffsets,
    pub azimuth: AxisState,
    pub elevation: AxisState,
}

/// Health status published by the tracker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TrackerHealth {
    Ok,
    BelowHorizon,
    AxisFault,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd = TrackerCommand::Nudge {
            axis: Axis::Elevation,
            delta_deg: -0.05,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"op":"nudge","axis":"elevation","delta_deg":-0.05}"#);

        let stop: TrackerCommand = serde_json::from_str(r#"{"op":"stop_tracking"}"#).unwrap();
        assert_eq!(stop, TrackerCommand::StopTracking);
    }

    #[test]
    fn test_health_wire_format() {
        let json = serde_json::to_string(&TrackerHealth::BelowHorizon).unwrap();
        assert_eq!(json, r#""below_horizon""#);
    }
}
