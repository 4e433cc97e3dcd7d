// Device units <-> degrees, and the travel range a stage may be commanded to.

use serde::{Deserialize, Serialize};

/// PRMTZ8 rotation mount on a KDC101: encoder counts per degree
pub const PRMTZ8_COUNTS_PER_DEG: f64 = 1919.6418578623391;
const PRMTZ8_VELOCITY_SCALE: f64 = 42941.66;
const PRMTZ8_ACCELERATION_SCALE: f64 = 14.66;

/// Conversion factors from real units to device units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    /// counts per degree
    pub position: f64,
    /// device units per deg/s
    pub velocity: f64,
    /// device units per deg/s²
    pub acceleration: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            position: PRMTZ8_COUNTS_PER_DEG,
            velocity: PRMTZ8_VELOCITY_SCALE,
            acceleration: PRMTZ8_ACCELERATION_SCALE,
        }
    }
}

impl ScaleFactors {
    /// Degrees to encoder counts, rounded to the nearest count
    pub fn to_counts(&self, degrees: f64) -> i32 {
        let counts = (degrees * self.position).round();
        counts.clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }

    pub fn to_degrees(&self, counts: i32) -> f64 {
        counts as f64 / self.position
    }

    pub fn velocity_to_deg_per_s(&self, raw: u16) -> f64 {
        raw as f64 / self.velocity
    }

    /// Smallest angle the stage can resolve
    pub fn resolution_deg(&self) -> f64 {
        1.0 / self.position
    }
}

/// Inclusive travel limits in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelRange {
    pub min_deg: f64,
    pub max_deg: f64,
}

impl TravelRange {
    pub fn new(min_deg: f64, max_deg: f64) -> Self {
        Self { min_deg, max_deg }
    }

    /// NaN and infinities are never in range
    pub fn contains(&self, degrees: f64) -> bool {
        degrees.is_finite() && degrees >= self.min_deg && degrees <= self.max_deg
    }

    pub fn is_valid(&self) -> bool {
        self.min_deg.is_finite() && self.max_deg.is_finite() && self.min_deg <= self.max_deg
    }
}

impl Default for TravelRange {
    /// Folded tracking angles always land in [0, 180]
    fn default() -> Self {
        Self::new(0.0, 180.0)
    }
}
