// Operator pointing offsets and their on-disk store
//
// The tracking runtime is the only writer. Changes arrive as TrackerCommands
// and are persisted atomically (temp file + rename), so a reader never sees a
// half-written file.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::messages::{Axis, TrackerCommand};

/// Fastest the tracking loop may run
pub const MIN_UPDATE_RATE_S: f64 = 0.1;
/// Slowest the tracking loop may run
pub const MAX_UPDATE_RATE_S: f64 = 3600.0;

/// Offsets added to the computed sky position, plus the loop period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingOffsets {
    pub azimuth_offset: f64,
    pub elevation_offset: f64,
    /// Seconds between tracking updates
    pub update_rate: f64,
}

impl Default for TrackingOffsets {
    fn default() -> Self {
        Self {
            azimuth_offset: 0.0,
            elevation_offset: 0.0,
            update_rate: 1.0,
        }
    }
}

impl TrackingOffsets {
    pub fn offset(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Azimuth => self.azimuth_offset,
            Axis::Elevation => self.elevation_offset,
        }
    }

    fn offset_mut(&mut self, axis: Axis) -> &mut f64 {
        match axis {
            Axis::Azimuth => &mut self.azimuth_offset,
            Axis::Elevation => &mut self.elevation_offset,
        }
    }

    /// Loop period, always within [MIN_UPDATE_RATE_S, MAX_UPDATE_RATE_S]
    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(clamp_rate(self.update_rate))
    }

    /// Apply a command; returns whether anything changed.
    ///
    /// Non-finite values are ignored. `StopTracking` is not an offset change.
    pub fn apply(&mut self, cmd: &TrackerCommand) -> bool {
        let before = *self;
        match *cmd {
            TrackerCommand::Nudge { axis, delta_deg } if delta_deg.is_finite() => {
                *self.offset_mut(axis) += delta_deg;
            }
            TrackerCommand::SetOffset { axis, offset_deg } if offset_deg.is_finite() => {
                *self.offset_mut(axis) = offset_deg;
            }
            TrackerCommand::ResetOffsets => {
                self.azimuth_offset = 0.0;
                self.elevation_offset = 0.0;
            }
            TrackerCommand::SetUpdateRate { seconds } if seconds.is_finite() => {
                self.update_rate = clamp_rate(seconds);
            }
            _ => {}
        }
        *self != before
    }
}

fn clamp_rate(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return TrackingOffsets::default().update_rate;
    }
    seconds.clamp(MIN_UPDATE_RATE_S, MAX_UPDATE_RATE_S)
}

/// Single owner of the offsets file
#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    current: TrackingOffsets,
}

impl OffsetStore {
    /// Load offsets from `path`, creating the file with defaults if it doesn't exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            info!("No offsets at {}, starting from defaults", path.display());
            let store = Self {
                path,
                current: TrackingOffsets::default(),
            };
            store.save()?;
            return Ok(store);
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let current = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        debug!("Loaded offsets {:?} from {}", current, path.display());
        Ok(Self { path, current })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> TrackingOffsets {
        self.current
    }

    /// Apply a command and persist if it changed anything
    pub fn apply(&mut self, cmd: &TrackerCommand) -> Result<bool, ConfigError> {
        if !self.current.apply(cmd) {
            return Ok(false);
        }
        info!(
            "Offsets now az={:+.3}° el={:+.3}° every {:.2}s",
            self.current.azimuth_offset, self.current.elevation_offset, self.current.update_rate
        );
        self.save()?;
        Ok(true)
    }

    /// Write the current offsets atomically
    pub fn save(&self) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(&self.current).map_err(|source| {
            ConfigError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nudge_accumulates() {
        let mut offsets = TrackingOffsets::default();
        let nudge = TrackerCommand::Nudge {
            axis: Axis::Azimuth,
            delta_deg: 0.05,
        };
        assert!(offsets.apply(&nudge));
        assert!(offsets.apply(&nudge));
        assert!((offsets.azimuth_offset - 0.1).abs() < 1e-12);
        assert_eq!(offsets.elevation_offset, 0.0);
    }

    #[test]
    fn test_noop_commands_report_unchanged() {
        let mut offsets = TrackingOffsets::default();
        assert!(!offsets.apply(&TrackerCommand::ResetOffsets));
        assert!(!offsets.apply(&TrackerCommand::StopTracking));
        assert!(!offsets.apply(&TrackerCommand::Nudge {
            axis: Axis::Elevation,
            delta_deg: f64::NAN,
        }));
    }

    #[test]
    fn test_update_rate_floor() {
        let mut offsets = TrackingOffsets::default();
        offsets.apply(&TrackerCommand::SetUpdateRate { seconds: 0.0 });
        assert_eq!(offsets.update_rate, MIN_UPDATE_RATE_S);
        assert_eq!(offsets.update_period().as_millis(), 100);
    }

    #[test]
    fn test_huge_update_rate_is_capped() {
        let mut offsets = TrackingOffsets::default();
        assert!(offsets.apply(&TrackerCommand::SetUpdateRate { seconds: 1e300 }));
        assert_eq!(offsets.update_rate, MAX_UPDATE_RATE_S);
        assert_eq!(offsets.update_period(), Duration::from_secs(3600));

        // A hand-edited file can still carry anything
        let from_file: TrackingOffsets = serde_json::from_str(r#"{"updateRate": 1e300}"#).unwrap();
        assert_eq!(from_file.update_period(), Duration::from_secs(3600));
        let negative: TrackingOffsets = serde_json::from_str(r#"{"updateRate": -5}"#).unwrap();
        assert_eq!(negative.update_period().as_millis(), 100);
    }

    #[test]
    fn test_reads_legacy_keys() {
        let offsets: TrackingOffsets =
            serde_json::from_str(r#"{"azimuthOffset": 0.15, "elevationOffset": -0.05, "updateRate": 2, "killTracking": 0}"#)
                .unwrap();
        assert_eq!(offsets.azimuth_offset, 0.15);
        assert_eq!(offsets.elevation_offset, -0.05);
        assert_eq!(offsets.update_rate, 2.0);
    }

    #[test]
    fn test_store_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let store = OffsetStore::load(&path).unwrap();
        assert_eq!(store.current(), TrackingOffsets::default());
        assert!(path.exists());
    }

    #[test]
    fn test_store_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let mut store = OffsetStore::load(&path).unwrap();
        let changed = store
            .apply(&TrackerCommand::SetOffset {
                axis: Axis::Elevation,
                offset_deg: 1.25,
            })
            .unwrap();
        assert!(changed);
        assert!(!store.apply(&TrackerCommand::StopTracking).unwrap());

        let reloaded = OffsetStore::load(&path).unwrap();
        assert_eq!(reloaded.current().elevation_offset, 1.25);

        // Only the offsets file remains; the temp file was renamed into place
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            OffsetStore::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
