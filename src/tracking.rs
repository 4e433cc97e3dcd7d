// Sky position + operator offsets -> stage angles

use crate::ephemeris::Horizontal;
use crate::offsets::TrackingOffsets;

/// Stage angles for one tracking update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisTargets {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
}

/// Fold any finite angle into [0, 180].
///
/// The angle is first reduced to [0, 360), then anything past 180 is
/// reflected, which keeps the stages on the short side of their travel.
pub fn fold_angle(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped > 180.0 {
        360.0 - wrapped
    } else {
        wrapped
    }
}

/// Stage targets for a sky position, or `None` while the offset target is below the horizon
pub fn pointing(sky: Horizontal, offsets: &TrackingOffsets) -> Option<AxisTargets> {
    let elevation = sky.elevation_deg + offsets.elevation_offset;
    if elevation < 0.0 {
        return None;
    }
    let azimuth = sky.azimuth_deg + offsets.azimuth_offset;

    Some(AxisTargets {
        azimuth_deg: fold_angle(azimuth),
        elevation_deg: fold_angle(elevation),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sky(azimuth_deg: f64, elevation_deg: f64) -> Horizontal {
        Horizontal {
            azimuth_deg,
            elevation_deg,
        }
    }

    #[test]
    fn test_fold_identity_in_range() {
        for deg in [0.0, 0.5, 45.0, 90.0, 179.9, 180.0] {
            assert_eq!(fold_angle(deg), deg);
            assert_eq!(fold_angle(fold_angle(deg)), deg);
        }
    }

    #[test]
    fn test_fold_reflects_past_180() {
        assert_eq!(fold_angle(200.0), 160.0);
        assert_eq!(fold_angle(359.0), 1.0);
    }

    #[test]
    fn test_fold_wraps_negative() {
        assert_eq!(fold_angle(-10.0), 10.0);
        assert_eq!(fold_angle(-170.0), 170.0);
    }

    #[test]
    fn test_fold_reduces_full_turns() {
        assert!((fold_angle(360.3) - 0.3).abs() < 1e-9);
        assert!((fold_angle(725.0) - 5.0).abs() < 1e-9);
        assert!((fold_angle(-400.0) - 40.0).abs() < 1e-9);
        assert_eq!(fold_angle(360.0), 0.0);
        assert_eq!(fold_angle(-360.0), 0.0);
    }

    #[test]
    fn test_azimuth_past_north_stays_in_travel() {
        let offsets = TrackingOffsets {
            azimuth_offset: 0.5,
            ..TrackingOffsets::default()
        };
        let targets = pointing(sky(359.8, 40.0), &offsets).unwrap();
        assert!((targets.azimuth_deg - 0.3).abs() < 1e-9);
        assert!(crate::stage::TravelRange::default().contains(targets.azimuth_deg));
    }

    #[test]
    fn test_offsets_applied_before_fold() {
        let offsets = TrackingOffsets {
            azimuth_offset: 5.0,
            elevation_offset: -0.5,
            ..TrackingOffsets::default()
        };
        let targets = pointing(sky(178.0, 30.0), &offsets).unwrap();
        assert_eq!(targets.azimuth_deg, 177.0);
        assert_eq!(targets.elevation_deg, 29.5);
    }

    #[test]
    fn test_below_horizon_skipped() {
        let offsets = TrackingOffsets::default();
        assert_eq!(pointing(sky(90.0, -0.1), &offsets), None);

        let raised = TrackingOffsets {
            elevation_offset: 0.2,
            ..TrackingOffsets::default()
        };
        assert!(pointing(sky(90.0, -0.1), &raised).is_some());
    }
}
