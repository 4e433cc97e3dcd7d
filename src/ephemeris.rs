// Where the tracked object is on the sky
//
// Solar positions come from the `sun` crate, lunar ones from `astro` (Meeus).
// Both report azimuth from south in radians; Horizontal is degrees clockwise
// from north.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the mount points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Sun,
    Moon,
    /// A fixed horizontal position, useful for alignment and bench tests
    Fixed { azimuth_deg: f64, elevation_deg: f64 },
}

/// Horizontal coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Horizontal {
    /// Clockwise from north, [0, 360)
    pub azimuth_deg: f64,
    /// Above the horizon
    pub elevation_deg: f64,
}

pub trait Ephemeris: Send {
    fn locate(&self, at: DateTime<Utc>) -> Horizontal;
}

/// South-referenced radians -> degrees clockwise from north in [0, 360)
fn north_azimuth_deg(azimuth_from_south: f64) -> f64 {
    (azimuth_from_south.to_degrees() + 180.0).rem_euclid(360.0)
}

pub struct SunEphemeris {
    latitude: f64,
    longitude: f64,
}

impl SunEphemeris {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl Ephemeris for SunEphemeris {
    fn locate(&self, at: DateTime<Utc>) -> Horizontal {
        let pos = sun::pos(at.timestamp_millis(), self.latitude, self.longitude);
        Horizontal {
            azimuth_deg: north_azimuth_deg(pos.azimuth),
            elevation_deg: pos.altitude.to_degrees(),
        }
    }
}

pub struct MoonEphemeris {
    latitude: f64,
    longitude: f64,
}

impl MoonEphemeris {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Julian day for a UTC instant
fn julian_day(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 86_400_000.0 + 2_440_587.5
}

/// Greenwich mean sidereal time, radians
fn greenwich_sidereal(jd: f64) -> f64 {
    (280.460_618_37 + 360.985_647_366_29 * (jd - 2_451_545.0)).to_radians()
}

impl Ephemeris for MoonEphemeris {
    fn locate(&self, at: DateTime<Utc>) -> Horizontal {
        let jd = julian_day(at);
        let (ecliptic, _distance_km) = astro::lunar::geocent_ecl_pos(jd);
        let obliquity = astro::ecliptic::mn_oblq_IAU(jd);
        let ra = astro::coords::asc_frm_ecl(ecliptic.long, ecliptic.lat, obliquity);
        let dec = astro::coords::dec_frm_ecl(ecliptic.long, ecliptic.lat, obliquity);

        let hour_angle = greenwich_sidereal(jd) + self.longitude.to_radians() - ra;
        let phi = self.latitude.to_radians();

        Horizontal {
            azimuth_deg: north_azimuth_deg(astro::coords::az_frm_eq(hour_angle, dec, phi)),
            elevation_deg: astro::coords::alt_frm_eq(hour_angle, dec, phi).to_degrees(),
        }
    }
}

pub struct FixedTarget(pub Horizontal);

impl Ephemeris for FixedTarget {
    fn locate(&self, _at: DateTime<Utc>) -> Horizontal {
        self.0
    }
}

/// Build the ephemeris for a configured target
pub fn for_target(target: &Target, latitude: f64, longitude: f64) -> Box<dyn Ephemeris> {
    match *target {
        Target::Sun => Box::new(SunEphemeris::new(latitude, longitude)),
        Target::Moon => Box::new(MoonEphemeris::new(latitude, longitude)),
        Target::Fixed {
            azimuth_deg,
            elevation_deg,
        } => Box::new(FixedTarget(Horizontal {
            azimuth_deg,
            elevation_deg,
        })),
    }
}
