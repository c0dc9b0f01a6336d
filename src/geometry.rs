// =============================================================================
// Sky geometry: sidereal time, equatorial <-> horizontal, separations
// =============================================================================
//
// All angles are degrees at the API boundary.  Azimuth runs from north
// through east.  Accuracy is at the arc-minute level, which is far inside the
// tolerances of primary-beam pointing and horizon checks.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Right ascension and declination in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPosition {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Rejects NaN and values outside the celestial sphere.
    pub fn is_valid(&self) -> bool {
        self.ra.is_finite()
            && self.dec.is_finite()
            && (0.0..=360.0).contains(&self.ra)
            && (-90.0..=90.0).contains(&self.dec)
    }
}

/// Altitude (elevation) and azimuth in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalCoord {
    pub alt: f64,
    pub az: f64,
}

/// Geodetic site of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverLocation {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub height_m: f64,
}

impl ObserverLocation {
    /// Murchison Widefield Array, Western Australia.
    pub fn mwa() -> Self {
        Self {
            lat_deg: sexagesimal_to_degrees(-26.0, 42.0, 11.95),
            lon_deg: sexagesimal_to_degrees(116.0, 40.0, 14.93),
            height_m: 377.8,
        }
    }

    /// Australia Telescope Compact Array, Narrabri.
    pub fn atca() -> Self {
        Self {
            lat_deg: sexagesimal_to_degrees(-30.0, 18.0, 46.385),
            lon_deg: sexagesimal_to_degrees(149.0, 33.0, 0.5),
            height_m: 236.87,
        }
    }
}

fn sexagesimal_to_degrees(deg: f64, min: f64, sec: f64) -> f64 {
    let magnitude = deg.abs() + min / 60.0 + sec / 3600.0;
    if deg < 0.0 {
        -magnitude
    } else {
        magnitude
    }
}

// -----------------------------------------------------------------------------
// Sidereal time
// -----------------------------------------------------------------------------

/// Greenwich mean sidereal time in degrees (IAU 1982, linear term).
pub fn gmst_degrees(at: DateTime<Utc>) -> f64 {
    let unix = at.timestamp() as f64 + at.timestamp_subsec_nanos() as f64 * 1e-9;
    let jd = unix / 86_400.0 + 2_440_587.5;
    let d = jd - 2_451_545.0;
    (280.460_618_37 + 360.985_647_366_29 * d).rem_euclid(360.0)
}

/// Local mean sidereal time in degrees.
pub fn lst_degrees(at: DateTime<Utc>, location: &ObserverLocation) -> f64 {
    (gmst_degrees(at) + location.lon_deg).rem_euclid(360.0)
}

// -----------------------------------------------------------------------------
// Frame transforms
// -----------------------------------------------------------------------------

pub fn equatorial_to_horizontal(
    pos: SkyPosition,
    location: &ObserverLocation,
    at: DateTime<Utc>,
) -> HorizontalCoord {
    let ha = (lst_degrees(at, location) - pos.ra).to_radians();
    let (alt, az) = rotate(pos.dec.to_radians(), ha, location.lat_deg.to_radians());
    HorizontalCoord { alt, az }
}

pub fn horizontal_to_equatorial(
    coord: HorizontalCoord,
    location: &ObserverLocation,
    at: DateTime<Utc>,
) -> SkyPosition {
    // The transform is its own inverse with (dec, ha) <-> (alt, az).
    let (dec, ha) = rotate(
        coord.alt.to_radians(),
        coord.az.to_radians(),
        location.lat_deg.to_radians(),
    );
    let ra = (lst_degrees(at, location) - ha).rem_euclid(360.0);
    SkyPosition { ra, dec }
}

/// Returns (elevation-like, azimuth-like) in degrees, azimuth in [0, 360).
fn rotate(lat_in: f64, lon_in: f64, site_lat: f64) -> (f64, f64) {
    let sin_out = lat_in.sin() * site_lat.sin() + lat_in.cos() * site_lat.cos() * lon_in.cos();
    let out_lat = sin_out.clamp(-1.0, 1.0).asin();
    let y = -lon_in.sin() * lat_in.cos();
    let x = site_lat.cos() * lat_in.sin() - site_lat.sin() * lat_in.cos() * lon_in.cos();
    let out_lon = y.atan2(x).to_degrees().rem_euclid(360.0);
    (out_lat.to_degrees(), out_lon)
}

/// Great-circle distance in degrees (haversine).
pub fn angular_separation(a: SkyPosition, b: SkyPosition) -> f64 {
    let (ra1, dec1) = (a.ra.to_radians(), a.dec.to_radians());
    let (ra2, dec2) = (b.ra.to_radians(), b.dec.to_radians());
    let h = ((dec2 - dec1) / 2.0).sin().powi(2)
        + dec1.cos() * dec2.cos() * ((ra2 - ra1) / 2.0).sin().powi(2);
    (2.0 * h.sqrt().clamp(0.0, 1.0).asin()).to_degrees()
}

// -----------------------------------------------------------------------------
// Formatting
// -----------------------------------------------------------------------------

/// Right ascension as `HH:MM:SS.ss`.
pub fn format_ra_hms(ra_deg: f64) -> String {
    let total = ra_deg.rem_euclid(360.0) / 15.0 * 3600.0;
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    format!("{:02}:{:02}:{:05.2}", hours as u32, minutes as u32, seconds)
}

/// Declination as `+DD:MM:SS.s`.
pub fn format_dec_dms(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let total = dec_deg.abs() * 3600.0;
    let degrees = (total / 3600.0).floor();
    let minutes = ((total - degrees * 3600.0) / 60.0).floor();
    let seconds = total - degrees * 3600.0 - minutes * 60.0;
    format!("{}{:02}:{:02}:{:04.1}", sign, degrees as u32, minutes as u32, seconds)
}
