//! Sun position.
//!
//! Thin wrapper over the NREL SPA implementation in the `spa` crate.
//! Reference frame: elevation 0 at the horizon, positive above; azimuth 0
//! at north, clockwise positive. The azimuth is only reported while the sun
//! is above the horizon.

use chrono::{DateTime, Utc};

/// Sun elevation and azimuth in degrees for an observer at sea level.
///
/// The azimuth is NaN when the sun is at or below the horizon; both values
/// are NaN when the solver rejects the inputs.
pub fn sun_position(lat: f64, lon: f64, utc: DateTime<Utc>) -> (f64, f64) {
    match spa::calc_solar_position(utc, lat, lon) {
        Ok(pos) => {
            let elevation = 90.0 - pos.zenith_angle;
            if elevation > 0.0 {
                (elevation, pos.azimuth)
            } else {
                (elevation, f64::NAN)
            }
        }
        Err(_) => (f64::NAN, f64::NAN),
    }
}
