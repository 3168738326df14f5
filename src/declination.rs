//! Magnetic declination.
//!
//! Truncated spherical-harmonic synthesis of the geomagnetic main field
//! (IGRF-13, degree and order 2, epoch 2020 with degree-1 secular
//! variation). The truncation reproduces the large-scale declination
//! pattern; regional error grows where higher-order terms matter. The
//! tilt-sensor compass is the steering source of last resort and the
//! tolerated angle-away-from-sun window absorbs heading errors of that
//! size.

use chrono::{DateTime, Datelike, Utc};

// IGRF-13 main field coefficients at 2020.0, nT.
const G10: f64 = -29404.8;
const G11: f64 = -1450.9;
const H11: f64 = 4652.5;
const G20: f64 = -2499.6;
const G21: f64 = 2982.0;
const H21: f64 = -2991.6;
const G22: f64 = 1677.0;
const H22: f64 = -734.6;

// Degree-1 secular variation, nT / year.
const G10_SV: f64 = 5.7;
const G11_SV: f64 = 7.4;
const H11_SV: f64 = -25.9;

/// Magnetic declination in degrees east of true north.
///
/// `altitude` is above mean sea level in meters; the field is evaluated at
/// the reference sphere, so only the epoch and position matter at ship
/// altitudes.
pub fn declination(lat: f64, lon: f64, _altitude: f64, date: DateTime<Utc>) -> f64 {
    let years = date.year() as f64 + (date.ordinal() as f64 - 1.0) / 365.25 - 2020.0;
    let g10 = G10 + G10_SV * years;
    let g11 = G11 + G11_SV * years;
    let h11 = H11 + H11_SV * years;

    let theta = (90.0 - lat).to_radians();
    let phi = lon.to_radians();
    let (sin_t, cos_t) = theta.sin_cos();
    let (sin_p, cos_p) = phi.sin_cos();
    let (sin_2p, cos_2p) = (2.0 * phi).sin_cos();
    let sqrt3 = 3.0_f64.sqrt();

    // Schmidt semi-normalized associated Legendre terms and derivatives.
    let dp10 = -sin_t;
    let dp11 = cos_t;
    let dp20 = -3.0 * sin_t * cos_t;
    let dp21 = sqrt3 * (2.0 * theta).cos();
    let dp22 = sqrt3 * sin_t * cos_t;
    let p11 = sin_t;
    let p21 = sqrt3 * sin_t * cos_t;
    let p22 = sqrt3 / 2.0 * sin_t * sin_t;

    let c11 = g11 * cos_p + h11 * sin_p;
    let c21 = G21 * cos_p + H21 * sin_p;
    let c22 = G22 * cos_2p + H22 * sin_2p;

    // B = -grad(V) on the reference sphere; X north = -B_theta, Y east.
    let x = g10 * dp10 + c11 * dp11 + G20 * dp20 + c21 * dp21 + c22 * dp22;
    let y = ((g11 * sin_p - h11 * cos_p) * p11
        + (G21 * sin_p - H21 * cos_p) * p21
        + 2.0 * (G22 * sin_2p - H22 * cos_2p) * p22)
        / sin_t.max(1e-9);

    y.atan2(x).to_degrees()
}

/// Correct a compass heading for the local declination; result in `[0, 360)`.
pub fn true_north_heading(
    heading: f64,
    lat: f64,
    lon: f64,
    altitude: f64,
    date: DateTime<Utc>,
) -> f64 {
    (heading + declination(lat, lon, altitude, date)).rem_euclid(360.0)
}
