//! Great-circle helpers on the WGS-84 mean sphere.
//!
//! All distances are in meters, all angles in degrees. Good enough for
//! leg lengths of a few kilometers; the survey legs this controller flies
//! are well inside that envelope.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two geodetic points, meters.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from the start point toward the end point, normalized
/// to [0, 360).
pub fn initial_bearing_deg(start_lat: f64, start_lon: f64, end_lat: f64, end_lon: f64) -> f64 {
    let start_lat_rad = start_lat.to_radians();
    let end_lat_rad = end_lat.to_radians();
    let delta_lon = (end_lon - start_lon).to_radians();

    let y = delta_lon.sin() * end_lat_rad.cos();
    let x = start_lat_rad.cos() * end_lat_rad.sin()
        - start_lat_rad.sin() * end_lat_rad.cos() * delta_lon.cos();

    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Unsigned minimum angular separation between two headings, [0, 180].
pub fn heading_diff_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs();
    diff.min(360.0 - diff)
}
