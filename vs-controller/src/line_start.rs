//! Geometric predicates deciding when a leg may begin and when a waypoint
//! counts as reached.

use tracing::{debug, info};

use crate::geo::{distance_m, heading_diff_deg, initial_bearing_deg};
use crate::mission::SubphasePlan;
use crate::navigation::NavigationFrame;

#[derive(Debug, Clone, Copy)]
pub struct LineStartTolerances {
    pub lat_lon_meters: f64,
    pub depth_meters: f64,
    pub heading_degrees: f64,
}

/// Line-start condition for the first leg of a phase: the vehicle must be at
/// the start waypoint, at the start depth, and (when heading is available)
/// pointed down the leg.
pub fn check_line_start(
    subphase_id: &str,
    plan: &SubphasePlan,
    nav: &NavigationFrame,
    tolerances: &LineStartTolerances,
) -> bool {
    let (Some(latitude), Some(longitude), Some(depth)) = (nav.latitude, nav.longitude, nav.depth)
    else {
        debug!("Incomplete navigation data (missing lat/lon/depth)");
        return false;
    };

    let target_heading =
        initial_bearing_deg(plan.start_lat, plan.start_lon, plan.end_lat, plan.end_lon);

    let distance = distance_m(latitude, longitude, plan.start_lat, plan.start_lon);
    if distance > tolerances.lat_lon_meters {
        debug!(
            "Subphase {subphase_id}: distance {distance:.1}m > tolerance {}m",
            tolerances.lat_lon_meters
        );
        return false;
    }

    let depth_diff = (depth - plan.start_z).abs();
    if depth_diff > tolerances.depth_meters {
        debug!(
            "Subphase {subphase_id}: depth diff {depth_diff:.1}m > tolerance {}m",
            tolerances.depth_meters
        );
        return false;
    }

    // Heading check is optional: skipped when the sensor reports nothing
    if let Some(heading) = nav.heading {
        let heading_diff = heading_diff_deg(heading, target_heading);
        if heading_diff > tolerances.heading_degrees {
            debug!(
                "Subphase {subphase_id}: heading diff {heading_diff:.1}° > tolerance {}°",
                tolerances.heading_degrees
            );
            return false;
        }
        info!(
            "Line start detected for subphase {subphase_id}: pos_diff={distance:.1}m, \
             depth_diff={depth_diff:.1}m, heading_diff={heading_diff:.1}°"
        );
    } else {
        debug!("No heading data available - skipping heading check");
        info!(
            "Line start detected for subphase {subphase_id}: pos_diff={distance:.1}m, \
             depth_diff={depth_diff:.1}m"
        );
    }

    true
}

/// Coordinate-only waypoint check, used for subphase START and END points.
pub fn check_point(
    target_lat: f64,
    target_lon: f64,
    nav: &NavigationFrame,
    point_id: &str,
    tolerance_meters: f64,
) -> bool {
    let (Some(latitude), Some(longitude)) = (nav.latitude, nav.longitude) else {
        debug!("check_point: incomplete navigation data (missing lat/lon)");
        return false;
    };

    let distance = distance_m(latitude, longitude, target_lat, target_lon);
    if distance > tolerance_meters {
        debug!("Point {point_id}: distance {distance:.1}m > tolerance {tolerance_meters:.1}m");
        return false;
    }

    info!("Point {point_id} reached: distance={distance:.1}m (tolerance={tolerance_meters:.1}m)");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn northbound_leg() -> SubphasePlan {
        SubphasePlan {
            start_lat: 63.4468,
            start_lon: 10.3721,
            start_z: 10.0,
            end_lat: 63.4568, // ~1.1 km due north
            end_lon: 10.3721,
            end_z: 20.0,
            speed: 1.0,
        }
    }

    fn tolerances() -> LineStartTolerances {
        LineStartTolerances {
            lat_lon_meters: 15.0,
            depth_meters: 3.0,
            heading_degrees: 20.0,
        }
    }

    fn frame_at(lat: f64, lon: f64, depth: f64, heading: Option<f64>) -> NavigationFrame {
        NavigationFrame {
            latitude: Some(lat),
            longitude: Some(lon),
            depth: Some(depth),
            heading,
            ..Default::default()
        }
    }

    #[test]
    fn line_start_requires_position_depth_and_heading() {
        let plan = northbound_leg();
        let on_point = frame_at(63.4468, 10.3721, 10.5, Some(2.0));
        assert!(check_line_start("1-1", &plan, &on_point, &tolerances()));

        let wrong_heading = frame_at(63.4468, 10.3721, 10.5, Some(90.0));
        assert!(!check_line_start("1-1", &plan, &wrong_heading, &tolerances()));

        let too_deep = frame_at(63.4468, 10.3721, 14.0, Some(2.0));
        assert!(!check_line_start("1-1", &plan, &too_deep, &tolerances()));

        let far_away = frame_at(63.4478, 10.3721, 10.0, Some(2.0));
        assert!(!check_line_start("1-1", &plan, &far_away, &tolerances()));
    }

    #[test]
    fn heading_check_skipped_when_sensor_silent() {
        let plan = northbound_leg();
        let no_heading = frame_at(63.4468, 10.3721, 10.5, None);
        assert!(check_line_start("1-1", &plan, &no_heading, &tolerances()));
    }

    #[test]
    fn heading_tolerance_wraps_through_north() {
        let plan = northbound_leg();
        // 355° is 5° away from the 0° leg bearing, not 355°
        let wrapped = frame_at(63.4468, 10.3721, 10.0, Some(355.0));
        assert!(check_line_start("1-1", &plan, &wrapped, &tolerances()));
    }

    #[test]
    fn line_start_rejected_without_depth() {
        let plan = northbound_leg();
        let mut frame = frame_at(63.4468, 10.3721, 0.0, Some(2.0));
        frame.depth = None;
        assert!(!check_line_start("1-1", &plan, &frame, &tolerances()));
    }

    #[test]
    fn point_check_uses_coordinates_only() {
        let nav = frame_at(63.4468, 10.3721, 55.0, None);
        assert!(check_point(63.4468, 10.3721, &nav, "1-1_END", 10.0));
        assert!(!check_point(63.4568, 10.3721, &nav, "1-1_END", 10.0));

        let blind = NavigationFrame::default();
        assert!(!check_point(63.4468, 10.3721, &blind, "1-1_END", 10.0));
    }
}
