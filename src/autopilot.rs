//! Tower steering geometry.
//!
//! The ship is the reference frame for both the compass and the indexing
//! table. Given the sun azimuth and the ship heading, [`AutoPilot::steer`]
//! picks the tower orientation that keeps the optical heads at the optimal
//! angle away from the sun while staying inside the tower's valid range;
//! when both mirror-image candidates fit, the one furthest from the range
//! walls wins, with hysteresis so small heading wobbles do not seesaw the
//! tower.

use crate::angle::normalize;
use crate::config::AutoPilotConfig;

#[derive(Debug, Clone)]
pub struct AutoPilot {
    /// Yaw offset of the GPS antenna baseline from the bow.
    pub compass_zero: f64,
    /// Tower zero orientation with respect to the bow.
    pub tower_zero: f64,
    /// Valid tower orientation range; `[a, b]` with `a > b` wraps through
    /// the back of the scale.
    pub tower_limits: [f64; 2],
    /// Optimal angle away from the sun azimuth.
    pub target: f64,
    /// Tolerated angle-away-from-sun range for the fallback search.
    pub target_limits: [f64; 2],
    /// Minimum advantage before switching to the other candidate.
    pub min_dist_delta: f64,
    /// Candidate retained by the previous `steer` call.
    pub selected_option: Option<usize>,
}

impl AutoPilot {
    pub fn new(cfg: &AutoPilotConfig) -> AutoPilot {
        AutoPilot {
            compass_zero: normalize(cfg.gps_orientation_on_ship),
            tower_zero: normalize(cfg.indexing_table_orientation_on_ship),
            tower_limits: [
                normalize(cfg.valid_indexing_table_orientation_limits[0]),
                normalize(cfg.valid_indexing_table_orientation_limits[1]),
            ],
            target: cfg.optimal_angle_away_from_sun,
            target_limits: [
                normalize(cfg.valid_angle_away_from_sun_limits[0]),
                normalize(cfg.valid_angle_away_from_sun_limits[1]),
            ],
            min_dist_delta: cfg.minimum_distance_delta,
            selected_option: None,
        }
    }

    pub fn set_tower_limits(&mut self, limits: [f64; 2]) {
        self.tower_limits = [normalize(limits[0]), normalize(limits[1])];
    }

    pub fn set_target_limits(&mut self, limits: [f64; 2]) {
        self.target_limits = [normalize(limits[0]), normalize(limits[1])];
    }

    /// Best tower orientation for the given sun azimuth and ship heading,
    /// NaN when no orientation satisfies even the tolerated range.
    pub fn steer(&mut self, sun_azimuth: f64, ship_heading: f64) -> f64 {
        // Both mirror-image world-frame candidates, brought into the tower
        // frame.
        let tower_zero_heading = ship_heading - self.tower_zero;
        let options = [
            normalize(sun_azimuth + self.target - tower_zero_heading),
            normalize(sun_azimuth - self.target - tower_zero_heading),
        ];

        let [lo, hi] = self.tower_limits;
        if lo == hi {
            // Degenerate limits: every orientation is valid, prefer the
            // first candidate.
            return options[0];
        }
        let mut valid_options = 0usize;
        if in_limits(options[0], lo, hi) {
            valid_options += 1;
        }
        if in_limits(options[1], lo, hi) {
            valid_options += 2;
        }

        match valid_options {
            0 => {
                self.selected_option = None;
                self.steer_fallback(sun_azimuth, tower_zero_heading)
            }
            1 | 2 => {
                self.selected_option = Some(valid_options - 1);
                options[valid_options - 1]
            }
            _ => {
                // Two candidates: distance of each to the nearest wall.
                let dist = [
                    f64::min(
                        normalize(lo - options[0]).abs(),
                        normalize(hi - options[0]).abs(),
                    ),
                    f64::min(
                        normalize(lo - options[1]).abs(),
                        normalize(hi - options[1]).abs(),
                    ),
                ];
                let best = if dist[1] > dist[0] { 1 } else { 0 };
                // Only switch when the advantage is worth the motion.
                match self.selected_option {
                    Some(kept)
                        if best != kept
                            && (dist[0] - dist[1]).abs() <= self.min_dist_delta => {}
                    _ => self.selected_option = Some(best),
                }
                options[self.selected_option.expect("selected above")]
            }
        }
    }

    /// No preferred candidate fits: return the first tower limit that lies
    /// inside a tolerated angle-away-from-sun range.
    fn steer_fallback(&self, sun_azimuth: f64, tower_zero_heading: f64) -> f64 {
        let [t_lo, t_hi] = self.target_limits;
        if t_lo == t_hi {
            return f64::NAN;
        }
        // Tolerated tower-frame ranges on both sides of the sun.
        let ranges = [
            [
                normalize(sun_azimuth + t_lo - tower_zero_heading),
                normalize(sun_azimuth + t_hi - tower_zero_heading),
            ],
            [
                normalize(sun_azimuth - t_hi - tower_zero_heading),
                normalize(sun_azimuth - t_lo - tower_zero_heading),
            ],
        ];
        for &t in &self.tower_limits {
            let tolerated = if t_lo < t_hi {
                (ranges[0][0] <= t && t <= ranges[0][1])
                    || (ranges[1][0] <= t && t <= ranges[1][1])
            } else {
                t >= ranges[0][0]
                    || ranges[0][1] >= t
                    || t >= ranges[1][0]
                    || ranges[1][1] >= t
            };
            if tolerated {
                return t;
            }
        }
        f64::NAN
    }

    /// Ship heading from a compass reading.
    ///
    /// With `tower_orientation` the compass rides on the tower and its
    /// reading must be brought back through the tower orientation; without
    /// it the compass is hull mounted.
    pub fn get_ship_heading(&self, compass_heading: f64, tower_orientation: Option<f64>) -> f64 {
        match tower_orientation {
            None => normalize(compass_heading - self.compass_zero),
            Some(correction) => normalize(
                compass_heading + correction - self.tower_zero - self.compass_zero,
            ),
        }
    }
}

/// Inclusive range check; reversed limits wrap through the back of the
/// signed scale.
fn in_limits(orientation: f64, lo: f64, hi: f64) -> bool {
    if lo < hi {
        lo <= orientation && orientation <= hi
    } else {
        orientation >= lo || hi >= orientation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config;

    fn pilot() -> AutoPilot {
        AutoPilot::new(&sample_config().auto_pilot)
    }

    #[test]
    fn steer_sun_ne_ship_nw() {
        // sun_azimuth = 45, ship_heading = -45
        let mut p = pilot();
        p.set_tower_limits([-180.0, 180.0]);
        assert_eq!(p.steer(45.0, -45.0), -135.0);
        p.set_tower_limits([-90.0, 0.0]);
        assert_eq!(p.steer(45.0, -45.0), -45.0);
        // Wrap-reversed limits leave only the second candidate.
        p.set_tower_limits([180.0, -90.0]);
        assert_eq!(p.steer(45.0, -45.0), -135.0);
        // Both fit, first is further from the walls.
        p.set_tower_limits([-140.0, 0.0]);
        assert_eq!(p.steer(45.0, -45.0), -45.0);
        p.set_tower_limits([-180.0, -40.0]);
        assert_eq!(p.steer(45.0, -45.0), -135.0);
    }

    #[test]
    fn steer_sun_sw_ship_nw() {
        // sun_azimuth = 225, ship_heading = -45
        let mut p = pilot();
        p.set_tower_limits([-180.0, 180.0]);
        assert_eq!(p.steer(225.0, -45.0), 45.0);
        p.set_tower_limits([0.0, 90.0]);
        assert_eq!(p.steer(225.0, -45.0), 45.0);
        p.set_tower_limits([90.0, 0.0]);
        assert_eq!(p.steer(225.0, -45.0), 135.0);
        // Both equidistant: prefer not moving away from the previous pick.
        p.set_tower_limits([0.0, 180.0]);
        assert_eq!(p.steer(225.0, -45.0), 135.0);
        // Slight advantage for the first candidate, below the hysteresis.
        p.set_tower_limits([0.0, 179.0]);
        assert_eq!(p.steer(225.0, -45.0), 135.0);
        // Clear advantage: switch.
        p.set_tower_limits([0.0, 176.0]);
        assert_eq!(p.steer(225.0, -45.0), 45.0);
        p.set_tower_limits([10.0, 180.0]);
        assert_eq!(p.steer(225.0, -45.0), 135.0);
    }

    #[test]
    fn steer_sun_sw_ship_se() {
        // sun_azimuth = 225, ship_heading = 135
        let mut p = pilot();
        p.set_tower_limits([-180.0, 180.0]);
        assert_eq!(p.steer(225.0, 135.0), -135.0);
        p.set_tower_limits([-90.0, 90.0]);
        assert_eq!(p.steer(225.0, 135.0), -45.0);
        p.set_tower_limits([-180.0, -90.0]);
        assert_eq!(p.steer(225.0, 135.0), -135.0);
        p.set_tower_limits([-180.0, 0.0]);
        assert_eq!(p.steer(225.0, 135.0), -135.0);
        p.set_tower_limits([-170.0, 170.0]);
        assert_eq!(p.steer(225.0, 135.0), -45.0);
    }

    #[test]
    fn steer_wrap_reversed_limits() {
        // sun_azimuth = 112, ship_heading = -170
        let mut p = pilot();
        p.set_tower_limits([-180.0, 180.0]);
        assert_eq!(p.steer(112.0, -170.0), 57.0);
        p.set_tower_limits([-90.0, 90.0]);
        assert_eq!(p.steer(112.0, -170.0), 57.0);
        p.set_tower_limits([90.0, -90.0]);
        assert_eq!(p.steer(112.0, -170.0), 147.0);
        p.set_tower_limits([90.0, 0.0]);
        assert_eq!(p.steer(112.0, -170.0), 147.0);
        p.set_tower_limits([-170.0, 170.0]);
        assert_eq!(p.steer(112.0, -170.0), 57.0);
    }

    #[test]
    fn steer_degenerate_limits_accept_everything() {
        let mut p = pilot();
        p.set_tower_limits([30.0, 30.0]);
        assert_eq!(p.steer(45.0, -45.0), normalize(45.0 + 135.0 + 45.0));
    }

    #[test]
    fn steer_result_stays_inside_limits() {
        let mut p = pilot();
        for &limits in &[[-90.0_f64, 90.0], [0.0, 180.0], [90.0, -90.0], [120.0, -150.0]] {
            p.set_tower_limits(limits);
            for sun in (0..360).step_by(15) {
                for ship in (-180..180).step_by(15) {
                    p.selected_option = None;
                    let aim = p.steer(sun as f64, ship as f64);
                    if aim.is_nan() {
                        continue;
                    }
                    assert!(
                        in_limits(aim, limits[0], limits[1]),
                        "steer({sun}, {ship}) = {aim} outside {limits:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn fallback_returns_tower_limit_or_nan() {
        let mut p = pilot();
        // Tower confined to a narrow range that never reaches 135 degrees
        // away from the sun: fall back to the tolerated range.
        p.set_tower_limits([-10.0, 10.0]);
        p.set_target_limits([90.0, 135.0]);
        // Sun dead ahead: candidates at +/-135 are far outside; the limits
        // are 90..135 away from the sun on either side only when the sun
        // azimuth brings a wall into the tolerated window.
        let aim = p.steer(100.0, 0.0);
        if !aim.is_nan() {
            assert!(aim == -10.0 || aim == 10.0);
        }
        // A geometry with no tolerated wall at all.
        p.set_tower_limits([-1.0, 1.0]);
        assert!(p.steer(0.0, 0.0).is_nan());
        assert_eq!(p.selected_option, None);
    }

    #[test]
    fn hysteresis_over_a_sun_sweep() {
        // Sun sweeps 180 -> 315 while the ship wobbles around -45: the
        // selected candidate must flip exactly once with the default
        // hysteresis, and is free to chatter without it.
        let n = 1000;
        let sweep = |p: &mut AutoPilot| -> usize {
            let mut switches = 0;
            let mut last: Option<usize> = None;
            for i in 0..n {
                let sun = 180.0 + 135.0 * i as f64 / n as f64;
                let ship = -45.0 + (i as f64 * 0.7).sin();
                let aim = p.steer(sun, ship);
                assert!(!aim.is_nan());
                if let (Some(prev), Some(cur)) = (last, p.selected_option) {
                    if prev != cur {
                        switches += 1;
                    }
                }
                last = p.selected_option;
            }
            switches
        };

        let mut p = pilot();
        p.set_tower_limits([0.0, 180.0]);
        assert_eq!(sweep(&mut p), 1);

        let mut p = pilot();
        p.set_tower_limits([0.0, 180.0]);
        p.min_dist_delta = 0.0;
        assert!(sweep(&mut p) >= 1);
    }

    #[test]
    fn ship_heading_from_compass() {
        let mut p = pilot();
        p.compass_zero = 0.0;
        assert_eq!(p.get_ship_heading(15.0, None), 15.0);
        p.compass_zero = 90.0;
        assert_eq!(p.get_ship_heading(15.0, None), -75.0);

        p.tower_zero = 0.0;
        p.compass_zero = 90.0;
        assert_eq!(p.get_ship_heading(15.0, Some(0.0)), -75.0);
        assert_eq!(p.get_ship_heading(15.0, Some(90.0)), 15.0);
    }

    #[test]
    fn warmup_scenario_geometry() {
        // Sun at 234.51, ship at 10: the two candidates are
        // normalize(234.51 +/- 135 - 10), i.e. -0.49 and 89.51.
        let mut p = pilot();
        // [-180, 180] normalizes to the degenerate full range: the first
        // candidate is returned unconditionally.
        p.set_tower_limits([-180.0, 180.0]);
        let aim = p.steer(234.51, 10.0);
        assert!((aim + 0.49).abs() < 1e-9, "aim = {aim}");
        // A bounded range forces the second candidate.
        p.set_tower_limits([45.0, 135.0]);
        let aim = p.steer(234.51, 10.0);
        assert!((aim - 89.51).abs() < 1e-9, "aim = {aim}");
    }
}
