//! Serpentine fly path with rounded overscan turns.

use crate::config::MeshDirection;
use crate::mesh::grid::MeshBounds;

/// Largest chord deviation of an arc segment, mm.
const MAX_ARC_DEVIATION: f64 = 0.1;
/// Lead in and out added to a half circle when sizing the overscan.
const OVERSCAN_LEAD: f64 = 2.0;

/// Points on a circular arc, both ends included.
///
/// Angles are in degrees; `span` may be negative for clockwise arcs.
pub fn arc_points(center: [f64; 2], r: f64, start: f64, span: f64) -> Vec<[f64; 2]> {
    let start = start.to_radians();
    let span = span.to_radians();
    let max_step = (1.0 - MAX_ARC_DEVIATION / r).acos();
    let count = (span.abs() / max_step).ceil().max(1.0) as usize;
    let step = span / count as f64;
    (0..=count)
        .map(|i| {
            let a = start + step * i as f64;
            [center[0] + a.cos() * r, center[1] + a.sin() * r]
        })
        .collect()
}

/// Overscan that fits inside the machine limits on both ends of a line.
///
/// `probe_count` is the configured `[x, y]` count; lines run along `dir`
/// so the spacing between them comes from the other axis.
pub fn auto_overscan(
    min: [f64; 2],
    max: [f64; 2],
    probe_count: [usize; 2],
    offset: [f64; 2],
    dir: MeshDirection,
    axis_min: [f64; 3],
    axis_max: [f64; 3],
) -> f64 {
    let (a, count) = match dir {
        MeshDirection::X => (0, probe_count[1]),
        MeshDirection::Y => (1, probe_count[0]),
    };
    let range = [min[a] - offset[a], max[a] - offset[a]];
    let machine = [axis_min[a], axis_max[a]];
    let space = (range[1] - range[0]) / count.saturating_sub(1).max(1) as f64;
    (range[0] - machine[0])
        .max(0.0)
        .min((machine[1] - range[1]).max(0.0))
        .min(space + OVERSCAN_LEAD)
}

/// Toolhead path covering `bounds` line by line along `dir`.
///
/// Built in (aligned, perpendicular) coordinates and swapped for Y.
pub fn generate_path(
    bounds: &MeshBounds,
    offset: [f64; 2],
    dir: MeshDirection,
    overscan: f64,
) -> Vec<[f64; 2]> {
    let (a, p, swap) = match dir {
        MeshDirection::X => (0, 1, false),
        MeshDirection::Y => (1, 0, true),
    };
    let (begin_a, end_a) = (bounds.min[a] - offset[a], bounds.max[a] - offset[a]);
    let (begin_p, end_p) = (bounds.min[p] - offset[p], bounds.max[p] - offset[p]);
    let count = bounds.res[p];
    let step = (end_p - begin_p) / count.saturating_sub(1).max(1) as f64;
    let radius = (step / 2.0).min(overscan);

    let mut points: Vec<[f64; 2]> = Vec::new();
    for i in 0..count {
        let pos_p = begin_p + step * i as f64;
        let rightwards = i % 2 == 0;
        let (from, to) = if rightwards {
            (begin_a, end_a)
        } else {
            (end_a, begin_a)
        };

        if !points.is_empty() && radius > 0.0 {
            if rightwards {
                let center = begin_a - overscan + radius;
                points.extend(arc_points([center, pos_p - step + radius], radius, -90.0, -90.0));
                points.extend(arc_points([center, pos_p - radius], radius, -180.0, -90.0));
            } else {
                let center = end_a + overscan - radius;
                points.extend(arc_points([center, pos_p - step + radius], radius, -90.0, 90.0));
                points.extend(arc_points([center, pos_p - radius], radius, 0.0, 90.0));
            }
        }
        points.push([from, pos_p]);
        points.push([to, pos_p]);
    }

    if swap {
        for pt in &mut points {
            pt.swap(0, 1);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(res: [usize; 2]) -> MeshBounds {
        MeshBounds::new([10.0, 20.0], [110.0, 120.0], res).unwrap()
    }

    #[test]
    fn arc_chords_stay_within_deviation() {
        let r = 5.0;
        let pts = arc_points([0.0, 0.0], r, 0.0, 90.0);
        let first = pts.first().unwrap();
        let last = pts.last().unwrap();
        assert!((first[0] - 5.0).abs() < 1e-12 && first[1].abs() < 1e-12);
        assert!(last[0].abs() < 1e-9 && (last[1] - 5.0).abs() < 1e-9);
        for w in pts.windows(2) {
            let mid = [(w[0][0] + w[1][0]) / 2.0, (w[0][1] + w[1][1]) / 2.0];
            let sagitta = r - (mid[0].powi(2) + mid[1].powi(2)).sqrt();
            assert!(sagitta <= MAX_ARC_DEVIATION + 1e-12);
        }
    }

    #[test]
    fn serpentine_without_overscan_alternates_direction() {
        let path = generate_path(&bounds([3, 3]), [0.0, 0.0], MeshDirection::X, 0.0);
        assert_eq!(
            path,
            vec![
                [10.0, 20.0],
                [110.0, 20.0],
                [110.0, 70.0],
                [10.0, 70.0],
                [10.0, 120.0],
                [110.0, 120.0],
            ]
        );
    }

    #[test]
    fn y_direction_swaps_coordinates_and_applies_offset() {
        let path = generate_path(&bounds([3, 3]), [5.0, -5.0], MeshDirection::Y, 0.0);
        assert_eq!(path[0], [5.0, 25.0]);
        assert_eq!(path[1], [5.0, 125.0]);
        assert_eq!(path[2], [55.0, 125.0]);
    }

    #[test]
    fn overscan_turns_stay_outside_the_mesh() {
        let path = generate_path(&bounds([3, 3]), [0.0, 0.0], MeshDirection::X, 4.0);
        assert!(path.len() > 6);
        let max_x = path.iter().map(|p| p[0]).fold(f64::MIN, f64::max);
        let min_x = path.iter().map(|p| p[0]).fold(f64::MAX, f64::min);
        assert!((max_x - 114.0).abs() < 1e-9);
        assert!((min_x - 6.0).abs() < 1e-9);
        assert_eq!(*path.last().unwrap(), [110.0, 120.0]);
    }

    #[test]
    fn overscan_is_limited_by_machine_and_spacing() {
        let o = auto_overscan(
            [10.0, 10.0],
            [225.0, 225.0],
            [5, 5],
            [0.0, 0.0],
            MeshDirection::X,
            [0.0, 0.0, 0.0],
            [235.0, 235.0, 250.0],
        );
        assert_eq!(o, 10.0);
        let o = auto_overscan(
            [50.0, 50.0],
            [185.0, 185.0],
            [10, 10],
            [0.0, 0.0],
            MeshDirection::X,
            [0.0, 0.0, 0.0],
            [235.0, 235.0, 250.0],
        );
        assert_eq!(o, 17.0);
    }
}
