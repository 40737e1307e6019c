//! Mesh grid geometry, sample binning and matrix post-processing.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::config::Region;
use crate::error::{Result, ScannerError, fail};
use crate::sample::Sample;
use crate::util::median;

/// Adaptive meshes keep at least this many points per axis.
const MIN_RESOLUTION: usize = 3;
/// Raised minimum when the other axis is dense.
const DENSE_MIN_RESOLUTION: usize = 4;
const DENSE_RESOLUTION: usize = 6;

/// Rectangular grid of `res[0]` by `res[1]` nodes spanning `min..=max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshBounds {
    pub min: [f64; 2],
    pub max: [f64; 2],
    pub res: [usize; 2],
}

impl MeshBounds {
    pub fn new(min: [f64; 2], max: [f64; 2], res: [usize; 2]) -> Result<Self> {
        if res[0] < 2 || res[1] < 2 {
            return Err(fail(ScannerError::mesh(format!(
                "Mesh needs at least 2 points per axis, got {},{}",
                res[0], res[1]
            ))));
        }
        if !(max[0] > min[0] && max[1] > min[1]) {
            return Err(fail(ScannerError::mesh(format!(
                "Mesh max ({:.3},{:.3}) must exceed mesh min ({:.3},{:.3})",
                max[0], max[1], min[0], min[1]
            ))));
        }
        Ok(Self { min, max, res })
    }

    pub fn step(&self) -> [f64; 2] {
        [
            (self.max[0] - self.min[0]) / (self.res[0] - 1) as f64,
            (self.max[1] - self.min[1]) / (self.res[1] - 1) as f64,
        ]
    }

    /// Bed coordinate of grid node `(xi, yi)`.
    pub fn node(&self, xi: usize, yi: usize) -> [f64; 2] {
        let step = self.step();
        [
            self.min[0] + step[0] * xi as f64,
            self.min[1] + step[1] * yi as f64,
        ]
    }

    /// Nearest grid node, if it lies on the grid.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let step = self.step();
        let xi = ((x - self.min[0]) / step[0]).round_ties_even();
        let yi = ((y - self.min[1]) / step[1]).round_ties_even();
        let in_range = |v: f64, res: usize| v >= 0.0 && v < res as f64;
        (in_range(xi, self.res[0]) && in_range(yi, self.res[1]))
            .then(|| (xi as usize, yi as usize))
    }

    /// Closed rectangle test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        (self.min[0]..=self.max[0]).contains(&x) && (self.min[1]..=self.max[1]).contains(&y)
    }

    /// Shrink to the `lo..hi` box of the printed objects, keeping roughly
    /// the original point spacing.
    #[must_use]
    pub fn shrink_to(&self, lo: [f64; 2], hi: [f64; 2]) -> Self {
        let mut out = *self;
        let mut res = [0usize; 2];
        for axis in 0..2 {
            let span = self.max[axis] - self.min[axis];
            if lo[axis] >= self.min[axis] {
                out.min[axis] = lo[axis];
            }
            if hi[axis] <= self.max[axis] {
                out.max[axis] = hi[axis];
            }
            let scaled = self.res[axis] as f64 * (out.max[axis] - out.min[axis]) / span;
            res[axis] = scaled.ceil().max(0.0) as usize;
        }
        let min_res = if res[0].max(res[1]) > DENSE_RESOLUTION
            && res[0].min(res[1]) < DENSE_MIN_RESOLUTION
        {
            DENSE_MIN_RESOLUTION
        } else {
            MIN_RESOLUTION
        };
        out.res = [res[0].max(min_res), res[1].max(min_res)];
        out
    }
}

/// Per-node distance readings, keyed by `(xi, yi)`.
pub type Clusters = BTreeMap<(usize, usize), Vec<f64>>;

/// Streaming sample binner for one mesh scan.
#[derive(Debug, Clone)]
pub struct Binner {
    bounds: MeshBounds,
    /// Sensor offset added to toolhead positions.
    offset: [f64; 2],
    /// Samples farther than this from their node are dropped; 0 keeps all.
    cluster_size: f64,
    /// Zero reference position and capture radius.
    zero_ref: Option<([f64; 2], f64)>,
    pub clusters: Clusters,
    pub zero_bin: Vec<f64>,
    pub total: usize,
    pub invalid: usize,
}

impl Binner {
    pub fn new(
        bounds: MeshBounds,
        offset: [f64; 2],
        cluster_size: f64,
        zero_ref: Option<([f64; 2], f64)>,
    ) -> Self {
        Self {
            bounds,
            offset,
            cluster_size,
            zero_ref: zero_ref.filter(|(_, radius)| *radius > 0.0),
            clusters: Clusters::new(),
            zero_bin: Vec::new(),
            total: 0,
            invalid: 0,
        }
    }

    pub fn add(&mut self, s: &Sample) {
        self.total += 1;
        let Some(pos) = s.pos else {
            return;
        };
        let (x, y) = (pos[0] + self.offset[0], pos[1] + self.offset[1]);
        let Some(d) = s.finite_dist() else {
            if self.bounds.contains(x, y) {
                self.invalid += 1;
            }
            return;
        };
        let Some((xi, yi)) = self.bounds.cell_of(x, y) else {
            return;
        };
        if self.cluster_size > 0.0 {
            let node = self.bounds.node(xi, yi);
            if (x - node[0]).hypot(y - node[1]) > self.cluster_size {
                return;
            }
        }
        if let Some((zero, radius)) = self.zero_ref {
            if (x - zero[0]).hypot(y - zero[1]) <= radius {
                self.zero_bin.push(d);
            }
        }
        self.clusters.entry((xi, yi)).or_default().push(d);
    }
}

/// Nodes inside a faulty region, as a `[yi][xi]` mask.
pub fn fault_mask(bounds: &MeshBounds, regions: &[Region]) -> Vec<Vec<bool>> {
    let [res_x, res_y] = bounds.res;
    let step = bounds.step();
    let mut mask = vec![vec![false; res_x]; res_y];
    let first = |v: f64| v.ceil().max(0.0) as usize;
    let last = |v: f64, res: usize| {
        let f = v.floor();
        if f < 0.0 { None } else { Some((f as usize).min(res - 1)) }
    };
    for r in regions {
        let x0 = first((r.x_min - bounds.min[0]) / step[0]);
        let y0 = first((r.y_min - bounds.min[1]) / step[1]);
        let (Some(x1), Some(y1)) = (
            last((r.x_max - bounds.min[0]) / step[0], res_x),
            last((r.y_max - bounds.min[1]) / step[1], res_y),
        ) else {
            continue;
        };
        for row in mask.iter_mut().take(y1 + 1).skip(y0) {
            for cell in row.iter_mut().take(x1 + 1).skip(x0) {
                *cell = true;
            }
        }
    }
    mask
}

/// Height matrix `[yi][xi]` from cluster medians.
///
/// Unsampled and masked nodes are NaN; masked nodes are returned as
/// `(yi, xi)` for reconstruction.
pub fn build_matrix(
    bounds: &MeshBounds,
    clusters: &Clusters,
    mask: &[Vec<bool>],
    trigger_distance: f64,
) -> (Vec<Vec<f64>>, Vec<(usize, usize)>) {
    let [res_x, res_y] = bounds.res;
    let mut matrix = vec![vec![f64::NAN; res_x]; res_y];
    for (&(xi, yi), values) in clusters {
        if !mask[yi][xi] {
            matrix[yi][xi] = trigger_distance - median(values);
        }
    }
    let faulty = (0..res_y)
        .flat_map(|yi| (0..res_x).map(move |xi| (yi, xi)))
        .filter(|&(yi, xi)| mask[yi][xi])
        .collect();
    (matrix, faulty)
}

/// Reject a matrix that still has holes, listing every empty node.
pub fn check_matrix(bounds: &MeshBounds, matrix: &[Vec<f64>]) -> Result<()> {
    let mut empty = String::new();
    for (yi, row) in matrix.iter().enumerate() {
        for (xi, v) in row.iter().enumerate() {
            if v.is_nan() {
                let [xc, yc] = bounds.node(xi, yi);
                let _ = write!(empty, "\n  ({xc:.3},{yc:.3})[{xi},{yi}]");
            }
        }
    }
    if empty.is_empty() {
        return Ok(());
    }
    Err(fail(ScannerError::mesh(format!(
        "Empty clusters found\nTry increasing mesh cluster_size or slowing down.\nThe following clusters were empty:{empty}"
    ))))
}

/// What the finished mesh is made relative to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZeroOffset {
    None,
    /// Row-major node index; ignored when outside the grid.
    Index(i64),
    /// Distance read at the zero reference position, if one was taken.
    Reading(Option<f64>),
}

/// Shift the matrix so the zero reference reads 0.
pub fn finalize_matrix(
    matrix: &mut [Vec<f64>],
    bounds: &MeshBounds,
    zero: ZeroOffset,
    trigger_distance: f64,
) {
    let [res_x, res_y] = bounds.res;
    let offset = match zero {
        ZeroOffset::Index(i) => usize::try_from(i)
            .ok()
            .filter(|&i| i < res_x * res_y)
            .map(|i| matrix[i / res_x][i % res_x]),
        ZeroOffset::Reading(dist) => dist.map(|d| trigger_distance - d),
        ZeroOffset::None => None,
    };
    if let Some(offset) = offset {
        for v in matrix.iter_mut().flatten() {
            *v -= offset;
        }
    }
}

/// Write every binned reading as `x,y,xp,yp,dist`.
pub fn write_dump(path: &Path, bounds: &MeshBounds, clusters: &Clusters) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(["x", "y", "xp", "yp", "dist"])?;
    for yi in 0..bounds.res[1] {
        for xi in 0..bounds.res[0] {
            let Some(values) = clusters.get(&(xi, yi)) else {
                continue;
            };
            let [xp, yp] = bounds.node(xi, yi);
            for d in values {
                w.write_record([
                    xi.to_string(),
                    yi.to_string(),
                    format!("{xp:.6}"),
                    format!("{yp:.6}"),
                    format!("{d:.6}"),
                ])?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> MeshBounds {
        MeshBounds::new([0.0, 0.0], [100.0, 50.0], [5, 3]).unwrap()
    }

    fn at(x: f64, y: f64, dist: Option<f64>) -> Sample {
        Sample {
            clock: 0,
            time: 0.0,
            data: 0,
            data_smooth: 0.0,
            temp: 30.0,
            freq: 3.0e6,
            dist,
            pos: Some([x, y, 2.0]),
            vel: None,
        }
    }

    #[test]
    fn degenerate_bounds_are_rejected() {
        assert!(MeshBounds::new([0.0, 0.0], [0.0, 10.0], [3, 3]).is_err());
        assert!(MeshBounds::new([0.0, 0.0], [10.0, 10.0], [1, 3]).is_err());
    }

    #[test]
    fn binning_rounds_to_nearest_node_and_honours_cluster_size() {
        let mut b = Binner::new(bounds(), [0.0, 0.0], 1.0, None);
        b.add(&at(24.5, 0.2, Some(2.0)));
        b.add(&at(26.5, 0.0, Some(2.1)));
        b.add(&at(37.0, 0.0, Some(2.2)));
        b.add(&at(-20.0, 0.0, Some(2.0)));
        assert_eq!(b.total, 4);
        assert_eq!(b.clusters.get(&(1, 0)), Some(&vec![2.0]));
        assert_eq!(b.clusters.len(), 1);
    }

    #[test]
    fn invalid_samples_count_only_inside_the_mesh() {
        let mut b = Binner::new(bounds(), [0.0, 0.0], 0.0, None);
        b.add(&at(50.0, 40.0, Some(f64::INFINITY)));
        b.add(&at(50.0, 40.0, None));
        b.add(&at(150.0, 40.0, Some(f64::NEG_INFINITY)));
        assert_eq!(b.invalid, 2);
        assert!(b.clusters.is_empty());
    }

    #[test]
    fn zero_reference_bin_uses_capture_radius() {
        let mut b = Binner::new(bounds(), [5.0, 0.0], 0.0, Some(([50.0, 25.0], 1.0)));
        b.add(&at(45.5, 25.0, Some(1.9)));
        b.add(&at(40.0, 25.0, Some(1.8)));
        assert_eq!(b.zero_bin, vec![1.9]);
    }

    #[test]
    fn faulty_mask_covers_nodes_inside_the_region() {
        let regions = [Region::new([20.0, 10.0], [60.0, 60.0])];
        let mask = fault_mask(&bounds(), &regions);
        assert_eq!(mask[0], vec![false; 5]);
        assert_eq!(mask[1], vec![false, true, true, false, false]);
        assert_eq!(mask[2], vec![false, true, true, false, false]);
    }

    #[test]
    fn matrix_subtracts_median_from_trigger_distance() {
        let mut clusters = Clusters::new();
        clusters.insert((0, 0), vec![1.9, 2.1, 1.7]);
        let mask = vec![vec![false; 5]; 3];
        let (m, faulty) = build_matrix(&bounds(), &clusters, &mask, 2.0);
        assert!((m[0][0] - 0.1).abs() < 1e-12);
        assert!(m[0][1].is_nan());
        assert!(faulty.is_empty());
    }

    #[test]
    fn empty_nodes_are_listed() {
        let b = MeshBounds::new([0.0, 0.0], [10.0, 10.0], [2, 2]).unwrap();
        let m = vec![vec![0.0, f64::NAN], vec![0.0, 0.0]];
        let err = check_matrix(&b, &m).unwrap_err().to_string();
        assert!(err.starts_with("Empty clusters found\n"));
        assert!(err.ends_with("\n  (10.000,0.000)[1,0]"));
    }

    #[test]
    fn zero_reference_shifts_the_mesh() {
        let b = MeshBounds::new([0.0, 0.0], [10.0, 10.0], [2, 2]).unwrap();
        let mut m = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        finalize_matrix(&mut m, &b, ZeroOffset::Index(3), 2.0);
        assert!((m[0][0] + 0.3).abs() < 1e-12 && m[1][1].abs() < 1e-12);

        let mut m = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        finalize_matrix(&mut m, &b, ZeroOffset::Index(4), 2.0);
        assert_eq!(m[1][1], 0.4);

        let mut m = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        finalize_matrix(&mut m, &b, ZeroOffset::Reading(Some(1.9)), 2.0);
        assert!(m[0][0].abs() < 1e-12);
    }

    #[test]
    fn adaptive_shrink_keeps_spacing_and_minimums() {
        let full = MeshBounds::new([10.0, 10.0], [210.0, 210.0], [21, 21]).unwrap();
        let s = full.shrink_to([95.0, 95.0], [125.0, 105.0]);
        assert_eq!(s.min, [95.0, 95.0]);
        assert_eq!(s.max, [125.0, 105.0]);
        assert_eq!(s.res, [4, 3]);

        let s = full.shrink_to([0.0, 95.0], [300.0, 100.0]);
        assert_eq!(s.min, [10.0, 95.0]);
        assert_eq!(s.res, [21, 4]);
    }
}
