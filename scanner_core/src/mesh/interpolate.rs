//! Reconstruction of masked mesh nodes.
//!
//! Nodes are addressed by grid index `[yi, xi]`, so distances are measured
//! in grid steps rather than millimetres.

use nalgebra::{DMatrix, DVector};

use crate::config::Interpolation;
use crate::error::{Result, ScannerError, fail};

/// Grid node index, `[yi, xi]`.
pub type Node = [usize; 2];

/// Estimates values at `targets` from the `known` nodes.
pub trait Interpolator: Send {
    fn name(&self) -> &'static str;
    fn interpolate(&self, known: &[Node], values: &[f64], targets: &[Node]) -> Result<Vec<f64>>;
}

/// Interpolator for a configured method; `None` when disabled.
pub fn for_setting(setting: Interpolation) -> Option<Box<dyn Interpolator>> {
    match setting {
        Interpolation::Rbf => Some(Box::new(ThinPlateRbf::default())),
        Interpolation::Linear => Some(Box::new(LinearTriangulation)),
        Interpolation::Disabled => None,
    }
}

/// Overwrite the `faulty` nodes of `matrix` from every other finite node.
pub fn fill_faulty(
    matrix: &mut [Vec<f64>],
    faulty: &[(usize, usize)],
    interp: &dyn Interpolator,
) -> Result<()> {
    let mut known = Vec::new();
    let mut values = Vec::new();
    for (yi, row) in matrix.iter().enumerate() {
        for (xi, v) in row.iter().enumerate() {
            if !v.is_nan() {
                known.push([yi, xi]);
                values.push(*v);
            }
        }
    }
    let targets: Vec<Node> = faulty.iter().map(|&(yi, xi)| [yi, xi]).collect();
    tracing::debug!(
        method = interp.name(),
        known = known.len(),
        targets = targets.len(),
        "reconstructing faulty nodes"
    );
    let fixed = interp.interpolate(&known, &values, &targets)?;
    for (&(yi, xi), v) in faulty.iter().zip(fixed) {
        matrix[yi][xi] = v;
    }
    Ok(())
}

fn to_f64(n: Node) -> [f64; 2] {
    [n[0] as f64, n[1] as f64]
}

fn dist2(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// Thin plate spline `r² ln r` with a linear polynomial tail, fitted
/// locally over the nearest `neighbors` known nodes of each target.
#[derive(Debug, Clone, Copy)]
pub struct ThinPlateRbf {
    pub neighbors: usize,
}

impl Default for ThinPlateRbf {
    fn default() -> Self {
        Self { neighbors: 64 }
    }
}

fn thin_plate(r2: f64) -> f64 {
    if r2 == 0.0 { 0.0 } else { 0.5 * r2 * r2.ln() }
}

impl ThinPlateRbf {
    fn eval_at(&self, known: &[[f64; 2]], values: &[f64], t: [f64; 2]) -> Result<f64> {
        let mut order: Vec<usize> = (0..known.len()).collect();
        order.sort_by(|&a, &b| dist2(known[a], t).total_cmp(&dist2(known[b], t)));
        order.truncate(self.neighbors);
        let k = order.len();

        // Centre on the neighbourhood for conditioning.
        let c = order.iter().fold([0.0, 0.0], |acc, &i| {
            [acc[0] + known[i][0] / k as f64, acc[1] + known[i][1] / k as f64]
        });
        let pts: Vec<[f64; 2]> = order
            .iter()
            .map(|&i| [known[i][0] - c[0], known[i][1] - c[1]])
            .collect();

        let n = k + 3;
        let a = DMatrix::from_fn(n, n, |i, j| match (i < k, j < k) {
            (true, true) => thin_plate(dist2(pts[i], pts[j])),
            (true, false) => poly_term(pts[i], j - k),
            (false, true) => poly_term(pts[j], i - k),
            (false, false) => 0.0,
        });
        let b = DVector::from_fn(n, |i, _| if i < k { values[order[i]] } else { 0.0 });
        let coef = a.lu().solve(&b).ok_or_else(|| {
            fail(ScannerError::mesh(
                "Unable to interpolate faulty regions: singular RBF system",
            ))
        })?;

        let t = [t[0] - c[0], t[1] - c[1]];
        let radial: f64 = pts
            .iter()
            .enumerate()
            .map(|(i, p)| coef[i] * thin_plate(dist2(*p, t)))
            .sum();
        Ok(radial + (0..3).map(|d| coef[k + d] * poly_term(t, d)).sum::<f64>())
    }
}

fn poly_term(p: [f64; 2], degree: usize) -> f64 {
    match degree {
        0 => 1.0,
        1 => p[0],
        _ => p[1],
    }
}

impl Interpolator for ThinPlateRbf {
    fn name(&self) -> &'static str {
        "rbf"
    }

    fn interpolate(&self, known: &[Node], values: &[f64], targets: &[Node]) -> Result<Vec<f64>> {
        if known.len() < 3 {
            return Err(fail(ScannerError::mesh(format!(
                "Unable to interpolate faulty regions: only {} measured nodes",
                known.len()
            ))));
        }
        let known: Vec<[f64; 2]> = known.iter().copied().map(to_f64).collect();
        targets
            .iter()
            .map(|&t| self.eval_at(&known, values, to_f64(t)))
            .collect()
    }
}

/// Piecewise linear interpolation over the Delaunay triangulation of the
/// known nodes. Targets outside their convex hull come back as NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearTriangulation;

type Pt = [i128; 2];

/// Twice the signed area of `abc`; positive when counter-clockwise.
fn orient(a: Pt, b: Pt, c: Pt) -> i128 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// `d` strictly inside the circumcircle of counter-clockwise `abc`.
fn in_circle(a: Pt, b: Pt, c: Pt, d: Pt) -> bool {
    let (adx, ady) = (a[0] - d[0], a[1] - d[1]);
    let (bdx, bdy) = (b[0] - d[0], b[1] - d[1]);
    let (cdx, cdy) = (c[0] - d[0], c[1] - d[1]);
    let det = (adx * adx + ady * ady) * (bdx * cdy - cdx * bdy)
        - (bdx * bdx + bdy * bdy) * (adx * cdy - cdx * ady)
        + (cdx * cdx + cdy * cdy) * (adx * bdy - bdx * ady);
    det > 0
}

/// Grid sides at or above this overflow the exact `i128` predicates.
const MAX_LINEAR_SIDE: usize = 256;

/// Bowyer-Watson over integer points; triangles are counter-clockwise
/// index triples into `pts`, with the three super vertices removed.
fn triangulate(pts: &[Pt]) -> Vec<[usize; 3]> {
    let side = pts
        .iter()
        .map(|p| p[0].max(p[1]))
        .max()
        .unwrap_or(0)
        + 1;
    // Far enough that no super vertex enters the circumcircle of a hull
    // triangle of grid points.
    let m = 4 * side * side * side;
    let mut all: Vec<Pt> = pts.to_vec();
    let base = all.len();
    all.extend([[-3 * m, -3 * m], [9 * m, -3 * m], [-3 * m, 9 * m]]);

    let mut tris: Vec<[usize; 3]> = vec![[base, base + 1, base + 2]];
    for (pi, &p) in pts.iter().enumerate() {
        let (bad, keep): (Vec<[usize; 3]>, Vec<[usize; 3]>) = tris
            .into_iter()
            .partition(|t| in_circle(all[t[0]], all[t[1]], all[t[2]], p));
        tris = keep;

        let edges: Vec<(usize, usize)> = bad
            .iter()
            .flat_map(|t| [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])])
            .collect();
        for &(a, b) in &edges {
            let shared = edges.iter().any(|&(c, d)| c == b && d == a);
            if !shared {
                tris.push([a, b, pi]);
            }
        }
    }
    tris.retain(|t| t.iter().all(|&v| v < base));
    tris
}

impl Interpolator for LinearTriangulation {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn interpolate(&self, known: &[Node], values: &[f64], targets: &[Node]) -> Result<Vec<f64>> {
        let too_large = known
            .iter()
            .chain(targets)
            .any(|n| n[0] >= MAX_LINEAR_SIDE || n[1] >= MAX_LINEAR_SIDE);
        if too_large {
            return Err(fail(ScannerError::mesh(format!(
                "Linear interpolation supports fewer than {MAX_LINEAR_SIDE} points per axis"
            ))));
        }
        let to_pt = |n: &Node| [n[0] as i128, n[1] as i128];
        let pts: Vec<Pt> = known.iter().map(to_pt).collect();
        let tris = triangulate(&pts);

        Ok(targets
            .iter()
            .map(|t| {
                let q = to_pt(t);
                tris.iter()
                    .find_map(|&[a, b, c]| {
                        let (pa, pb, pc) = (pts[a], pts[b], pts[c]);
                        let area = orient(pa, pb, pc);
                        let wa = orient(q, pb, pc);
                        let wb = orient(pa, q, pc);
                        let wc = orient(pa, pb, q);
                        (area > 0 && wa >= 0 && wb >= 0 && wc >= 0).then(|| {
                            let area = area as f64;
                            (wa as f64 * values[a] + wb as f64 * values[b] + wc as f64 * values[c])
                                / area
                        })
                    })
                    .unwrap_or(f64::NAN)
            })
            .collect())
    }
}
