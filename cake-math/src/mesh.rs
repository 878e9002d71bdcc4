//! Piecewise-linear interpolation over a triangulated sample grid.
//!
//! Samples arrive as two 2D arrays `u[[r, c]]` and `v[[r, c]]` giving the
//! position of grid node (r, c) in the query space. Every grid cell is split
//! into two triangles and a query point inside a triangle is interpolated
//! barycentrically from the three corner values. Query points covered by no
//! triangle evaluate to NaN.
//!
//! Because neighbouring detector pixels are neighbours in angle space too,
//! the pixel grid itself is a valid triangulation of the scattered
//! (angle, angle) samples and no Delaunay step is needed. Triangles that
//! straddle a branch cut are dropped with `max_u_span`.

use ndarray::ArrayView2;
use rayon::prelude::*;
use thiserror::Error;

/// Errors raised while building a [`MeshInterpolator`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    /// The `u` and `v` sample grids have different shapes.
    #[error("sample grids differ in shape: u={u:?}, v={v:?}")]
    ShapeMismatch {
        u: (usize, usize),
        v: (usize, usize),
    },

    /// A grid needs at least 2x2 nodes to form a triangle.
    #[error("sample grid {rows}x{cols} is too small to triangulate")]
    GridTooSmall { rows: usize, cols: usize },

    /// Every candidate triangle was degenerate, non-finite or filtered out.
    #[error("no valid triangles in sample grid")]
    NoValidTriangles,
}

/// Slack allowed on barycentric weights so points on shared edges are found.
const BARYCENTRIC_TOLERANCE: f64 = 1e-10;

/// Corner indices and weights of the triangle that contains a query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Barycentric {
    /// Flat (row-major) node indices of the triangle corners
    pub nodes: [usize; 3],
    /// Barycentric weights, summing to one
    pub weights: [f64; 3],
}

impl Barycentric {
    /// Blend per-node values with the stored weights.
    pub fn apply(&self, values: &[f64]) -> f64 {
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .map(|(&n, &w)| values[n] * w)
            .sum()
    }
}

/// Linear interpolant over a triangulated structured grid of scattered samples.
#[derive(Debug, Clone)]
pub struct MeshInterpolator {
    u: Vec<f64>,
    v: Vec<f64>,
    triangles: Vec<[u32; 3]>,
    /// (u_min, u_max, v_min, v_max) over all kept triangle corners
    bounds: (f64, f64, f64, f64),
    /// Bucket grid dimensions (cells along u, cells along v)
    cells: (usize, usize),
    cell_start: Vec<usize>,
    cell_triangles: Vec<u32>,
}

impl MeshInterpolator {
    /// Triangulate a structured grid of sample positions.
    ///
    /// # Arguments
    /// * `u` - First coordinate of every grid node
    /// * `v` - Second coordinate of every grid node, same shape as `u`
    /// * `max_u_span` - Drop triangles whose corners spread wider than this
    ///   along `u` (used to cut the mesh at an angular branch cut)
    pub fn from_grid(
        u: ArrayView2<f64>,
        v: ArrayView2<f64>,
        max_u_span: Option<f64>,
    ) -> Result<Self, InterpolationError> {
        if u.dim() != v.dim() {
            return Err(InterpolationError::ShapeMismatch {
                u: u.dim(),
                v: v.dim(),
            });
        }

        let (rows, cols) = u.dim();
        if rows < 2 || cols < 2 {
            return Err(InterpolationError::GridTooSmall { rows, cols });
        }

        let us: Vec<f64> = u.iter().copied().collect();
        let vs: Vec<f64> = v.iter().copied().collect();
        let node = |r: usize, c: usize| (r * cols + c) as u32;

        let mut triangles = Vec::with_capacity(2 * (rows - 1) * (cols - 1));
        for r in 0..rows - 1 {
            for c in 0..cols - 1 {
                let a = node(r, c);
                let b = node(r, c + 1);
                let d = node(r + 1, c + 1);
                let e = node(r + 1, c);
                for tri in [[a, b, d], [a, d, e]] {
                    if is_usable(&us, &vs, tri, max_u_span) {
                        triangles.push(tri);
                    }
                }
            }
        }

        if triangles.is_empty() {
            return Err(InterpolationError::NoValidTriangles);
        }

        let mut bounds = (
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
        );
        for tri in &triangles {
            for &n in tri {
                let (pu, pv) = (us[n as usize], vs[n as usize]);
                bounds.0 = bounds.0.min(pu);
                bounds.1 = bounds.1.max(pu);
                bounds.2 = bounds.2.min(pv);
                bounds.3 = bounds.3.max(pv);
            }
        }

        let side = ((triangles.len() as f64 / 2.0).sqrt().ceil() as usize).max(1);
        let mut mesh = Self {
            u: us,
            v: vs,
            triangles,
            bounds,
            cells: (side, side),
            cell_start: Vec::new(),
            cell_triangles: Vec::new(),
        };
        mesh.build_index();
        Ok(mesh)
    }

    /// Number of sample nodes (rows × cols of the source grid).
    pub fn node_count(&self) -> usize {
        self.u.len()
    }

    /// Number of triangles kept after filtering.
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Find the triangle containing `(pu, pv)` and its barycentric weights.
    pub fn locate(&self, pu: f64, pv: f64) -> Option<Barycentric> {
        if !pu.is_finite() || !pv.is_finite() {
            return None;
        }
        let (u_min, u_max, v_min, v_max) = self.bounds;
        if pu < u_min || pu > u_max || pv < v_min || pv > v_max {
            return None;
        }

        let cell = self.cell_of(pu, pv);
        let candidates = &self.cell_triangles[self.cell_start[cell]..self.cell_start[cell + 1]];
        candidates.iter().find_map(|&t| {
            let tri = self.triangles[t as usize];
            self.weights(tri, pu, pv).map(|weights| Barycentric {
                nodes: [tri[0] as usize, tri[1] as usize, tri[2] as usize],
                weights,
            })
        })
    }

    /// Locate many query points in parallel, preserving input order.
    pub fn par_locate(&self, queries: &[(f64, f64)]) -> Vec<Option<Barycentric>> {
        queries
            .par_iter()
            .map(|&(pu, pv)| self.locate(pu, pv))
            .collect()
    }

    /// Interpolate per-node `values` at `(pu, pv)`; NaN outside the mesh.
    ///
    /// # Panics
    /// Panics if `values` does not hold one entry per node.
    pub fn interpolate(&self, values: &[f64], pu: f64, pv: f64) -> f64 {
        assert_eq!(
            values.len(),
            self.node_count(),
            "value count must match node count"
        );
        self.locate(pu, pv)
            .map(|b| b.apply(values))
            .unwrap_or(f64::NAN)
    }

    fn cell_size(&self) -> (f64, f64) {
        let (u_min, u_max, v_min, v_max) = self.bounds;
        let du = (u_max - u_min) / self.cells.0 as f64;
        let dv = (v_max - v_min) / self.cells.1 as f64;
        (
            if du > 0.0 { du } else { 1.0 },
            if dv > 0.0 { dv } else { 1.0 },
        )
    }

    fn cell_coords(&self, pu: f64, pv: f64) -> (usize, usize) {
        let (du, dv) = self.cell_size();
        let cu = ((pu - self.bounds.0) / du).floor().max(0.0) as usize;
        let cv = ((pv - self.bounds.2) / dv).floor().max(0.0) as usize;
        (cu.min(self.cells.0 - 1), cv.min(self.cells.1 - 1))
    }

    fn cell_of(&self, pu: f64, pv: f64) -> usize {
        let (cu, cv) = self.cell_coords(pu, pv);
        cv * self.cells.0 + cu
    }

    /// Bucket triangles by bounding box into a CSR cell table.
    fn build_index(&mut self) {
        let n_cells = self.cells.0 * self.cells.1;
        let ranges: Vec<((usize, usize), (usize, usize))> = self
            .triangles
            .iter()
            .map(|tri| {
                let us = tri.map(|n| self.u[n as usize]);
                let vs = tri.map(|n| self.v[n as usize]);
                let lo = self.cell_coords(
                    us.iter().copied().fold(f64::INFINITY, f64::min),
                    vs.iter().copied().fold(f64::INFINITY, f64::min),
                );
                let hi = self.cell_coords(
                    us.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    vs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                );
                (lo, hi)
            })
            .collect();

        let mut counts = vec![0usize; n_cells + 1];
        for &((u0, v0), (u1, v1)) in &ranges {
            for cv in v0..=v1 {
                for cu in u0..=u1 {
                    counts[cv * self.cells.0 + cu + 1] += 1;
                }
            }
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }

        let mut fill = counts.clone();
        let mut cell_triangles = vec![0u32; counts[n_cells]];
        for (t, &((u0, v0), (u1, v1))) in ranges.iter().enumerate() {
            for cv in v0..=v1 {
                for cu in u0..=u1 {
                    let cell = cv * self.cells.0 + cu;
                    cell_triangles[fill[cell]] = t as u32;
                    fill[cell] += 1;
                }
            }
        }

        self.cell_start = counts;
        self.cell_triangles = cell_triangles;
    }

    fn weights(&self, tri: [u32; 3], pu: f64, pv: f64) -> Option<[f64; 3]> {
        let [a, b, c] = tri.map(|n| (self.u[n as usize], self.v[n as usize]));
        let det = (b.1 - c.1) * (a.0 - c.0) + (c.0 - b.0) * (a.1 - c.1);
        let l1 = ((b.1 - c.1) * (pu - c.0) + (c.0 - b.0) * (pv - c.1)) / det;
        let l2 = ((c.1 - a.1) * (pu - c.0) + (a.0 - c.0) * (pv - c.1)) / det;
        let l3 = 1.0 - l1 - l2;

        let inside = l1 >= -BARYCENTRIC_TOLERANCE
            && l2 >= -BARYCENTRIC_TOLERANCE
            && l3 >= -BARYCENTRIC_TOLERANCE;
        inside.then_some([l1, l2, l3])
    }
}

fn is_usable(us: &[f64], vs: &[f64], tri: [u32; 3], max_u_span: Option<f64>) -> bool {
    let [a, b, c] = tri.map(|n| (us[n as usize], vs[n as usize]));
    if [a, b, c]
        .iter()
        .any(|(pu, pv)| !pu.is_finite() || !pv.is_finite())
    {
        return false;
    }

    if let Some(limit) = max_u_span {
        let lo = a.0.min(b.0).min(c.0);
        let hi = a.0.max(b.0).max(c.0);
        if hi - lo > limit {
            return false;
        }
    }

    let det = (b.1 - c.1) * (a.0 - c.0) + (c.0 - b.0) * (a.1 - c.1);
    det != 0.0 && det.is_finite()
}
