//! Characteristic tracing and periodic trilinear interpolation for the
//! semi-Lagrangian transport scheme.
//!
//! Departure points are traced with an RK2 (midpoint-corrected) step and
//! stored in grid-index coordinates, so interpolation is a direct
//! trilinear gather with periodic wrapping.

use rayon::prelude::*;

use crate::field::VecField;
use crate::grid::{idx3d, GridSize};

/// Departure points of the backward characteristics, one per grid point,
/// in continuous grid-index coordinates.
pub struct Trajectory {
    grid: GridSize,
    q1: Vec<f64>,
    q2: Vec<f64>,
    q3: Vec<f64>,
    // velocity interpolated at the predictor points
    v1x: Vec<f64>,
    v2x: Vec<f64>,
    v3x: Vec<f64>,
}

impl Trajectory {
    pub fn new(grid: GridSize) -> Self {
        let nl = grid.nl();
        Self {
            grid,
            q1: vec![0.0; nl],
            q2: vec![0.0; nl],
            q3: vec![0.0; nl],
            v1x: vec![0.0; nl],
            v2x: vec![0.0; nl],
            v3x: vec![0.0; nl],
        }
    }

    /// Trace departure points for a time step of size `ht` under the
    /// stationary velocity `v`. `sign` is -1 for the state solve
    /// (backward characteristics) and +1 for the adjoint solve.
    ///
    /// RK2 trace: x* = x + sign·ht·v(x), X = x + sign·(ht/2)·(v(x) + v(x*)).
    pub fn compute(&mut self, v: &VecField, ht: f64, sign: f64) {
        let [nx, ny, nz] = self.grid.nx;
        let h = self.grid.spacing();
        let s = sign * ht;
        let half = 0.5 * sign * ht;

        // Euler predictor in physical coordinates
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    self.q1[idx] = (i as f64 * h[0] + s * v.x1[idx]) / h[0];
                    self.q2[idx] = (j as f64 * h[1] + s * v.x2[idx]) / h[1];
                    self.q3[idx] = (k as f64 * h[2] + s * v.x3[idx]) / h[2];
                }
            }
        }

        // midpoint corrector: average v(x) with v at the predicted point
        interpolate(&mut self.v1x, &v.x1, &self.q1, &self.q2, &self.q3, self.grid);
        interpolate(&mut self.v2x, &v.x2, &self.q1, &self.q2, &self.q3, self.grid);
        interpolate(&mut self.v3x, &v.x3, &self.q1, &self.q2, &self.q3, self.grid);

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    self.q1[idx] =
                        (i as f64 * h[0] + half * (v.x1[idx] + self.v1x[idx])) / h[0];
                    self.q2[idx] =
                        (j as f64 * h[1] + half * (v.x2[idx] + self.v2x[idx])) / h[1];
                    self.q3[idx] =
                        (k as f64 * h[2] + half * (v.x3[idx] + self.v3x[idx])) / h[2];
                }
            }
        }
    }

    /// Interpolate a scalar field along the stored departure points.
    pub fn interpolate(&self, out: &mut [f64], f: &[f64]) {
        interpolate(out, f, &self.q1, &self.q2, &self.q3, self.grid);
    }
}

/// Periodic trilinear interpolation of `f` at the continuous grid-index
/// query points (q1, q2, q3).
pub fn interpolate(
    out: &mut [f64],
    f: &[f64],
    q1: &[f64],
    q2: &[f64],
    q3: &[f64],
    grid: GridSize,
) {
    let [nx, ny, nz] = grid.nx;

    out.par_iter_mut().enumerate().for_each(|(idx, o)| {
        let (x, y, z) = (q1[idx], q2[idx], q3[idx]);

        let i0 = x.floor();
        let j0 = y.floor();
        let k0 = z.floor();
        let fx = x - i0;
        let fy = y - j0;
        let fz = z - k0;

        let i0 = wrap(i0 as i64, nx);
        let j0 = wrap(j0 as i64, ny);
        let k0 = wrap(k0 as i64, nz);
        let i1 = (i0 + 1) % nx;
        let j1 = (j0 + 1) % ny;
        let k1 = (k0 + 1) % nz;

        let c000 = f[idx3d(i0, j0, k0, nx, ny)];
        let c100 = f[idx3d(i1, j0, k0, nx, ny)];
        let c010 = f[idx3d(i0, j1, k0, nx, ny)];
        let c110 = f[idx3d(i1, j1, k0, nx, ny)];
        let c001 = f[idx3d(i0, j0, k1, nx, ny)];
        let c101 = f[idx3d(i1, j0, k1, nx, ny)];
        let c011 = f[idx3d(i0, j1, k1, nx, ny)];
        let c111 = f[idx3d(i1, j1, k1, nx, ny)];

        let c00 = c000 + fx * (c100 - c000);
        let c10 = c010 + fx * (c110 - c010);
        let c01 = c001 + fx * (c101 - c001);
        let c11 = c011 + fx * (c111 - c011);

        let c0 = c00 + fy * (c10 - c00);
        let c1 = c01 + fy * (c11 - c01);

        *o = c0 + fz * (c1 - c0);
    });
}

/// Wrap a (possibly negative) index into [0, n).
#[inline(always)]
fn wrap(i: i64, n: usize) -> usize {
    let n = n as i64;
    (((i % n) + n) % n) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_at_grid_points() {
        let grid = GridSize::new([4, 4, 4]);
        let f: Vec<f64> = (0..grid.nl()).map(|i| i as f64).collect();

        let [nx, ny, nz] = grid.nx;
        let mut q1 = vec![0.0; grid.nl()];
        let mut q2 = vec![0.0; grid.nl()];
        let mut q3 = vec![0.0; grid.nl()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    q1[idx] = i as f64;
                    q2[idx] = j as f64;
                    q3[idx] = k as f64;
                }
            }
        }
        let mut out = vec![0.0; grid.nl()];
        interpolate(&mut out, &f, &q1, &q2, &q3, grid);
        for (a, b) in out.iter().zip(f.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn test_interpolate_periodic_wrap() {
        let grid = GridSize::new([4, 4, 4]);
        let f: Vec<f64> = (0..grid.nl()).map(|i| (i % 7) as f64).collect();

        // querying one full period away reproduces the on-grid values
        let [nx, ny, nz] = grid.nx;
        let mut q1 = vec![0.0; grid.nl()];
        let mut q2 = vec![0.0; grid.nl()];
        let mut q3 = vec![0.0; grid.nl()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    q1[idx] = i as f64 - nx as f64;
                    q2[idx] = j as f64 + ny as f64;
                    q3[idx] = k as f64;
                }
            }
        }
        let mut out = vec![0.0; grid.nl()];
        interpolate(&mut out, &f, &q1, &q2, &q3, grid);
        for (a, b) in out.iter().zip(f.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn test_trajectory_zero_velocity_is_identity() {
        let grid = GridSize::new([4, 4, 4]);
        let v = VecField::new(grid).unwrap();
        let mut traj = Trajectory::new(grid);
        traj.compute(&v, 0.25, -1.0);

        let f: Vec<f64> = (0..grid.nl()).map(|i| (i as f64).sin()).collect();
        let mut out = vec![0.0; grid.nl()];
        traj.interpolate(&mut out, &f);
        for (a, b) in out.iter().zip(f.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn test_trajectory_constant_velocity_shift() {
        let grid = GridSize::new([8, 8, 8]);
        let h = grid.spacing();
        let mut v = VecField::new(grid).unwrap();
        // constant velocity of one grid cell per unit time along x
        v.x1.fill(h[0]);
        let mut traj = Trajectory::new(grid);
        traj.compute(&v, 1.0, -1.0);

        // f(x) sampled at X = x - h[0] equals the field shifted by one cell
        let [nx, ny, nz] = grid.nx;
        let mut f = vec![0.0; grid.nl()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    f[idx3d(i, j, k, nx, ny)] = i as f64;
                }
            }
        }
        let mut out = vec![0.0; grid.nl()];
        traj.interpolate(&mut out, &f);
        // at i = 0 the wrap brings in f = nx-1
        assert!((out[idx3d(1, 0, 0, nx, ny)] - 0.0).abs() < 1e-12);
        assert!((out[idx3d(2, 0, 0, nx, ny)] - 1.0).abs() < 1e-12);
        assert!((out[idx3d(0, 0, 0, nx, ny)] - (nx as f64 - 1.0)).abs() < 1e-12);
    }
}
