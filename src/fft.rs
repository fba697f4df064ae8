//! 3D FFT workspace built on rustfft.
//!
//! Caches forward/inverse plans and scratch buffers for one grid size and
//! performs in-place complex-to-complex transforms axis by axis. Data is
//! stored in Fortran (column-major) order, so the x-axis is contiguous and
//! the y/z axes are gathered through small strided buffers.

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

use crate::grid::{idx3d, GridSize};

/// FFT workspace that caches plans and scratch buffers for reuse.
pub struct Fft3dWorkspace {
    grid: GridSize,
    n_total: usize,
    // Forward FFT plans
    fft_x: Arc<dyn Fft<f64>>,
    fft_y: Arc<dyn Fft<f64>>,
    fft_z: Arc<dyn Fft<f64>>,
    // Inverse FFT plans
    ifft_x: Arc<dyn Fft<f64>>,
    ifft_y: Arc<dyn Fft<f64>>,
    ifft_z: Arc<dyn Fft<f64>>,
    // Scratch buffers
    scratch_x: Vec<Complex64>,
    scratch_y: Vec<Complex64>,
    scratch_z: Vec<Complex64>,
    buffer_y: Vec<Complex64>,
    buffer_z: Vec<Complex64>,
}

impl Fft3dWorkspace {
    /// Create a new FFT workspace for the given grid.
    pub fn new(grid: GridSize) -> Self {
        let [nx, ny, nz] = grid.nx;
        let mut planner = FftPlanner::new();

        let fft_x = planner.plan_fft(nx, FftDirection::Forward);
        let fft_y = planner.plan_fft(ny, FftDirection::Forward);
        let fft_z = planner.plan_fft(nz, FftDirection::Forward);

        let ifft_x = planner.plan_fft(nx, FftDirection::Inverse);
        let ifft_y = planner.plan_fft(ny, FftDirection::Inverse);
        let ifft_z = planner.plan_fft(nz, FftDirection::Inverse);

        let scratch_x = vec![
            Complex64::new(0.0, 0.0);
            fft_x.get_inplace_scratch_len().max(ifft_x.get_inplace_scratch_len())
        ];
        let scratch_y = vec![
            Complex64::new(0.0, 0.0);
            fft_y.get_inplace_scratch_len().max(ifft_y.get_inplace_scratch_len())
        ];
        let scratch_z = vec![
            Complex64::new(0.0, 0.0);
            fft_z.get_inplace_scratch_len().max(ifft_z.get_inplace_scratch_len())
        ];

        Self {
            grid,
            n_total: grid.nl(),
            fft_x,
            fft_y,
            fft_z,
            ifft_x,
            ifft_y,
            ifft_z,
            scratch_x,
            scratch_y,
            scratch_z,
            buffer_y: vec![Complex64::new(0.0, 0.0); ny],
            buffer_z: vec![Complex64::new(0.0, 0.0); nz],
        }
    }

    /// Grid this workspace is planned for.
    pub fn grid(&self) -> GridSize {
        self.grid
    }

    /// In-place forward 3D FFT.
    pub fn fft3d(&mut self, data: &mut [Complex64]) {
        let [nx, ny, nz] = self.grid.nx;

        // Transform along x-axis (contiguous in Fortran order)
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                self.fft_x
                    .process_with_scratch(&mut data[start..start + nx], &mut self.scratch_x);
            }
        }

        // Transform along y-axis
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    self.buffer_y[j] = data[idx3d(i, j, k, nx, ny)];
                }
                self.fft_y
                    .process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_y[j];
                }
            }
        }

        // Transform along z-axis
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    self.buffer_z[k] = data[idx3d(i, j, k, nx, ny)];
                }
                self.fft_z
                    .process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_z[k];
                }
            }
        }
    }

    /// In-place inverse 3D FFT (with 1/N normalization).
    pub fn ifft3d(&mut self, data: &mut [Complex64]) {
        let [nx, ny, nz] = self.grid.nx;
        let n_total = self.n_total as f64;

        // Transform along x-axis
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                self.ifft_x
                    .process_with_scratch(&mut data[start..start + nx], &mut self.scratch_x);
            }
        }

        // Transform along y-axis
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    self.buffer_y[j] = data[idx3d(i, j, k, nx, ny)];
                }
                self.ifft_y
                    .process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_y[j];
                }
            }
        }

        // Transform along z-axis
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    self.buffer_z[k] = data[idx3d(i, j, k, nx, ny)];
                }
                self.ifft_z
                    .process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_z[k];
                }
            }
        }

        // Normalize
        for val in data.iter_mut() {
            *val /= n_total;
        }
    }

    /// Load a real field into the complex buffer, imaginary parts zeroed.
    #[inline]
    pub fn load_real(buf: &mut [Complex64], x: &[f64]) {
        for (c, &r) in buf.iter_mut().zip(x.iter()) {
            *c = Complex64::new(r, 0.0);
        }
    }

    /// Extract the real part of the complex buffer into a real field.
    #[inline]
    pub fn store_real(out: &mut [f64], buf: &[Complex64]) {
        for (o, c) in out.iter_mut().zip(buf.iter()) {
            *o = c.re;
        }
    }

    /// Apply a real spectral symbol in-place: out = real(ifft(symbol · fft(x))).
    ///
    /// `symbol` is a per-wavenumber real multiplier of length n_total.
    pub fn apply_symbol(
        &mut self,
        x: &[f64],
        symbol: &[f64],
        out: &mut [f64],
        complex_buf: &mut [Complex64],
    ) {
        Self::load_real(complex_buf, x);
        self.fft3d(complex_buf);
        for (c, &s) in complex_buf.iter_mut().zip(symbol.iter()) {
            *c *= s;
        }
        self.ifft3d(complex_buf);
        Self::store_real(out, complex_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fft_ifft_roundtrip() {
        let grid = GridSize::new([4, 4, 4]);
        let mut ws = Fft3dWorkspace::new(grid);

        let original: Vec<f64> = (0..grid.nl()).map(|i| i as f64).collect();
        let mut data: Vec<Complex64> = original
            .iter()
            .map(|&x| Complex64::new(x, 0.0))
            .collect();

        ws.fft3d(&mut data);
        ws.ifft3d(&mut data);

        for (i, (&orig, result)) in original.iter().zip(data.iter()).enumerate() {
            assert!(
                (result.re - orig).abs() < 1e-10,
                "mismatch at index {}: expected {}, got {}",
                i,
                orig,
                result.re
            );
            assert!(result.im.abs() < 1e-10);
        }
    }

    #[test]
    fn test_apply_identity_symbol() {
        let grid = GridSize::new([4, 4, 4]);
        let mut ws = Fft3dWorkspace::new(grid);
        let n = grid.nl();

        let x: Vec<f64> = (0..n).map(|i| ((i as f64) * 0.3).sin()).collect();
        let symbol = vec![1.0; n];
        let mut out = vec![0.0; n];
        let mut buf = vec![Complex64::new(0.0, 0.0); n];

        ws.apply_symbol(&x, &symbol, &mut out, &mut buf);

        for (a, b) in x.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
