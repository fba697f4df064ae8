//! Spectral differential operators on the periodic grid.
//!
//! All operators are diagonal in Fourier space: transform, multiply by the
//! symbol, transform back. The service owns one FFT workspace per grid of
//! the fine/coarse pair and is re-pointed between them with `set_fft`
//! before restriction/prolongation-adjacent work, mirroring how the
//! two-level preconditioner drives it.

use num_complex::Complex64;

use crate::error::{ClaireError, Result};
use crate::fft::Fft3dWorkspace;
use crate::field::VecField;
use crate::grid::{idx3d, GridSize};

use super::wavenumber::{fold_wavenumber, fold_wavenumber_inv};

/// Which grid of the fine/coarse pair the service currently operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GridLevel {
    Fine,
    Coarse,
}

/// Spectral differentiation backend for the fine/coarse grid pair.
pub struct SpectralDiff {
    fine: Fft3dWorkspace,
    coarse: Fft3dWorkspace,
    level: GridLevel,
    // complex scratch, sized for the fine grid; coarse ops use a prefix
    buf_a: Vec<Complex64>,
    buf_b: Vec<Complex64>,
    buf_c: Vec<Complex64>,
}

impl SpectralDiff {
    /// Create the service for a fine grid and its coarse half.
    pub fn new(grid: GridSize) -> Self {
        let nl = grid.nl();
        Self {
            fine: Fft3dWorkspace::new(grid),
            coarse: Fft3dWorkspace::new(grid.coarsen()),
            level: GridLevel::Fine,
            buf_a: vec![Complex64::new(0.0, 0.0); nl],
            buf_b: vec![Complex64::new(0.0, 0.0); nl],
            buf_c: vec![Complex64::new(0.0, 0.0); nl],
        }
    }

    /// Re-point the service at one grid of the pair.
    pub fn set_fft(&mut self, grid: GridSize) -> Result<()> {
        if grid == self.fine.grid() {
            self.level = GridLevel::Fine;
            Ok(())
        } else if grid == self.coarse.grid() {
            self.level = GridLevel::Coarse;
            Ok(())
        } else {
            Err(ClaireError::invalid_state(format!(
                "grid {:?} is neither the fine nor the coarse grid",
                grid.nx
            )))
        }
    }

    /// Grid the service currently operates on.
    pub fn grid(&self) -> GridSize {
        match self.level {
            GridLevel::Fine => self.fine.grid(),
            GridLevel::Coarse => self.coarse.grid(),
        }
    }

    /// Fine grid of the pair.
    pub fn fine_grid(&self) -> GridSize {
        self.fine.grid()
    }

    /// Coarse grid of the pair.
    pub fn coarse_grid(&self) -> GridSize {
        self.coarse.grid()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let expected = self.grid().nl();
        if len != expected {
            return Err(ClaireError::DimensionMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    /// Gradient of a scalar field: out_d = ∂x_d m.
    pub fn gradient(&mut self, out: &mut VecField, m: &[f64]) -> Result<()> {
        self.check_len(m.len())?;
        let grid = self.grid();
        let n = grid.nl();
        let [nx, ny, nz] = grid.nx;

        let ws = match self.level {
            GridLevel::Fine => &mut self.fine,
            GridLevel::Coarse => &mut self.coarse,
        };

        let hat = &mut self.buf_a[..n];
        Fft3dWorkspace::load_real(hat, m);
        ws.fft3d(hat);

        let work = &mut self.buf_b[..n];
        for (d, comp) in out.components_mut().into_iter().enumerate() {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        let idx = idx3d(i, j, k, nx, ny);
                        let w = match d {
                            0 => fold_wavenumber(i, nx),
                            1 => fold_wavenumber(j, ny),
                            _ => fold_wavenumber(k, nz),
                        };
                        // i·w: multiply by the imaginary unit times the wavenumber
                        let h = hat[idx];
                        work[idx] = Complex64::new(-h.im, h.re) * w as f64;
                    }
                }
            }
            ws.ifft3d(work);
            Fft3dWorkspace::store_real(comp, work);
        }
        Ok(())
    }

    /// Divergence of a vector field: out = Σ_d ∂x_d v_d.
    pub fn divergence(&mut self, out: &mut [f64], v: &VecField) -> Result<()> {
        self.check_len(out.len())?;
        let grid = self.grid();
        let n = grid.nl();
        let [nx, ny, nz] = grid.nx;

        let ws = match self.level {
            GridLevel::Fine => &mut self.fine,
            GridLevel::Coarse => &mut self.coarse,
        };

        let acc = &mut self.buf_b[..n];
        acc.fill(Complex64::new(0.0, 0.0));

        let hat = &mut self.buf_a[..n];
        for (d, comp) in v.components().into_iter().enumerate() {
            Fft3dWorkspace::load_real(hat, comp);
            ws.fft3d(hat);
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        let idx = idx3d(i, j, k, nx, ny);
                        let w = match d {
                            0 => fold_wavenumber(i, nx),
                            1 => fold_wavenumber(j, ny),
                            _ => fold_wavenumber(k, nz),
                        };
                        let h = hat[idx];
                        acc[idx] += Complex64::new(-h.im, h.re) * w as f64;
                    }
                }
            }
        }
        ws.ifft3d(acc);
        Fft3dWorkspace::store_real(out, acc);
        Ok(())
    }

    /// Laplacian of a scalar field: out = Δx.
    pub fn laplacian(&mut self, out: &mut [f64], x: &[f64]) -> Result<()> {
        self.check_len(x.len())?;
        let grid = self.grid();
        let n = grid.nl();
        let [nx, ny, nz] = grid.nx;

        let ws = match self.level {
            GridLevel::Fine => &mut self.fine,
            GridLevel::Coarse => &mut self.coarse,
        };

        let hat = &mut self.buf_a[..n];
        Fft3dWorkspace::load_real(hat, x);
        ws.fft3d(hat);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    let w0 = fold_wavenumber(i, nx);
                    let w1 = fold_wavenumber(j, ny);
                    let w2 = fold_wavenumber(k, nz);
                    let lap = -((w0 * w0 + w1 * w1 + w2 * w2) as f64);
                    hat[idx] *= lap;
                }
            }
        }
        ws.ifft3d(hat);
        Fft3dWorkspace::store_real(out, hat);
        Ok(())
    }

    /// Apply the analytic inverse of the smoothing operator β(I - Δ) to
    /// every component of a vector field, the smoother of the H0
    /// preconditioner. `apply_sqrt` takes the square root of the symbol
    /// first (symmetric preconditioning).
    pub fn inv_reg_lap_op(
        &mut self,
        out: &mut VecField,
        x: &VecField,
        apply_sqrt: bool,
        beta: f64,
    ) -> Result<()> {
        if beta == 0.0 {
            return Err(ClaireError::DivideByZero("inv_reg_lap_op with beta = 0"));
        }
        self.apply_inverse_symbol(out, x, beta, beta, apply_sqrt, false)
    }

    /// Inverse smoothing operator with an optional Leray projection onto
    /// the divergence-free subspace (enabled by `beta_w > 0`). `beta_v`
    /// weights the Laplacian term of the symbol, `beta` the zero-order
    /// term that keeps it invertible.
    pub fn inv_reg_leray_op(
        &mut self,
        out: &mut VecField,
        x: &VecField,
        beta_v: f64,
        beta_w: f64,
        beta: f64,
    ) -> Result<()> {
        if beta == 0.0 {
            return Err(ClaireError::DivideByZero("inv_reg_leray_op with beta = 0"));
        }
        self.apply_inverse_symbol(out, x, beta, beta + beta_v, false, beta_w > 0.0)
    }

    /// Shared kernel of the two inverse operators: symbol
    /// 1/(a0 + a1·|w|²) on inversion-folded wavenumbers, optionally
    /// square-rooted, optionally Leray-projected.
    fn apply_inverse_symbol(
        &mut self,
        out: &mut VecField,
        x: &VecField,
        a0: f64,
        a1: f64,
        apply_sqrt: bool,
        project: bool,
    ) -> Result<()> {
        self.check_len(x.nl())?;
        self.check_len(out.nl())?;
        let grid = self.grid();
        let n = grid.nl();
        let [nx, ny, nz] = grid.nx;

        let ws = match self.level {
            GridLevel::Fine => &mut self.fine,
            GridLevel::Coarse => &mut self.coarse,
        };

        // forward transform all three components
        let hat1 = &mut self.buf_a[..n];
        let hat2 = &mut self.buf_b[..n];
        let hat3 = &mut self.buf_c[..n];
        Fft3dWorkspace::load_real(hat1, &x.x1);
        ws.fft3d(hat1);
        Fft3dWorkspace::load_real(hat2, &x.x2);
        ws.fft3d(hat2);
        Fft3dWorkspace::load_real(hat3, &x.x3);
        ws.fft3d(hat3);

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    let w0 = fold_wavenumber_inv(i, nx) as f64;
                    let w1 = fold_wavenumber_inv(j, ny) as f64;
                    let w2 = fold_wavenumber_inv(k, nz) as f64;
                    let wsq = w0 * w0 + w1 * w1 + w2 * w2;

                    if project && wsq > 0.0 {
                        // Leray projection: remove the gradient component
                        let dot = hat1[idx] * w0 + hat2[idx] * w1 + hat3[idx] * w2;
                        let s = dot / wsq;
                        hat1[idx] -= s * w0;
                        hat2[idx] -= s * w1;
                        hat3[idx] -= s * w2;
                    }

                    let mut regop = a0 + a1 * wsq;
                    if apply_sqrt {
                        regop = regop.sqrt();
                    }
                    let inv = 1.0 / regop;
                    hat1[idx] *= inv;
                    hat2[idx] *= inv;
                    hat3[idx] *= inv;
                }
            }
        }

        ws.ifft3d(hat1);
        Fft3dWorkspace::store_real(&mut out.x1, hat1);
        ws.ifft3d(hat2);
        Fft3dWorkspace::store_real(&mut out.x2, hat2);
        ws.ifft3d(hat3);
        Fft3dWorkspace::store_real(&mut out.x3, hat3);
        Ok(())
    }

    /// Spectral restriction of a fine-grid scalar field onto the coarse
    /// grid: keep the Fourier modes representable on the coarse grid,
    /// zero the coarse Nyquist planes.
    pub fn restrict(&mut self, out: &mut [f64], x: &[f64], coarse: GridSize) -> Result<()> {
        if coarse != self.coarse.grid() {
            return Err(ClaireError::invalid_state(
                "restriction target is not the coarse grid of the pair".to_string(),
            ));
        }
        let fine = self.fine.grid();
        if x.len() != fine.nl() {
            return Err(ClaireError::DimensionMismatch {
                expected: fine.nl(),
                actual: x.len(),
            });
        }
        if out.len() != coarse.nl() {
            return Err(ClaireError::DimensionMismatch {
                expected: coarse.nl(),
                actual: out.len(),
            });
        }

        let nf = fine.nl();
        let nc = coarse.nl();
        let [fnx, fny, _fnz] = fine.nx;
        let [cnx, cny, cnz] = coarse.nx;

        let hat = &mut self.buf_a[..nf];
        Fft3dWorkspace::load_real(hat, x);
        self.fine.fft3d(hat);

        let scale = nc as f64 / nf as f64;
        let chat = &mut self.buf_b[..nc];
        chat.fill(Complex64::new(0.0, 0.0));
        for k in 0..cnz {
            for j in 0..cny {
                for i in 0..cnx {
                    let w0 = fold_wavenumber_inv(i, cnx);
                    let w1 = fold_wavenumber_inv(j, cny);
                    let w2 = fold_wavenumber_inv(k, cnz);
                    // drop the coarse Nyquist planes: their conjugate
                    // partners do not exist on the coarse grid
                    if 2 * w0 == cnx as i64 || 2 * w1 == cny as i64 || 2 * w2 == cnz as i64 {
                        continue;
                    }
                    let fi = wrap_index(w0, fine.nx[0]);
                    let fj = wrap_index(w1, fine.nx[1]);
                    let fk = wrap_index(w2, fine.nx[2]);
                    chat[idx3d(i, j, k, cnx, cny)] =
                        hat[idx3d(fi, fj, fk, fnx, fny)] * scale;
                }
            }
        }
        self.coarse.ifft3d(chat);
        Fft3dWorkspace::store_real(out, chat);
        Ok(())
    }

    /// Spectral prolongation of a coarse-grid scalar field onto the fine
    /// grid: zero-pad the spectrum.
    pub fn prolong(&mut self, out: &mut [f64], x: &[f64], coarse: GridSize) -> Result<()> {
        if coarse != self.coarse.grid() {
            return Err(ClaireError::invalid_state(
                "prolongation source is not the coarse grid of the pair".to_string(),
            ));
        }
        let fine = self.fine.grid();
        if x.len() != coarse.nl() {
            return Err(ClaireError::DimensionMismatch {
                expected: coarse.nl(),
                actual: x.len(),
            });
        }
        if out.len() != fine.nl() {
            return Err(ClaireError::DimensionMismatch {
                expected: fine.nl(),
                actual: out.len(),
            });
        }

        let nf = fine.nl();
        let nc = coarse.nl();
        let [fnx, fny, _fnz] = fine.nx;
        let [cnx, cny, cnz] = coarse.nx;

        let chat = &mut self.buf_a[..nc];
        Fft3dWorkspace::load_real(chat, x);
        self.coarse.fft3d(chat);

        let scale = nf as f64 / nc as f64;
        let hat = &mut self.buf_b[..nf];
        hat.fill(Complex64::new(0.0, 0.0));
        for k in 0..cnz {
            for j in 0..cny {
                for i in 0..cnx {
                    let w0 = fold_wavenumber_inv(i, cnx);
                    let w1 = fold_wavenumber_inv(j, cny);
                    let w2 = fold_wavenumber_inv(k, cnz);
                    if 2 * w0 == cnx as i64 || 2 * w1 == cny as i64 || 2 * w2 == cnz as i64 {
                        continue;
                    }
                    let fi = wrap_index(w0, fine.nx[0]);
                    let fj = wrap_index(w1, fine.nx[1]);
                    let fk = wrap_index(w2, fine.nx[2]);
                    hat[idx3d(fi, fj, fk, fnx, fny)] =
                        chat[idx3d(i, j, k, cnx, cny)] * scale;
                }
            }
        }
        self.fine.ifft3d(hat);
        Fft3dWorkspace::store_real(out, hat);
        Ok(())
    }
}

/// Map a signed wavenumber back to the raw FFT index of a grid axis.
#[inline]
fn wrap_index(w: i64, n: usize) -> usize {
    if w < 0 {
        (w + n as i64) as usize
    } else {
        w as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_coords(grid: GridSize) -> Vec<(f64, f64, f64)> {
        let [nx, ny, nz] = grid.nx;
        let h = grid.spacing();
        let mut out = vec![(0.0, 0.0, 0.0); grid.nl()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    out[idx3d(i, j, k, nx, ny)] =
                        (i as f64 * h[0], j as f64 * h[1], k as f64 * h[2]);
                }
            }
        }
        out
    }

    #[test]
    fn test_gradient_of_sine() {
        let grid = GridSize::new([16, 16, 16]);
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);

        let m: Vec<f64> = coords.iter().map(|&(x, _, _)| x.sin()).collect();
        let mut g = VecField::new(grid).unwrap();
        diff.gradient(&mut g, &m).unwrap();

        for (idx, &(x, _, _)) in coords.iter().enumerate() {
            assert!(
                (g.x1[idx] - x.cos()).abs() < 1e-10,
                "d/dx sin(x) mismatch at {}",
                idx
            );
            assert!(g.x2[idx].abs() < 1e-10);
            assert!(g.x3[idx].abs() < 1e-10);
        }
    }

    #[test]
    fn test_divergence_matches_gradient_sum() {
        let grid = GridSize::new([8, 8, 8]);
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);

        let mut v = VecField::new(grid).unwrap();
        for (idx, &(x, y, z)) in coords.iter().enumerate() {
            v.x1[idx] = x.sin();
            v.x2[idx] = (2.0 * y).cos();
            v.x3[idx] = z.sin() * 0.5;
        }
        let mut div = vec![0.0; grid.nl()];
        diff.divergence(&mut div, &v).unwrap();

        for (idx, &(x, y, z)) in coords.iter().enumerate() {
            let expected = x.cos() - 2.0 * (2.0 * y).sin() + 0.5 * z.cos();
            assert!(
                (div[idx] - expected).abs() < 1e-9,
                "divergence mismatch at {}: {} vs {}",
                idx,
                div[idx],
                expected
            );
        }
    }

    #[test]
    fn test_laplacian_of_sine() {
        let grid = GridSize::new([8, 8, 8]);
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);

        let m: Vec<f64> = coords.iter().map(|&(_, y, _)| (2.0 * y).sin()).collect();
        let mut lap = vec![0.0; grid.nl()];
        diff.laplacian(&mut lap, &m).unwrap();

        for (idx, &(_, y, _)) in coords.iter().enumerate() {
            assert!((lap[idx] + 4.0 * (2.0 * y).sin()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_restrict_prolong_constant() {
        let grid = GridSize::new([8, 8, 8]);
        let coarse = grid.coarsen();
        let mut diff = SpectralDiff::new(grid);

        let x = vec![3.5; grid.nl()];
        let mut xc = vec![0.0; coarse.nl()];
        diff.restrict(&mut xc, &x, coarse).unwrap();
        for &v in xc.iter() {
            assert!((v - 3.5).abs() < 1e-12, "restriction must preserve constants");
        }

        let mut xf = vec![0.0; grid.nl()];
        diff.prolong(&mut xf, &xc, coarse).unwrap();
        for &v in xf.iter() {
            assert!((v - 3.5).abs() < 1e-12, "prolongation must preserve constants");
        }
    }

    #[test]
    fn test_restrict_preserves_low_modes() {
        let grid = GridSize::new([16, 16, 16]);
        let coarse = grid.coarsen();
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);

        // a mode representable on the coarse grid survives restriction
        let x: Vec<f64> = coords.iter().map(|&(x, y, _)| (x + 2.0 * y).sin()).collect();
        let mut xc = vec![0.0; coarse.nl()];
        diff.restrict(&mut xc, &x, coarse).unwrap();

        let ccoords = grid_coords(coarse);
        for (idx, &(x, y, _)) in ccoords.iter().enumerate() {
            assert!(
                (xc[idx] - (x + 2.0 * y).sin()).abs() < 1e-10,
                "low mode altered by restriction at {}",
                idx
            );
        }
    }

    #[test]
    fn test_inv_reg_lap_op_inverts_smoother() {
        let grid = GridSize::new([8, 8, 8]);
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);
        let beta = 0.3;

        // forward operator β(I - Δ) applied to sin(x) is β(1+1)·sin(x)
        let mut x = VecField::new(grid).unwrap();
        for (idx, &(cx, _, _)) in coords.iter().enumerate() {
            x.x1[idx] = 2.0 * beta * cx.sin();
        }
        let mut out = VecField::new(grid).unwrap();
        diff.inv_reg_lap_op(&mut out, &x, false, beta).unwrap();
        for (idx, &(cx, _, _)) in coords.iter().enumerate() {
            assert!((out.x1[idx] - cx.sin()).abs() < 1e-10);
        }
    }

    #[test]
    fn test_leray_projection_removes_gradient_part() {
        let grid = GridSize::new([8, 8, 8]);
        let mut diff = SpectralDiff::new(grid);
        let coords = grid_coords(grid);

        // pure gradient field v = ∇ sin(x) projects to (near) zero
        let mut v = VecField::new(grid).unwrap();
        for (idx, &(x, _, _)) in coords.iter().enumerate() {
            v.x1[idx] = x.cos();
        }
        let mut out = VecField::new(grid).unwrap();
        diff.inv_reg_leray_op(&mut out, &v, 1.0, 1.0, 1.0).unwrap();
        assert!(
            out.norm_inf() < 1e-10,
            "gradient field must vanish under the Leray projection, got {}",
            out.norm_inf()
        );
    }

    #[test]
    fn test_set_fft_rejects_unknown_grid() {
        let mut diff = SpectralDiff::new(GridSize::new([8, 8, 8]));
        assert!(diff.set_fft(GridSize::new([6, 6, 6])).is_err());
        assert!(diff.set_fft(GridSize::new([4, 4, 4])).is_ok());
        assert_eq!(diff.grid().nx, [4, 4, 4]);
    }
}
