//! Regularization model for the velocity field.
//!
//! Evaluates the smoothing functional R(v) = ½‖Lv‖² and its variations for
//! the supported Sobolev norms. All operators are diagonal in Fourier
//! space, so the functional is evaluated through Parseval's identity and
//! the operator inverse is an analytic per-wavenumber division.
//!
//! Forward operator symbols use the Nyquist-zeroing wavenumber fold; the
//! inversion path uses the signed fold without Nyquist zeroing. See
//! `diff::wavenumber` for why the two differ.

use num_complex::Complex64;

use crate::config::RegNorm;
use crate::diff::{fold_wavenumber, fold_wavenumber_inv};
use crate::error::{ClaireError, Result};
use crate::fft::Fft3dWorkspace;
use crate::field::VecField;
use crate::grid::{idx3d, GridSize};

/// Regularization model: functional, first/second variation, analytic
/// inverse of the operator induced by the chosen norm.
pub struct RegularizationModel {
    norm: RegNorm,
    /// [βv, βw]: differential and zero-order weights.
    beta: [f64; 2],
    grid: GridSize,
    ws: Fft3dWorkspace,
    hat: [Vec<Complex64>; 3],
}

impl RegularizationModel {
    pub fn new(grid: GridSize, norm: RegNorm, beta_v: f64, beta_w: f64) -> Self {
        let nl = grid.nl();
        let zero = vec![Complex64::new(0.0, 0.0); nl];
        // seminorms have no zero-order term by definition
        let beta_w = match norm {
            RegNorm::H1Seminorm | RegNorm::H2Seminorm => 0.0,
            _ => beta_w,
        };
        Self {
            norm,
            beta: [beta_v, beta_w],
            grid,
            ws: Fft3dWorkspace::new(grid),
            hat: [zero.clone(), zero.clone(), zero],
        }
    }

    /// Current regularization weights [βv, βw].
    pub fn beta(&self) -> [f64; 2] {
        self.beta
    }

    /// Update the differential weight (parameter continuation).
    pub fn set_beta_v(&mut self, beta_v: f64) {
        self.beta[0] = beta_v;
    }

    /// Power of |w|² in the differential symbol.
    #[inline]
    fn order(&self) -> i32 {
        match self.norm {
            RegNorm::H1 | RegNorm::H1Seminorm => 1,
            RegNorm::H2 | RegNorm::H2Seminorm => 2,
        }
    }

    /// Operator symbol a(w) = βv·(|w|²)^p + βw on a pre-folded |w|².
    #[inline]
    fn symbol(&self, wsq: f64) -> f64 {
        self.beta[0] * wsq.powi(self.order()) + self.beta[1]
    }

    #[inline]
    fn weights_are_zero(&self) -> bool {
        self.beta[0] == 0.0 && self.beta[1] == 0.0
    }

    fn check_len(&self, v: &VecField) -> Result<()> {
        if v.nl() != self.grid.nl() {
            return Err(ClaireError::DimensionMismatch {
                expected: self.grid.nl(),
                actual: v.nl(),
            });
        }
        Ok(())
    }

    fn fft_components(&mut self, v: &VecField) {
        let n = self.grid.nl();
        for (hat, comp) in self.hat.iter_mut().zip(v.components().into_iter()) {
            Fft3dWorkspace::load_real(&mut hat[..n], comp);
            self.ws.fft3d(&mut hat[..n]);
        }
    }

    /// Evaluate R(v) = ½‖Lv‖². Returns 0 without computation if all
    /// weights are zero.
    pub fn evaluate_functional(&mut self, v: &VecField) -> Result<f64> {
        if self.weights_are_zero() {
            return Ok(0.0);
        }
        self.check_len(v)?;

        let [nx, ny, nz] = self.grid.nx;
        let n = self.grid.nl();
        let hd = self.grid.cell_measure();

        self.fft_components(v);

        // Parseval: Σ_x |Lv|² = (1/N)·Σ_k a(w)·|v̂_k|², a being the
        // symbol of L*L
        let mut r = 0.0;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    let w0 = fold_wavenumber(i, nx) as f64;
                    let w1 = fold_wavenumber(j, ny) as f64;
                    let w2 = fold_wavenumber(k, nz) as f64;
                    let a = self.symbol(w0 * w0 + w1 * w1 + w2 * w2);
                    let e = self.hat[0][idx].norm_sqr()
                        + self.hat[1][idx].norm_sqr()
                        + self.hat[2][idx].norm_sqr();
                    r += a * e;
                }
            }
        }
        Ok(0.5 * hd * r / n as f64)
    }

    /// First variation: dvR = L*L v = A[v]. Writes zero if all weights
    /// are zero.
    pub fn evaluate_gradient(&mut self, dv_r: &mut VecField, v: &VecField) -> Result<()> {
        if self.weights_are_zero() {
            dv_r.set(0.0);
            return Ok(());
        }
        self.check_len(v)?;
        self.check_len(dv_r)?;

        let [nx, ny, nz] = self.grid.nx;
        let n = self.grid.nl();

        self.fft_components(v);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    let w0 = fold_wavenumber(i, nx) as f64;
                    let w1 = fold_wavenumber(j, ny) as f64;
                    let w2 = fold_wavenumber(k, nz) as f64;
                    let a = self.symbol(w0 * w0 + w1 * w1 + w2 * w2);
                    self.hat[0][idx] *= a;
                    self.hat[1][idx] *= a;
                    self.hat[2][idx] *= a;
                }
            }
        }

        for (hat, comp) in self.hat.iter_mut().zip(dv_r.components_mut().into_iter()) {
            self.ws.ifft3d(&mut hat[..n]);
            Fft3dWorkspace::store_real(comp, &hat[..n]);
        }
        Ok(())
    }

    /// Second variation applied to a perturbation. For the quadratic
    /// norms supported here this equals the first variation.
    pub fn hessian_matvec(&mut self, dvv_r: &mut VecField, vtilde: &VecField) -> Result<()> {
        self.evaluate_gradient(dvv_r, vtilde)
    }

    /// Analytic inverse of the regularization operator. With all weights
    /// zero the operator collapses to the identity and the input is
    /// copied through. `apply_sqrt` inverts the symmetric square root
    /// instead. Seminorm zero modes (symbol 0) pass through unchanged.
    pub fn apply_inverse(
        &mut self,
        ainv_x: &mut VecField,
        x: &VecField,
        apply_sqrt: bool,
    ) -> Result<()> {
        if self.weights_are_zero() {
            ainv_x.copy_from(x)?;
            return Ok(());
        }
        self.check_len(x)?;
        self.check_len(ainv_x)?;

        let [nx, ny, nz] = self.grid.nx;
        let n = self.grid.nl();

        self.fft_components(x);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    let w0 = fold_wavenumber_inv(i, nx) as f64;
                    let w1 = fold_wavenumber_inv(j, ny) as f64;
                    let w2 = fold_wavenumber_inv(k, nz) as f64;
                    let mut a = self.symbol(w0 * w0 + w1 * w1 + w2 * w2);
                    if a == 0.0 {
                        // seminorm nullspace (constant mode): identity
                        continue;
                    }
                    if apply_sqrt {
                        a = a.sqrt();
                    }
                    let inv = 1.0 / a;
                    self.hat[0][idx] *= inv;
                    self.hat[1][idx] *= inv;
                    self.hat[2][idx] *= inv;
                }
            }
        }

        for (hat, comp) in self.hat.iter_mut().zip(ainv_x.components_mut().into_iter()) {
            self.ws.ifft3d(&mut hat[..n]);
            Fft3dWorkspace::store_real(comp, &hat[..n]);
        }
        Ok(())
    }

    /// Extreme eigenvalues of the inverse operator, used for step-size
    /// heuristics and preconditioner scaling.
    pub fn extreme_eigvals_inv_op(&self) -> (f64, f64) {
        let w = [
            self.grid.nx[0] as f64 / 2.0,
            self.grid.nx[1] as f64 / 2.0,
            self.grid.nx[2] as f64 / 2.0,
        ];
        let wsq_max = w[0] * w[0] + w[1] * w[1] + w[2] * w[2];
        let emin = 1.0 / self.symbol(wsq_max);
        let emax = if self.beta[1] > 0.0 {
            1.0 / self.beta[1]
        } else if self.beta[0] > 0.0 {
            // seminorm: smallest nonzero mode has |w|² = 1
            1.0 / self.symbol(1.0)
        } else {
            1.0
        };
        (emin, emax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_field(grid: GridSize) -> VecField {
        let [nx, ny, nz] = grid.nx;
        let h = grid.spacing();
        let mut v = VecField::new(grid).unwrap();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    v.x1[idx] = (i as f64 * h[0]).sin();
                    v.x2[idx] = (j as f64 * h[1]).cos();
                    v.x3[idx] = 0.0;
                }
            }
        }
        v
    }

    #[test]
    fn test_zero_weights_identity() {
        let grid = GridSize::new([8, 8, 8]);
        let mut reg = RegularizationModel::new(grid, RegNorm::H2, 0.0, 0.0);
        let v = sine_field(grid);

        assert_eq!(reg.evaluate_functional(&v).unwrap(), 0.0);

        let mut out = VecField::new(grid).unwrap();
        reg.apply_inverse(&mut out, &v, false).unwrap();
        for (a, b) in out.x1.iter().zip(v.x1.iter()) {
            assert_eq!(a, b, "zero-weight inverse must be the exact identity");
        }

        reg.evaluate_gradient(&mut out, &v).unwrap();
        assert_eq!(out.norm_inf(), 0.0);
    }

    #[test]
    fn test_h1_functional_analytic() {
        // v = (sin(x), 0, 0): ‖∇v‖² integrates cos²(x) over [0,2π)³,
        // so R = ½·βv·(2π)³/2 for H1 with βw = 0
        let grid = GridSize::new([16, 16, 16]);
        let beta_v = 0.25;
        let mut reg = RegularizationModel::new(grid, RegNorm::H1Seminorm, beta_v, 0.0);
        let [nx, ny, nz] = grid.nx;
        let h = grid.spacing();
        let mut v = VecField::new(grid).unwrap();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    v.x1[idx3d(i, j, k, nx, ny)] = (i as f64 * h[0]).sin();
                }
            }
        }
        let r = reg.evaluate_functional(&v).unwrap();
        let vol = (2.0 * std::f64::consts::PI).powi(3);
        let expected = 0.5 * beta_v * vol / 2.0;
        assert!(
            (r - expected).abs() < 1e-8 * expected.abs(),
            "H1 functional: got {}, expected {}",
            r,
            expected
        );
    }

    #[test]
    fn test_gradient_inverse_roundtrip() {
        let grid = GridSize::new([8, 8, 8]);
        let mut reg = RegularizationModel::new(grid, RegNorm::H2, 1e-2, 1e-4);
        let v = sine_field(grid);

        let mut av = VecField::new(grid).unwrap();
        reg.evaluate_gradient(&mut av, &v).unwrap();
        let mut back = VecField::new(grid).unwrap();
        reg.apply_inverse(&mut back, &av, false).unwrap();

        // A⁻¹A = identity on fields without Nyquist content
        for (a, b) in back.x1.iter().zip(v.x1.iter()) {
            assert!((a - b).abs() < 1e-9, "roundtrip mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_sqrt_inverse_composes() {
        let grid = GridSize::new([8, 8, 8]);
        let mut reg = RegularizationModel::new(grid, RegNorm::H2, 1e-1, 1e-2);
        let v = sine_field(grid);

        let mut once = VecField::new(grid).unwrap();
        reg.apply_inverse(&mut once, &v, true).unwrap();
        let mut twice = VecField::new(grid).unwrap();
        reg.apply_inverse(&mut twice, &once, true).unwrap();

        let mut full = VecField::new(grid).unwrap();
        reg.apply_inverse(&mut full, &v, false).unwrap();

        for (a, b) in twice.x1.iter().zip(full.x1.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_extreme_eigvals() {
        let grid = GridSize::new([8, 8, 8]);
        let reg = RegularizationModel::new(grid, RegNorm::H2, 1e-2, 1e-4);
        let (emin, emax) = reg.extreme_eigvals_inv_op();
        assert!(emin > 0.0 && emax > 0.0);
        assert!(emin < emax);
        assert!((emax - 1e4).abs() < 1e-9);
    }

    #[test]
    fn test_hessian_matvec_equals_gradient() {
        let grid = GridSize::new([8, 8, 8]);
        let mut reg = RegularizationModel::new(grid, RegNorm::H1, 1e-2, 1e-3);
        let v = sine_field(grid);

        let mut a = VecField::new(grid).unwrap();
        let mut b = VecField::new(grid).unwrap();
        reg.evaluate_gradient(&mut a, &v).unwrap();
        reg.hessian_matvec(&mut b, &v).unwrap();
        for (x, y) in a.x1.iter().zip(b.x1.iter()) {
            assert_eq!(x, y);
        }
    }
}
