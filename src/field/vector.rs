//! Vector field: three co-located scalar components sharing one layout.
//!
//! The control variable (velocity) is stationary in time, so vector fields
//! carry no time dimension. Linear-algebra helpers mirror the operations
//! the optimization loop needs: axpy, waxpy, scale, dot products and norms.

use crate::error::{ClaireError, Result};
use crate::grid::GridSize;

/// Vector field with components x1, x2, x3 over the local grid.
#[derive(Clone, Debug)]
pub struct VecField {
    pub x1: Vec<f64>,
    pub x2: Vec<f64>,
    pub x3: Vec<f64>,
    nl: usize,
}

impl VecField {
    /// Allocate a zero vector field on the given grid.
    pub fn new(grid: GridSize) -> Result<Self> {
        let nl = grid.nl();
        let mut x1 = Vec::new();
        x1.try_reserve_exact(nl)
            .map_err(|e| ClaireError::AllocationFailure(e.to_string()))?;
        x1.resize(nl, 0.0);
        Ok(Self {
            x2: x1.clone(),
            x3: x1.clone(),
            x1,
            nl,
        })
    }

    #[inline]
    pub fn nl(&self) -> usize {
        self.nl
    }

    /// Components as an array of slices.
    #[inline]
    pub fn components(&self) -> [&[f64]; 3] {
        [&self.x1, &self.x2, &self.x3]
    }

    /// Components as an array of mutable slices.
    #[inline]
    pub fn components_mut(&mut self) -> [&mut [f64]; 3] {
        [&mut self.x1, &mut self.x2, &mut self.x3]
    }

    /// Set all components to a constant.
    pub fn set(&mut self, value: f64) {
        self.x1.fill(value);
        self.x2.fill(value);
        self.x3.fill(value);
    }

    /// Copy another field of identical size.
    pub fn copy_from(&mut self, other: &VecField) -> Result<()> {
        if other.nl != self.nl {
            return Err(ClaireError::DimensionMismatch {
                expected: self.nl,
                actual: other.nl,
            });
        }
        self.x1.copy_from_slice(&other.x1);
        self.x2.copy_from_slice(&other.x2);
        self.x3.copy_from_slice(&other.x3);
        Ok(())
    }

    /// Load components from one flat buffer of length 3*nl, laid out
    /// [x1 | x2 | x3].
    pub fn set_components(&mut self, flat: &[f64]) -> Result<()> {
        if flat.len() != 3 * self.nl {
            return Err(ClaireError::DimensionMismatch {
                expected: 3 * self.nl,
                actual: flat.len(),
            });
        }
        self.x1.copy_from_slice(&flat[..self.nl]);
        self.x2.copy_from_slice(&flat[self.nl..2 * self.nl]);
        self.x3.copy_from_slice(&flat[2 * self.nl..]);
        Ok(())
    }

    /// Store components into one flat buffer of length 3*nl.
    pub fn get_components(&self, flat: &mut [f64]) -> Result<()> {
        if flat.len() != 3 * self.nl {
            return Err(ClaireError::DimensionMismatch {
                expected: 3 * self.nl,
                actual: flat.len(),
            });
        }
        flat[..self.nl].copy_from_slice(&self.x1);
        flat[self.nl..2 * self.nl].copy_from_slice(&self.x2);
        flat[2 * self.nl..].copy_from_slice(&self.x3);
        Ok(())
    }

    /// self += a * other
    pub fn axpy(&mut self, a: f64, other: &VecField) {
        for (y, &x) in self.x1.iter_mut().zip(other.x1.iter()) {
            *y += a * x;
        }
        for (y, &x) in self.x2.iter_mut().zip(other.x2.iter()) {
            *y += a * x;
        }
        for (y, &x) in self.x3.iter_mut().zip(other.x3.iter()) {
            *y += a * x;
        }
    }

    /// self = a * x + y
    pub fn waxpy(&mut self, a: f64, x: &VecField, y: &VecField) {
        for ((w, &xi), &yi) in self.x1.iter_mut().zip(x.x1.iter()).zip(y.x1.iter()) {
            *w = a * xi + yi;
        }
        for ((w, &xi), &yi) in self.x2.iter_mut().zip(x.x2.iter()).zip(y.x2.iter()) {
            *w = a * xi + yi;
        }
        for ((w, &xi), &yi) in self.x3.iter_mut().zip(x.x3.iter()).zip(y.x3.iter()) {
            *w = a * xi + yi;
        }
    }

    /// self *= a
    pub fn scale(&mut self, a: f64) {
        for v in self.x1.iter_mut() {
            *v *= a;
        }
        for v in self.x2.iter_mut() {
            *v *= a;
        }
        for v in self.x3.iter_mut() {
            *v *= a;
        }
    }

    /// Euclidean inner product over all three components.
    pub fn inner(&self, other: &VecField) -> f64 {
        let d1: f64 = self.x1.iter().zip(other.x1.iter()).map(|(&a, &b)| a * b).sum();
        let d2: f64 = self.x2.iter().zip(other.x2.iter()).map(|(&a, &b)| a * b).sum();
        let d3: f64 = self.x3.iter().zip(other.x3.iter()).map(|(&a, &b)| a * b).sum();
        d1 + d2 + d3
    }

    /// Euclidean norm over all three components.
    pub fn norm2(&self) -> f64 {
        self.inner(self).sqrt()
    }

    /// Per-component Euclidean norms.
    pub fn component_norms(&self) -> (f64, f64, f64) {
        let n = |x: &[f64]| x.iter().map(|&v| v * v).sum::<f64>().sqrt();
        (n(&self.x1), n(&self.x2), n(&self.x3))
    }

    /// Largest absolute entry over all components.
    pub fn norm_inf(&self) -> f64 {
        self.x1
            .iter()
            .chain(self.x2.iter())
            .chain(self.x3.iter())
            .fold(0.0_f64, |acc, &v| acc.max(v.abs()))
    }

    /// True if the field is exactly zero everywhere.
    pub fn is_zero(&self) -> bool {
        self.norm_inf() == 0.0
    }

    /// Pointwise magnitude |v| written into a scalar buffer.
    pub fn pointwise_norm(&self, out: &mut [f64]) -> Result<()> {
        if out.len() != self.nl {
            return Err(ClaireError::DimensionMismatch {
                expected: self.nl,
                actual: out.len(),
            });
        }
        for (((o, &a), &b), &c) in out
            .iter_mut()
            .zip(self.x1.iter())
            .zip(self.x2.iter())
            .zip(self.x3.iter())
        {
            *o = (a * a + b * b + c * c).sqrt();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> VecField {
        VecField::new(GridSize::new([2, 2, 2])).unwrap()
    }

    #[test]
    fn test_axpy_waxpy() {
        let mut a = small();
        let mut b = small();
        a.set(1.0);
        b.set(2.0);
        a.axpy(3.0, &b);
        assert!((a.x1[0] - 7.0).abs() < 1e-15);

        let mut c = small();
        c.waxpy(-1.0, &b, &a);
        assert!((c.x2[0] - 5.0).abs() < 1e-15);
    }

    #[test]
    fn test_component_flat_roundtrip() {
        let mut v = small();
        let flat: Vec<f64> = (0..3 * v.nl()).map(|i| i as f64).collect();
        v.set_components(&flat).unwrap();
        let mut out = vec![0.0; 3 * v.nl()];
        v.get_components(&mut out).unwrap();
        assert_eq!(flat, out);
    }

    #[test]
    fn test_is_zero() {
        let mut v = small();
        assert!(v.is_zero());
        v.x3[5] = 1e-300;
        assert!(!v.is_zero());
    }

    #[test]
    fn test_inner_norm() {
        let mut v = small();
        v.set(2.0);
        // 3 components * 8 points * 4
        assert!((v.inner(&v) - 96.0).abs() < 1e-12);
        assert!((v.norm2() - 96.0_f64.sqrt()).abs() < 1e-12);
    }
}
