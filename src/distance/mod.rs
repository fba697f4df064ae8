//! Squared-L2 distance measure between the transported template and the
//! reference image.
//!
//! Evaluates the data-fidelity functional and writes the final-time
//! boundary conditions of the adjoint systems in place. The signs follow
//! the first-order optimality system of the underlying Lagrangian:
//! λ(1) = mR - m(1) and λ̃(1) = -m̃(1).

use rayon::prelude::*;

use crate::error::{ClaireError, Result};
use crate::field::ScaField;

/// Squared-L2 distance measure.
pub struct DistanceMeasure {
    nc: usize,
    nt: usize,
    /// Lebesgue measure of a grid cell.
    hd: f64,
}

impl DistanceMeasure {
    pub fn new(nc: usize, nt: usize, hd: f64) -> Self {
        Self { nc, nt, hd }
    }

    /// D = (hd/2)·Σ (m(1) - mR)² over all channels.
    pub fn evaluate_functional(&self, state: &ScaField, reference: &ScaField) -> Result<f64> {
        self.check(state, reference)?;
        let mut d = 0.0;
        for k in 0..self.nc {
            let m1 = state.frame(self.nt, k);
            let mr = reference.frame(0, k);
            d += m1
                .par_iter()
                .zip(mr.par_iter())
                .map(|(&a, &b)| (a - b) * (a - b))
                .sum::<f64>();
        }
        Ok(0.5 * self.hd * d)
    }

    /// Final condition of the adjoint equation: λ(1) = mR - m(1).
    pub fn set_final_condition_ae(
        &self,
        adjoint: &mut ScaField,
        state: &ScaField,
        reference: &ScaField,
    ) -> Result<()> {
        self.check(state, reference)?;
        for k in 0..self.nc {
            let m1 = state.frame(self.nt, k);
            let mr = reference.frame(0, k);
            let l1 = adjoint.frame_mut(self.nt, k);
            l1.par_iter_mut()
                .enumerate()
                .for_each(|(i, l)| *l = mr[i] - m1[i]);
        }
        Ok(())
    }

    /// Final condition of the incremental adjoint equation: λ̃(1) = -m̃(1).
    pub fn set_final_condition_iae(
        &self,
        inc_adjoint: &mut ScaField,
        inc_state: &ScaField,
    ) -> Result<()> {
        for k in 0..self.nc {
            let mt1 = inc_state.frame(self.nt, k);
            let lt1 = inc_adjoint.frame_mut(self.nt, k);
            lt1.par_iter_mut()
                .enumerate()
                .for_each(|(i, l)| *l = -mt1[i]);
        }
        Ok(())
    }

    fn check(&self, state: &ScaField, reference: &ScaField) -> Result<()> {
        if state.nl() != reference.nl() || state.nc() != reference.nc() {
            return Err(ClaireError::DimensionMismatch {
                expected: state.nl() * state.nc(),
                actual: reference.nl() * reference.nc(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_functional_zero_for_identical_images() {
        let dm = DistanceMeasure::new(1, 4, 0.1);
        let mut state = ScaField::new(8, 1, 5).unwrap();
        let mut reference = ScaField::new(8, 1, 1).unwrap();
        state.frame_mut(4, 0).fill(2.0);
        reference.frame_mut(0, 0).fill(2.0);
        assert_eq!(dm.evaluate_functional(&state, &reference).unwrap(), 0.0);
    }

    #[test]
    fn test_functional_value() {
        let dm = DistanceMeasure::new(1, 2, 0.5);
        let mut state = ScaField::new(4, 1, 3).unwrap();
        let reference = ScaField::new(4, 1, 1).unwrap();
        state.frame_mut(2, 0).fill(1.0);
        // D = 0.5·hd·Σ 1² = 0.5·0.5·4 = 1
        let d = dm.evaluate_functional(&state, &reference).unwrap();
        assert!((d - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_final_condition_ae_sign() {
        let dm = DistanceMeasure::new(1, 2, 1.0);
        let mut state = ScaField::new(4, 1, 3).unwrap();
        let mut reference = ScaField::new(4, 1, 1).unwrap();
        state.frame_mut(2, 0).fill(3.0);
        reference.frame_mut(0, 0).fill(5.0);

        let mut adjoint = ScaField::new(4, 1, 1).unwrap();
        dm.set_final_condition_ae(&mut adjoint, &state, &reference)
            .unwrap();
        for &l in adjoint.frame(2, 0).iter() {
            assert!((l - 2.0).abs() < 1e-15, "λ(1) must equal mR - m(1)");
        }
    }

    #[test]
    fn test_final_condition_iae_sign() {
        let dm = DistanceMeasure::new(1, 2, 1.0);
        let mut inc_state = ScaField::new(4, 1, 3).unwrap();
        inc_state.frame_mut(2, 0).fill(1.5);
        let mut inc_adjoint = ScaField::new(4, 1, 1).unwrap();
        dm.set_final_condition_iae(&mut inc_adjoint, &inc_state).unwrap();
        for &l in inc_adjoint.frame(2, 0).iter() {
            assert!((l + 1.5).abs() < 1e-15, "λ̃(1) must equal -m̃(1)");
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let dm = DistanceMeasure::new(1, 1, 1.0);
        let state = ScaField::new(8, 1, 2).unwrap();
        let reference = ScaField::new(4, 1, 1).unwrap();
        assert!(matches!(
            dm.evaluate_functional(&state, &reference).unwrap_err(),
            ClaireError::DimensionMismatch { .. }
        ));
    }
}
