//! Krylov-method glue between the optimal-control engine and the outer
//! Newton iteration.
//!
//! Provides a preconditioned conjugate-gradient solver over vector
//! fields, convergence-reason reporting, and the Eisenstat-Walker forcing
//! sequence that adapts the linear-solve tolerance to the progress of the
//! nonlinear iteration. Hitting the iteration cap or detecting negative
//! curvature is a warning, not an error: the solver hands back whatever
//! approximate solution it has, consistent with an inexact Newton method.

pub mod newton;

use crate::config::ForcingSequence;
use crate::error::Result;
use crate::field::VecField;
use crate::grid::GridSize;

pub use newton::{NewtonKrylov, NewtonOutcome};

/// Tolerance bounds of the forcing sequence: never ask the linear solver
/// for more than 12 digits, never let it coast above half the residual.
const LOWER_GRAD_BOUND: f64 = 1e-12;
const UPPER_GRAD_BOUND: f64 = 0.5;

/// Hessian operator and preconditioner pair consumed by the solver.
pub trait HessianOperator {
    fn apply(&mut self, out: &mut VecField, x: &VecField) -> Result<()>;
    fn precond(&mut self, out: &mut VecField, x: &VecField) -> Result<()>;
}

/// Why the Krylov solve stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrylovReason {
    /// ||r||_2 dropped below reltol·||b||_2.
    RelativeTolerance,
    /// ||r||_2 dropped below the absolute tolerance.
    AbsoluteTolerance,
    /// Iteration cap reached; the current iterate is returned.
    MaxIterations,
    /// The operator showed negative curvature along a search direction.
    NegativeCurvature,
    /// The preconditioned residual inner product vanished.
    Breakdown,
    /// Still iterating (not a terminal state).
    Iterating,
}

/// Log the convergence reason of a Krylov solve.
pub fn disp_conv_reason(reason: KrylovReason) {
    match reason {
        KrylovReason::RelativeTolerance => {
            log::debug!("KSP convergence ||r||_2 < tol ||b||_2");
        }
        KrylovReason::AbsoluteTolerance => {
            log::debug!("KSP convergence ||r||_2 < tol");
        }
        KrylovReason::MaxIterations => {
            log::warn!("KSP max number of iterations reached");
        }
        KrylovReason::NegativeCurvature => {
            log::warn!("KSP negative curvature detected");
        }
        KrylovReason::Breakdown => {
            log::warn!("KSP generic breakdown; potential singular operator");
        }
        KrylovReason::Iterating => {}
    }
}

/// Estimate the relative tolerance of the next linear solve from the
/// progress of the gradient norm (Eisenstat-Walker).
pub fn estimate_forcing_tolerance(
    fseq: ForcingSequence,
    gnorm: f64,
    g0norm: f64,
    default: f64,
) -> f64 {
    let g = gnorm / g0norm;
    match fseq {
        ForcingSequence::None => default,
        // assuming quadratic convergence
        ForcingSequence::Quadratic => g.min(UPPER_GRAD_BOUND).max(LOWER_GRAD_BOUND),
        // assuming superlinear convergence
        ForcingSequence::Superlinear => g.sqrt().min(UPPER_GRAD_BOUND).max(LOWER_GRAD_BOUND),
    }
}

/// Preconditioned conjugate-gradient solver over vector fields.
pub struct KrylovSolver {
    pub maxit: usize,
    pub reltol: f64,
    pub abstol: f64,
    r: VecField,
    z: VecField,
    p: VecField,
    hp: VecField,
}

impl KrylovSolver {
    pub fn new(grid: GridSize, maxit: usize) -> Result<Self> {
        Ok(Self {
            maxit,
            reltol: 1e-1,
            abstol: 1e-16,
            r: VecField::new(grid)?,
            z: VecField::new(grid)?,
            p: VecField::new(grid)?,
            hp: VecField::new(grid)?,
        })
    }

    /// Solve H x = b from x = 0 with the operator/preconditioner pair.
    /// Returns the stop reason and the number of iterations taken.
    pub fn solve<H: HessianOperator>(
        &mut self,
        x: &mut VecField,
        b: &VecField,
        hess: &mut H,
    ) -> Result<(KrylovReason, usize)> {
        x.set(0.0);
        self.r.copy_from(b)?;
        let bnorm = b.norm2();
        if bnorm == 0.0 {
            return Ok((KrylovReason::AbsoluteTolerance, 0));
        }

        hess.precond(&mut self.z, &self.r)?;
        self.p.copy_from(&self.z)?;
        let mut rz = self.r.inner(&self.z);

        let mut reason = KrylovReason::Iterating;
        let mut iters = 0;
        for i in 0..self.maxit {
            hess.apply(&mut self.hp, &self.p)?;
            let php = self.p.inner(&self.hp);
            if php <= 0.0 {
                // Newton-CG safeguard: fall back to the steepest-descent
                // direction if no step has been taken yet
                if i == 0 {
                    x.copy_from(&self.z)?;
                }
                reason = KrylovReason::NegativeCurvature;
                iters = i;
                break;
            }

            let alpha = rz / php;
            x.axpy(alpha, &self.p);
            self.r.axpy(-alpha, &self.hp);
            iters = i + 1;

            let rnorm = self.r.norm2();
            log::trace!("KSP iter {:3}: ||r||_2 = {:e}", iters, rnorm);
            if rnorm < self.reltol * bnorm {
                reason = KrylovReason::RelativeTolerance;
                break;
            }
            if rnorm < self.abstol {
                reason = KrylovReason::AbsoluteTolerance;
                break;
            }

            hess.precond(&mut self.z, &self.r)?;
            let rz_new = self.r.inner(&self.z);
            if rz_new == 0.0 {
                reason = KrylovReason::Breakdown;
                break;
            }
            let beta = rz_new / rz;
            rz = rz_new;

            self.p.scale(beta);
            self.p.axpy(1.0, &self.z);
        }

        if reason == KrylovReason::Iterating {
            reason = KrylovReason::MaxIterations;
        }
        disp_conv_reason(reason);
        Ok((reason, iters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Diagonal operator for testing, with an optional Jacobi
    /// preconditioner.
    struct DiagOp {
        diag: Vec<f64>,
        jacobi: bool,
    }

    impl HessianOperator for DiagOp {
        fn apply(&mut self, out: &mut VecField, x: &VecField) -> Result<()> {
            out.copy_from(x)?;
            for (o, &d) in out.x1.iter_mut().zip(self.diag.iter()) {
                *o *= d;
            }
            for (o, &d) in out.x2.iter_mut().zip(self.diag.iter()) {
                *o *= d;
            }
            for (o, &d) in out.x3.iter_mut().zip(self.diag.iter()) {
                *o *= d;
            }
            Ok(())
        }

        fn precond(&mut self, out: &mut VecField, x: &VecField) -> Result<()> {
            out.copy_from(x)?;
            if self.jacobi {
                for (o, &d) in out.x1.iter_mut().zip(self.diag.iter()) {
                    *o /= d;
                }
                for (o, &d) in out.x2.iter_mut().zip(self.diag.iter()) {
                    *o /= d;
                }
                for (o, &d) in out.x3.iter_mut().zip(self.diag.iter()) {
                    *o /= d;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_pcg_solves_diagonal_system() {
        let grid = GridSize::new([2, 2, 2]);
        let nl = grid.nl();
        let mut op = DiagOp {
            diag: (0..nl).map(|i| 1.0 + i as f64).collect(),
            jacobi: false,
        };

        let mut b = VecField::new(grid).unwrap();
        b.set(1.0);
        let mut x = VecField::new(grid).unwrap();

        let mut ksp = KrylovSolver::new(grid, 100).unwrap();
        ksp.reltol = 1e-12;
        let (reason, iters) = ksp.solve(&mut x, &b, &mut op).unwrap();
        assert_eq!(reason, KrylovReason::RelativeTolerance);
        // one iteration per distinct eigenvalue, plus rounding slack
        assert!(iters <= 2 * nl);
        for (i, &v) in x.x2.iter().enumerate() {
            assert!((v - 1.0 / (1.0 + i as f64)).abs() < 1e-10);
        }
    }

    #[test]
    fn test_jacobi_preconditioner_converges_in_one_iteration() {
        let grid = GridSize::new([2, 2, 2]);
        let nl = grid.nl();
        let mut op = DiagOp {
            diag: (0..nl).map(|i| 1.0 + i as f64).collect(),
            jacobi: true,
        };

        let mut b = VecField::new(grid).unwrap();
        b.set(2.0);
        let mut x = VecField::new(grid).unwrap();

        let mut ksp = KrylovSolver::new(grid, 100).unwrap();
        ksp.reltol = 1e-10;
        let (_, iters) = ksp.solve(&mut x, &b, &mut op).unwrap();
        assert_eq!(iters, 1, "exact preconditioner must converge immediately");
    }

    #[test]
    fn test_max_iterations_is_not_an_error() {
        let grid = GridSize::new([2, 2, 2]);
        let nl = grid.nl();
        let mut op = DiagOp {
            diag: (0..nl).map(|i| 1.0 + (i as f64) * 100.0).collect(),
            jacobi: false,
        };

        let mut b = VecField::new(grid).unwrap();
        b.set(1.0);
        let mut x = VecField::new(grid).unwrap();

        let mut ksp = KrylovSolver::new(grid, 1).unwrap();
        ksp.reltol = 1e-14;
        let (reason, iters) = ksp.solve(&mut x, &b, &mut op).unwrap();
        assert_eq!(reason, KrylovReason::MaxIterations);
        assert_eq!(iters, 1);
        assert!(x.norm2() > 0.0, "the approximate iterate is returned");
    }

    #[test]
    fn test_forcing_sequence_bounds() {
        let f = estimate_forcing_tolerance(ForcingSequence::Quadratic, 1.0, 1.0, 0.1);
        assert!((f - 0.5).abs() < 1e-15, "clamped to the upper bound");

        let f = estimate_forcing_tolerance(ForcingSequence::Quadratic, 1e-20, 1.0, 0.1);
        assert!((f - 1e-12).abs() < 1e-27, "clamped to the lower bound");

        let f = estimate_forcing_tolerance(ForcingSequence::Superlinear, 1e-2, 1.0, 0.1);
        assert!((f - 0.1).abs() < 1e-15);

        let f = estimate_forcing_tolerance(ForcingSequence::None, 1e-2, 1.0, 0.3);
        assert!((f - 0.3).abs() < 1e-15);
    }
}
