//! Inexact Newton-Krylov driver for the registration problem.
//!
//! Each outer iteration evaluates the reduced gradient, solves the KKT
//! system H δv = -g with the preconditioned conjugate-gradient method at
//! a forcing-sequence tolerance, and globalizes the step with an Armijo
//! backtracking line search.

use crate::config::ForcingSequence;
use crate::engine::Claire;
use crate::error::Result;
use crate::field::VecField;

use super::{estimate_forcing_tolerance, KrylovSolver};

/// Armijo slope parameter.
const LS_C1: f64 = 1e-4;
/// Maximum number of backtracking trials.
const LS_MAXTRIAL: usize = 20;

/// Per-iteration record of the outer loop.
#[derive(Clone, Copy, Debug)]
pub struct IterationRecord {
    pub iter: usize,
    pub jval: f64,
    pub dval: f64,
    pub gradnorm: f64,
    pub krylov_iters: usize,
    pub step: f64,
}

/// Result of a Newton-Krylov solve.
#[derive(Clone, Debug)]
pub struct NewtonOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub jval: f64,
    pub gradnorm: f64,
    pub history: Vec<IterationRecord>,
}

/// The outer Newton-Krylov optimizer.
pub struct NewtonKrylov {
    ksp: KrylovSolver,
    maxit: usize,
    opttol: f64,
    fseq: ForcingSequence,
    base_reltol: f64,
    g: VecField,
    dv: VecField,
    rhs: VecField,
    vtrial: VecField,
}

impl NewtonKrylov {
    pub fn new(cfg: &crate::config::RegConfig) -> Result<Self> {
        let grid = cfg.grid;
        Ok(Self {
            ksp: KrylovSolver::new(grid, cfg.krylov_maxit)?,
            maxit: cfg.newton_maxit,
            opttol: cfg.opttol,
            fseq: cfg.fseq,
            base_reltol: 1e-1,
            g: VecField::new(grid)?,
            dv: VecField::new(grid)?,
            rhs: VecField::new(grid)?,
            vtrial: VecField::new(grid)?,
        })
    }

    /// Minimize J(v) starting from the given control; `v` is updated in
    /// place with the final iterate.
    pub fn solve(&mut self, engine: &mut Claire, v: &mut VecField) -> Result<NewtonOutcome> {
        engine.set_velocity(v)?;
        engine.initialize_optimization()?;
        let g0norm = engine.monitor.gradnorm0;

        let mut history = Vec::new();
        if g0norm == 0.0 {
            log::info!("initial gradient is zero; nothing to do");
            return Ok(NewtonOutcome {
                converged: true,
                iterations: 0,
                jval: engine.monitor.jval0,
                gradnorm: 0.0,
                history,
            });
        }

        let mut j = engine.monitor.jval;
        let mut gnorm = engine.monitor.gradnorm0;
        let mut converged = false;

        for it in 0..self.maxit {
            engine.evaluate_gradient(&mut self.g, None)?;
            gnorm = self.g.norm2();
            if gnorm <= self.opttol * g0norm {
                log::info!(
                    "converged: ||g|| = {:e} <= {:e} ||g0||",
                    gnorm,
                    self.opttol
                );
                converged = true;
                break;
            }

            // Eisenstat-Walker tolerance for the KKT solve
            let reltol =
                estimate_forcing_tolerance(self.fseq, gnorm, g0norm, self.base_reltol);
            self.ksp.reltol = reltol;
            engine.set_krylov_reltol(reltol);
            log::debug!("computing solution of KKT system (tol = {:e})", reltol);

            self.rhs.copy_from(&self.g)?;
            self.rhs.scale(-1.0);
            let (_, kiters) = self.ksp.solve(&mut self.dv, &self.rhs, engine)?;
            engine.monitor.krylov_iters += kiters;

            // the Newton step must be a descent direction; fall back to
            // steepest descent if the inexact solve failed to produce one
            let mut descent = self.g.inner(&self.dv);
            if descent >= 0.0 {
                log::warn!("search direction is not a descent direction");
                self.dv.copy_from(&self.g)?;
                self.dv.scale(-1.0);
                descent = -gnorm * gnorm;
            }

            // Armijo backtracking
            let mut alpha = 1.0;
            let mut accepted = false;
            let mut jtrial = j;
            for _ in 0..LS_MAXTRIAL {
                self.vtrial.waxpy(alpha, &self.dv, v);
                jtrial = engine.evaluate_objective(&self.vtrial)?;
                if jtrial <= j + LS_C1 * alpha * descent {
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }
            if !accepted {
                log::warn!("line search failed after {} trials", LS_MAXTRIAL);
                break;
            }

            v.copy_from(&self.vtrial)?;
            j = jtrial;
            engine.monitor.newton_iters += 1;

            log::info!(
                "newton iter {:3}: J = {:e}, D = {:e}, ||g|| = {:e}, ksp {:3}, step {:e}",
                it + 1,
                j,
                engine.monitor.dval,
                gnorm,
                kiters,
                alpha
            );
            history.push(IterationRecord {
                iter: it + 1,
                jval: j,
                dval: engine.monitor.dval,
                gradnorm: gnorm,
                krylov_iters: kiters,
                step: alpha,
            });
        }

        Ok(NewtonOutcome {
            converged,
            iterations: history.len(),
            jval: j,
            gradnorm: gnorm,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegConfig;
    use crate::grid::{idx3d, GridSize};

    fn bump(grid: GridSize, center: (f64, f64, f64)) -> Vec<f64> {
        let [nx, ny, nz] = grid.nx;
        let h = grid.spacing();
        let mut f = vec![0.0; grid.nl()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let dx = i as f64 * h[0] - center.0;
                    let dy = j as f64 * h[1] - center.1;
                    let dz = k as f64 * h[2] - center.2;
                    f[idx3d(i, j, k, nx, ny)] = (-(dx * dx + dy * dy + dz * dz)).exp();
                }
            }
        }
        f
    }

    #[test]
    fn test_identical_images_converge_immediately() {
        let grid = GridSize::new([8, 8, 8]);
        let cfg = RegConfig::new(grid, 2);
        let mut engine = Claire::new(cfg.clone()).unwrap();
        let c = std::f64::consts::PI;
        let img = bump(grid, (c, c, c));
        engine.set_template_image(&img).unwrap();
        engine.set_reference_image(&img).unwrap();

        let mut v = VecField::new(grid).unwrap();
        let mut newton = NewtonKrylov::new(&cfg).unwrap();
        let outcome = newton.solve(&mut engine, &mut v).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(v.norm2(), 0.0);
    }

    #[test]
    fn test_objective_decreases_monotonically() {
        let grid = GridSize::new([12, 12, 12]);
        let mut cfg = RegConfig::new(grid, 2);
        cfg.newton_maxit = 3;
        cfg.beta = [1e-3, 1e-6, 0.0, 0.0];
        let mut engine = Claire::new(cfg.clone()).unwrap();
        let c = std::f64::consts::PI;
        let h = grid.spacing();
        engine.set_template_image(&bump(grid, (c, c, c))).unwrap();
        engine
            .set_reference_image(&bump(grid, (c + h[0], c, c)))
            .unwrap();

        let mut v = VecField::new(grid).unwrap();
        let mut newton = NewtonKrylov::new(&cfg).unwrap();
        let outcome = newton.solve(&mut engine, &mut v).unwrap();

        assert!(!outcome.history.is_empty(), "the solver must take steps");
        let mut prev = engine.monitor.jval0;
        for rec in &outcome.history {
            assert!(
                rec.jval < prev,
                "objective must decrease per accepted step: {} -> {}",
                prev,
                rec.jval
            );
            prev = rec.jval;
        }
        assert!(v.norm2() > 0.0, "a nonzero control must be found");
    }
}
