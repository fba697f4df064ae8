//! Transport problem: the continuity/advection PDE family under a given
//! control.
//!
//! Solves the state equation forward, the adjoint equation backward, and
//! their linearizations, with either RK2 (trapezoidal) or semi-Lagrangian
//! time stepping. The adjoint-type solves accumulate the time-integrated
//! body force into a caller-provided vector field as a side effect; the
//! quadrature in time (ht, trapezoid weights) happens here, the Lebesgue
//! scaling by hd happens in the engine.

pub mod interp;

use rayon::prelude::*;

use crate::config::{PdeScheme, RegConfig};
use crate::diff::SpectralDiff;
use crate::error::{ClaireError, Result};
use crate::field::{ScaField, VecField};
use crate::grid::GridSize;

use interp::Trajectory;

/// Transport equation solver. Owns its trajectory and stage buffers;
/// state/adjoint containers and the velocity are borrowed per call.
pub struct TransportProblem {
    grid: GridSize,
    nt: usize,
    nc: usize,
    ht: f64,
    scheme: PdeScheme,
    // stage and gradient work space, allocated once
    grad: VecField,
    grad2: VecField,
    lv: VecField,
    mj: Vec<f64>,
    mnext: Vec<f64>,
    rhs0: Vec<f64>,
    stage: Vec<f64>,
    divv: Vec<f64>,
    divvx: Vec<f64>,
    fx: Vec<f64>,
    traj_state: Trajectory,
    traj_adjoint: Trajectory,
}

impl TransportProblem {
    pub fn new(cfg: &RegConfig) -> Result<Self> {
        let grid = cfg.grid;
        let nl = grid.nl();
        Ok(Self {
            grid,
            nt: cfg.nt,
            nc: cfg.nc,
            ht: cfg.ht(),
            scheme: cfg.pde_scheme,
            grad: VecField::new(grid)?,
            grad2: VecField::new(grid)?,
            lv: VecField::new(grid)?,
            mj: vec![0.0; nl],
            mnext: vec![0.0; nl],
            rhs0: vec![0.0; nl],
            stage: vec![0.0; nl],
            divv: vec![0.0; nl],
            divvx: vec![0.0; nl],
            fx: vec![0.0; nl],
            traj_state: Trajectory::new(grid),
            traj_adjoint: Trajectory::new(grid),
        })
    }

    fn check_nt(&self) -> Result<()> {
        if self.nt == 0 {
            return Err(ClaireError::invalid_state("nt <= 0"));
        }
        Ok(())
    }

    /// Solve the state equation ∂m/∂t + ∇m·v = 0 forward from the
    /// template image at t = 0 to t = 1.
    pub fn solve_forward(
        &mut self,
        diff: &mut SpectralDiff,
        state: &mut ScaField,
        template: &ScaField,
        v: &VecField,
    ) -> Result<()> {
        self.check_nt()?;
        log::debug!(
            "solving state equation (nx,nc,nt) = ({:?},{},{})",
            self.grid.nx,
            self.nc,
            self.nt
        );

        // initial condition m_0 = m_T
        for k in 0..self.nc {
            state.frame_mut(0, k).copy_from_slice(template.frame(0, k));
        }

        if self.scheme == PdeScheme::SemiLagrangian {
            self.traj_state.compute(v, self.ht, -1.0);
        }

        for j in 0..self.nt {
            for k in 0..self.nc {
                self.mj.copy_from_slice(state.frame(j, k));
                match self.scheme {
                    PdeScheme::Rk2 => self.advect_step_rk2(diff, v)?,
                    PdeScheme::SemiLagrangian => {
                        // pure advection: carry the value along the
                        // backward characteristic
                        self.traj_state.interpolate(&mut self.mnext, &self.mj);
                    }
                }
                state.frame_mut(j + 1, k).copy_from_slice(&self.mnext);
            }
        }
        Ok(())
    }

    /// One RK2 advection step: mj -> mnext under velocity v.
    fn advect_step_rk2(&mut self, diff: &mut SpectralDiff, v: &VecField) -> Result<()> {
        let ht = self.ht;

        diff.gradient(&mut self.grad, &self.mj)?;
        let grad = &self.grad;
        self.rhs0
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, r)| {
                *r = -(grad.x1[i] * v.x1[i] + grad.x2[i] * v.x2[i] + grad.x3[i] * v.x3[i]);
            });

        let (mj, rhs0) = (&self.mj, &self.rhs0);
        self.stage
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, s)| *s = mj[i] + ht * rhs0[i]);

        diff.gradient(&mut self.grad, &self.stage)?;
        let grad = &self.grad;
        let (mj, rhs0) = (&self.mj, &self.rhs0);
        self.mnext.par_iter_mut().enumerate().for_each(|(i, m)| {
            let rhs1 =
                -(grad.x1[i] * v.x1[i] + grad.x2[i] * v.x2[i] + grad.x3[i] * v.x3[i]);
            *m = mj[i] + 0.5 * ht * (rhs0[i] + rhs1);
        });
        Ok(())
    }

    /// Solve the adjoint equation -∂λ/∂t - ∇·(λv) = 0 backward in time
    /// from the final condition already stored at t = 1, accumulating the
    /// body force ∫ λ∇m dt into `body_force`.
    pub fn solve_adjoint(
        &mut self,
        diff: &mut SpectralDiff,
        adjoint: &mut ScaField,
        state: &ScaField,
        v: &VecField,
        body_force: &mut VecField,
    ) -> Result<()> {
        self.check_nt()?;
        log::debug!(
            "solving adjoint equation (nx,nc,nt) = ({:?},{},{})",
            self.grid.nx,
            self.nc,
            self.nt
        );

        body_force.set(0.0);

        if self.scheme == PdeScheme::SemiLagrangian {
            self.traj_adjoint.compute(v, self.ht, 1.0);
            diff.divergence(&mut self.divv, v)?;
            self.traj_adjoint.interpolate(&mut self.divvx, &self.divv);
        }

        for j in (1..=self.nt).rev() {
            let w = if j == self.nt { 0.5 } else { 1.0 };
            for k in 0..self.nc {
                self.mj.copy_from_slice(adjoint.frame(j, k));
                self.accumulate_body_force(diff, body_force, state.frame(j, k), w)?;
                match self.scheme {
                    PdeScheme::Rk2 => self.continuity_step_rk2(diff, v)?,
                    PdeScheme::SemiLagrangian => self.continuity_step_sl(),
                }
                adjoint.frame_mut(j - 1, k).copy_from_slice(&self.mnext);
            }
        }
        // trapezoid endpoint at t = 0
        for k in 0..self.nc {
            self.mj.copy_from_slice(adjoint.frame(0, k));
            self.accumulate_body_force(diff, body_force, state.frame(0, k), 0.5)?;
        }
        Ok(())
    }

    /// body_force += w·ht·λ·∇m, with λ in self.mj.
    fn accumulate_body_force(
        &mut self,
        diff: &mut SpectralDiff,
        body_force: &mut VecField,
        m: &[f64],
        weight: f64,
    ) -> Result<()> {
        diff.gradient(&mut self.grad, m)?;
        let s = weight * self.ht;
        let (grad, lambda) = (&self.grad, &self.mj);
        body_force
            .x1
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b += s * lambda[i] * grad.x1[i]);
        body_force
            .x2
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b += s * lambda[i] * grad.x2[i]);
        body_force
            .x3
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b += s * lambda[i] * grad.x3[i]);
        Ok(())
    }

    /// One backward RK2 step of the continuity equation:
    /// λ_{j-1} = λ_j + (ht/2)(div(λ_j v) + div(λ̄ v)), λ̄ = λ_j + ht·div(λ_j v).
    fn continuity_step_rk2(&mut self, diff: &mut SpectralDiff, v: &VecField) -> Result<()> {
        let ht = self.ht;

        let lambda = &self.mj;
        self.lv
            .x1
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = lambda[i] * v.x1[i]);
        self.lv
            .x2
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = lambda[i] * v.x2[i]);
        self.lv
            .x3
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = lambda[i] * v.x3[i]);
        diff.divergence(&mut self.rhs0, &self.lv)?;

        let (lambda, rhs0) = (&self.mj, &self.rhs0);
        self.stage
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, s)| *s = lambda[i] + ht * rhs0[i]);

        let stage = &self.stage;
        self.lv
            .x1
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = stage[i] * v.x1[i]);
        self.lv
            .x2
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = stage[i] * v.x2[i]);
        self.lv
            .x3
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| *o = stage[i] * v.x3[i]);
        diff.divergence(&mut self.fx, &self.lv)?;

        let (lambda, rhs0, rhs1) = (&self.mj, &self.rhs0, &self.fx);
        self.mnext
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, m)| *m = lambda[i] + 0.5 * ht * (rhs0[i] + rhs1[i]));
        Ok(())
    }

    /// One backward semi-Lagrangian step of the continuity equation,
    /// 2nd-order (trapezoidal) correction:
    /// rhs0 = λX·divvX, rhs1 = (λX + ht·rhs0)·divv,
    /// λ_{j-1} = λX + (ht/2)(rhs0 + rhs1).
    fn continuity_step_sl(&mut self) {
        let ht = self.ht;
        self.traj_adjoint.interpolate(&mut self.fx, &self.mj);
        let (lx, divv, divvx) = (&self.fx, &self.divv, &self.divvx);
        self.mnext.par_iter_mut().enumerate().for_each(|(i, m)| {
            let rhs0 = lx[i] * divvx[i];
            let rhs1 = (lx[i] + ht * rhs0) * divv[i];
            *m = lx[i] + 0.5 * ht * (rhs0 + rhs1);
        });
    }

    /// Solve the incremental state equation
    /// ∂m̃/∂t + ∇m̃·v + ∇m·ṽ = 0 forward from m̃(0) = 0.
    pub fn solve_inc_forward(
        &mut self,
        diff: &mut SpectralDiff,
        inc_state: &mut ScaField,
        state: &ScaField,
        v: &VecField,
        vtilde: &VecField,
    ) -> Result<()> {
        self.check_nt()?;
        log::debug!(
            "solving incremental state equation (nx,nc,nt) = ({:?},{},{})",
            self.grid.nx,
            self.nc,
            self.nt
        );

        for k in 0..self.nc {
            inc_state.frame_mut(0, k).fill(0.0);
        }

        if self.scheme == PdeScheme::SemiLagrangian {
            self.traj_state.compute(v, self.ht, -1.0);
        }

        let ht = self.ht;
        for j in 0..self.nt {
            for k in 0..self.nc {
                self.mj.copy_from_slice(inc_state.frame(j, k));
                match self.scheme {
                    PdeScheme::Rk2 => {
                        // rhs0 = -∇m̃_j·v - ∇m_j·ṽ
                        diff.gradient(&mut self.grad, &self.mj)?;
                        diff.gradient(&mut self.grad2, state.frame(j, k))?;
                        let (g, g2) = (&self.grad, &self.grad2);
                        self.rhs0.par_iter_mut().enumerate().for_each(|(i, r)| {
                            *r = -(g.x1[i] * v.x1[i] + g.x2[i] * v.x2[i] + g.x3[i] * v.x3[i])
                                - (g2.x1[i] * vtilde.x1[i]
                                    + g2.x2[i] * vtilde.x2[i]
                                    + g2.x3[i] * vtilde.x3[i]);
                        });

                        let (mj, rhs0) = (&self.mj, &self.rhs0);
                        self.stage
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(i, s)| *s = mj[i] + ht * rhs0[i]);

                        // rhs1 = -∇m̃bar·v - ∇m_{j+1}·ṽ
                        diff.gradient(&mut self.grad, &self.stage)?;
                        diff.gradient(&mut self.grad2, state.frame(j + 1, k))?;
                        let (g, g2) = (&self.grad, &self.grad2);
                        let (mj, rhs0) = (&self.mj, &self.rhs0);
                        self.mnext.par_iter_mut().enumerate().for_each(|(i, m)| {
                            let rhs1 = -(g.x1[i] * v.x1[i]
                                + g.x2[i] * v.x2[i]
                                + g.x3[i] * v.x3[i])
                                - (g2.x1[i] * vtilde.x1[i]
                                    + g2.x2[i] * vtilde.x2[i]
                                    + g2.x3[i] * vtilde.x3[i]);
                            *m = mj[i] + 0.5 * ht * (rhs0[i] + rhs1);
                        });
                    }
                    PdeScheme::SemiLagrangian => {
                        // dm̃/dt = -∇m·ṽ along the characteristic,
                        // trapezoid between departure and arrival points
                        diff.gradient(&mut self.grad2, state.frame(j, k))?;
                        let g2 = &self.grad2;
                        self.rhs0.par_iter_mut().enumerate().for_each(|(i, r)| {
                            *r = g2.x1[i] * vtilde.x1[i]
                                + g2.x2[i] * vtilde.x2[i]
                                + g2.x3[i] * vtilde.x3[i];
                        });
                        self.traj_state.interpolate(&mut self.stage, &self.rhs0);
                        self.traj_state.interpolate(&mut self.fx, &self.mj);

                        diff.gradient(&mut self.grad2, state.frame(j + 1, k))?;
                        let g2 = &self.grad2;
                        let (mx, srcx) = (&self.fx, &self.stage);
                        self.mnext.par_iter_mut().enumerate().for_each(|(i, m)| {
                            let src1 = g2.x1[i] * vtilde.x1[i]
                                + g2.x2[i] * vtilde.x2[i]
                                + g2.x3[i] * vtilde.x3[i];
                            *m = mx[i] - 0.5 * ht * (srcx[i] + src1);
                        });
                    }
                }
                inc_state.frame_mut(j + 1, k).copy_from_slice(&self.mnext);
            }
        }
        Ok(())
    }

    /// Solve the incremental adjoint equation backward in time from the
    /// final condition already stored at t = 1, accumulating the
    /// incremental body force into `body_force`.
    ///
    /// Gauss-Newton drops the second-order terms; full Newton requires
    /// the adjoint and incremental-state histories and fails with
    /// `NullPointer` if they are missing.
    #[allow(clippy::too_many_arguments)]
    pub fn solve_inc_adjoint(
        &mut self,
        diff: &mut SpectralDiff,
        inc_adjoint: &mut ScaField,
        state: &ScaField,
        adjoint: Option<&ScaField>,
        inc_state: Option<&ScaField>,
        v: &VecField,
        vtilde: &VecField,
        full_newton: bool,
        body_force: &mut VecField,
    ) -> Result<()> {
        self.check_nt()?;
        log::debug!(
            "solving incremental adjoint equation (nx,nc,nt) = ({:?},{},{})",
            self.grid.nx,
            self.nc,
            self.nt
        );

        if full_newton {
            if adjoint.is_none() {
                return Err(ClaireError::NullPointer("adjoint variable"));
            }
            if inc_state.is_none() {
                return Err(ClaireError::NullPointer("incremental state variable"));
            }
        }

        body_force.set(0.0);

        if self.scheme == PdeScheme::SemiLagrangian {
            self.traj_adjoint.compute(v, self.ht, 1.0);
            diff.divergence(&mut self.divv, v)?;
            self.traj_adjoint.interpolate(&mut self.divvx, &self.divv);
        }

        let ht = self.ht;
        for j in (1..=self.nt).rev() {
            let w = if j == self.nt { 0.5 } else { 1.0 };
            for k in 0..self.nc {
                self.mj.copy_from_slice(inc_adjoint.frame(j, k));
                self.accumulate_body_force(diff, body_force, state.frame(j, k), w)?;
                if full_newton {
                    // second-order term: w·ht·λ∇m̃
                    let lambda = adjoint.unwrap();
                    let mtilde = inc_state.unwrap();
                    self.fx.copy_from_slice(lambda.frame(j, k));
                    std::mem::swap(&mut self.mj, &mut self.fx);
                    self.accumulate_body_force(diff, body_force, mtilde.frame(j, k), w)?;
                    std::mem::swap(&mut self.mj, &mut self.fx);
                }

                match self.scheme {
                    PdeScheme::Rk2 => {
                        if full_newton {
                            self.continuity_step_rk2_fn(
                                diff,
                                v,
                                vtilde,
                                adjoint.unwrap(),
                                j,
                                k,
                            )?;
                        } else {
                            self.continuity_step_rk2(diff, v)?;
                        }
                    }
                    PdeScheme::SemiLagrangian => {
                        if full_newton {
                            self.continuity_step_sl_fn(diff, vtilde, adjoint.unwrap(), j, k)?;
                        } else {
                            self.continuity_step_sl();
                        }
                    }
                }
                inc_adjoint.frame_mut(j - 1, k).copy_from_slice(&self.mnext);
            }
        }
        for k in 0..self.nc {
            self.mj.copy_from_slice(inc_adjoint.frame(0, k));
            self.accumulate_body_force(diff, body_force, state.frame(0, k), 0.5)?;
            if full_newton {
                let lambda = adjoint.unwrap();
                let mtilde = inc_state.unwrap();
                self.fx.copy_from_slice(lambda.frame(0, k));
                std::mem::swap(&mut self.mj, &mut self.fx);
                self.accumulate_body_force(diff, body_force, mtilde.frame(0, k), 0.5)?;
                std::mem::swap(&mut self.mj, &mut self.fx);
            }
        }
        Ok(())
    }

    /// Full-Newton RK2 continuity step with the source term div(λṽ).
    fn continuity_step_rk2_fn(
        &mut self,
        diff: &mut SpectralDiff,
        v: &VecField,
        vtilde: &VecField,
        adjoint: &ScaField,
        j: usize,
        k: usize,
    ) -> Result<()> {
        let ht = self.ht;

        // rhs0 = div(λ̃_j v) + div(λ_j ṽ)
        let lt = &self.mj;
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = lt[i] * v.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = lt[i] * v.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = lt[i] * v.x3[i]);
        diff.divergence(&mut self.rhs0, &self.lv)?;

        let lam = adjoint.frame(j, k);
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x3[i]);
        diff.divergence(&mut self.fx, &self.lv)?;
        let src = &self.fx;
        self.rhs0.par_iter_mut().enumerate().for_each(|(i, r)| *r += src[i]);

        let (lt, rhs0) = (&self.mj, &self.rhs0);
        self.stage
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, s)| *s = lt[i] + ht * rhs0[i]);

        // rhs1 = div(λ̄ v) + div(λ_{j-1} ṽ)
        let stage = &self.stage;
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = stage[i] * v.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = stage[i] * v.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = stage[i] * v.x3[i]);
        diff.divergence(&mut self.mnext, &self.lv)?;

        let lam = adjoint.frame(j - 1, k);
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x3[i]);
        diff.divergence(&mut self.fx, &self.lv)?;

        let (lt, rhs0, src) = (&self.mj, &self.rhs0, &self.fx);
        let rhs1 = &mut self.mnext;
        rhs1.par_iter_mut()
            .enumerate()
            .for_each(|(i, m)| *m = lt[i] + 0.5 * ht * (rhs0[i] + *m + src[i]));
        Ok(())
    }

    /// Full-Newton semi-Lagrangian continuity step with the source term
    /// div(λṽ) evaluated along the characteristic.
    fn continuity_step_sl_fn(
        &mut self,
        diff: &mut SpectralDiff,
        vtilde: &VecField,
        adjoint: &ScaField,
        j: usize,
        k: usize,
    ) -> Result<()> {
        let ht = self.ht;

        let lam = adjoint.frame(j, k);
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x3[i]);
        diff.divergence(&mut self.rhs0, &self.lv)?;
        self.traj_adjoint.interpolate(&mut self.stage, &self.rhs0);

        let lam = adjoint.frame(j - 1, k);
        self.lv.x1.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x1[i]);
        self.lv.x2.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x2[i]);
        self.lv.x3.par_iter_mut().enumerate().for_each(|(i, o)| *o = lam[i] * vtilde.x3[i]);
        diff.divergence(&mut self.rhs0, &self.lv)?;

        self.traj_adjoint.interpolate(&mut self.fx, &self.mj);
        let (lx, divv, divvx, srcx, src1) =
            (&self.fx, &self.divv, &self.divvx, &self.stage, &self.rhs0);
        self.mnext.par_iter_mut().enumerate().for_each(|(i, m)| {
            let rhs0 = lx[i] * divvx[i] + srcx[i];
            let rhs1 = (lx[i] + ht * rhs0) * divv[i] + src1[i];
            *m = lx[i] + 0.5 * ht * (rhs0 + rhs1);
        });
        Ok(())
    }
}
