//! Optimal-control engine: objective, reduced gradient and Hessian-vector
//! products of the registration Lagrangian.
//!
//! The engine owns the state/adjoint/incremental containers and all work
//! fields (allocate-once), and drives the transport problem, distance
//! measure and regularization model. The transport collaborators receive
//! borrows for the duration of a call and never hold on to engine state.
//!
//! Scaling convention: the adjoint solves multiply the assembled body
//! force by the cell measure hd; `hessian_matvec` divides its result by
//! hd unless the caller requests the unscaled form. The asymmetry is
//! deliberate and kept as-is.

pub mod precond;

use crate::config::{GradientKind, MatVecKind, Monitor, NewtonKind, PrecondKind, RegConfig};
use crate::diff::SpectralDiff;
use crate::distance::DistanceMeasure;
use crate::error::{ClaireError, Result};
use crate::field::{ScaField, VecField};
use crate::readwrite::ReadWrite;
use crate::regularization::RegularizationModel;
use crate::transport::TransportProblem;

use precond::H0Precond;

/// The optimal-control registration engine.
pub struct Claire {
    cfg: RegConfig,
    pub monitor: Monitor,

    diff: SpectralDiff,
    reg: RegularizationModel,
    transport: TransportProblem,
    distance: DistanceMeasure,
    precond: H0Precond,

    template: Option<ScaField>,
    reference: Option<ScaField>,

    state: Option<ScaField>,
    adjoint: Option<ScaField>,
    inc_state: Option<ScaField>,
    inc_adjoint: Option<ScaField>,

    velocity: Option<VecField>,
    inc_velocity: Option<VecField>,

    // work vector fields; work2 carries the (incremental) body force
    work1: Option<VecField>,
    work2: Option<VecField>,
    work5: Option<VecField>,

    readwrite: Option<Box<dyn ReadWrite>>,

    /// The preconditioner caches the base-point state gradient; invalid
    /// after every fresh forward solve.
    precond_grad_valid: bool,
    /// Relative tolerance handed down by the Krylov forcing sequence.
    krylov_reltol: f64,
}

impl Claire {
    pub fn new(cfg: RegConfig) -> Result<Self> {
        let grid = cfg.grid;
        let hd = grid.cell_measure();
        Ok(Self {
            diff: SpectralDiff::new(grid),
            reg: RegularizationModel::new(grid, cfg.reg_norm, cfg.beta[0], cfg.beta[1]),
            transport: TransportProblem::new(&cfg)?,
            distance: DistanceMeasure::new(cfg.nc, cfg.nt, hd),
            precond: H0Precond::new(grid)?,
            monitor: Monitor::default(),
            template: None,
            reference: None,
            state: None,
            adjoint: None,
            inc_state: None,
            inc_adjoint: None,
            velocity: None,
            inc_velocity: None,
            work1: None,
            work2: None,
            work5: None,
            readwrite: None,
            precond_grad_valid: false,
            krylov_reltol: 1e-1,
            cfg,
        })
    }

    pub fn config(&self) -> &RegConfig {
        &self.cfg
    }

    /// Lebesgue measure of a grid cell.
    #[inline]
    pub fn cell_measure(&self) -> f64 {
        self.cfg.grid.cell_measure()
    }

    pub fn set_read_write(&mut self, rw: Box<dyn ReadWrite>) {
        self.readwrite = Some(rw);
    }

    /// Relative tolerance of the current outer Krylov solve, consumed by
    /// the two-level preconditioner.
    pub fn set_krylov_reltol(&mut self, reltol: f64) {
        self.krylov_reltol = reltol;
    }

    /// Bind the template image m_T (length nl·nc).
    pub fn set_template_image(&mut self, m: &[f64]) -> Result<()> {
        let (nl, nc) = (self.cfg.grid.nl(), self.cfg.nc);
        let field = self.template.get_or_insert(ScaField::new(nl, nc, 1)?);
        field.set_frame(m, 0)
    }

    /// Bind the reference image m_R (length nl·nc).
    pub fn set_reference_image(&mut self, m: &[f64]) -> Result<()> {
        let (nl, nc) = (self.cfg.grid.nl(), self.cfg.nc);
        let field = self.reference.get_or_insert(ScaField::new(nl, nc, 1)?);
        field.set_frame(m, 0)
    }

    /// Pre-allocate every container so repeated solves never allocate
    /// (warm start).
    pub fn initialize_solver(&mut self) -> Result<()> {
        let cfg = &self.cfg;
        let (nl, nc) = (cfg.grid.nl(), cfg.nc);
        let fullnewton = cfg.newton == NewtonKind::FullNewton;

        allocate_once_sca(&mut self.state, nl, nc, cfg.nslots())?;
        allocate_once_sca(&mut self.adjoint, nl, nc, cfg.adjoint_nslots())?;
        allocate_once_sca(
            &mut self.inc_state,
            nl,
            nc,
            if fullnewton { cfg.nt + 1 } else { cfg.nslots() },
        )?;
        allocate_once_sca(&mut self.inc_adjoint, nl, nc, cfg.adjoint_nslots())?;

        let grid = cfg.grid;
        allocate_once_vec(&mut self.velocity, grid)?;
        allocate_once_vec(&mut self.inc_velocity, grid)?;
        allocate_once_vec(&mut self.work1, grid)?;
        allocate_once_vec(&mut self.work2, grid)?;
        allocate_once_vec(&mut self.work5, grid)?;
        Ok(())
    }

    /// Bind the control variable.
    pub fn set_velocity(&mut self, v: &VecField) -> Result<()> {
        allocate_once_vec(&mut self.velocity, self.cfg.grid)?;
        self.velocity.as_mut().unwrap().copy_from(v)
    }

    /// Copy of the current control variable.
    pub fn velocity(&self) -> Result<&VecField> {
        self.velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))
    }

    /// True if no control is set or the control is exactly zero.
    pub fn is_velocity_zero(&self) -> bool {
        self.velocity.as_ref().map_or(true, |v| v.is_zero())
    }

    /// Bind an externally computed state variable.
    pub fn set_state_variable(&mut self, m: &ScaField) -> Result<()> {
        log::debug!("setting state variable");
        let cfg = &self.cfg;
        allocate_once_sca(&mut self.state, cfg.grid.nl(), cfg.nc, cfg.nslots())?;
        self.state.as_mut().unwrap().copy_from(m)?;
        self.precond_grad_valid = false;
        Ok(())
    }

    pub fn state_variable(&self) -> Result<&ScaField> {
        self.state
            .as_ref()
            .ok_or(ClaireError::NullPointer("state variable"))
    }

    /// Bind an externally computed adjoint variable.
    pub fn set_adjoint_variable(&mut self, l: &ScaField) -> Result<()> {
        let cfg = &self.cfg;
        allocate_once_sca(&mut self.adjoint, cfg.grid.nl(), cfg.nc, cfg.adjoint_nslots())?;
        self.adjoint.as_mut().unwrap().copy_from(l)
    }

    pub fn adjoint_variable(&self) -> Result<&ScaField> {
        self.adjoint
            .as_ref()
            .ok_or(ClaireError::NullPointer("adjoint variable"))
    }

    /// Final state m(t=1), copied out (length nl·nc).
    pub fn get_final_state(&self, m1: &mut [f64]) -> Result<()> {
        let state = self.state_variable()?;
        state.get_frame(m1, self.cfg.nt)
    }

    /// Standalone forward solve: m0 -> m1 under the bound velocity.
    pub fn solve_forward_problem(&mut self, m1: Option<&mut [f64]>, m0: &[f64]) -> Result<()> {
        self.set_template_image(m0)?;
        self.solve_state_equation()?;
        if let Some(m1) = m1 {
            self.get_final_state(m1)?;
        }
        Ok(())
    }

    /// Standalone adjoint solve: final condition from m1, returns λ(t=0).
    pub fn solve_adjoint_problem(&mut self, l0: &mut [f64], m1: &[f64]) -> Result<()> {
        let cfg = &self.cfg;
        allocate_once_sca(&mut self.state, cfg.grid.nl(), cfg.nc, cfg.nslots())?;
        self.state.as_mut().unwrap().set_frame(m1, cfg.nt)?;
        self.solve_adjoint_equation()?;
        self.adjoint.as_ref().unwrap().get_frame(l0, 0)
    }

    /// Advective CFL number max(Σ|v_d|/h_d)·ht and the step count that
    /// would bring it to one.
    pub fn compute_cfl_number(&self) -> Result<(f64, usize)> {
        let v = self.velocity()?;
        let h = self.cfg.grid.spacing();
        let mut vmax = 0.0_f64;
        for i in 0..v.nl() {
            let s = v.x1[i].abs() / h[0] + v.x2[i].abs() / h[1] + v.x3[i].abs() / h[2];
            vmax = vmax.max(s);
        }
        let cfl = vmax * self.cfg.ht();
        let nt_admissible = vmax.ceil().max(1.0) as usize;
        Ok((cfl, nt_admissible))
    }

    /// Evaluate the distance measure at the current control (runs a
    /// forward solve).
    pub fn evaluate_distance_measure(&mut self) -> Result<f64> {
        if self.reference.is_none() {
            return Err(ClaireError::NullPointer("reference image"));
        }
        self.solve_state_equation()?;
        let state = self.state.as_ref().unwrap();
        let reference = self.reference.as_ref().unwrap();
        self.distance.evaluate_functional(state, reference)
    }

    /// Objective J(v) = D(v) + R(v). The regularization term is skipped
    /// entirely for a zero control since R(0) = 0 for every supported
    /// norm.
    pub fn evaluate_objective(&mut self, v: &VecField) -> Result<f64> {
        log::debug!("evaluating objective");
        self.set_velocity(v)?;

        let d = self.evaluate_distance_measure()?;
        let r = if self.is_velocity_zero() {
            0.0
        } else {
            self.reg.evaluate_functional(self.velocity.as_ref().unwrap())?
        };

        let j = d + r;
        self.monitor.jval = j;
        self.monitor.dval = d;
        self.monitor.rval = r;
        self.monitor.obj_evals += 1;
        log::debug!("J(v) = D(v) + R(v) = {:e} + {:e}", d, r);
        Ok(j)
    }

    /// Reduced gradient of the Lagrangian. Requires a state variable from
    /// a prior forward solve; binds `v` if given.
    pub fn evaluate_gradient(&mut self, g: &mut VecField, v: Option<&VecField>) -> Result<()> {
        log::debug!("evaluating gradient");
        if self.state.is_none() {
            return Err(ClaireError::NullPointer("state variable"));
        }
        if let Some(v) = v {
            self.set_velocity(v)?;
        }
        allocate_once_vec(&mut self.work1, self.cfg.grid)?;

        // adjoint solve assembles the body force into work2
        self.solve_adjoint_equation()?;

        if self.is_velocity_zero() {
            // g = K[b]: the regularization gradient vanishes at v = 0
            g.copy_from(self.work2.as_ref().unwrap())?;
        } else {
            match self.cfg.gradient {
                GradientKind::L2 => self.evaluate_l2_gradient(g)?,
                GradientKind::Sobolev => self.evaluate_sobolev_gradient(g, false)?,
                GradientKind::SobolevSym => self.evaluate_sobolev_gradient(g, true)?,
            }
        }

        self.monitor.gradnorm = g.norm2();
        self.monitor.grad_evals += 1;
        log::debug!("||g||_2 = {:e}", self.monitor.gradnorm);
        Ok(())
    }

    /// L2 gradient g = βA[v] + K[b].
    fn evaluate_l2_gradient(&mut self, g: &mut VecField) -> Result<()> {
        let v = self
            .velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))?;
        let w1 = self
            .work1
            .as_mut()
            .ok_or(ClaireError::NullPointer("work vector field"))?;
        self.reg.evaluate_gradient(w1, v)?;
        w1.axpy(1.0, self.work2.as_ref().unwrap());
        g.copy_from(self.work1.as_ref().unwrap())
    }

    /// Sobolev gradient g = v + (βA)⁻¹K[b].
    fn evaluate_sobolev_gradient(&mut self, g: &mut VecField, sym: bool) -> Result<()> {
        let w2 = self
            .work2
            .as_ref()
            .ok_or(ClaireError::NullPointer("work vector field"))?;
        let w1 = self
            .work1
            .as_mut()
            .ok_or(ClaireError::NullPointer("work vector field"))?;
        self.reg.apply_inverse(w1, w2, sym)?;
        w1.axpy(1.0, self.velocity.as_ref().unwrap());
        g.copy_from(self.work1.as_ref().unwrap())
    }

    /// Hessian applied to a perturbation. Divides the raw result by the
    /// cell measure hd unless `scale` is set; the forward body-force
    /// assembly multiplies by the same measure.
    pub fn hessian_matvec(
        &mut self,
        hv: &mut VecField,
        vtilde: &VecField,
        scale: bool,
    ) -> Result<()> {
        log::debug!("computing hessian matvec");
        match self.cfg.matvec {
            MatVecKind::Default => self.hess_matvec(hv, vtilde)?,
            MatVecKind::H0 => self.h0_hess_matvec(hv, vtilde)?,
            MatVecKind::Precond => self.precond_hess_matvec(hv, vtilde)?,
            MatVecKind::PrecondSym => self.precond_hess_matvec_sym(hv, vtilde)?,
        }

        if !scale {
            let hd = self.cell_measure();
            hv.scale(1.0 / hd);
        }

        self.monitor.hess_matvecs += 1;
        Ok(())
    }

    /// Default matvec: H[ṽ] = βA[ṽ] + K[b̃] through the linearized
    /// forward and adjoint solves.
    fn hess_matvec(&mut self, hv: &mut VecField, vtilde: &VecField) -> Result<()> {
        log::debug!("regular hessian matvec");
        allocate_once_vec(&mut self.inc_velocity, self.cfg.grid)?;
        allocate_once_vec(&mut self.work1, self.cfg.grid)?;
        self.inc_velocity.as_mut().unwrap().copy_from(vtilde)?;

        self.solve_inc_state_equation()?;
        self.solve_inc_adjoint_equation()?;

        // βA[ṽ] + K[b̃]; the body force and incremental body force share
        // the same container
        let w1 = self.work1.as_mut().unwrap();
        self.reg
            .hessian_matvec(w1, self.inc_velocity.as_ref().unwrap())?;
        w1.axpy(1.0, self.work2.as_ref().unwrap());
        hv.copy_from(self.work1.as_ref().unwrap())
    }

    /// Gauss-Newton matvec at v = 0: the incremental PDE solves collapse
    /// onto the base-point state gradient, H[ṽ] = βA[ṽ] + hd·∇m(∇m·ṽ).
    fn h0_hess_matvec(&mut self, hv: &mut VecField, vtilde: &VecField) -> Result<()> {
        if self.state.is_none() {
            return Err(ClaireError::NullPointer("state variable"));
        }
        allocate_once_vec(&mut self.inc_velocity, self.cfg.grid)?;
        allocate_once_vec(&mut self.work1, self.cfg.grid)?;
        allocate_once_vec(&mut self.work2, self.cfg.grid)?;
        self.inc_velocity.as_mut().unwrap().copy_from(vtilde)?;

        let hd = self.cell_measure();

        // ∇m at t = 0
        let state = self.state.as_ref().unwrap();
        let grad = self.work1.as_mut().unwrap();
        self.diff.gradient(grad, state.frame(0, 0))?;

        // gMgMᵀ kernel: w2 = ∇m (∇m·ṽ)
        let grad = self.work1.as_ref().unwrap();
        let w2 = self.work2.as_mut().unwrap();
        precond::gmgmt_kernel(w2, grad, vtilde);

        self.apply_projection()?;
        self.work2.as_mut().unwrap().scale(hd);

        let w1 = self.work1.as_mut().unwrap();
        self.reg
            .hessian_matvec(w1, self.inc_velocity.as_ref().unwrap())?;
        w1.axpy(1.0, self.work2.as_ref().unwrap());
        hv.copy_from(self.work1.as_ref().unwrap())
    }

    /// Analytically preconditioned matvec
    /// P(H[ṽ]) = hd·ṽ + (βA)⁻¹K[b̃]; no longer symmetric.
    fn precond_hess_matvec(&mut self, hv: &mut VecField, vtilde: &VecField) -> Result<()> {
        log::debug!("preconditioned hessian matvec");
        allocate_once_vec(&mut self.inc_velocity, self.cfg.grid)?;
        allocate_once_vec(&mut self.work1, self.cfg.grid)?;
        self.inc_velocity.as_mut().unwrap().copy_from(vtilde)?;

        self.solve_inc_state_equation()?;
        self.solve_inc_adjoint_equation()?;

        let hd = self.cell_measure();
        let w2 = self.work2.as_ref().unwrap();
        let w1 = self.work1.as_mut().unwrap();
        self.reg.apply_inverse(w1, w2, false)?;

        let w2 = self.work2.as_mut().unwrap();
        w2.waxpy(hd, self.inc_velocity.as_ref().unwrap(), self.work1.as_ref().unwrap());
        hv.copy_from(self.work2.as_ref().unwrap())
    }

    /// Symmetrized preconditioned matvec
    /// P(H[ṽ]) = hd·ṽ + (βA)^{-1/2}K[(βA)^{-1/2}ṽ]; PCG-compatible.
    fn precond_hess_matvec_sym(&mut self, hv: &mut VecField, vtilde: &VecField) -> Result<()> {
        log::debug!("symmetric preconditioned hessian matvec");
        allocate_once_vec(&mut self.inc_velocity, self.cfg.grid)?;
        allocate_once_vec(&mut self.work1, self.cfg.grid)?;
        allocate_once_vec(&mut self.work5, self.cfg.grid)?;

        // stash ṽ: work fields 1 and 2 are overwritten by the solves
        self.work5.as_mut().unwrap().copy_from(vtilde)?;

        let w5 = self.work5.as_ref().unwrap();
        let iv = self.inc_velocity.as_mut().unwrap();
        self.reg.apply_inverse(iv, w5, true)?;

        self.solve_inc_state_equation()?;
        self.solve_inc_adjoint_equation()?;

        let w2 = self.work2.as_ref().unwrap();
        let w1 = self.work1.as_mut().unwrap();
        self.reg.apply_inverse(w1, w2, true)?;

        let hd = self.cell_measure();
        let w5 = self.work5.as_mut().unwrap();
        w5.scale(hd);
        w5.axpy(1.0, self.work1.as_ref().unwrap());
        hv.copy_from(self.work5.as_ref().unwrap())
    }

    /// Apply the inverse of H(v=0) through the spectrally preconditioned
    /// conjugate-gradient solve (the H0 preconditioner).
    pub fn apply_inv_hessian(
        &mut self,
        precx: &mut VecField,
        x: &VecField,
        twolevel: bool,
    ) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or(ClaireError::NullPointer("state variable"))?;
        let first = !self.precond_grad_valid;
        self.precond.apply(
            &mut self.diff,
            state,
            self.cfg.nt,
            self.cfg.beta,
            self.cfg.pctolint,
            self.krylov_reltol,
            precx,
            x,
            first,
            twolevel,
        )?;
        self.precond_grad_valid = true;
        Ok(())
    }

    /// Preconditioner entry point for the outer Krylov method.
    pub fn precond_matvec(&mut self, out: &mut VecField, x: &VecField) -> Result<()> {
        match self.cfg.precond {
            PrecondKind::None => out.copy_from(x),
            PrecondKind::InvReg => self.reg.apply_inverse(out, x, false),
            PrecondKind::H0 => self.apply_inv_hessian(out, x, false),
            PrecondKind::TwoLevel => self.apply_inv_hessian(out, x, true),
        }
    }

    /// Extension point for the projection onto divergence-free velocity
    /// fields; currently the identity.
    fn apply_projection(&mut self) -> Result<()> {
        Ok(())
    }

    /// Forward solve of the state equation into the owned state variable.
    fn solve_state_equation(&mut self) -> Result<()> {
        let cfg = &self.cfg;
        let velocity = self
            .velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))?;
        let template = self
            .template
            .as_ref()
            .ok_or(ClaireError::NullPointer("template image"))?;

        allocate_once_sca(&mut self.state, cfg.grid.nl(), cfg.nc, cfg.nslots())?;
        let state = self.state.as_mut().unwrap();

        self.transport
            .solve_forward(&mut self.diff, state, template, velocity)?;

        self.monitor.pde_solves += 1;
        self.precond_grad_valid = false;
        Ok(())
    }

    /// Backward solve of the adjoint equation; assembles the body force
    /// K[b] (scaled by hd) into work2.
    fn solve_adjoint_equation(&mut self) -> Result<()> {
        let cfg = &self.cfg;
        let velocity = self
            .velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))?;
        let state = self
            .state
            .as_ref()
            .ok_or(ClaireError::NullPointer("state variable"))?;
        let reference = self
            .reference
            .as_ref()
            .ok_or(ClaireError::NullPointer("reference image"))?;

        allocate_once_sca(&mut self.adjoint, cfg.grid.nl(), cfg.nc, cfg.adjoint_nslots())?;
        allocate_once_vec(&mut self.work2, cfg.grid)?;

        let adjoint = self.adjoint.as_mut().unwrap();
        self.distance
            .set_final_condition_ae(adjoint, state, reference)?;

        let body_force = self.work2.as_mut().unwrap();
        self.transport
            .solve_adjoint(&mut self.diff, adjoint, state, velocity, body_force)?;

        self.apply_projection()?;
        let hd = cfg.grid.cell_measure();
        self.work2.as_mut().unwrap().scale(hd);

        self.monitor.pde_solves += 1;
        Ok(())
    }

    /// Forward solve of the incremental state equation.
    fn solve_inc_state_equation(&mut self) -> Result<()> {
        let cfg = &self.cfg;
        let velocity = self
            .velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))?;
        let inc_velocity = self
            .inc_velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("incremental velocity field"))?;
        let state = self
            .state
            .as_ref()
            .ok_or(ClaireError::NullPointer("state variable"))?;

        let fullnewton = cfg.newton == NewtonKind::FullNewton;
        allocate_once_sca(
            &mut self.inc_state,
            cfg.grid.nl(),
            cfg.nc,
            if fullnewton { cfg.nt + 1 } else { cfg.nslots() },
        )?;
        let inc_state = self.inc_state.as_mut().unwrap();
        inc_state.set(0.0);

        self.transport.solve_inc_forward(
            &mut self.diff,
            inc_state,
            state,
            velocity,
            inc_velocity,
        )?;
        self.monitor.pde_solves += 1;
        Ok(())
    }

    /// Backward solve of the incremental adjoint equation; assembles the
    /// incremental body force K[b̃] (scaled by hd) into work2.
    fn solve_inc_adjoint_equation(&mut self) -> Result<()> {
        let cfg = &self.cfg;
        let fullnewton = cfg.newton == NewtonKind::FullNewton;
        let velocity = self
            .velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("velocity field"))?;
        let inc_velocity = self
            .inc_velocity
            .as_ref()
            .ok_or(ClaireError::NullPointer("incremental velocity field"))?;
        let state = self
            .state
            .as_ref()
            .ok_or(ClaireError::NullPointer("state variable"))?;
        let inc_state = self
            .inc_state
            .as_ref()
            .ok_or(ClaireError::NullPointer("incremental state variable"))?;

        allocate_once_sca(
            &mut self.inc_adjoint,
            cfg.grid.nl(),
            cfg.nc,
            cfg.adjoint_nslots(),
        )?;
        allocate_once_vec(&mut self.work2, cfg.grid)?;

        let inc_adjoint = self.inc_adjoint.as_mut().unwrap();
        self.distance
            .set_final_condition_iae(inc_adjoint, inc_state)?;

        let body_force = self.work2.as_mut().unwrap();
        self.transport.solve_inc_adjoint(
            &mut self.diff,
            inc_adjoint,
            state,
            self.adjoint.as_ref(),
            Some(inc_state),
            velocity,
            inc_velocity,
            fullnewton,
            body_force,
        )?;

        self.apply_projection()?;
        let hd = cfg.grid.cell_measure();
        self.work2.as_mut().unwrap().scale(hd);

        self.monitor.pde_solves += 1;
        Ok(())
    }

    /// Evaluate distance, objective and gradient norm at the current
    /// control and latch them as the reference values for relative
    /// convergence tests.
    pub fn initialize_optimization(&mut self) -> Result<()> {
        allocate_once_vec(&mut self.velocity, self.cfg.grid)?;
        let v = self.velocity.as_ref().unwrap().clone();

        let d = self.evaluate_distance_measure()?;
        self.monitor.dval0 = d;

        let j = self.evaluate_objective(&v)?;
        self.monitor.jval0 = j;

        let mut g = VecField::new(self.cfg.grid)?;
        self.evaluate_gradient(&mut g, None)?;
        self.monitor.gradnorm0 = g.norm2();
        log::info!("initial gradient norm: {:e}", self.monitor.gradnorm0);
        Ok(())
    }

    /// Final reporting: residuals before/after registration, output of
    /// the velocity field and deformed template through the read/write
    /// boundary if one is bound.
    pub fn finalize(&mut self, v: &VecField) -> Result<()> {
        log::info!("finalizing registration");
        self.set_velocity(v)?;

        let template = self
            .template
            .as_ref()
            .ok_or(ClaireError::NullPointer("template image"))?;
        let reference = self
            .reference
            .as_ref()
            .ok_or(ClaireError::NullPointer("reference image"))?;

        // ||mR - mT|| before registration
        let nlnc = self.cfg.grid.nl() * self.cfg.nc;
        let mut res0_l2 = 0.0_f64;
        let mut res0_inf = 0.0_f64;
        for k in 0..self.cfg.nc {
            for (&a, &b) in template.frame(0, k).iter().zip(reference.frame(0, k).iter()) {
                let d = (a - b).abs();
                res0_l2 += d * d;
                res0_inf = res0_inf.max(d);
            }
        }
        let res0_l2 = res0_l2.sqrt();

        // ||mR - m1|| after registration
        self.solve_state_equation()?;
        let state = self.state.as_ref().unwrap();
        let reference = self.reference.as_ref().unwrap();
        let mut res1_l2 = 0.0_f64;
        let mut res1_inf = 0.0_f64;
        for k in 0..self.cfg.nc {
            for (&a, &b) in state
                .frame(self.cfg.nt, k)
                .iter()
                .zip(reference.frame(0, k).iter())
            {
                let d = (a - b).abs();
                res1_l2 += d * d;
                res1_inf = res1_inf.max(d);
            }
        }
        let res1_l2 = res1_l2.sqrt();

        log::info!("residual ||mR - mT||_2   = {:e}", res0_l2);
        log::info!("residual ||mR - mT||_inf = {:e}", res0_inf);
        log::info!("residual ||mR - m1||_2   = {:e}", res1_l2);
        log::info!("residual ||mR - m1||_inf = {:e}", res1_inf);
        if res0_l2 > 0.0 {
            log::info!("relative residual reduction: {:e}", res1_l2 / res0_l2);
        }

        if let Some(rw) = self.readwrite.as_mut() {
            let multichannel = self.cfg.nc > 1;
            let mut m1 = vec![0.0; nlnc];
            state.get_frame(&mut m1, self.cfg.nt)?;
            rw.write_template(&m1, "deformed-template-image", multichannel)?;

            let v = self.velocity.as_ref().unwrap();
            let mut flat = vec![0.0; 3 * v.nl()];
            v.get_components(&mut flat)?;
            rw.write(&flat, "velocity-field")?;
        }
        Ok(())
    }
}

impl crate::krylov::HessianOperator for Claire {
    fn apply(&mut self, out: &mut VecField, x: &VecField) -> Result<()> {
        self.hessian_matvec(out, x, false)
    }

    fn precond(&mut self, out: &mut VecField, x: &VecField) -> Result<()> {
        self.precond_matvec(out, x)
    }
}

/// Allocate a scalar field only if the slot is still empty.
fn allocate_once_sca(
    slot: &mut Option<ScaField>,
    nl: usize,
    nc: usize,
    nslots: usize,
) -> Result<()> {
    if slot.is_none() {
        *slot = Some(ScaField::new(nl, nc, nslots)?);
    }
    Ok(())
}

/// Allocate a vector field only if the slot is still empty.
fn allocate_once_vec(slot: &mut Option<VecField>, grid: crate::grid::GridSize) -> Result<()> {
    if slot.is_none() {
        *slot = Some(VecField::new(grid)?);
    }
    Ok(())
}
