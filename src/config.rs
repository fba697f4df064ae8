//! Solver configuration and run monitor.
//!
//! `RegConfig` is the immutable configuration handed to every component at
//! construction; `Monitor` is the small mutable counter/value store that is
//! only touched where counters are actually incremented.

use crate::grid::GridSize;

/// Time integration scheme for the transport equations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdeScheme {
    /// Explicit 2nd-order Runge-Kutta (trapezoidal) stepping.
    Rk2,
    /// Semi-Lagrangian stepping along backward characteristics.
    SemiLagrangian,
}

/// Hessian matvec operator selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatVecKind {
    /// Linearized forward + adjoint solves, H = βA + K.
    Default,
    /// Gauss-Newton block at v = 0 built from the base-point state gradient.
    H0,
    /// Analytically preconditioned operator v + (βA)⁻¹K[v]; not symmetric.
    Precond,
    /// Symmetrized variant v + (βA)^{-1/2}K[v](βA)^{-1/2}; PCG-compatible.
    PrecondSym,
}

/// Reduced-gradient flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradientKind {
    /// L2 gradient βA[v] + K[b].
    L2,
    /// Sobolev gradient v + (βA)⁻¹K[b].
    Sobolev,
    /// Sobolev gradient with the symmetric square-root inverse.
    SobolevSym,
}

/// Hessian approximation for the outer Newton method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewtonKind {
    /// Drop second-order state/adjoint sensitivities; no λ history needed.
    GaussNewton,
    /// Retain them; requires the full time history of state and adjoint.
    FullNewton,
}

/// Regularization norm selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegNorm {
    /// H1 norm, symbol βv|w|² + βw.
    H1,
    /// H2 norm, symbol βv|w|⁴ + βw.
    H2,
    /// H1 seminorm (βw = 0).
    H1Seminorm,
    /// H2 seminorm (βw = 0).
    H2Seminorm,
}

/// Forcing sequence for the inexact Newton-Krylov tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForcingSequence {
    /// Fixed tolerance, no adaptation.
    None,
    /// Assume quadratic convergence: η = ‖g‖/‖g0‖.
    Quadratic,
    /// Assume superlinear convergence: η = sqrt(‖g‖/‖g0‖).
    Superlinear,
}

/// Preconditioner applied inside the outer Krylov solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrecondKind {
    /// No preconditioning.
    None,
    /// Analytic inverse of the regularization operator.
    InvReg,
    /// Single-level H0 conjugate-gradient preconditioner.
    H0,
    /// Two-level (fine/coarse) H0 conjugate-gradient preconditioner.
    TwoLevel,
}

/// Immutable solver configuration.
#[derive(Clone, Debug)]
pub struct RegConfig {
    /// Fine grid size.
    pub grid: GridSize,
    /// Number of time steps for the transport solves.
    pub nt: usize,
    /// Number of image channels.
    pub nc: usize,
    /// Regularization weights: [βv, βw, β_div, β_continuation].
    pub beta: [f64; 4],
    pub reg_norm: RegNorm,
    pub pde_scheme: PdeScheme,
    pub matvec: MatVecKind,
    pub gradient: GradientKind,
    pub newton: NewtonKind,
    pub precond: PrecondKind,
    /// Per-stage preconditioner tolerances [coarse-vs-reltol, pre, post].
    pub pctolint: [f64; 3],
    /// Forcing sequence for the Krylov tolerance.
    pub fseq: ForcingSequence,
    /// Outer Krylov iteration cap.
    pub krylov_maxit: usize,
    /// Outer Newton iteration cap.
    pub newton_maxit: usize,
    /// Relative gradient reduction for the Newton stop.
    pub opttol: f64,
    /// Store the full time history of the state variable.
    pub store_time_history: bool,
    /// Verbosity level (mapped onto log levels by the caller).
    pub verbosity: u8,
}

impl RegConfig {
    /// Configuration with the defaults used throughout the test problems.
    pub fn new(grid: GridSize, nt: usize) -> Self {
        Self {
            grid,
            nt,
            nc: 1,
            beta: [1e-2, 1e-4, 0.0, 0.0],
            reg_norm: RegNorm::H2,
            pde_scheme: PdeScheme::Rk2,
            matvec: MatVecKind::Default,
            gradient: GradientKind::L2,
            newton: NewtonKind::GaussNewton,
            precond: PrecondKind::InvReg,
            pctolint: [1e-1, 1e-1, 1e-1],
            fseq: ForcingSequence::Quadratic,
            krylov_maxit: 50,
            newton_maxit: 30,
            opttol: 1e-6,
            store_time_history: true,
            verbosity: 1,
        }
    }

    /// Time step size on the synthetic interval [0, 1].
    #[inline]
    pub fn ht(&self) -> f64 {
        1.0 / self.nt as f64
    }

    /// Number of stored time slots for a field with history.
    #[inline]
    pub fn nslots(&self) -> usize {
        if self.store_time_history {
            self.nt + 1
        } else {
            1
        }
    }

    /// Adjoint-type fields store history only under full Newton.
    #[inline]
    pub fn adjoint_nslots(&self) -> usize {
        if self.newton == NewtonKind::FullNewton {
            self.nt + 1
        } else {
            1
        }
    }
}

/// Mutable run counters and monitored values.
#[derive(Clone, Debug, Default)]
pub struct Monitor {
    pub obj_evals: usize,
    pub grad_evals: usize,
    pub hess_matvecs: usize,
    pub pde_solves: usize,
    pub newton_iters: usize,
    pub krylov_iters: usize,
    /// Objective, distance and regularization values of the latest evaluation.
    pub jval: f64,
    pub dval: f64,
    pub rval: f64,
    /// Values at the initial guess, latched by initialize_optimization.
    pub jval0: f64,
    pub dval0: f64,
    pub gradnorm0: f64,
    pub gradnorm: f64,
}
