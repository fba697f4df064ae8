//! CLAIRE: constrained large deformation diffeomorphic image registration.
//!
//! Given a reference and a template image, this crate computes a smooth,
//! invertible spatial transformation, parameterized by a stationary
//! velocity field, that deforms the template to match the reference. The
//! map is found by solving a PDE-constrained optimal-control problem: the
//! transport equation advects image intensity under the velocity field,
//! and an inexact Newton-Krylov method minimizes the image mismatch plus
//! a Sobolev smoothness penalty on the control.
//!
//! # Modules
//! - `field`: scalar/vector field containers with channels and time history
//! - `diff`: spectral differential operators on the periodic grid
//! - `regularization`: smoothing functional, its variations and inverse
//! - `transport`: forward/adjoint/incremental transport solves
//! - `distance`: squared-L2 data-fidelity term
//! - `engine`: objective, reduced gradient, Hessian matvecs, H0 preconditioner
//! - `krylov`: PCG solver, forcing sequence, Newton-Krylov driver
//! - `readwrite`: NIfTI-backed persistence boundary

pub mod config;
pub mod diff;
pub mod distance;
pub mod engine;
pub mod error;
pub mod fft;
pub mod field;
pub mod grid;
pub mod krylov;
pub mod readwrite;
pub mod regularization;
pub mod transport;

pub use config::{
    ForcingSequence, GradientKind, MatVecKind, Monitor, NewtonKind, PdeScheme, PrecondKind,
    RegConfig, RegNorm,
};
pub use engine::Claire;
pub use error::{ClaireError, Result};
pub use field::{ScaField, VecField};
pub use grid::GridSize;
pub use krylov::{NewtonKrylov, NewtonOutcome};
pub use readwrite::{NiftiReadWrite, ReadWrite};

/// Register a template image onto a reference image.
///
/// Convenience entry point: builds the engine, runs the Newton-Krylov
/// optimization from a zero initial control, and returns the velocity
/// field together with the solver outcome. Both images are flat volumes
/// of length `grid.nl() * cfg.nc` in Fortran order.
pub fn register(
    cfg: RegConfig,
    template: &[f64],
    reference: &[f64],
) -> Result<(VecField, NewtonOutcome)> {
    let grid = cfg.grid;
    let mut engine = Claire::new(cfg.clone())?;
    engine.set_template_image(template)?;
    engine.set_reference_image(reference)?;
    engine.initialize_solver()?;

    let mut v = VecField::new(grid)?;
    let mut newton = NewtonKrylov::new(&cfg)?;
    let outcome = newton.solve(&mut engine, &mut v)?;
    engine.finalize(&v)?;
    Ok((v, outcome))
}
