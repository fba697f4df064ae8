//! Spectral differentiation service.
//!
//! Supplies the differential operators consumed by the transport problem,
//! the regularization model and the preconditioner: gradient, divergence,
//! Laplacian, analytic inverses of the regularization operators, and
//! restriction/prolongation between the fine and coarse grids of the
//! two-level preconditioner.

pub mod spectral;
pub mod wavenumber;

pub use spectral::SpectralDiff;
pub use wavenumber::{fold_wavenumber, fold_wavenumber_inv};
