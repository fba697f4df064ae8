//! Error types for the registration solver.
//!
//! Every public entry point validates its preconditions up front and fails
//! on the first violation. Krylov/CG convergence problems are deliberately
//! not part of this taxonomy: a solver that hits its iteration cap logs a
//! warning and returns the approximate result it has, consistent with an
//! inexact-Newton strategy.

use thiserror::Error;

/// Main error type for registration operations.
#[derive(Error, Debug)]
pub enum ClaireError {
    /// A required container or binding is unset.
    #[error("null pointer: {0} is not set")]
    NullPointer(&'static str),

    /// The solver state or configuration is inconsistent.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A selector (gradient type, matvec type, norm) has no handler.
    #[error("operator not implemented: {0}")]
    NotImplemented(&'static str),

    /// A raw buffer does not match the expected container size.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Out of memory while constructing a field container.
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// A collective reduction returned a non-success status.
    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    /// An analytic operator inversion would divide by zero.
    #[error("division by zero in {0}")]
    DivideByZero(&'static str),

    /// File I/O error from the read/write boundary.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, ClaireError>;

impl ClaireError {
    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an i/o error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClaireError::NullPointer("velocity field");
        assert_eq!(err.to_string(), "null pointer: velocity field is not set");

        let err = ClaireError::DimensionMismatch { expected: 8, actual: 4 };
        assert!(err.to_string().contains("expected 8"));
        assert!(err.to_string().contains("got 4"));
    }

    #[test]
    fn test_invalid_state() {
        let err = ClaireError::invalid_state("nt <= 0");
        assert!(matches!(err, ClaireError::InvalidState(_)));
    }
}
