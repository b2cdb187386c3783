//! Error taxonomy for the harness
//!
//! Three classes of failure with different blast radii:
//! - Configuration errors are fatal for the single test case that produced
//!   them; the suite records the case as failed and moves on.
//! - Numerical mismatches are not errors at this level at all; they are
//!   counted by the correctness checker and surface in suite summaries.
//! - Backend failures (pipeline compilation, device loss) are unrecoverable
//!   for the whole run: the kernel generator is the component under test,
//!   so retrying a failed compile yields no new information.

use thiserror::Error;

use crate::precision::Operand;

/// Error type for harness operations
#[derive(Debug, Error)]
pub enum VerificarError {
    /// No storage precision assigned for an operand a dispatch requires
    #[error("no precision assigned for operand {operand}")]
    MissingPrecision {
        /// The operand the dispatch needed
        operand: Operand,
    },

    /// Grid sizing was asked to divide by a zero granularity
    #[error("dispatch granularity must be positive")]
    InvalidGranularity,

    /// Two arrays fed to a comparison or codec differ in length
    #[error("length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch {
        /// Element count the caller declared
        expected: usize,
        /// Element count actually present
        actual: usize,
    },

    /// Kernel source failed to compile into a pipeline
    #[error("kernel compilation failed: {0}")]
    KernelCompile(String),

    /// The GPU backend rejected or lost a request
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// A handle referred to a pipeline, buffer, or batch the backend does not know
    #[error("unknown {kind} handle {id}")]
    UnknownHandle {
        /// Handle category ("pipeline", "buffer", "batch")
        kind: &'static str,
        /// Raw handle value
        id: usize,
    },
}

impl VerificarError {
    /// Whether this error aborts the whole run rather than one test case
    ///
    /// Per the error-handling policy, backend and compile failures have no
    /// retry path; everything else is contained to the current case.
    #[must_use]
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            VerificarError::KernelCompile(_) | VerificarError::BackendFailure(_)
        )
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, VerificarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_precision_display() {
        let err = VerificarError::MissingPrecision {
            operand: Operand::Q,
        };
        assert!(err.to_string().contains("Q"));
        assert!(!err.is_fatal_for_run());
    }

    #[test]
    fn test_fatality_split() {
        assert!(VerificarError::KernelCompile("bad source".into()).is_fatal_for_run());
        assert!(VerificarError::BackendFailure("device lost".into()).is_fatal_for_run());
        assert!(!VerificarError::InvalidGranularity.is_fatal_for_run());
        assert!(!VerificarError::LengthMismatch {
            expected: 4,
            actual: 2
        }
        .is_fatal_for_run());
    }

    #[test]
    fn test_length_mismatch_display() {
        let err = VerificarError::LengthMismatch {
            expected: 100,
            actual: 99,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("99"));
    }
}
