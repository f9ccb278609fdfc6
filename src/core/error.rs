// This module defines the error taxonomy of the shader backend using the thiserror crate.
// CompileError covers the three failure classes a shader-variant compile can hit:
// unsupported constructs (unknown opcodes, unhandled intrinsics, malformed texture
// source combinations), structural violations (uses of SSA values that were never bound,
// variable accesses outside the declared array length, broken control-flow nesting), and
// resource exhaustion surfaced by the register-allocation fallback once the lane-group
// count cannot be halved any further. Every variant carries the context needed to name
// the offending construct in the diagnostic. ErrorKind exposes the class so the pipeline
// manager can decide whether a retry makes sense. CompileResult<T> is the crate-wide
// alias for Result<T, CompileError>.

//! Error types for shader compilation.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Failure class of a [`CompileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input uses something this backend cannot express. Never retried.
    Unsupported,
    /// The lane-group budget is exhausted.
    ResourceExhaustion,
    /// Internal consistency failure: upstream IR or our own bookkeeping is broken.
    Structural,
}

/// Main error type for shader compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Unsupported {construct}: {detail}")]
    Unsupported {
        construct: &'static str,
        detail: String,
    },

    #[error("Malformed texture sources: {reason}")]
    MalformedTexture {
        reason: String,
    },

    #[error("Use of SSA value %{id} with no reachable definition")]
    UndefinedValue {
        id: u32,
    },

    #[error("Variable {var} accessed at element {index}, but only {len} elements are declared")]
    VariableOutOfBounds {
        var: String,
        index: u32,
        len: u32,
    },

    #[error("Structural violation: {reason}")]
    Structural {
        reason: String,
    },

    #[error("Register allocation failed at {threads} threads")]
    RegisterPressure {
        threads: u32,
    },
}

impl CompileError {
    /// Shorthand for [`CompileError::Unsupported`].
    pub fn unsupported(construct: &'static str, detail: impl Into<String>) -> Self {
        CompileError::Unsupported {
            construct,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`CompileError::Structural`].
    pub fn structural(reason: impl Into<String>) -> Self {
        CompileError::Structural {
            reason: reason.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompileError::Unsupported { .. } | CompileError::MalformedTexture { .. } => {
                ErrorKind::Unsupported
            }
            CompileError::RegisterPressure { .. } => ErrorKind::ResourceExhaustion,
            CompileError::UndefinedValue { .. }
            | CompileError::VariableOutOfBounds { .. }
            | CompileError::Structural { .. } => ErrorKind::Structural,
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
