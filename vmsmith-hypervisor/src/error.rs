//! Error types for the hypervisor management layer.

use thiserror::Error;

/// Errors that can occur during domain and volume operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// A referenced domain, pool, volume or file does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The target name already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Domain is in an invalid state for the requested operation.
    #[error("Invalid domain state for operation: {0}")]
    InvalidState(String),

    /// Malformed MAC seed, malformed configuration document, etc.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Identifier generation ran out of attempts.
    #[error("Failed to generate a free {what} after {attempts} attempts")]
    ExhaustedAttempts {
        what: &'static str,
        attempts: u32,
    },

    /// An external program failed.
    #[error("Program error: {0}")]
    ProgramError(String),

    /// Opaque failure reported by the management API.
    #[error("Management API error: {0}")]
    Management(String),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
