//! Error types for PA (Performance Administration) operations.
//!
//! Internal lookup failures are translated into this taxonomy at the public
//! entry points. Each variant maps onto a protocol status sub-code through
//! [`PaError::status_code`] so a MAD responder can fill in its status field
//! without inspecting messages.

use thiserror::Error;

/// Result type alias for PA operations.
pub type Result<T> = std::result::Result<T, PaError>;

/// Protocol status sub-codes reported alongside an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaStatusCode {
    InvalidParameter,
    InvalidSetting,
    Unavailable,
    NoGroup,
    NoVf,
    NoPort,
    NoImage,
    NoData,
    BadData,
    NoRecords,
    InsufficientMemory,
    Corrupt,
}

/// Errors surfaced by the PA access layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaError {
    /// Malformed caller input; detected before any lock is taken.
    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// The request is valid but the engine is configured not to serve it.
    #[error("Invalid setting: {reason}")]
    InvalidSetting { code: PaStatusCode, reason: String },

    /// The engine is stopping or stopped.
    #[error("PA engine unavailable")]
    Unavailable,

    /// A named group, VF, port or image does not exist.
    #[error("{what} not found")]
    NotFound { code: PaStatusCode, what: String },

    /// A bounded resource (freeze slots, client ids, memory) is exhausted.
    #[error("Insufficient memory: {what}")]
    InsufficientMemory { code: PaStatusCode, what: String },

    /// A composite buffer or snapshot graph is structurally invalid.
    #[error("Corrupt data: {reason}")]
    Corrupt { reason: String },

    /// A composite buffer was produced by an incompatible history format.
    #[error("History version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

impl PaError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    pub fn not_found(code: PaStatusCode, what: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            what: what.into(),
        }
    }

    pub fn no_memory(code: PaStatusCode, what: impl Into<String>) -> Self {
        Self::InsufficientMemory {
            code,
            what: what.into(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    /// Status sub-code carried on the wire for this error.
    pub fn status_code(&self) -> PaStatusCode {
        match self {
            PaError::InvalidParameter { .. } => PaStatusCode::InvalidParameter,
            PaError::InvalidSetting { code, .. } => *code,
            PaError::Unavailable => PaStatusCode::Unavailable,
            PaError::NotFound { code, .. } => *code,
            PaError::InsufficientMemory { code, .. } => *code,
            PaError::Corrupt { .. } => PaStatusCode::Corrupt,
            PaError::VersionMismatch { .. } => PaStatusCode::InvalidParameter,
        }
    }
}

impl From<std::collections::TryReserveError> for PaError {
    fn from(_: std::collections::TryReserveError) -> Self {
        PaError::no_memory(PaStatusCode::InsufficientMemory, "allocation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            PaError::invalid("range is zero").status_code(),
            PaStatusCode::InvalidParameter
        );
        assert_eq!(
            PaError::not_found(PaStatusCode::NoGroup, "Group Foo").status_code(),
            PaStatusCode::NoGroup
        );
        assert_eq!(PaError::Unavailable.status_code(), PaStatusCode::Unavailable);
        assert_eq!(
            PaError::VersionMismatch {
                found: 1,
                expected: 2
            }
            .status_code(),
            PaStatusCode::InvalidParameter
        );
    }

    #[test]
    fn test_display() {
        let err = PaError::not_found(PaStatusCode::NoPort, "Port 3 of LID 0x0007");
        assert_eq!(err.to_string(), "Port 3 of LID 0x0007 not found");
    }

    #[test]
    fn test_try_reserve_maps_to_insufficient_memory() {
        let mut v: Vec<u64> = Vec::new();
        let err: PaError = v.try_reserve(usize::MAX).unwrap_err().into();
        assert!(matches!(err, PaError::InsufficientMemory { .. }));
    }
}
