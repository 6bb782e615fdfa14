//! Shared error types for the network configuration engine.

use thiserror::Error;

/// How the boot sequence must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log, pause, then terminate with non-zero status.
    Fatal,

    /// Log and keep going.
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Fatal => write!(f, "fatal"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Failure reported by an external facility (ipadm layer, DHCP agent, services).
#[derive(Debug, Error)]
pub enum FacilityError {
    /// The facility rejected the request with a status message.
    #[error("{operation} failed: {detail}")]
    Rejected { operation: String, detail: String },

    /// The facility did not answer within the allotted time.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Could not reach or launch the facility at all.
    #[error("{operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl FacilityError {
    /// Build a `Rejected` error.
    pub fn rejected(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Build an `Io` error.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Whether this failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FacilityError::Timeout { .. })
    }
}
