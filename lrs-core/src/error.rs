//! Backend Errors
//!
//! `TigerStyle`: Explicit error types with context.
//!
//! Three kinds reach callers: parameter errors (caller misuse, never
//! retried), engine errors (possibly transient) and bad-format errors (a
//! record that could not be decoded or validated). A bulk write that aborts
//! wraps its cause in [`BackendError::Write`] so the applied count survives.

use thiserror::Error;

/// Coarse classification of a [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied an invalid argument
    Parameter,
    /// Engine-level failure
    Engine,
    /// A record could not be decoded or validated
    BadFormat,
}

/// Errors from backend operations.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Invalid query shape, disallowed operation or invalid target
    #[error("invalid parameter: {message}")]
    Parameter {
        /// What was wrong with the argument
        message: String,
    },

    /// Connection failure, malformed response or rejected records
    #[error("{message}")]
    Engine {
        /// Cause as reported by the engine
        message: String,
    },

    /// A raw record could not be decoded or lacks mandatory fields
    #[error("bad format: {message}")]
    BadFormat {
        /// Decode or validation failure
        message: String,
    },

    /// Simulated fault (for DST)
    #[error("simulated fault: {fault_type}")]
    SimulatedFault {
        /// Type of simulated fault
        fault_type: String,
    },

    /// A write aborted after applying some records
    #[error("write aborted after {applied} records: {source}")]
    Write {
        /// Records the engine applied before the abort
        applied: usize,
        /// Cause of the abort
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// Create a parameter error.
    #[must_use]
    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter {
            message: message.into(),
        }
    }

    /// Create an engine error.
    #[must_use]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Create a bad-format error.
    #[must_use]
    pub fn bad_format(message: impl Into<String>) -> Self {
        Self::BadFormat {
            message: message.into(),
        }
    }

    /// Create a connection error (engine kind).
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Engine {
            message: format!("connection failed: {}", message.into()),
        }
    }

    /// Create a simulated fault error.
    #[must_use]
    pub fn simulated_fault(fault_type: impl Into<String>) -> Self {
        Self::SimulatedFault {
            fault_type: fault_type.into(),
        }
    }

    /// Wrap `source` with the number of records applied before it occurred.
    ///
    /// Parameter errors are returned unchanged: nothing is applied before
    /// they are raised.
    #[must_use]
    pub fn aborted_write(applied: usize, source: BackendError) -> Self {
        match source {
            Self::Parameter { .. } => source,
            Self::Write {
                applied: inner,
                source,
            } => Self::Write {
                applied: applied + inner,
                source,
            },
            other => Self::Write {
                applied,
                source: Box::new(other),
            },
        }
    }

    /// Classify this error, looking through write wrappers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parameter { .. } => ErrorKind::Parameter,
            Self::Engine { .. } | Self::SimulatedFault { .. } => ErrorKind::Engine,
            Self::BadFormat { .. } => ErrorKind::BadFormat,
            Self::Write { source, .. } => source.kind(),
        }
    }

    /// True when the caller misused the API.
    #[must_use]
    pub fn is_parameter(&self) -> bool {
        self.kind() == ErrorKind::Parameter
    }

    /// Records applied before an aborted write, 0 for every other error.
    #[must_use]
    pub fn applied(&self) -> usize {
        match self {
            Self::Write { applied, .. } => *applied,
            _ => 0,
        }
    }

    /// Check if this is a transient error (can be retried).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Engine { .. } | Self::SimulatedFault { .. } => true,
            Self::Write { source, .. } => source.is_transient(),
            Self::Parameter { .. } | Self::BadFormat { .. } => false,
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_format(err.to_string())
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
