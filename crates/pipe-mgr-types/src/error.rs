//! Pipeline manager status codes and error types.
//!
//! Every fallible operation in the HA and idle engines returns
//! [`PipeResult`]. The numeric [`PipeStatus`] codes exist for callers that
//! still speak status integers (driver shims, diagnostics).

use std::fmt;
use thiserror::Error;

/// Status codes reported across the driver boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeStatus {
    Success = 0,
    NoSysResources = 2,
    InvalidArg = 3,
    AlreadyExists = 4,
    HwCommFail = 5,
    ObjectNotFound = 6,
    NotSupported = 14,
    Unexpected = 17,
    ConfigError = 18,
}

impl PipeStatus {
    /// Creates a status from a raw code. Unknown codes map to `Unexpected`.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => PipeStatus::Success,
            2 => PipeStatus::NoSysResources,
            3 => PipeStatus::InvalidArg,
            4 => PipeStatus::AlreadyExists,
            5 => PipeStatus::HwCommFail,
            6 => PipeStatus::ObjectNotFound,
            14 => PipeStatus::NotSupported,
            18 => PipeStatus::ConfigError,
            _ => PipeStatus::Unexpected,
        }
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == PipeStatus::Success
    }

    /// Converts to a Result, returning Ok(()) for success.
    pub fn into_result(self) -> PipeResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(PipeMgrError::from_status(self))
        }
    }
}

impl fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipeStatus::Success => "PIPE_SUCCESS",
            PipeStatus::NoSysResources => "PIPE_NO_SYS_RESOURCES",
            PipeStatus::InvalidArg => "PIPE_INVALID_ARG",
            PipeStatus::AlreadyExists => "PIPE_ALREADY_EXISTS",
            PipeStatus::HwCommFail => "PIPE_HW_COMM_FAIL",
            PipeStatus::ObjectNotFound => "PIPE_OBJECT_NOT_FOUND",
            PipeStatus::NotSupported => "PIPE_NOT_SUPPORTED",
            PipeStatus::Unexpected => "PIPE_UNEXPECTED",
            PipeStatus::ConfigError => "PIPE_CONFIG_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Error type for pipeline manager operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeMgrError {
    /// Bad caller input.
    #[error("Invalid argument: {message}")]
    InvalidArg { message: String },

    /// Handle, table or index not present. Often a legitimate
    /// "not yet populated" outcome rather than a failure.
    #[error("Object not found: {object}")]
    ObjectNotFound { object: String },

    /// Allocation failure.
    #[error("No system resources: {message}")]
    NoSysResources { message: String },

    /// Internal invariant violated.
    #[error("Unexpected state: {message}")]
    Unexpected { message: String },

    /// Operation inapplicable to this table type or mode.
    #[error("Not supported: {operation}")]
    NotSupported { operation: String },

    #[error("Already exists: {object}")]
    AlreadyExists { object: String },

    /// The driver reported a failure talking to the device.
    #[error("Hardware error: {message}")]
    Hardware { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PipeMgrError {
    /// Creates an error from a status code.
    pub fn from_status(status: PipeStatus) -> Self {
        let message = format!("driver returned {}", status);
        match status {
            PipeStatus::Success => PipeMgrError::Unexpected {
                message: "from_status called with success status".to_string(),
            },
            PipeStatus::NoSysResources => PipeMgrError::NoSysResources { message },
            PipeStatus::InvalidArg => PipeMgrError::InvalidArg { message },
            PipeStatus::AlreadyExists => PipeMgrError::AlreadyExists { object: message },
            PipeStatus::HwCommFail => PipeMgrError::Hardware { message },
            PipeStatus::ObjectNotFound => PipeMgrError::ObjectNotFound { object: message },
            PipeStatus::NotSupported => PipeMgrError::NotSupported { operation: message },
            PipeStatus::Unexpected => PipeMgrError::Unexpected { message },
            PipeStatus::ConfigError => PipeMgrError::Config { message },
        }
    }

    pub fn invalid_arg(message: impl Into<String>) -> Self {
        PipeMgrError::InvalidArg {
            message: message.into(),
        }
    }

    pub fn not_found(object: impl Into<String>) -> Self {
        PipeMgrError::ObjectNotFound {
            object: object.into(),
        }
    }

    pub fn no_resources(message: impl Into<String>) -> Self {
        PipeMgrError::NoSysResources {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        PipeMgrError::Unexpected {
            message: message.into(),
        }
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        PipeMgrError::NotSupported {
            operation: operation.into(),
        }
    }

    pub fn already_exists(object: impl Into<String>) -> Self {
        PipeMgrError::AlreadyExists {
            object: object.into(),
        }
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        PipeMgrError::Hardware {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipeMgrError::Config {
            message: message.into(),
        }
    }

    /// Returns the status code for this error.
    pub fn status(&self) -> PipeStatus {
        match self {
            PipeMgrError::InvalidArg { .. } => PipeStatus::InvalidArg,
            PipeMgrError::ObjectNotFound { .. } => PipeStatus::ObjectNotFound,
            PipeMgrError::NoSysResources { .. } => PipeStatus::NoSysResources,
            PipeMgrError::Unexpected { .. } => PipeStatus::Unexpected,
            PipeMgrError::NotSupported { .. } => PipeStatus::NotSupported,
            PipeMgrError::AlreadyExists { .. } => PipeStatus::AlreadyExists,
            PipeMgrError::Hardware { .. } => PipeStatus::HwCommFail,
            PipeMgrError::Config { .. } => PipeStatus::ConfigError,
        }
    }

    /// Returns true for the "not yet populated" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PipeMgrError::ObjectNotFound { .. })
    }
}

/// Result type for pipeline manager operations.
pub type PipeResult<T> = Result<T, PipeMgrError>;

/// Extension trait for converting raw status codes.
pub trait PipeStatusExt {
    fn to_result(self) -> PipeResult<()>;
}

impl PipeStatusExt for i32 {
    fn to_result(self) -> PipeResult<()> {
        PipeStatus::from_raw(self).into_result()
    }
}
