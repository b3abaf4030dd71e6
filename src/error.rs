//! Error types for the okteto CLI.
//!
//! This module provides the error hierarchy for every operation in the
//! activation lifecycle: manifest loading, cluster access, file
//! synchronization and remote command execution. Cluster and syncthing
//! errors are classified once, at the facade layer, into a small sealed
//! taxonomy; call sites never string-match error messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the okteto CLI.
#[derive(Debug, Error)]
pub enum Error {
    /// Manifest-related errors.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Cluster API errors.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// File synchronization errors.
    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    /// An actionable error caused by user input or user environment.
    #[error("{0}")]
    User(#[from] UserError),

    /// Connectivity to the development environment was lost and could not
    /// be recovered.
    #[error("Lost connection to your cluster. Please check your network connection and run 'okteto up' again")]
    LostConnection,

    /// The remote command exited with a non-zero code.
    #[error("Command execution failed")]
    CommandFailed {
        /// Exit code reported by the remote process.
        exit_code: i32,
    },

    /// The dev-mode overlay was removed from the deployment externally.
    #[error("Deployment is no longer in developer mode")]
    NotDevDeployment,

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// An actionable error with a hint for the user.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UserError {
    /// What went wrong.
    pub message: String,
    /// How to fix it.
    pub hint: String,
}

/// Manifest-related errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file was not found.
    #[error("Manifest file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The manifest could not be parsed.
    #[error("Invalid manifest: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
    },

    /// Validation failed.
    #[error("Invalid manifest: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Cluster API errors, normalised from HTTP status codes and transport
/// failures at the client facade.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind (deployment, pod, secret, ...).
        kind: String,
        /// Object name.
        name: String,
    },

    /// The credentials are not allowed to perform the operation.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Error message from the API server.
        message: String,
    },

    /// The object was modified concurrently.
    #[error("conflict: {message}")]
    Conflict {
        /// Error message from the API server.
        message: String,
    },

    /// A retryable failure (network, throttling, server overload).
    #[error("transient cluster error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// Any other cluster failure.
    #[error("{message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },
}

/// File synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The syncthing binary is not installed.
    #[error("cannot find syncthing in your PATH. Make sure syncthing is installed")]
    BinaryNotFound,

    /// The local syncthing process could not be started or died.
    #[error("failed to run the file synchronization service: {message}")]
    ProcessFailed {
        /// Description of the process failure.
        message: String,
    },

    /// A syncthing REST call failed.
    #[error("synchronization service API error: {message}")]
    ApiRequestFailed {
        /// Description of the API failure.
        message: String,
    },

    /// The synchronization made no progress for the freeze threshold.
    #[error("the file synchronization service is frozen")]
    Frozen {
        /// Path to the syncthing log file.
        log_path: PathBuf,
    },

    /// Timed out waiting for a syncthing state.
    #[error("timed out waiting for the file synchronization service to be {expected_state}")]
    Timeout {
        /// State that was not reached.
        expected_state: String,
    },
}

/// Result type alias for okteto operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable at the facade layer.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::Transient { .. }))
    }

    /// Returns true if the error means the target object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::NotFound { .. }))
    }

    /// Maps the error to the process exit code.
    ///
    /// 0 is success, 1 a user error, 2 an unrecoverable lost connection
    /// and 3 an internal failure. A failed remote command propagates its
    /// own exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_)
            | Self::Manifest(_)
            | Self::NotDevDeployment
            | Self::Sync(SyncError::Frozen { .. }) => 1,
            Self::CommandFailed { exit_code } => *exit_code,
            Self::LostConnection => 2,
            _ => 3,
        }
    }
}

impl UserError {
    /// Creates a new user error.
    #[must_use]
    pub fn new(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

impl ManifestError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ClusterError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Classifies an HTTP status code from the API server.
    #[must_use]
    pub fn from_status(status: u16, kind: &str, name: &str, message: &str) -> Self {
        match status {
            404 => Self::not_found(kind, name),
            401 | 403 => Self::Forbidden {
                message: message.to_string(),
            },
            409 => Self::Conflict {
                message: message.to_string(),
            },
            429 | 500..=599 => Self::transient(message),
            _ => Self::fatal(message),
        }
    }
}

impl SyncError {
    /// Creates an API request error.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            message: message.into(),
        }
    }

    /// Creates a process failure error.
    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::ProcessFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ClusterError::from_status(404, "deployment", "api", ""),
            ClusterError::NotFound { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(403, "deployment", "api", "rbac"),
            ClusterError::Forbidden { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(409, "deployment", "api", "stale"),
            ClusterError::Conflict { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(503, "deployment", "api", "busy"),
            ClusterError::Transient { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(418, "deployment", "api", "teapot"),
            ClusterError::Fatal { .. }
        ));
    }

    #[test]
    fn test_exit_codes() {
        let user = Error::User(UserError::new("bad manifest", "fix it"));
        assert_eq!(user.exit_code(), 1);

        assert_eq!(Error::LostConnection.exit_code(), 2);
        assert_eq!(Error::NotDevDeployment.exit_code(), 1);
        assert_eq!(Error::internal("boom").exit_code(), 3);
        assert_eq!(Error::CommandFailed { exit_code: 127 }.exit_code(), 127);

        let frozen = Error::Sync(SyncError::Frozen {
            log_path: PathBuf::from("/tmp/syncthing.log"),
        });
        assert_eq!(frozen.exit_code(), 1);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Cluster(ClusterError::transient("throttled")).is_retryable());
        assert!(!Error::Cluster(ClusterError::fatal("bad request")).is_retryable());
        assert!(!Error::NotDevDeployment.is_retryable());
    }
}
