//! Error types for Butler bootstrap operations
//!
//! Errors are structured so that the top-level message always carries enough
//! context to diagnose a failed run: which phase failed, which document or
//! workload was involved, and the underlying cause.

use thiserror::Error;

/// Result alias used across the Butler crates
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Butler bootstrap operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration. Raised before any infrastructure is touched.
    #[error("validation error for {field}: {message}")]
    Validation {
        /// The offending configuration key (e.g., "cluster.name")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Local environment problem: substrate lifecycle, missing tools, fix-ups
    #[error("environment error: {message}")]
    Environment {
        /// Description of what failed
        message: String,
    },

    /// Manifest apply or readiness failure
    #[error("deploy error [{target}]: {message}")]
    Deploy {
        /// The document or workload that failed
        target: String,
        /// Description of what failed
        message: String,
    },

    /// The external controllers reported the bootstrap as Failed
    #[error("cluster bootstrap failed: {reason}: {message}")]
    ProvisioningFailed {
        /// Controller-reported failure reason, verbatim
        reason: String,
        /// Controller-reported failure message, verbatim
        message: String,
    },

    /// The run deadline expired while waiting
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited on when the deadline expired
        operation: String,
    },

    /// The run was interrupted
    #[error("operation cancelled")]
    Cancelled,

    /// Credential decode or write failure
    #[error("persist error: {message}")]
    Persist {
        /// Description of what failed
        message: String,
    },

    /// A create-once object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// A failure wrapped with the orchestrator phase it occurred in
    #[error("{phase} failed: {source}")]
    Phase {
        /// Human readable phase name
        phase: String,
        /// The underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error for a configuration field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an environment error
    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    /// Create a deploy error naming the document or workload that failed
    pub fn deploy(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deploy {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a provisioning failure carrying the controller's diagnostics
    pub fn provisioning_failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a persist error
    pub fn persist(message: impl Into<String>) -> Self {
        Self::Persist {
            message: message.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap this error with the phase it occurred in
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through phase wrapping
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if the run deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }

    /// Returns true if the run was interrupted
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Returns true if the controllers reported a failure
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(self.root(), Self::ProvisioningFailed { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wrapping_names_phase_and_cause() {
        let err = Error::deploy("butler-bootstrap-controller", "not ready")
            .in_phase("AwaitControllersReady");
        let msg = err.to_string();
        assert!(msg.contains("AwaitControllersReady"));
        assert!(msg.contains("butler-bootstrap-controller"));
        assert!(msg.contains("not ready"));
    }

    #[test]
    fn test_classification_looks_through_phases() {
        let err = Error::timeout("ClusterBootstrap").in_phase("Watch");
        assert!(err.is_timeout());
        assert!(!err.is_provisioning_failure());
        assert!(!err.is_cancelled());

        let err = Error::provisioning_failed("QuotaExceeded", "no IPs").in_phase("Watch");
        assert!(err.is_provisioning_failure());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_provisioning_failure_keeps_diagnostics_verbatim() {
        let err = Error::provisioning_failed("QuotaExceeded", "no IP addresses available");
        let msg = err.to_string();
        assert!(msg.contains("QuotaExceeded"));
        assert!(msg.contains("no IP addresses available"));
    }
}
