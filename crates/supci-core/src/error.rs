//! Error types for release orchestration.

use thiserror::Error;

/// Errors produced by the release orchestration core.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Missing or invalid trigger inputs or static configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Packaging (or its cache rebuild) failed for one architecture.
    #[error("build failed for {architecture}: {reason}")]
    Build {
        architecture: String,
        reason: String,
    },

    /// No runnable image could be produced for the integration test.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// The instance never reported ready within the bound.
    #[error("instance at {address} not ready after {timeout_secs}s (last observed: {last_observed})")]
    ReadinessTimeout {
        address: String,
        timeout_secs: u64,
        last_observed: String,
    },

    /// A control-API check did not match its expectation.
    #[error("verification step '{step}' failed: observed {observed}")]
    Verification { step: String, observed: String },

    /// The signing service rejected or failed the attestation.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Registry or version-store publication failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The run was cancelled externally.
    #[error("run cancelled during {0}")]
    Cancelled(String),

    /// The job graph is malformed.
    #[error("job graph error: {0}")]
    Graph(String),

    /// An external command could not be spawned or timed out.
    #[error("process error in {command}: {reason}")]
    Process { command: String, reason: String },

    /// Control API transport failure.
    #[error("control API error: {0}")]
    Control(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReleaseError {
    /// Whether this error stems from cancellation rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReleaseError::Cancelled(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ReleaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_displays_architecture() {
        let err = ReleaseError::Build {
            architecture: "aarch64".to_string(),
            reason: "packager exited with 2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aarch64"));
        assert!(msg.contains("exited with 2"));
    }

    #[test]
    fn test_verification_error_names_step() {
        let err = ReleaseError::Verification {
            step: "network info".to_string(),
            observed: "\"error\"".to_string(),
        };
        assert!(err.to_string().contains("network info"));
    }

    #[test]
    fn test_cancelled_is_flagged() {
        assert!(ReleaseError::Cancelled("awaiting_ready".into()).is_cancelled());
        assert!(!ReleaseError::Signing("no key".into()).is_cancelled());
    }
}
