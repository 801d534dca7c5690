//! Error types for the gangway orchestration engine.
//!
//! The taxonomy follows the engine's failure classes: configuration errors
//! abort before the loop starts, dispatch errors terminate the run, setup
//! I/O errors abort orchestration, and transport errors surface from the
//! artifact store façade. Recoverable conditions (an artifact that is not
//! yet present) are never modeled as errors; the readiness gate absorbs
//! them into "not ready".

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GangwayError>;

/// The main error type for gangway operations.
#[derive(Debug, Error)]
pub enum GangwayError {
    /// Invalid or missing configuration; fatal before the loop starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform build specification requests a strategy gangway
    /// cannot serve.
    #[error("unsupported build strategy: {0}")]
    UnsupportedStrategy(String),

    /// A remote store operation was attempted with no client attached.
    #[error("no object client configured")]
    NoClient,

    /// A pre-loop setup step failed (decompression, copy, listing).
    #[error("setup failed: {0}")]
    Setup(String),

    /// A worker invocation failed or could not be constructed.
    #[error("dispatch failed for stage '{stage}': {reason}")]
    Dispatch {
        /// The stage whose worker failed.
        stage: String,
        /// Why the dispatch failed.
        reason: String,
    },

    /// A named artifact is not listed in the build metadata record.
    #[error("artifact '{0}' not found in build metadata")]
    ArtifactMissing(String),

    /// The embedded object-store server failed to start or respond.
    #[error("object store server error: {0}")]
    Server(String),

    /// A remote object request returned an unexpected status.
    #[error("object store returned {status} for {bucket}/{object}")]
    ObjectStatus {
        /// HTTP status code.
        status: u16,
        /// Bucket the request targeted.
        bucket: String,
        /// Object key the request targeted.
        object: String,
    },

    /// Transport-level failure talking to the object store.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A jobspec failed validation (duplicate stage ids and the like).
    #[error("invalid jobspec: {0}")]
    InvalidJobSpec(String),
}

impl GangwayError {
    /// Creates a dispatch error for a stage.
    #[must_use]
    pub fn dispatch(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dispatch {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error means an object simply was not there.
    ///
    /// The readiness gate uses this to fold missing metadata into
    /// "not ready" instead of failing the poll.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            Self::ObjectStatus { status, .. } => *status == 404,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_display() {
        let err = GangwayError::dispatch("build", "pod exited 1");
        assert_eq!(
            err.to_string(),
            "dispatch failed for stage 'build': pod exited 1"
        );
    }

    #[test]
    fn test_not_found_classification() {
        let io = GangwayError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert!(io.is_not_found());

        let status = GangwayError::ObjectStatus {
            status: 404,
            bucket: "builds".to_string(),
            object: "meta.json".to_string(),
        };
        assert!(status.is_not_found());

        let other = GangwayError::Config("bad".to_string());
        assert!(!other.is_not_found());
    }
}
