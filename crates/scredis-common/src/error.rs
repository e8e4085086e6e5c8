//! Unified error types for the scredis workspace.
//!
//! Every fatal launch failure maps onto one of the variants below; the
//! orchestrator attaches the lifecycle stage it happened in.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ScredisError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Every identifier in the IP pool is leased.
    #[error("no more ip addr available")]
    PoolExhausted,

    /// A supplied or computed address fails subnet or range validation.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        /// The offending input.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A specifically requested address is already leased.
    #[error("address id {id} is already leased")]
    AddressInUse {
        /// Host identifier that is taken.
        id: u8,
    },

    /// Forwarding toggle, bridge creation, address assignment or link-up failed.
    #[error("bridge setup failed while {step}: {message}")]
    BridgeSetupFailed {
        /// Provisioning step that failed.
        step: &'static str,
        /// Underlying cause.
        message: String,
    },

    /// Extraction of the root filesystem archive failed.
    #[error("rootfs export to {path} failed: {source}")]
    RootfsExportFailed {
        /// Target directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or persistence of the container specification failed.
    #[error("writing container spec to {path} failed: {message}")]
    SpecWriteFailed {
        /// Destination file.
        path: PathBuf,
        /// Underlying cause.
        message: String,
    },

    /// The container runtime rejected the spec or failed to fork.
    #[error("container creation failed: {message}")]
    RuntimeCreateFailed {
        /// Underlying cause.
        message: String,
    },

    /// The container runtime failed to start the workload.
    #[error("container start failed: {message}")]
    RuntimeStartFailed {
        /// Underlying cause.
        message: String,
    },

    /// Stage 1 failed before handing control to the workload.
    #[error("container init failed: {message}")]
    InitFailure {
        /// Underlying cause.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ScredisError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ScredisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_message_is_stable() {
        assert_eq!(
            ScredisError::PoolExhausted.to_string(),
            "no more ip addr available"
        );
    }

    #[test]
    fn bridge_failure_names_step() {
        let err = ScredisError::BridgeSetupFailed {
            step: "bringing link up",
            message: "no such device".into(),
        };
        assert!(err.to_string().contains("bringing link up"));
    }
}
