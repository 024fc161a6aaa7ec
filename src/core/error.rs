//! Core errors - Failure taxonomy for starting and routing cores

use std::path::PathBuf;

use thiserror::Error;

/// Broad category of a core failure, used by callers to pick their messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or empty configuration supplied by the user
    UserInput,
    /// Something must be installed or configured before retrying
    ResourceUnavailable,
    /// Core is recognized but has no runtime yet ("coming soon")
    Unimplemented,
    /// Core identifier is not recognized at all
    UnsupportedCore,
    /// The operating system refused to create the process
    SpawnFailure,
}

/// Errors raised while resolving, validating or launching a core
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Config is empty; cannot start core.")]
    EmptyConfig,

    #[error("{core} requires JSON config; provided config is not JSON.")]
    NotJson { core: String },

    #[error("Core already running.")]
    AlreadyRunning,

    #[error("{core} binary not found. Please install it via the update flow.")]
    BinaryNotFound { core: String },

    #[error("Failed to write active config {}: {source}", .path.display())]
    ActiveConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {core}: {source}")]
    Spawn {
        core: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Compatibility layer ready for {name} ({}), but its runtime is not implemented yet.", .binary.display())]
    Unimplemented { name: String, binary: PathBuf },

    #[error("{name} binary path is not configured.")]
    MissingBinary { name: String },

    #[error("Unsupported core: {0}")]
    UnsupportedCore(String),

    #[error("Core start was cancelled by a stop request.")]
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyConfig | Self::NotJson { .. } | Self::AlreadyRunning | Self::Cancelled => {
                ErrorKind::UserInput
            }
            Self::BinaryNotFound { .. }
            | Self::MissingBinary { .. }
            | Self::ActiveConfigWrite { .. } => ErrorKind::ResourceUnavailable,
            Self::Unimplemented { .. } => ErrorKind::Unimplemented,
            Self::UnsupportedCore(_) => ErrorKind::UnsupportedCore,
            Self::Spawn { .. } => ErrorKind::SpawnFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unimplemented_and_unsupported_are_distinct() {
        let coming_soon = CoreError::Unimplemented {
            name: "openvpn".into(),
            binary: PathBuf::from("/usr/sbin/openvpn"),
        };
        let invalid = CoreError::UnsupportedCore("wat".into());
        assert_eq!(coming_soon.kind(), ErrorKind::Unimplemented);
        assert_eq!(invalid.kind(), ErrorKind::UnsupportedCore);
        assert!(coming_soon.to_string().contains("not implemented"));
        assert_eq!(invalid.to_string(), "Unsupported core: wat");
    }

    #[test]
    fn missing_binary_hints_at_remediation() {
        let err = CoreError::BinaryNotFound {
            core: "Sing-box".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert!(err.to_string().contains("install"));
    }
}
