//! Error types shared across the sandbox and security modules.

use thiserror::Error;

/// Rejected configuration or policy values.
///
/// Raised eagerly by the validating constructors (`SandboxConfig::builder`,
/// `FileSystemPolicy::new`, `HostPattern::parse`, ...) so a bad value is
/// never discovered mid-execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid filesystem policy: {0}")]
    InvalidFilesystemPolicy(String),

    #[error("invalid host pattern '{pattern}': {reason}")]
    InvalidHostPattern { pattern: String, reason: String },

    #[error("unknown syscall name: {0}")]
    UnknownSyscall(String),
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
