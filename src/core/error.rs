use std::path::PathBuf;
use thiserror::Error;

/// Core error types for pvefw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The advisory lock could not be acquired in time
    #[error("unable to acquire lock '{path}' within {timeout_secs}s")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    /// Post-apply verification found a chain that did not converge
    #[error("chain '{0}' failed to converge after apply")]
    Diverged(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
