//! Error types for corral-core.

use crate::codec::DecodeError;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for corral-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while orchestrating sandboxed sessions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The listen address could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// A transient failure accepting a connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The transport handshake with a client failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The identity cannot be mapped onto a sandbox account.
    #[error("identity {0:?} is not a valid account name")]
    InvalidIdentity(String),

    /// The container engine could not create a sandbox.
    #[error("failed to create sandbox: {output}")]
    SandboxCreateFailed {
        /// Diagnostic output of the engine (or a description of the failure)
        output: String,
    },

    /// The container engine could not remove one or more sandboxes.
    #[error("failed to remove sandboxes: {output}")]
    SandboxRemoveFailed {
        /// Diagnostic output of the engine
        output: String,
    },

    /// The pseudo-terminal or the shell process could not be started.
    #[error("failed to start pty: {0}")]
    PtyStartFailed(String),

    /// Waiting for the sandbox shell to exit failed.
    #[error("failed to wait for shell: {0}")]
    ShellWait(std::io::Error),

    /// A control request carried a payload that could not be decoded.
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] DecodeError),

    /// Invalid sandbox policy.
    #[error("invalid policy: {0}")]
    Policy(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
