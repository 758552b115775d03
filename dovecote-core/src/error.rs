//! Dovecote error types.

use std::io;
use thiserror::Error;

/// Main error type for broker operations.
///
/// Errors never escape the session that produced them: the session is the
/// unit of recovery and its termination is the recovery action. Variants
/// that reach the client use their display text verbatim as the `-ERR`
/// reason.
#[derive(Error, Debug)]
pub enum DovecoteError {
    /// IO error on the underlying stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error while interpreting client input
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Subject failed validation (empty token, misplaced wildcard)
    #[error("Invalid Subject")]
    InvalidSubject,

    /// Credentials missing, rejected, or supplied too late
    #[error("Authorization is Required")]
    Authorization,

    /// Peer stopped answering pings
    #[error("Stale Connection")]
    StaleConnection,

    /// Peer could not drain its writer within the flush deadline
    #[error("Slow Consumer")]
    SlowConsumer,

    /// The connection is gone
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, DovecoteError>;

impl DovecoteError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
