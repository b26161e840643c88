use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the relay outside of the CDP wire protocol.
///
/// Per-connection conditions (malformed frames, unowned sessions, command
/// timeouts) are answered on the wire and never become a `RelayError`; only
/// configuration and listener-level failures propagate to the caller.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Process exit code for stand-alone runs: 2 for bind failures, 3 for
    /// configuration errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => 3,
            RelayError::Bind { .. } => 2,
            RelayError::Io(_) => 1,
        }
    }
}
