//! Error types for tether operations.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by tether operations.
///
/// Transport failures ([`Error::Transport`]) and domain failures
/// ([`Error::Domain`]) are kept apart: the former mean the call itself did
/// not complete, the latter that the runtime on the other side rejected it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A local I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The RPC call could not be completed (connection lost, refused, ...).
    #[error("transport: {0}")]
    Transport(#[source] std::io::Error),

    /// The remote runtime rejected the operation.
    #[error("{0}")]
    Domain(String),

    /// The peer violated the protocol (unexpected message, bad descriptor
    /// transfer, double bind, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No live resource is registered under this reference ID.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// A reference ID string could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A rendezvous did not complete within its time budget.
    #[error("timed out waiting for {0} to become ready")]
    Timeout(String),

    /// The caller cancelled the wait.
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// The resource was closed.
    #[error("{0} is closed")]
    Closed(String),

    /// The runtime does not support this operation.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// The runtime binary failed.
    #[error("{op}: {message}")]
    Runtime {
        /// The runtime command that failed.
        op: &'static str,
        /// Diagnostic output or exit status.
        message: String,
    },

    /// JSON produced or consumed by the runtime was malformed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if the call failed in transit rather than in the runtime.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if the remote runtime rejected the operation.
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }
}
