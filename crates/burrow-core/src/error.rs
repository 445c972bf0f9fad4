//! Error types shared across the burrow crates

use thiserror::Error;

/// Errors surfaced by the tunnel engine
#[derive(Debug, Error)]
pub enum Error {
    /// Id failed subdomain validation
    #[error("invalid client id '{id}': ids are 4-63 lowercase alphanumeric characters")]
    InvalidClientId { id: String },

    /// `ClientTunnel::start` was called twice
    #[error("tunnel '{id}' already started")]
    AlreadyStarted { id: String },

    /// Could not bind the per-client listener
    #[error("failed to bind tunnel listener: {source}")]
    ListenerBind {
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tunnel operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
