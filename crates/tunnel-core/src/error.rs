use thiserror::Error;

/// Errors that can occur in tunnel core operations
#[derive(Error, Debug)]
pub enum SshCoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local destination could not be reached
    #[error("failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The forward listener stopped producing connections
    #[error("could not accept forwarded connection: {0}")]
    AcceptFailed(String),

    /// A relay session already holds the session in non-blocking mode
    #[error("secure session is already in a non-blocking scope")]
    NonBlockingScopeActive,

    /// Lifecycle transition that the tunnel state machine does not allow
    #[error("invalid tunnel state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::state::TunnelState,
        to: crate::state::TunnelState,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tunnel core operations
pub type SshResult<T> = Result<T, SshCoreError>;

impl SshCoreError {
    /// Create an accept failure error
    pub fn accept(message: impl Into<String>) -> Self {
        Self::AcceptFailed(message.into())
    }
}
