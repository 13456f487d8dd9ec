use thiserror::Error;
use tunnel_core::SshCoreError;

/// Errors that can occur while setting up or running the tunnel
#[derive(Error, Debug)]
pub enum ClientError {
    /// SSH error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Host key verification failed
    #[error("host key verification failed: {0}")]
    HostKeyFailed(String),

    /// Cryptographic error
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// The server refused or failed the tcpip-forward request
    #[error("could not start the tcpip-forward listener on {bind}: {source}")]
    Listen {
        bind: String,
        #[source]
        source: russh::Error,
    },

    /// Relay or accept loop error
    #[error(transparent)]
    Core(#[from] SshCoreError),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tunnel client operations
pub type ClientResult<T> = Result<T, ClientError>;
