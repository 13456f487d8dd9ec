//! Shared configuration shapes for the reverse tunnel.
//!
//! These structs are plain data: the CLI builds a [`TunnelConfig`] once at
//! startup and every runtime component borrows the pieces it needs.

use std::{fmt, path::PathBuf, time::Duration};

use secrecy::SecretString;

/// Default SSH server port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Bytes moved per read in either relay direction.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
/// Upper bound on how long the relay waits on the local socket before checking the channel.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A `host:port` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Forces a single authentication method, mirroring the `-p` / `-k` flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOverride {
    /// Password only.
    Password,
    /// Public key only.
    PublicKey,
}

/// Key pair used for public-key authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPaths {
    pub public_key: PathBuf,
    pub private_key: PathBuf,
}

/// Tuning knobs for the relay loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySettings {
    /// Transfer buffer size in bytes.
    pub chunk_size: usize,
    /// Bounded wait on local readability per loop iteration.
    pub poll_interval: Duration,
    /// Local connect timeout.
    pub connect_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Top-level reverse tunnel configuration.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// SSH server to connect to.
    pub server: Endpoint,
    /// Remote username.
    pub username: String,
    /// Password; doubles as the private key passphrase when non-empty.
    pub password: SecretString,
    /// Address the server is asked to listen on. Resolved by the server.
    pub remote_bind: Endpoint,
    /// Local service that receives forwarded connections.
    pub local_target: Endpoint,
    pub auth_override: Option<AuthOverride>,
    pub keys: KeyPaths,
    /// Pinned SHA-1 host key fingerprint (hex, separators ignored).
    pub expected_fingerprint: Option<String>,
    pub relay: RelaySettings,
    /// Stop after relaying this many connections.
    pub max_connections: Option<usize>,
    /// Allow the legacy cipher suite.
    pub insecure: bool,
    pub keepalive_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display_brackets_ipv6() {
        assert_eq!(Endpoint::new("127.0.0.1", 8080).to_string(), "127.0.0.1:8080");
        assert_eq!(Endpoint::new("::1", 4000).to_string(), "[::1]:4000");
    }

    #[test]
    fn relay_defaults_match_reference_buffer() {
        let settings = RelaySettings::default();
        assert_eq!(settings.chunk_size, 16384);
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
    }
}
