use std::{env, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{ArgAction, Parser};
use secrecy::SecretString;
use tunnel_types::{AuthOverride, DEFAULT_CHUNK_SIZE, DEFAULT_SSH_PORT, Endpoint, KeyPaths, RelaySettings, TunnelConfig};

pub const PASSWORD_ENV: &str = "RT_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "rtunnel", about = "Reverse SSH tunnel: expose a local TCP service on a remote SSH server")]
pub struct TunnelArgs {
    /// SSH server address
    #[arg(value_name = "SERVER", default_value = "127.0.0.1")]
    server: String,
    /// Remote username
    #[arg(value_name = "USERNAME", default_value = "username")]
    username: String,
    /// Password, also used as the private key passphrase (falls back to RT_PASSWORD)
    #[arg(value_name = "PASSWORD")]
    password: Option<String>,
    /// Host the server should listen on
    #[arg(value_name = "REMOTE_HOST", default_value = "localhost")]
    remote_host: String,
    /// Port the server should listen on (0 lets the server choose)
    #[arg(value_name = "REMOTE_PORT", default_value_t = 4000)]
    remote_port: u16,
    /// Local destination address
    #[arg(value_name = "LOCAL_HOST", default_value = "127.0.0.1")]
    local_host: String,
    /// Local destination port
    #[arg(value_name = "LOCAL_PORT", default_value_t = 8080)]
    local_port: u16,
    /// Authenticate by password only
    #[arg(short = 'p', short_alias = 'P', action = ArgAction::SetTrue, conflicts_with = "public_key_only", help_heading = "Auth Options")]
    password_only: bool,
    /// Authenticate by public key only
    #[arg(short = 'k', short_alias = 'K', action = ArgAction::SetTrue, help_heading = "Auth Options")]
    public_key_only: bool,
    /// Public key file (default ~/.ssh/id_rsa.pub)
    #[arg(long = "public-key", value_name = "PATH", help_heading = "Auth Options")]
    public_key: Option<PathBuf>,
    /// Private key file (default ~/.ssh/id_rsa)
    #[arg(long = "private-key", value_name = "PATH", help_heading = "Auth Options")]
    private_key: Option<PathBuf>,
    /// SSH server port
    #[arg(long = "ssh-port", value_name = "PORT", default_value_t = DEFAULT_SSH_PORT, help_heading = "Tunnel Options")]
    ssh_port: u16,
    /// Refuse the server unless its SHA-1 host key fingerprint matches (hex, separators ignored)
    #[arg(long = "expect-fingerprint", value_name = "HEX", help_heading = "Tunnel Options")]
    expect_fingerprint: Option<String>,
    /// Upper bound on each wait for local data, in milliseconds
    #[arg(long = "poll-interval-ms", value_name = "MS", default_value_t = 100, help_heading = "Tunnel Options")]
    poll_interval_ms: u64,
    /// Relay buffer size in bytes
    #[arg(long = "chunk-size", value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE, help_heading = "Tunnel Options")]
    chunk_size: usize,
    /// Local connect timeout in seconds
    #[arg(long = "connect-timeout", value_name = "SECONDS", default_value_t = 10, help_heading = "Tunnel Options")]
    connect_timeout: u64,
    /// Exit after relaying this many connections
    #[arg(long = "max-connections", value_name = "COUNT", help_heading = "Tunnel Options")]
    max_connections: Option<usize>,
    /// Allow legacy/insecure crypto suites
    #[arg(short = 'i', long = "insecure", action = ArgAction::SetTrue, help_heading = "Tunnel Options")]
    insecure: bool,
    /// Send keepalive probes every N seconds (default 30)
    #[arg(long = "keepalive-interval", value_name = "SECONDS", help_heading = "Tunnel Options")]
    keepalive_interval: Option<u64>,
}

impl TunnelArgs {
    pub fn parse_config() -> Result<TunnelConfig> {
        let args = TunnelArgs::parse();
        TunnelConfig::try_from(args)
    }
}

impl TryFrom<TunnelArgs> for TunnelConfig {
    type Error = anyhow::Error;

    fn try_from(args: TunnelArgs) -> Result<Self> {
        let TunnelArgs {
            server,
            username,
            password,
            remote_host,
            remote_port,
            local_host,
            local_port,
            password_only,
            public_key_only,
            public_key,
            private_key,
            ssh_port,
            expect_fingerprint,
            poll_interval_ms,
            chunk_size,
            connect_timeout,
            max_connections,
            insecure,
            keepalive_interval,
        } = args;

        if chunk_size == 0 {
            bail!("--chunk-size must be greater than zero");
        }
        if poll_interval_ms == 0 {
            bail!("--poll-interval-ms must be greater than zero");
        }
        if max_connections == Some(0) {
            bail!("--max-connections must be greater than zero");
        }

        let auth_override = match (password_only, public_key_only) {
            (true, _) => Some(AuthOverride::Password),
            (_, true) => Some(AuthOverride::PublicKey),
            _ => None,
        };
        let password = password.or_else(|| env::var(PASSWORD_ENV).ok()).unwrap_or_default();

        Ok(TunnelConfig {
            server: Endpoint::new(server, ssh_port),
            username,
            password: SecretString::from(password),
            remote_bind: Endpoint::new(remote_host, remote_port),
            local_target: Endpoint::new(local_host, local_port),
            auth_override,
            keys: KeyPaths {
                public_key: public_key.unwrap_or_else(|| default_key_path("id_rsa.pub")),
                private_key: private_key.unwrap_or_else(|| default_key_path("id_rsa")),
            },
            expected_fingerprint: expect_fingerprint,
            relay: RelaySettings {
                chunk_size,
                poll_interval: Duration::from_millis(poll_interval_ms),
                connect_timeout: Duration::from_secs(connect_timeout),
            },
            max_connections,
            insecure,
            keepalive_interval: keepalive_interval.map(Duration::from_secs),
        })
    }
}

fn default_key_path(file: &str) -> PathBuf {
    let home = env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/home").join(whoami::username()));
    home.join(".ssh").join(file)
}
