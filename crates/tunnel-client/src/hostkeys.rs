use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use russh::{
    Channel,
    client::{Msg, Session},
    keys::{HashAlg, PublicKey},
};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnel_core::relay::Origin;

use crate::{ClientError, ClientResult};

/// Host key fingerprints captured during the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFingerprint {
    pub sha1: [u8; 20],
    pub sha256: String,
    pub algorithm: String,
}

impl HostFingerprint {
    pub fn from_key(key: &PublicKey) -> ClientResult<Self> {
        let blob = key.to_bytes().map_err(|e| ClientError::Crypto(e.to_string()))?;
        let digest = Sha1::digest(&blob);
        let mut sha1 = [0u8; 20];
        sha1.copy_from_slice(&digest);
        Ok(Self {
            sha1,
            sha256: key.fingerprint(HashAlg::Sha256).to_string(),
            algorithm: key.algorithm().as_str().to_string(),
        })
    }

    /// SHA-1 as uppercase hex pairs separated by single spaces.
    pub fn sha1_hex(&self) -> String {
        spaced_hex(&self.sha1)
    }
}

impl fmt::Display for HostFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sha1_hex())
    }
}

pub fn spaced_hex(bytes: &[u8]) -> String {
    let encoded = hex::encode_upper(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 2);
    for (idx, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(&String::from_utf8_lossy(pair));
    }
    out
}

/// Host key policy: accept anything (the fingerprint is printed for the operator) or require a pinned SHA-1.
#[derive(Clone, Debug, Default)]
pub struct HostKeyCheck {
    pinned: Option<Vec<u8>>,
}

impl HostKeyCheck {
    /// `pinned` accepts hex with or without space or colon separators.
    pub fn new(pinned: Option<&str>) -> ClientResult<Self> {
        let pinned = match pinned {
            Some(raw) => {
                let cleaned: String = raw.chars().filter(|c| !matches!(c, ' ' | ':')).collect();
                let bytes = hex::decode(&cleaned).map_err(|e| ClientError::HostKeyFailed(format!("invalid pinned fingerprint {raw:?}: {e}")))?;
                if bytes.len() != 20 {
                    return Err(ClientError::HostKeyFailed(format!(
                        "pinned fingerprint must be 20 bytes of SHA-1, got {}",
                        bytes.len()
                    )));
                }
                Some(bytes)
            }
            None => None,
        };
        Ok(Self { pinned })
    }

    pub fn check(&self, fingerprint: &HostFingerprint) -> ClientResult<()> {
        match &self.pinned {
            Some(expected) if expected.as_slice() != fingerprint.sha1.as_slice() => Err(ClientError::HostKeyFailed(format!(
                "server presented {} but {} was expected",
                fingerprint.sha1_hex(),
                spaced_hex(expected)
            ))),
            Some(_) => {
                info!("host key matches pinned fingerprint");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// A forwarded-tcpip channel opened by the server, waiting to be accepted.
pub struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub origin: Origin,
}

#[derive(Clone)]
pub struct ClientHandler {
    check: Arc<HostKeyCheck>,
    seen: Arc<OnceLock<HostFingerprint>>,
    forwarded: mpsc::UnboundedSender<ForwardedChannel>,
}

impl ClientHandler {
    pub fn new(check: HostKeyCheck, forwarded: mpsc::UnboundedSender<ForwardedChannel>) -> Self {
        Self {
            check: Arc::new(check),
            seen: Arc::new(OnceLock::new()),
            forwarded,
        }
    }

    /// Filled in once the server key has been checked.
    pub fn fingerprint_slot(&self) -> Arc<OnceLock<HostFingerprint>> {
        Arc::clone(&self.seen)
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = ClientError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let outcome = HostFingerprint::from_key(server_public_key).and_then(|fingerprint| {
            debug!(algorithm = %fingerprint.algorithm, sha256 = %fingerprint.sha256, "server host key");
            self.check.check(&fingerprint)?;
            let _ = self.seen.set(fingerprint);
            Ok(true)
        });
        async move { outcome }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let forwarded = ForwardedChannel {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            origin: Origin {
                address: originator_address.to_string(),
                port: originator_port,
            },
        };
        if let Err(mpsc::error::SendError(dropped)) = self.forwarded.send(forwarded) {
            warn!(origin = %dropped.origin, "forwarded connection arrived after the listener was closed");
        }
        async { Ok(()) }
    }
}

#[cfg(test)]
#[path = "hostkeys_tests.rs"]
mod tests;
