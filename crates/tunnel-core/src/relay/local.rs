use std::{io, time::Duration};

use tokio::{net::TcpStream, time};
use tracing::debug;
use tunnel_types::{Endpoint, RelaySettings};

use crate::SshCoreError;

type Result<T> = crate::SshResult<T>;

/// Opens plain TCP connections to the fixed local destination.
#[derive(Clone, Debug)]
pub struct LocalConnector {
    target: Endpoint,
    timeout: Duration,
}

impl LocalConnector {
    pub fn new(target: Endpoint, settings: &RelaySettings) -> Self {
        Self {
            target,
            timeout: settings.connect_timeout,
        }
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Connect once. Every failure is reported as [`SshCoreError::ConnectionFailed`]; there are no retries.
    pub async fn connect(&self) -> Result<TcpStream> {
        let address = self.target.to_string();
        let attempt = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let stream = match time::timeout(self.timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SshCoreError::ConnectionFailed { address, source }),
            Err(_) => {
                return Err(SshCoreError::ConnectionFailed {
                    address,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, target = %address, "could not set TCP_NODELAY on local connection");
        }
        debug!(target = %address, "local connection established");
        Ok(stream)
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
