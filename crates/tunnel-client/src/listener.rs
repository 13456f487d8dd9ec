use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use tunnel_core::{
    IoMode, SshCoreError, SshResult,
    relay::{Accepted, ForwardListener},
};

use crate::{ClientError, ClientResult, channel::RusshChannel, hostkeys::ForwardedChannel};

/// Something that can ask the server to open a remote listener.
#[async_trait]
pub trait RemoteRegistrar {
    async fn request_tcpip_forward(&mut self, bind_address: String, bind_port: u16) -> Result<u32, russh::Error>;
}

/// Something that can tear the remote listener down again.
#[async_trait]
pub trait ForwardCanceller: Send + Sync {
    async fn cancel_tcpip_forwarding(&self, bind_address: String, port: u32) -> Result<(), russh::Error>;
}

#[async_trait]
impl<H> RemoteRegistrar for Handle<H>
where
    H: client::Handler + Send,
{
    async fn request_tcpip_forward(&mut self, bind_address: String, bind_port: u16) -> Result<u32, russh::Error> {
        self.tcpip_forward(bind_address, bind_port.into()).await
    }
}

#[async_trait]
impl<H> ForwardCanceller for Arc<Handle<H>>
where
    H: client::Handler + Send + Sync + 'static,
{
    async fn cancel_tcpip_forwarding(&self, bind_address: String, port: u32) -> Result<(), russh::Error> {
        self.as_ref().cancel_tcpip_forward(bind_address, port).await
    }
}

/// Ask the server to listen on `bind_host:want_port`. Returns the port actually bound.
pub async fn start_forward_listener<R>(session: &mut R, bind_host: &str, want_port: u16) -> ClientResult<u32>
where
    R: RemoteRegistrar + Send,
{
    let assigned = session
        .request_tcpip_forward(bind_host.to_string(), want_port)
        .await
        .map_err(|source| ClientError::Listen {
            bind: format!("{bind_host}:{want_port}"),
            source,
        })?;
    let actual_port = if assigned != 0 { assigned } else { u32::from(want_port) };
    debug!(requested = want_port, assigned, actual_port, "tcpip-forward registered");
    Ok(actual_port)
}

/// Hands out forwarded-tcpip channels queued by the client handler.
pub struct SshForwardListener<S> {
    session: S,
    incoming: mpsc::UnboundedReceiver<ForwardedChannel>,
    mode: IoMode,
    bind_host: String,
    actual_port: u32,
    cancelled: bool,
}

impl<S> SshForwardListener<S>
where
    S: ForwardCanceller,
{
    pub fn new(session: S, incoming: mpsc::UnboundedReceiver<ForwardedChannel>, mode: IoMode, bind_host: impl Into<String>, actual_port: u32) -> Self {
        Self {
            session,
            incoming,
            mode,
            bind_host: bind_host.into(),
            actual_port,
            cancelled: false,
        }
    }

    async fn next_forwarded(&mut self) -> SshResult<ForwardedChannel> {
        let next = if self.mode.is_blocking() {
            self.incoming.recv().await
        } else {
            match self.incoming.try_recv() {
                Ok(forwarded) => Some(forwarded),
                Err(TryRecvError::Empty) => {
                    return Err(SshCoreError::accept("no forwarded connection pending and the session is non-blocking"));
                }
                Err(TryRecvError::Disconnected) => None,
            }
        };
        next.ok_or_else(|| SshCoreError::accept("secure session closed"))
    }
}

#[async_trait]
impl<S> ForwardListener for SshForwardListener<S>
where
    S: ForwardCanceller,
{
    type Channel = RusshChannel;

    async fn accept(&mut self) -> SshResult<Accepted<RusshChannel>> {
        if self.cancelled {
            return Err(SshCoreError::accept("listener cancelled"));
        }
        loop {
            let forwarded = self.next_forwarded().await?;
            if forwarded.connected_port != self.actual_port {
                warn!(
                    address = %forwarded.connected_address,
                    port = forwarded.connected_port,
                    "received forwarded-tcpip for a listener this tunnel did not request"
                );
                let _ = forwarded.channel.close().await;
                continue;
            }
            debug!(origin = %forwarded.origin, "forwarded-tcpip channel opened");
            return Ok(Accepted {
                channel: RusshChannel::new(forwarded.channel, self.mode.clone()),
                origin: forwarded.origin,
            });
        }
    }

    fn bound(&self) -> (&str, u32) {
        (&self.bind_host, self.actual_port)
    }

    async fn cancel(&mut self) -> SshResult<()> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        self.incoming.close();
        self.session
            .cancel_tcpip_forwarding(self.bind_host.clone(), self.actual_port)
            .await
            .map_err(|err| SshCoreError::Other(format!("cancel tcpip-forward: {err}")))?;
        info!(bind = %format!("{}:{}", self.bind_host, self.actual_port), "remote listener cancelled");
        Ok(())
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
