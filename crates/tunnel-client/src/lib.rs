//! russh-backed reverse tunnel client.
//!
//! Connects to an SSH server, authenticates, asks the server to listen on a
//! remote address and serves each forwarded connection, one at a time, by
//! relaying it to a fixed local destination.

pub mod auth;
pub mod channel;
mod error;
pub mod hostkeys;
pub mod listener;
pub mod transport;

use std::sync::Arc;

pub use error::{ClientError, ClientResult};
use hostkeys::{ClientHandler, HostKeyCheck};
use listener::{SshForwardListener, start_forward_listener};
use russh::{
    Disconnect,
    client::{self, Handle},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tunnel_core::{
    IoMode,
    relay::{AcceptLoop, AcceptSummary, ForwardListener, LocalConnector, RelayEngine},
    state::{Lifecycle, TunnelState},
};
use tunnel_types::TunnelConfig;

/// Run the tunnel until the accept loop ends or `shutdown` flips to `true`.
///
/// Teardown runs on every exit path after the session exists: the remote
/// listener is cancelled, then the session is disconnected.
pub async fn run_tunnel(config: &TunnelConfig, shutdown: watch::Receiver<bool>) -> ClientResult<AcceptSummary> {
    let mut lifecycle = Lifecycle::new();
    let mode = IoMode::new();
    let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
    let handler = ClientHandler::new(HostKeyCheck::new(config.expected_fingerprint.as_deref())?, forwarded_tx);
    let fingerprint = handler.fingerprint_slot();

    info!(server = %config.server, "connecting to SSH server");
    let mut session = client::connect(
        transport::client_config(config),
        (config.server.host.as_str(), config.server.port),
        handler,
    )
    .await
    .inspect_err(|err| error!(error = %err, "failed to establish the SSH session"))?;

    if let Some(fingerprint) = fingerprint.get() {
        println!("Fingerprint: {}", fingerprint.sha1_hex());
        info!(algorithm = %fingerprint.algorithm, sha256 = %fingerprint.sha256, "server host key");
    }

    let actual_port = match establish(&mut session, config, &mut lifecycle).await {
        Ok(port) => port,
        Err(err) => {
            error!(error = %err, "tunnel setup failed");
            lifecycle.begin_shutdown();
            disconnect(&session).await;
            let _ = lifecycle.advance(TunnelState::Terminated);
            return Err(err);
        }
    };

    let session = Arc::new(session);
    let mut listener = SshForwardListener::new(Arc::clone(&session), forwarded_rx, mode.clone(), config.remote_bind.host.clone(), actual_port);
    println!("Server is listening on {}:{}", config.remote_bind.host, actual_port);

    let connector = LocalConnector::new(config.local_target.clone(), &config.relay);
    let engine = RelayEngine::new(mode.clone(), &config.relay).with_cancellation(shutdown.clone());
    let outcome = AcceptLoop::new(&connector, &engine)
        .max_connections(config.max_connections)
        .with_shutdown(shutdown)
        .run(&mut listener, &mut lifecycle)
        .await;
    debug_assert!(mode.is_blocking(), "session left non-blocking after the accept loop");

    lifecycle.begin_shutdown();
    if let Err(err) = listener.cancel().await {
        warn!(error = %err, "failed to cancel the remote listener");
    }
    drop(listener);
    disconnect(&session).await;
    match Arc::try_unwrap(session) {
        Ok(handle) => {
            if let Err(err) = handle.await {
                debug!(?err, "SSH session shutdown error");
            }
        }
        Err(_) => warn!("SSH session handle still in use; skipping shutdown wait"),
    }
    if let Err(err) = lifecycle.advance(TunnelState::Terminated) {
        debug!(error = %err, "lifecycle already terminated");
    }

    let summary = outcome?;
    info!(
        accepted = summary.accepted,
        sent = summary.bytes_to_remote,
        received = summary.bytes_to_local,
        stop = ?summary.stop,
        "tunnel finished"
    );
    Ok(summary)
}

/// Authenticate and register the remote listener. Returns the bound port.
async fn establish<H>(session: &mut Handle<H>, config: &TunnelConfig, lifecycle: &mut Lifecycle) -> ClientResult<u32>
where
    H: client::Handler + Send,
{
    auth::authenticate(session, config).await?;
    lifecycle.advance(TunnelState::Authenticated)?;

    let bind = &config.remote_bind;
    let actual_port = start_forward_listener(session, &bind.host, bind.port).await?;
    lifecycle.advance(TunnelState::Listening)?;
    info!(
        remote = %format!("{}:{}", bind.host, actual_port),
        local = %config.local_target,
        "remote listener ready"
    );
    Ok(actual_port)
}

async fn disconnect<H>(session: &Handle<H>)
where
    H: client::Handler,
{
    if let Err(err) = session.disconnect(Disconnect::ByApplication, "Client disconnecting normally", "").await {
        debug!(?err, "disconnect");
    }
}
