use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{
    engine::{RelayEngine, RelayReport, RelayStatus, StatusKind},
    local::LocalConnector,
    traits::{Accepted, ForwardListener, SecureChannel},
};
use crate::state::{Lifecycle, TunnelState};

type Result<T> = crate::SshResult<T>;

/// Why the accept loop returned without an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopReason {
    /// `max_connections` relays were served.
    #[default]
    LimitReached,
    /// The shutdown signal fired.
    Cancelled,
}

/// Tally of the relays served by one accept loop run.
#[derive(Clone, Debug, Default)]
pub struct AcceptSummary {
    pub accepted: usize,
    pub statuses: Vec<StatusKind>,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
    pub stop: StopReason,
}

impl AcceptSummary {
    fn record(&mut self, report: &RelayReport) {
        self.statuses.push(report.status.kind());
        self.bytes_to_remote += report.bytes_to_remote;
        self.bytes_to_local += report.bytes_to_local;
    }

    pub fn count(&self, kind: StatusKind) -> usize {
        self.statuses.iter().filter(|status| **status == kind).count()
    }

    pub fn by_kind(&self) -> HashMap<StatusKind, usize> {
        let mut counts = HashMap::new();
        for status in &self.statuses {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }
}

/// Sequential server: accept one forwarded connection, relay it, repeat.
pub struct AcceptLoop<'a> {
    connector: &'a LocalConnector,
    engine: &'a RelayEngine,
    max_connections: Option<usize>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a> AcceptLoop<'a> {
    pub fn new(connector: &'a LocalConnector, engine: &'a RelayEngine) -> Self {
        Self {
            connector,
            engine,
            max_connections: None,
            shutdown: None,
        }
    }

    pub fn max_connections(mut self, limit: Option<usize>) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Serve connections until the listener fails, the limit is hit, or shutdown is signalled.
    ///
    /// Expects `lifecycle` in `Listening`; leaves it in `Accepting`.
    pub async fn run<L>(&self, listener: &mut L, lifecycle: &mut Lifecycle) -> Result<AcceptSummary>
    where
        L: ForwardListener,
    {
        let mut summary = AcceptSummary::default();
        let mut shutdown = self.shutdown.clone();
        let (bind_host, bind_port) = listener.bound();
        let remote = format!("{bind_host}:{bind_port}");
        lifecycle.advance(TunnelState::Accepting)?;

        loop {
            if self.max_connections.is_some_and(|limit| summary.accepted >= limit) {
                summary.stop = StopReason::LimitReached;
                return Ok(summary);
            }
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                summary.stop = StopReason::Cancelled;
                return Ok(summary);
            }

            info!("waiting for remote connection");
            let accepted = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => {
                    summary.stop = StopReason::Cancelled;
                    return Ok(summary);
                }
                accepted = listener.accept() => accepted,
            };
            let Accepted { mut channel, origin } = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "could not accept connection (this can be a problem at the server, review its logs)");
                    return Err(err);
                }
            };
            summary.accepted += 1;
            lifecycle.advance(TunnelState::Relaying)?;

            let target = self.connector.target();
            info!(origin = %origin, target = %target, "accepted remote connection, connecting to local server");
            let report = match self.connector.connect().await {
                Ok(stream) => {
                    info!(remote = %remote, local = %target, "forwarding connection");
                    self.engine.relay(&mut channel, stream).await
                }
                Err(err) => RelayReport::new(RelayStatus::ConnectFailed(err)),
            };
            log_report(&report, &remote, &target.to_string());
            summary.record(&report);

            if let Err(err) = channel.close().await {
                warn!(?err, "failed to release forwarded channel");
            }
            lifecycle.advance(TunnelState::Accepting)?;
        }
    }
}

fn log_report(report: &RelayReport, remote: &str, local: &str) {
    let status = &report.status;
    match status {
        RelayStatus::LocalEof => info!(local, sent = report.bytes_to_remote, received = report.bytes_to_local, "{status}"),
        RelayStatus::RemoteEof => info!(remote, sent = report.bytes_to_remote, received = report.bytes_to_local, "{status}"),
        RelayStatus::Cancelled => info!("{status}"),
        _ => warn!(remote, local, "relay ended: {status}"),
    }
}

async fn shutdown_signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
