use std::{
    fmt, io,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
    time,
};
use tracing::{debug, trace, warn};
use tunnel_types::RelaySettings;

use super::traits::{ChannelRead, LocalIo, SecureChannel};
use crate::{IoMode, SshCoreError};

/// Why a relay session ended.
#[derive(Debug)]
pub enum RelayStatus {
    /// The local peer closed its side.
    LocalEof,
    /// The remote side signalled end-of-stream after its last forwarded chunk.
    RemoteEof,
    /// The shutdown signal fired mid-relay.
    Cancelled,
    /// Another relay already holds the session in non-blocking mode.
    SessionBusy,
    /// The local destination could not be reached; no channel I/O happened.
    ConnectFailed(SshCoreError),
    LocalError(io::Error),
    RemoteError(io::Error),
    LocalWriteError(io::Error),
    RemoteWriteError(io::Error),
}

/// Payload-free tag of a [`RelayStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusKind {
    LocalEof,
    RemoteEof,
    Cancelled,
    SessionBusy,
    ConnectFailed,
    LocalError,
    RemoteError,
    LocalWriteError,
    RemoteWriteError,
}

impl RelayStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            RelayStatus::LocalEof => StatusKind::LocalEof,
            RelayStatus::RemoteEof => StatusKind::RemoteEof,
            RelayStatus::Cancelled => StatusKind::Cancelled,
            RelayStatus::SessionBusy => StatusKind::SessionBusy,
            RelayStatus::ConnectFailed(_) => StatusKind::ConnectFailed,
            RelayStatus::LocalError(_) => StatusKind::LocalError,
            RelayStatus::RemoteError(_) => StatusKind::RemoteError,
            RelayStatus::LocalWriteError(_) => StatusKind::LocalWriteError,
            RelayStatus::RemoteWriteError(_) => StatusKind::RemoteWriteError,
        }
    }

    /// EOF on either side and cancellation are orderly endings; everything else is a failure.
    pub fn is_error(&self) -> bool {
        !matches!(self, RelayStatus::LocalEof | RelayStatus::RemoteEof | RelayStatus::Cancelled)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::LocalEof => write!(f, "local server disconnected"),
            RelayStatus::RemoteEof => write!(f, "remote client disconnected"),
            RelayStatus::Cancelled => write!(f, "relay cancelled"),
            RelayStatus::SessionBusy => write!(f, "secure session busy with another relay"),
            RelayStatus::ConnectFailed(err) => write!(f, "{err}"),
            RelayStatus::LocalError(err) => write!(f, "error reading from the local connection: {err}"),
            RelayStatus::RemoteError(err) => write!(f, "error reading from the SSH channel: {err}"),
            RelayStatus::LocalWriteError(err) => write!(f, "error writing to the local connection: {err}"),
            RelayStatus::RemoteWriteError(err) => write!(f, "error writing to the SSH channel: {err}"),
        }
    }
}

/// Result of one relay session.
#[derive(Debug)]
pub struct RelayReport {
    pub status: RelayStatus,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
    pub elapsed: Duration,
}

impl RelayReport {
    pub fn new(status: RelayStatus) -> Self {
        Self {
            status,
            bytes_to_remote: 0,
            bytes_to_local: 0,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Counters {
    to_remote: u64,
    to_local: u64,
}

enum LocalPoll {
    Cancelled,
    Idle,
    Read(io::Result<usize>),
}

/// Why a full-chunk write stopped short.
#[derive(Debug)]
enum WriteStop {
    Cancelled,
    Failed(io::Error),
}

/// Pause between retries while a writer reports no capacity.
const STALL_BACKOFF: Duration = Duration::from_millis(2);

/// Pumps bytes between one secure channel and one local connection.
#[derive(Clone, Debug)]
pub struct RelayEngine {
    mode: IoMode,
    chunk_size: usize,
    poll_interval: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl RelayEngine {
    pub fn new(mode: IoMode, settings: &RelaySettings) -> Self {
        Self {
            mode,
            chunk_size: settings.chunk_size.max(1),
            poll_interval: settings.poll_interval,
            cancel: None,
        }
    }

    /// End relays with [`RelayStatus::Cancelled`] once `cancel` holds `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn mode(&self) -> &IoMode {
        &self.mode
    }

    /// Run one relay session to completion.
    ///
    /// The session is non-blocking for the whole call. On return the local
    /// connection has been shut down and dropped, and blocking mode is restored.
    /// The channel is left open for the caller to release.
    pub async fn relay<C, L>(&self, channel: &mut C, mut local: L) -> RelayReport
    where
        C: SecureChannel,
        L: LocalIo,
    {
        let started = Instant::now();
        let scope = match self.mode.enter_non_blocking() {
            Ok(scope) => scope,
            Err(err) => {
                warn!(error = %err, "refusing to start relay");
                close_local(local).await;
                return RelayReport::new(RelayStatus::SessionBusy);
            }
        };

        let mut counters = Counters::default();
        let status = self.pump(channel, &mut local, &mut counters).await;
        close_local(local).await;
        scope.exit();

        debug!(
            status = ?status.kind(),
            to_remote = counters.to_remote,
            to_local = counters.to_local,
            "relay session finished"
        );
        RelayReport {
            status,
            bytes_to_remote: counters.to_remote,
            bytes_to_local: counters.to_local,
            elapsed: started.elapsed(),
        }
    }

    async fn pump<C, L>(&self, channel: &mut C, local: &mut L, counters: &mut Counters) -> RelayStatus
    where
        C: SecureChannel,
        L: LocalIo,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut cancel = self.cancel.clone();
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => LocalPoll::Cancelled,
                read = time::timeout(self.poll_interval, local.read(&mut buf)) => match read {
                    Err(_) => LocalPoll::Idle,
                    Ok(result) => LocalPoll::Read(result),
                },
            };

            match polled {
                LocalPoll::Cancelled => return RelayStatus::Cancelled,
                LocalPoll::Idle => {}
                LocalPoll::Read(Ok(0)) => return RelayStatus::LocalEof,
                LocalPoll::Read(Ok(len)) => {
                    match write_to_channel(channel, &buf[..len], &mut cancel).await {
                        Ok(()) => {}
                        Err(WriteStop::Cancelled) => return RelayStatus::Cancelled,
                        Err(WriteStop::Failed(err)) => return RelayStatus::RemoteWriteError(err),
                    }
                    counters.to_remote += len as u64;
                    trace!(bytes = len, "local -> channel");
                }
                LocalPoll::Read(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                LocalPoll::Read(Err(err)) => return RelayStatus::LocalError(err),
            }

            if let Some(status) = drain_channel(channel, local, &mut buf, counters, &mut cancel).await {
                return status;
            }
        }
    }
}

/// Forward everything the channel has ready right now. `Some` means the relay is over.
async fn drain_channel<C, L>(
    channel: &mut C,
    local: &mut L,
    buf: &mut [u8],
    counters: &mut Counters,
    cancel: &mut Option<watch::Receiver<bool>>,
) -> Option<RelayStatus>
where
    C: SecureChannel,
    L: LocalIo,
{
    loop {
        match channel.read(buf).await {
            Ok(ChannelRead::WouldBlock) => return None,
            Ok(ChannelRead::Eof) => return Some(RelayStatus::RemoteEof),
            Ok(ChannelRead::Data(0)) => {
                return channel.at_remote_eof().then_some(RelayStatus::RemoteEof);
            }
            Ok(ChannelRead::Data(len)) => {
                match write_to_local(local, &buf[..len], cancel).await {
                    Ok(()) => {}
                    Err(WriteStop::Cancelled) => return Some(RelayStatus::Cancelled),
                    Err(WriteStop::Failed(err)) => return Some(RelayStatus::LocalWriteError(err)),
                }
                counters.to_local += len as u64;
                trace!(bytes = len, "channel -> local");
                if channel.at_remote_eof() {
                    return Some(RelayStatus::RemoteEof);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
            Err(err) => return Some(RelayStatus::RemoteError(err)),
        }
    }
}

/// Write all of `chunk` to the channel. Zero-progress writes and would-block are retried until cancelled.
async fn write_to_channel<C>(channel: &mut C, chunk: &[u8], cancel: &mut Option<watch::Receiver<bool>>) -> Result<(), WriteStop>
where
    C: SecureChannel,
{
    let mut written = 0;
    while written < chunk.len() {
        let step = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(WriteStop::Cancelled),
            step = channel.write(&chunk[written..]) => step,
        };
        match step {
            Ok(0) => stall(cancel).await?,
            Ok(len) => written += len.min(chunk.len() - written),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => stall(cancel).await?,
            Err(err) => return Err(WriteStop::Failed(err)),
        }
    }
    Ok(())
}

/// Write all of `chunk` to the local peer. A zero-byte write is fatal; a peer that stops reading is only escaped by cancellation.
async fn write_to_local<L>(local: &mut L, chunk: &[u8], cancel: &mut Option<watch::Receiver<bool>>) -> Result<(), WriteStop>
where
    L: LocalIo,
{
    let mut written = 0;
    while written < chunk.len() {
        let step = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(WriteStop::Cancelled),
            step = local.write(&chunk[written..]) => step,
        };
        match step {
            Ok(0) => {
                return Err(WriteStop::Failed(io::Error::new(io::ErrorKind::WriteZero, "local peer accepted no bytes")));
            }
            Ok(len) => written += len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(WriteStop::Failed(err)),
        }
    }
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(WriteStop::Cancelled),
        flushed = local.flush() => flushed.map_err(WriteStop::Failed),
    }
}

async fn stall(cancel: &mut Option<watch::Receiver<bool>>) -> Result<(), WriteStop> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(WriteStop::Cancelled),
        _ = time::sleep(STALL_BACKOFF) => Ok(()),
    }
}

async fn close_local<L>(mut local: L)
where
    L: LocalIo,
{
    if let Err(err) = local.shutdown().await {
        trace!(?err, "local shutdown after relay");
    }
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
