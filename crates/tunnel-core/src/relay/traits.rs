use std::{fmt, io};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

// Internal Result type alias for convenience
type Result<T> = crate::SshResult<T>;

/// Trait for local streams the relay can pump against.
pub trait LocalIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> LocalIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Outcome of a single channel read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRead {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing is queued right now. Only returned while the session is non-blocking.
    WouldBlock,
    /// The remote side sent EOF or closed the channel and nothing is left to read.
    Eof,
}

/// One bidirectional stream multiplexed over the secure transport.
#[async_trait]
pub trait SecureChannel: Send {
    /// Read queued data, honouring the owning session's blocking mode.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead>;

    /// Write some prefix of `buf`. `Ok(0)` and `ErrorKind::WouldBlock` mean "no capacity yet".
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// True once the remote side signalled end-of-stream and every queued byte was read.
    fn at_remote_eof(&self) -> bool;

    /// Release the channel. Calling it again is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

/// Where a forwarded connection came from, as reported by the server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Origin {
    pub address: String,
    pub port: u32,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A forwarded connection handed out by [`ForwardListener::accept`].
pub struct Accepted<C> {
    pub channel: C,
    pub origin: Origin,
}

/// The remote-side listening endpoint hosted by the server.
#[async_trait]
pub trait ForwardListener: Send {
    type Channel: SecureChannel;

    /// Wait for the next forwarded connection. An error ends the accept loop.
    async fn accept(&mut self) -> Result<Accepted<Self::Channel>>;

    /// Host the server was asked to bind and the port it actually bound.
    fn bound(&self) -> (&str, u32);

    /// Ask the server to stop listening.
    async fn cancel(&mut self) -> Result<()>;
}
