use std::io;

use async_trait::async_trait;
use futures::FutureExt;
use russh::{Channel, ChannelMsg, client::Msg};
use tracing::trace;
use tunnel_core::{
    IoMode,
    relay::{ChannelRead, SecureChannel},
};

/// A forwarded-tcpip channel seen through the session's blocking flag.
///
/// In non-blocking mode reads never wait: a message is taken only if one is
/// already queued. Data left over from a message larger than the caller's
/// buffer is served before the next message is pulled.
pub struct RusshChannel {
    channel: Channel<Msg>,
    mode: IoMode,
    pending: Vec<u8>,
    offset: usize,
    remote_eof: bool,
    closed: bool,
}

impl RusshChannel {
    pub fn new(channel: Channel<Msg>, mode: IoMode) -> Self {
        Self {
            channel,
            mode,
            pending: Vec::new(),
            offset: 0,
            remote_eof: false,
            closed: false,
        }
    }

    fn buffered(&self) -> usize {
        self.pending.len() - self.offset
    }

    fn take_buffered(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.buffered());
        buf[..len].copy_from_slice(&self.pending[self.offset..self.offset + len]);
        self.offset += len;
        len
    }

    /// Fold one channel message into the local state.
    fn absorb(&mut self, msg: Option<ChannelMsg>) {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                self.pending.clear();
                self.pending.extend_from_slice(&data);
                self.offset = 0;
            }
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => self.remote_eof = true,
            Some(other) => trace!(?other, "ignoring channel message"),
        }
    }

    /// After the buffer runs dry, look past queued control messages for an EOF so it is visible right after the last chunk.
    fn peek_eof(&mut self) {
        while self.buffered() == 0
            && !self.remote_eof
            && let Some(msg) = self.channel.wait().now_or_never()
        {
            self.absorb(msg);
        }
    }
}

fn to_io(err: russh::Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err.to_string())
}

#[async_trait]
impl SecureChannel for RusshChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ChannelRead> {
        loop {
            if self.buffered() > 0 {
                let len = self.take_buffered(buf);
                self.peek_eof();
                return Ok(ChannelRead::Data(len));
            }
            if self.remote_eof {
                return Ok(ChannelRead::Eof);
            }
            let msg = if self.mode.is_blocking() {
                self.channel.wait().await
            } else {
                match self.channel.wait().now_or_never() {
                    Some(msg) => msg,
                    None => return Ok(ChannelRead::WouldBlock),
                }
            };
            self.absorb(msg);
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel already closed"));
        }
        self.channel.data(buf).await.map_err(to_io)?;
        Ok(buf.len())
    }

    fn at_remote_eof(&self) -> bool {
        self.remote_eof && self.buffered() == 0
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.channel.eof().await {
            trace!(?err, "sending channel EOF before close");
        }
        match self.channel.close().await {
            Ok(()) => Ok(()),
            // The peer may already have torn the channel down.
            Err(_) if self.remote_eof => Ok(()),
            Err(err) => Err(to_io(err)),
        }
    }
}
