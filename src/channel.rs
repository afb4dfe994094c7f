// ABOUTME: Unidirectional channels binding local streams to a transaction
// ABOUTME: Sources turn local reads into outbound frames; sinks drain inbound payloads to local writes

use crate::codec::{self, PacketType, ProtocolState};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

pub type BoxedSource = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// One-shot action taken when a source reaches EOF on its local stream.
///
/// These replace the function-pointer callbacks of a vtable design; each
/// channel carries at most one handler per terminal event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadEofAction {
    /// Nothing to do (command output streams; status comes from the child).
    #[default]
    None,
    /// Emit an EOF packet for this stream (stdin forwarding, file upload).
    SendEof,
    /// Emit an EOF packet, then report success status (file download served
    /// in full).
    SendEofAndStatus,
}

/// One-shot action taken when the peer announces EOF for a sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteEofAction {
    #[default]
    None,
    /// Half-close the local stream (a command's stdin).
    CloseStream,
    /// Half-close, then report minor status 0 (inject destination complete).
    ReplyMinor,
}

/// What a source produced on one poll.
#[derive(Debug)]
pub enum SourceYield {
    /// A payload chunk, with header head-room already reserved.
    Data(BytesMut),
    /// The local stream ended. Reported exactly once.
    Eof,
}

enum ChannelIo {
    Source {
        stream: BoxedSource,
        /// At most one posted receive buffer at a time.
        recv_buf: Option<BytesMut>,
    },
    Sink {
        stream: BoxedSink,
        pending: VecDeque<Bytes>,
        /// Peer announced EOF; shut the stream down once `pending` drains.
        eof_pending: bool,
        shutdown_done: bool,
    },
}

/// A unidirectional stream inside a transaction, tagged by the packet type
/// its data travels under.
pub struct Channel {
    id: PacketType,
    io: ChannelIo,
    plugged: bool,
    read_eof: bool,
    eof_reported: bool,
    dead: bool,
    read_eof_action: ReadEofAction,
    write_eof_action: WriteEofAction,
}

impl Channel {
    /// Wrap a local stream the transaction reads from (and the peer receives).
    pub fn source(id: PacketType, stream: BoxedSource) -> Self {
        Self {
            id,
            io: ChannelIo::Source {
                stream,
                recv_buf: None,
            },
            plugged: false,
            read_eof: false,
            eof_reported: false,
            dead: false,
            read_eof_action: ReadEofAction::default(),
            write_eof_action: WriteEofAction::default(),
        }
    }

    /// Wrap a local stream the transaction writes inbound payloads to.
    /// Sinks never read, so they are born at read-EOF.
    pub fn sink(id: PacketType, stream: BoxedSink) -> Self {
        Self {
            id,
            io: ChannelIo::Sink {
                stream,
                pending: VecDeque::new(),
                eof_pending: false,
                shutdown_done: false,
            },
            plugged: false,
            read_eof: true,
            eof_reported: false,
            dead: false,
            read_eof_action: ReadEofAction::default(),
            write_eof_action: WriteEofAction::default(),
        }
    }

    pub fn id(&self) -> PacketType {
        self.id
    }

    pub fn is_source(&self) -> bool {
        matches!(self.io, ChannelIo::Source { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.io, ChannelIo::Sink { .. })
    }

    /// A plugged source is held back: no receive buffer is posted and no
    /// data leaves the local stream until it is unplugged.
    pub fn set_plugged(&mut self, plugged: bool) {
        self.plugged = plugged;
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    pub fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn set_read_eof_action(&mut self, action: ReadEofAction) {
        self.read_eof_action = action;
    }

    pub fn set_write_eof_action(&mut self, action: WriteEofAction) {
        self.write_eof_action = action;
    }

    pub fn write_eof_action(&self) -> WriteEofAction {
        self.write_eof_action
    }

    /// Take the read-EOF action, firing it at most once.
    pub fn take_read_eof_action(&mut self) -> ReadEofAction {
        std::mem::take(&mut self.read_eof_action)
    }

    /// Pull one chunk from a source's local stream into a buffer with header
    /// head-room. Plugged and drained sources yield nothing.
    pub fn poll_produce(
        &mut self,
        cx: &mut Context<'_>,
        ps: &ProtocolState,
    ) -> Poll<io::Result<SourceYield>> {
        let ChannelIo::Source { stream, recv_buf } = &mut self.io else {
            return Poll::Pending;
        };
        if self.plugged || self.dead {
            return Poll::Pending;
        }
        if self.read_eof {
            if self.eof_reported {
                return Poll::Pending;
            }
            self.eof_reported = true;
            return Poll::Ready(Ok(SourceYield::Eof));
        }

        let buf = recv_buf.get_or_insert_with(|| codec::payload_buffer(ps));
        let start = buf.len();
        let max = codec::MAX_FRAME_SIZE - start;
        buf.resize(start + max, 0);
        let mut read_buf = ReadBuf::new(&mut buf[start..]);
        let result = Pin::new(stream).poll_read(cx, &mut read_buf);
        let filled = read_buf.filled().len();
        buf.truncate(start + filled);

        match result {
            Poll::Ready(Ok(())) => {
                if filled == 0 {
                    self.read_eof = true;
                    self.eof_reported = true;
                    recv_buf.take();
                    debug!(id = %(self.id as u8 as char), "source EOF");
                    Poll::Ready(Ok(SourceYield::Eof))
                } else {
                    Poll::Ready(Ok(SourceYield::Data(
                        recv_buf.take().expect("buffer was just filled"),
                    )))
                }
            }
            // A non-blocking fd behind a reader that does not translate
            // EAGAIN itself; treat it as "nothing available right now".
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Poll::Ready(Err(e)) => {
                self.dead = true;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Queue an inbound payload for a sink. Data arriving for a dead sink is
    /// silently discarded.
    pub fn write_data(&mut self, payload: Bytes) {
        let ChannelIo::Sink { pending, .. } = &mut self.io else {
            return;
        };
        if self.dead {
            return;
        }
        debug!(
            id = %(self.id as u8 as char),
            len = payload.len(),
            "queueing data for local sink"
        );
        pending.push_back(payload);
    }

    /// Note the peer's EOF announcement; the stream shuts down once pending
    /// data has drained.
    pub fn announce_write_eof(&mut self) {
        if let ChannelIo::Sink { eof_pending, .. } = &mut self.io {
            *eof_pending = true;
        }
    }

    pub fn has_pending(&self) -> bool {
        match &self.io {
            ChannelIo::Sink { pending, .. } => !pending.is_empty(),
            ChannelIo::Source { .. } => false,
        }
    }

    /// Drain queued payloads into the sink's local stream.
    ///
    /// `Ready(true)` reports, exactly once, that a pending write-EOF has
    /// completed (drained and shut down); the caller then fires the
    /// channel's [`WriteEofAction`].
    pub fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        let ChannelIo::Sink {
            stream,
            pending,
            eof_pending,
            shutdown_done,
        } = &mut self.io
        else {
            return Poll::Ready(Ok(false));
        };
        if self.dead {
            return Poll::Ready(Ok(false));
        }

        while let Some(front) = pending.front_mut() {
            let n = match Pin::new(&mut *stream).poll_write(cx, front) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => {
                    self.dead = true;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                self.dead = true;
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero)));
            }
            if n == front.len() {
                pending.pop_front();
            } else {
                let _ = front.split_to(n);
            }
        }

        if *eof_pending && !*shutdown_done {
            match Pin::new(&mut *stream).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    *shutdown_done = true;
                    return Poll::Ready(Ok(true));
                }
                Poll::Ready(Err(e)) => {
                    self.dead = true;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(false))
    }

    /// Drain a sink completely. Used at tear-down.
    pub async fn flush(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_drain(cx).map(|r| r.map(|_| ()))).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &(self.id as u8 as char))
            .field("kind", &if self.is_source() { "source" } else { "sink" })
            .field("plugged", &self.plugged)
            .field("read_eof", &self.read_eof)
            .field("dead", &self.dead)
            .finish()
    }
}

/// A file sink that fsyncs on shutdown, so an inject's minor status is only
/// reported once the data has actually reached the disk.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub fn new(file: tokio::fs::File) -> Self {
        Self { file }
    }
}

impl AsyncWrite for FileSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.file).poll_flush(cx))?;
        // Synchronous fsync; the write-back is small and already buffered.
        let fd = std::os::fd::AsRawFd::as_raw_fd(&this.file);
        if unsafe { libc::fsync(fd) } != 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        Poll::Ready(Ok(()))
    }
}
