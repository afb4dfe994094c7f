// ABOUTME: One endpoint of the byte pipe: frame accumulation inbound, queued frames outbound
// ABOUTME: Applies the flow-control gate and tracks EOF, dead state and link activity times

use crate::codec::{self, CodecError, Frame, ProtocolVersion};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::poll_fn;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant};

/// Above this many queued outbound bytes the event loop stops polling local
/// sources until the kernel has drained some of the backlog.
pub const SEND_QUEUE_HIGH_WATER: usize = 4 * codec::MAX_FRAME_SIZE;

/// How much the receive buffer grows per read.
const RECV_CHUNK: usize = 8 * 1024;

/// Default inactivity timeout: a link with no frame read or written for this
/// long fails its transactions with a protocol error.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("peer closed the link mid-frame")]
    TruncatedFrame,

    #[error("timeout on link")]
    Timeout,
}

/// One endpoint of the full-duplex byte pipe.
///
/// Outbound frames are queued and drained with non-blocking writes; inbound
/// bytes accumulate until a complete frame can be parsed. At most one frame
/// surfaces per poll, in arrival order.
#[derive(Debug)]
pub struct Link<T> {
    pipe: T,
    version: ProtocolVersion,
    recv_buf: BytesMut,
    send_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    read_eof: bool,
    write_eof: bool,
    dead: bool,
    last_activity: Instant,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Link<T> {
    pub fn new(pipe: T, version: ProtocolVersion) -> Self {
        Self {
            pipe,
            version,
            recv_buf: BytesMut::with_capacity(RECV_CHUNK),
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            read_eof: false,
            write_eof: false,
            dead: false,
            last_activity: Instant::now(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    /// Queue an outbound frame, taking ownership of the buffer.
    pub fn queue_xmit(&mut self, frame: Bytes) {
        debug_assert!(!self.write_eof);
        self.queued_bytes += frame.len();
        self.send_queue.push_back(frame);
    }

    /// Queue a frame whose payload is shared with the caller. `Bytes` makes
    /// the clone a reference-count bump rather than a copy.
    pub fn xmit_shared(&mut self, frame: &Bytes) {
        self.queue_xmit(frame.clone());
    }

    pub fn xmit_queue_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Flow-control gate: whether the event loop may pull more data from
    /// local sources into this link's send queue.
    pub fn xmit_queue_allowed(&self) -> bool {
        !self.write_eof && !self.dead && self.queued_bytes < SEND_QUEUE_HIGH_WATER
    }

    /// Instant of the last successful read or write on the pipe.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.last_activity + timeout
    }

    /// Drain as much of the send queue as the pipe accepts right now.
    ///
    /// Ready once the queue is empty; partial progress leaves the remainder
    /// queued for the next poll.
    pub fn poll_flush_queue(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
        while let Some(front) = self.send_queue.front_mut() {
            let n = match Pin::new(&mut self.pipe).poll_write(cx, front) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => {
                    self.dead = true;
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                self.dead = true;
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
            }
            self.last_activity = Instant::now();
            self.queued_bytes -= n;
            if n == front.len() {
                self.send_queue.pop_front();
            } else {
                front.advance(n);
            }
        }
        match Pin::new(&mut self.pipe).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => {
                self.dead = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Poll for the next complete inbound frame.
    ///
    /// `Ready(None)` is a clean close: the peer shut down on a frame
    /// boundary. A close mid-frame is an error.
    pub fn poll_recv_frame(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<Frame>, LinkError>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Poll::Ready(Ok(Some(frame)));
            }

            if self.read_eof {
                return if self.recv_buf.is_empty() {
                    Poll::Ready(Ok(None))
                } else {
                    self.dead = true;
                    Poll::Ready(Err(LinkError::TruncatedFrame))
                };
            }

            let n = ready!(self.poll_read_chunk(cx))?;
            if n == 0 {
                self.read_eof = true;
            } else {
                self.last_activity = Instant::now();
            }
        }
    }

    /// Try to parse one frame out of the receive buffer.
    fn parse_frame(&mut self) -> Result<Option<Frame>, LinkError> {
        let mut cursor = Cursor::new(&self.recv_buf[..]);
        match codec::parse(&mut cursor, self.version) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                self.recv_buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => {
                self.dead = true;
                Err(e.into())
            }
        }
    }

    fn poll_read_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, LinkError>> {
        let start = self.recv_buf.len();
        self.recv_buf.resize(start + RECV_CHUNK, 0);
        let mut read_buf = ReadBuf::new(&mut self.recv_buf[start..]);
        let result = Pin::new(&mut self.pipe).poll_read(cx, &mut read_buf);
        let filled = read_buf.filled().len();
        self.recv_buf.truncate(start + filled);
        match result {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(filled)),
            Poll::Ready(Err(e)) => {
                self.dead = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Half-close the write side once the queue has drained.
    pub fn poll_shutdown_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
        ready!(self.poll_flush_queue(cx))?;
        match Pin::new(&mut self.pipe).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                self.write_eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.dead = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Queue a frame and drain the queue to the pipe.
    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), LinkError> {
        self.queue_xmit(frame);
        self.flush_queued().await
    }

    pub async fn flush_queued(&mut self) -> Result<(), LinkError> {
        poll_fn(|cx| self.poll_flush_queue(cx)).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, LinkError> {
        poll_fn(|cx| self.poll_recv_frame(cx)).await
    }

    pub async fn shutdown_write(&mut self) -> Result<(), LinkError> {
        poll_fn(|cx| self.poll_shutdown_write(cx)).await
    }
}
