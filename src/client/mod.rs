// ABOUTME: Client operation drivers: command, inject, extract, interrupt and quit
// ABOUTME: Each operation opens a fresh link, sends one request frame and drives it to completion

pub mod error;
pub mod output;
mod stdin;

pub use error::{RemexError, RemexResult};
pub use output::{CommandOutput, OutputMode};

use crate::channel::{Channel, ReadEofAction, SourceYield};
use crate::codec::{self, Frame, PacketType, ProtocolState, ProtocolVersion, Request, Role};
use crate::link::{DEFAULT_LINK_TIMEOUT, Link, LinkError};
use crate::transaction::Status;
use crate::transport::{Endpoint, Pipe};
use error::local_open_error;
use output::{OutputSink, SinkError};
use std::future::poll_fn;
use std::io::Write;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, sleep_until};
use tracing::debug;

/// What one cooperative tick of an operation driver surfaced.
enum DriverEvent {
    /// A complete frame arrived from the peer.
    Frame(Frame),
    /// The local source hit EOF; its EOF frame is already queued. Carries
    /// the payload bytes staged in the same tick.
    SourceEof(usize),
    /// Payload bytes were pulled from the local source and staged.
    Sent(usize),
    /// The peer closed the link.
    Closed,
}

enum DriverError {
    /// Reading the local source failed.
    Source(std::io::Error),
    /// The link itself failed.
    Link(LinkError),
}

/// The client side of the engine.
///
/// Every operation opens its own link to the configured endpoint, performs
/// one transaction and closes the link again; nothing is shared between
/// operations except the transaction-id counter on multiplexed setups.
pub struct Client {
    endpoint: Endpoint,
    version: ProtocolVersion,
    link_timeout: Duration,
    dots: bool,
    next_xid: u16,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            version: ProtocolVersion::default(),
            link_timeout: DEFAULT_LINK_TIMEOUT,
            dots: false,
            next_xid: 0,
        }
    }

    /// Select the header shape; must match the server's configuration.
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    /// Print one progress dot per transferred chunk during file operations.
    pub fn with_progress_dots(mut self, dots: bool) -> Self {
        self.dots = dots;
        self
    }

    fn next_ps(&mut self) -> ProtocolState {
        let xid = match self.version {
            ProtocolVersion::Legacy => 0,
            ProtocolVersion::Multiplexed => {
                self.next_xid = self.next_xid.wrapping_add(1);
                if self.next_xid == 0 {
                    self.next_xid = 1;
                }
                self.next_xid
            }
        };
        ProtocolState::new(self.version, xid, Role::Client)
    }

    async fn open_link(&self) -> RemexResult<Link<Pipe>> {
        let pipe = self
            .endpoint
            .connect()
            .await
            .map_err(RemexError::OpenSession)?;
        Ok(Link::new(pipe, self.version))
    }

    /// Run a command, printing its output to the local screen.
    pub async fn run_command(&mut self, user: &str, command: &str) -> RemexResult<Status> {
        let output = self
            .run_command_with(user, command, OutputMode::Screen)
            .await?;
        Ok(output.status)
    }

    /// Run a command, dropping its output.
    pub async fn run_command_quiet(&mut self, user: &str, command: &str) -> RemexResult<Status> {
        let output = self
            .run_command_with(user, command, OutputMode::Discard)
            .await?;
        Ok(output.status)
    }

    /// Run a command, capturing stdout and stderr concatenated into one
    /// buffer of at most `limit` bytes.
    pub async fn run_command_captured(
        &mut self,
        user: &str,
        command: &str,
        limit: usize,
    ) -> RemexResult<CommandOutput> {
        self.run_command_with(user, command, OutputMode::Together { limit })
            .await
    }

    /// Run a command, capturing stdout and stderr separately, each capped at
    /// `limit` bytes.
    pub async fn run_command_split(
        &mut self,
        user: &str,
        command: &str,
        limit: usize,
    ) -> RemexResult<CommandOutput> {
        self.run_command_with(user, command, OutputMode::Split { limit })
            .await
    }

    /// Run a command with an explicit output mode.
    ///
    /// Local stdin is forwarded to the remote command until it hits EOF or
    /// the command's status starts arriving. The returned status carries the
    /// framework major and the command's exit code as minor.
    pub async fn run_command_with(
        &mut self,
        user: &str,
        command: &str,
        mode: OutputMode,
    ) -> RemexResult<CommandOutput> {
        let request = Request::Command {
            user: user.into(),
            command: command.into(),
        };
        let payload = request.encode_payload()?;
        let ps = self.next_ps();

        // The guard restores the stdin flags on every exit path below.
        let (_guard, stdin) = stdin::stdin_source();
        let mut link = self.open_link().await?;
        link.send_frame(codec::encode(&ps, PacketType::Command, &payload)?)
            .await
            .map_err(RemexError::SendCommand)?;

        let mut source = Channel::source(PacketType::Stdin, stdin);
        source.set_read_eof_action(ReadEofAction::SendEof);

        let mut sink = OutputSink::new(mode);
        let mut major: Option<i64> = None;
        let mut minor: Option<i64> = None;

        while minor.is_none() {
            let deadline = link.idle_deadline(self.link_timeout);
            let event = tokio::select! {
                event = poll_fn(|cx| poll_driver(&mut link, Some(&mut source), &ps, cx)) => event,
                _ = sleep_until(deadline) => {
                    return Err(RemexError::Protocol("timeout on link".into()));
                }
            };

            let frame = match event {
                Ok(DriverEvent::Frame(frame)) => frame,
                Ok(DriverEvent::SourceEof(_) | DriverEvent::Sent(_)) => continue,
                Ok(DriverEvent::Closed) => {
                    return Err(RemexError::ReceiveResults(
                        "link closed before the command finished".into(),
                    ));
                }
                Err(DriverError::Source(e)) => return Err(RemexError::ForwardInput(e)),
                Err(DriverError::Link(e)) => {
                    return Err(RemexError::ReceiveResults(e.to_string()));
                }
            };

            match frame.packet_type() {
                PacketType::Stdout if major.is_none() => {
                    sink.write_stdout(&frame.payload).map_err(sink_error)?;
                }
                PacketType::Stderr if major.is_none() => {
                    sink.write_stderr(&frame.payload).map_err(sink_error)?;
                }
                PacketType::Major if major.is_none() => {
                    major = Some(codec::parse_uint(&frame.payload)?);
                    // No more input once the status pair has started.
                    source.set_plugged(true);
                }
                PacketType::Minor if major.is_some() => {
                    minor = Some(codec::parse_uint(&frame.payload)?);
                }
                PacketType::Timeout => {
                    return Err(RemexError::Protocol("command timed out on the server".into()));
                }
                other => {
                    return Err(RemexError::ReceiveResults(format!(
                        "unexpected packet '{}'",
                        other as u8 as char
                    )));
                }
            }
        }

        let status = Status {
            major: major.unwrap_or_default(),
            minor: minor.unwrap_or_default(),
        };
        debug!(?status, "command finished");
        let (stdout, stderr) = sink.into_buffers();
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Copy a local file to `remote_path` on the peer.
    ///
    /// No file data leaves this side before the server confirms, with an
    /// early major status of 0, that it could open the destination.
    pub async fn inject_file(
        &mut self,
        user: &str,
        local_path: &str,
        remote_path: &str,
    ) -> RemexResult<()> {
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(local_open_error)?;
        let size = file
            .metadata()
            .await
            .map_err(RemexError::LocalFile)?
            .len();

        let request = Request::Inject {
            user: user.into(),
            size,
            path: remote_path.into(),
        };
        let payload = request.encode_payload()?;
        let ps = self.next_ps();

        let mut link = self.open_link().await?;
        link.send_frame(codec::encode(&ps, PacketType::Inject, &payload)?)
            .await
            .map_err(RemexError::SendCommand)?;

        // Attached but plugged: the early major unplugs it.
        let mut source = Channel::source(PacketType::Data, Box::new(file));
        source.set_plugged(true);
        source.set_read_eof_action(ReadEofAction::SendEof);

        let mut streaming = false;
        let mut eof_sent = false;
        let mut sent_bytes: u64 = 0;

        loop {
            let deadline = link.idle_deadline(self.link_timeout);
            let event = tokio::select! {
                event = poll_fn(|cx| poll_driver(&mut link, Some(&mut source), &ps, cx)) => event,
                _ = sleep_until(deadline) => {
                    self.finish_dots();
                    return Err(RemexError::Protocol("timeout on link".into()));
                }
            };

            match event {
                Ok(DriverEvent::Sent(n)) => {
                    sent_bytes += n as u64;
                    if self.dots {
                        print!(".");
                        let _ = std::io::stdout().flush();
                    }
                }
                Ok(DriverEvent::SourceEof(n)) => {
                    sent_bytes += n as u64;
                    self.finish_dots();
                    eof_sent = true;
                    if sent_bytes != size {
                        return Err(RemexError::LocalFile(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "file changed size while it was being sent",
                        )));
                    }
                }
                Ok(DriverEvent::Frame(frame)) => match frame.packet_type() {
                    PacketType::Major if !streaming => {
                        let code = codec::parse_uint(&frame.payload)?;
                        if code != 0 {
                            return Err(RemexError::RemoteFile(code));
                        }
                        streaming = true;
                        source.set_plugged(false);
                    }
                    PacketType::Minor if streaming => {
                        // Either the final acknowledgement, or the server
                        // aborting the transfer partway through.
                        let code = codec::parse_uint(&frame.payload)?;
                        if code != 0 {
                            return Err(RemexError::RemoteFile(code));
                        }
                        if !eof_sent {
                            return Err(RemexError::Protocol(
                                "minor status before the transfer completed".into(),
                            ));
                        }
                        return Ok(());
                    }
                    other => {
                        self.finish_dots();
                        return Err(RemexError::Protocol(format!(
                            "unexpected packet '{}' during inject",
                            other as u8 as char
                        )));
                    }
                },
                Ok(DriverEvent::Closed) => {
                    self.finish_dots();
                    return Err(RemexError::SendFile("link closed during transfer".into()));
                }
                Err(DriverError::Source(e)) => {
                    self.finish_dots();
                    return Err(RemexError::LocalFile(e));
                }
                Err(DriverError::Link(e)) => {
                    self.finish_dots();
                    return Err(RemexError::SendFile(e.to_string()));
                }
            }
        }
    }

    /// Copy `remote_path` from the peer into a local file.
    pub async fn extract_file(
        &mut self,
        user: &str,
        remote_path: &str,
        local_path: &str,
    ) -> RemexResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(local_path)
            .await
            .map_err(local_open_error)?;

        let request = Request::Extract {
            user: user.into(),
            path: remote_path.into(),
        };
        let payload = request.encode_payload()?;
        let ps = self.next_ps();

        let mut link = self.open_link().await?;
        link.send_frame(codec::encode(&ps, PacketType::Extract, &payload)?)
            .await
            .map_err(RemexError::SendCommand)?;

        let mut remaining: Option<u64> = None;
        let mut got_eof = false;
        let mut major: Option<i64> = None;

        loop {
            let deadline = link.idle_deadline(self.link_timeout);
            let event = tokio::select! {
                event = poll_fn(|cx| poll_driver(&mut link, None, &ps, cx)) => event,
                _ = sleep_until(deadline) => {
                    self.finish_dots();
                    return Err(RemexError::Protocol("timeout on link".into()));
                }
            };

            let frame = match event {
                Ok(DriverEvent::Frame(frame)) => frame,
                Ok(DriverEvent::SourceEof(_) | DriverEvent::Sent(_)) => continue,
                Ok(DriverEvent::Closed) => {
                    self.finish_dots();
                    return Err(RemexError::ReceiveFile(
                        "link closed before the transfer completed".into(),
                    ));
                }
                Err(DriverError::Source(e)) => {
                    self.finish_dots();
                    return Err(RemexError::LocalFile(e));
                }
                Err(DriverError::Link(e)) => {
                    self.finish_dots();
                    return Err(RemexError::ReceiveFile(e.to_string()));
                }
            };

            match frame.packet_type() {
                PacketType::Size if remaining.is_none() => {
                    remaining = Some(codec::parse_uint(&frame.payload)? as u64);
                }
                PacketType::Major if remaining.is_none() => {
                    // Early failure: the server could not open the file.
                    let code = codec::parse_uint(&frame.payload)?;
                    return Err(RemexError::RemoteFile(code));
                }
                PacketType::Data if remaining.is_some() && !got_eof => {
                    let left = remaining.unwrap_or_default();
                    if frame.payload.len() as u64 > left {
                        self.finish_dots();
                        return Err(RemexError::ReceiveFile(
                            "server sent more data than announced".into(),
                        ));
                    }
                    file.write_all(&frame.payload)
                        .await
                        .map_err(RemexError::LocalFile)?;
                    remaining = Some(left - frame.payload.len() as u64);
                    if self.dots {
                        print!(".");
                        let _ = std::io::stdout().flush();
                    }
                }
                PacketType::Eof if remaining.is_some() && !got_eof => {
                    self.finish_dots();
                    if remaining != Some(0) {
                        return Err(RemexError::ReceiveFile(
                            "transfer ended short of the announced size".into(),
                        ));
                    }
                    got_eof = true;
                    file.flush().await.map_err(RemexError::LocalFile)?;
                }
                PacketType::Major if got_eof && major.is_none() => {
                    let code = codec::parse_uint(&frame.payload)?;
                    if code != 0 {
                        return Err(RemexError::RemoteFile(code));
                    }
                    major = Some(code);
                }
                PacketType::Minor if major.is_some() => {
                    let code = codec::parse_uint(&frame.payload)?;
                    if code != 0 {
                        return Err(RemexError::RemoteFile(code));
                    }
                    return Ok(());
                }
                other => {
                    self.finish_dots();
                    return Err(RemexError::ReceiveFile(format!(
                        "unexpected packet '{}' during extract",
                        other as u8 as char
                    )));
                }
            }
        }
    }

    /// Interrupt the command the server is currently running.
    pub async fn interrupt(&mut self) -> RemexResult<()> {
        let ps = self.next_ps();
        let payload = Request::Interrupt.encode_payload()?;
        let mut link = self.open_link().await?;
        link.send_frame(codec::encode(&ps, PacketType::Interrupt, &payload)?)
            .await
            .map_err(RemexError::InterruptCommand)?;
        Ok(())
    }

    /// Ask the server to finish its live transactions and exit.
    pub async fn quit_server(&mut self) -> RemexResult<()> {
        let ps = self.next_ps();
        let payload = Request::Quit.encode_payload()?;
        let mut link = self.open_link().await?;
        link.send_frame(codec::encode(&ps, PacketType::Quit, &payload)?)
            .await
            .map_err(RemexError::SendCommand)?;
        Ok(())
    }

    fn finish_dots(&self) {
        if self.dots {
            println!();
        }
    }
}

fn sink_error(e: SinkError) -> RemexError {
    RemexError::ReceiveResults(e.to_string())
}

/// One cooperative tick: pump the local source under the flow gate, drain
/// the link's send queue, then look for a complete inbound frame.
fn poll_driver(
    link: &mut Link<Pipe>,
    mut source: Option<&mut Channel>,
    ps: &ProtocolState,
    cx: &mut Context<'_>,
) -> Poll<Result<DriverEvent, DriverError>> {
    let gate_open_before = link.xmit_queue_allowed();
    let have_source = source.is_some();
    if let Some(source) = source.as_deref_mut() {
        let mut sent = 0usize;
        while link.xmit_queue_allowed() {
            match source.poll_produce(cx, ps) {
                Poll::Ready(Ok(SourceYield::Data(mut buf))) => {
                    sent += buf.len() - ps.header_size();
                    codec::push_header(&mut buf, ps, source.id());
                    link.queue_xmit(buf.freeze());
                }
                Poll::Ready(Ok(SourceYield::Eof)) => {
                    if source.take_read_eof_action() == ReadEofAction::SendEof {
                        link.queue_xmit(codec::encode_empty(ps, PacketType::Eof));
                    }
                    return Poll::Ready(Ok(DriverEvent::SourceEof(sent)));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(DriverError::Source(e))),
                Poll::Pending => break,
            }
        }
        if sent > 0 {
            // Surface progress so the caller can account for it; the queue
            // drains on the next tick.
            if let Poll::Ready(Err(e)) = link.poll_flush_queue(cx) {
                return Poll::Ready(Err(DriverError::Link(e)));
            }
            return Poll::Ready(Ok(DriverEvent::Sent(sent)));
        }
    }

    if let Poll::Ready(Err(e)) = link.poll_flush_queue(cx) {
        return Poll::Ready(Err(DriverError::Link(e)));
    }
    // If the flush just reopened the flow gate, surface a tick so the
    // held-back source gets polled again (it has no waker registered).
    if have_source && !gate_open_before && link.xmit_queue_allowed() {
        return Poll::Ready(Ok(DriverEvent::Sent(0)));
    }

    match link.poll_recv_frame(cx) {
        Poll::Ready(Ok(Some(frame))) => Poll::Ready(Ok(DriverEvent::Frame(frame))),
        Poll::Ready(Ok(None)) => Poll::Ready(Ok(DriverEvent::Closed)),
        Poll::Ready(Err(e)) => Poll::Ready(Err(DriverError::Link(e))),
        Poll::Pending => Poll::Pending,
    }
}
