// ABOUTME: Per-link server event loop: polls the link and every transaction's channels
// ABOUTME: Dispatches complete frames by transaction id, creates transactions, reaps finished ones

use crate::channel::{FileSink, ReadEofAction, WriteEofAction};
use crate::codec::{Frame, PacketType, ProtocolState, ProtocolVersion, Request, Role};
use crate::link::{Link, LinkError};
use crate::server::exec::{self, ExecRegistry, ExitEvent};
use crate::transaction::{Dispatch, Status, Transaction, TransactionKind, errno_of};
use std::collections::HashMap;
use std::future::poll_fn;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, warn};

enum Event {
    Frame(Frame),
    ChildExit(ExitEvent),
    /// A tick made internal progress (frames staged, EOF actions fired).
    Progress,
    Closed,
    IdleTimeout,
    CommandTimeout,
}

/// One connection's worth of server state: the link, the live transactions,
/// and the child-exit channel feeding their command status.
pub struct ServerConnection<T> {
    link: Link<T>,
    link_timeout: Duration,
    command_timeout: Option<Duration>,
    registry: ExecRegistry,
    transactions: Vec<Transaction>,
    /// Server-side command deadlines, by transaction id.
    deadlines: HashMap<u16, Instant>,
    /// Exit statuses waiting for the tail of the command's output.
    pending_exits: HashMap<u16, Status>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    quit: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ServerConnection<T> {
    pub fn new(
        link: Link<T>,
        registry: ExecRegistry,
        link_timeout: Duration,
        command_timeout: Option<Duration>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            link,
            link_timeout,
            command_timeout,
            registry,
            transactions: Vec::new(),
            deadlines: HashMap::new(),
            pending_exits: HashMap::new(),
            exit_tx,
            exit_rx,
            quit: false,
        }
    }

    /// Drive the connection until the peer closes, the link dies or a quit
    /// request has been served. Returns whether quit was requested.
    pub async fn run(mut self) -> Result<bool, LinkError> {
        loop {
            self.settle_commands();
            self.reap().await;

            if self.quit && self.transactions.is_empty() {
                self.link.flush_queued().await?;
                debug!("quit requested, connection drained");
                return Ok(true);
            }

            let idle_at = self.link.idle_deadline(self.link_timeout);
            let command_at = self.deadlines.values().min().copied();

            let event = tokio::select! {
                event = poll_fn(|cx| self.poll_engine(cx)) => event?,
                _ = sleep_until(idle_at) => Event::IdleTimeout,
                _ = sleep_until(command_at.unwrap_or_else(Instant::now)),
                    if command_at.is_some() => Event::CommandTimeout,
            };

            match event {
                Event::Frame(frame) => self.dispatch_frame(frame).await,
                Event::ChildExit(exit) => {
                    self.deadlines.remove(&exit.xid);
                    self.pending_exits.insert(exit.xid, exit.status);
                }
                Event::Progress => {}
                Event::Closed => {
                    debug!("peer closed the link");
                    for trans in &mut self.transactions {
                        trans.flush_sinks().await;
                    }
                    return Ok(self.quit);
                }
                Event::IdleTimeout => {
                    // The select may race a frame that refreshed the clock.
                    if Instant::now() >= self.link.idle_deadline(self.link_timeout) {
                        warn!("timeout on link, failing live transactions");
                        self.fail_all(libc::EPROTO as i64);
                        let _ = self.link.flush_queued().await;
                        return Ok(self.quit);
                    }
                }
                Event::CommandTimeout => self.expire_commands(),
            }
        }
    }

    /// One cooperative tick: pump every transaction's channels, move staged
    /// frames onto the link, flush, then surface whatever needs a decision.
    fn poll_engine(&mut self, cx: &mut Context<'_>) -> Poll<Result<Event, LinkError>> {
        let mut progress = false;

        let out_allowed = self.link.xmit_queue_allowed();
        for trans in &mut self.transactions {
            if trans.pump(cx, out_allowed) {
                progress = true;
            }
            for frame in trans.drain_outbox() {
                self.link.queue_xmit(frame);
            }
        }

        if let Poll::Ready(Err(e)) = self.link.poll_flush_queue(cx) {
            return Poll::Ready(Err(e));
        }
        // If the flush just reopened the flow gate, come around again so the
        // held-back sources get polled (they have no waker registered).
        if !out_allowed && self.link.xmit_queue_allowed() {
            progress = true;
        }

        if let Poll::Ready(Some(exit)) = self.exit_rx.poll_recv(cx) {
            return Poll::Ready(Ok(Event::ChildExit(exit)));
        }

        match self.link.poll_recv_frame(cx) {
            Poll::Ready(Ok(Some(frame))) => return Poll::Ready(Ok(Event::Frame(frame))),
            Poll::Ready(Ok(None)) => return Poll::Ready(Ok(Event::Closed)),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }

        if progress {
            Poll::Ready(Ok(Event::Progress))
        } else {
            Poll::Pending
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) {
        match frame.packet_type() {
            PacketType::Command | PacketType::Inject | PacketType::Extract => {
                self.start_request(frame).await;
            }
            PacketType::Quit => {
                debug!("quit requested by peer");
                self.quit = true;
            }
            PacketType::Interrupt => self.handle_interrupt(&frame),
            _ => {
                let xid = frame.xid();
                let Some(trans) = self.transactions.iter_mut().find(|t| t.xid() == xid) else {
                    warn!(
                        xid,
                        packet = %(frame.packet_type() as u8 as char),
                        "frame for unknown transaction dropped"
                    );
                    return;
                };
                if let Dispatch::KindPacket(frame) = trans.recv_packet(frame) {
                    warn!(
                        trans = %trans.describe(),
                        packet = %(frame.packet_type() as u8 as char),
                        "unexpected packet type"
                    );
                    trans.fail(libc::EPROTO as i64);
                }
            }
        }
    }

    async fn start_request(&mut self, frame: Frame) {
        let xid = frame.xid();
        if self.transactions.iter().any(|t| t.xid() == xid) {
            warn!(xid, "request reuses a live transaction id, dropped");
            return;
        }

        let ps = ProtocolState::new(self.link.version(), xid, Role::Server);
        let kind = match frame.packet_type() {
            PacketType::Command => TransactionKind::Command,
            PacketType::Inject => TransactionKind::Inject,
            PacketType::Extract => TransactionKind::Extract,
            _ => unreachable!("start_request only sees request frames"),
        };
        let mut trans = Transaction::new(kind, ps);

        match Request::parse(&frame) {
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                trans.send_status(Status {
                    major: libc::EINVAL as i64,
                    minor: 0,
                });
            }
            Ok(Request::Command { user, command }) => {
                match exec::spawn(&user, &command, xid, &self.registry, self.exit_tx.clone()) {
                    Ok(spawned) => {
                        trans
                            .attach_sink(PacketType::Stdin, Box::new(spawned.stdin))
                            .set_write_eof_action(WriteEofAction::CloseStream);
                        trans.attach_source(PacketType::Stdout, Box::new(spawned.stdout));
                        trans.attach_source(PacketType::Stderr, Box::new(spawned.stderr));
                        if let Some(timeout) = self.command_timeout {
                            self.deadlines.insert(xid, Instant::now() + timeout);
                        }
                    }
                    Err(e) => trans.send_status(Status {
                        major: errno_of(&e),
                        minor: 0,
                    }),
                }
            }
            Ok(Request::Inject { user, size, path }) => {
                debug!(user = %user, size, path = %path, "inject request");
                let open = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .await;
                match open {
                    Ok(file) => {
                        // Major 0 unplugs the client's file source.
                        trans.send_major(0);
                        trans
                            .attach_sink(PacketType::Data, Box::new(FileSink::new(file)))
                            .set_write_eof_action(WriteEofAction::ReplyMinor);
                    }
                    Err(e) => trans.send_status(Status {
                        major: errno_of(&e),
                        minor: 0,
                    }),
                }
            }
            Ok(Request::Extract { user, path }) => {
                debug!(user = %user, path = %path, "extract request");
                match open_for_extract(&path).await {
                    Ok((file, size)) => {
                        trans.queue_uint(PacketType::Size, size as i64);
                        trans
                            .attach_source(PacketType::Data, Box::new(file))
                            .set_read_eof_action(ReadEofAction::SendEofAndStatus);
                    }
                    Err(e) => trans.fail(errno_of(&e)),
                }
            }
            Ok(Request::Quit | Request::Interrupt) => {
                unreachable!("quit and interrupt are handled before parsing")
            }
        }

        self.transactions.push(trans);
    }

    fn handle_interrupt(&mut self, frame: &Frame) {
        let target = match self.link.version() {
            ProtocolVersion::Multiplexed => Some(frame.xid()),
            ProtocolVersion::Legacy => None,
        };
        if !self.registry.interrupt(target) && target.is_some() {
            // The id did not resolve (an interrupt sent over a fresh link);
            // fall back to the newest running command.
            self.registry.interrupt(None);
        }
    }

    /// Report a finished command once the tail of its output is through.
    fn settle_commands(&mut self) {
        self.pending_exits.retain(|xid, status| {
            let Some(trans) = self
                .transactions
                .iter_mut()
                .find(|t| t.xid() == *xid && t.kind() == TransactionKind::Command)
            else {
                return false;
            };
            if trans.is_done() {
                return false;
            }
            if trans.sources_at_eof() {
                trans.send_status(*status);
                return false;
            }
            true
        });
    }

    fn expire_commands(&mut self) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(xid, _)| *xid)
            .collect();
        for xid in expired {
            warn!(xid, "command timed out");
            self.deadlines.remove(&xid);
            self.registry.kill(xid);
            if let Some(trans) = self
                .transactions
                .iter_mut()
                .find(|t| t.xid() == xid && !t.is_done())
            {
                trans.send_timeout();
            }
        }
    }

    fn fail_all(&mut self, code: i64) {
        for trans in &mut self.transactions {
            if !trans.is_done() {
                trans.fail(code);
            }
        }
        for trans in &mut self.transactions {
            for frame in trans.drain_outbox() {
                self.link.queue_xmit(frame);
            }
        }
    }

    /// Drop finished transactions whose frames have all been staged.
    async fn reap(&mut self) {
        let mut index = 0;
        while index < self.transactions.len() {
            let trans = &self.transactions[index];
            if trans.is_done() && trans.outbox_is_empty() {
                let mut trans = self.transactions.remove(index);
                self.deadlines.remove(&trans.xid());
                self.pending_exits.remove(&trans.xid());
                trans.flush_sinks().await;
                debug!(trans = %trans.describe(), "transaction reaped");
            } else {
                index += 1;
            }
        }
    }
}

async fn open_for_extract(path: &str) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let meta = file.metadata().await?;
    Ok((file, meta.len()))
}
