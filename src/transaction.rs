// ABOUTME: The transaction engine: one unit of work with its channels and status handshake
// ABOUTME: Pumps sources into outbound frames, drains sinks, enforces the major/minor protocol

use crate::channel::{BoxedSink, BoxedSource, Channel, ReadEofAction, SourceYield, WriteEofAction};
use crate::codec::{self, Frame, PacketType, ProtocolState};
use bytes::{Bytes, BytesMut};
use std::io;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// The two-integer exit pair of a transaction: `major` is the framework
/// status (spawn or open succeeded?), `minor` the operation status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub major: i64,
    pub minor: i64,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Command,
    Inject,
    Extract,
    Interrupt,
    Quit,
}

impl TransactionKind {
    fn name(self) -> &'static str {
        match self {
            TransactionKind::Command => "command",
            TransactionKind::Inject => "inject",
            TransactionKind::Extract => "extract",
            TransactionKind::Interrupt => "interrupt",
            TransactionKind::Quit => "quit",
        }
    }
}

/// Outcome of handing an inbound frame to a transaction.
#[derive(Debug)]
pub enum Dispatch {
    /// Consumed: sink data, an EOF announcement, or dropped because DONE.
    Handled,
    /// Not a channel packet; the kind-specific handler decides. A caller
    /// with no handler for it must fail the transaction with EPROTO.
    KindPacket(Frame),
}

enum ChannelEvent {
    SourceData(PacketType, BytesMut),
    SourceEof(ReadEofAction),
    WriteEofDone(PacketType, WriteEofAction),
    IoError(i64),
}

/// A unit of work between the two ends of a link.
///
/// The transaction owns its channels; the link stays with the event loop.
/// Frames to send are staged in an outbox the loop moves onto the link, so
/// per-transaction ordering is preserved.
pub struct Transaction {
    ps: ProtocolState,
    kind: TransactionKind,
    sinks: Vec<Channel>,
    sources: Vec<Channel>,
    outbox: Vec<Bytes>,
    major_sent: bool,
    minor_sent: bool,
    done: bool,
}

impl Transaction {
    pub fn new(kind: TransactionKind, ps: ProtocolState) -> Self {
        debug!(trans = %describe(kind, &ps), "new transaction");
        Self {
            ps,
            kind,
            sinks: Vec::new(),
            sources: Vec::new(),
            outbox: Vec::new(),
            major_sent: false,
            minor_sent: false,
            done: false,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn ps(&self) -> &ProtocolState {
        &self.ps
    }

    pub fn xid(&self) -> u16 {
        self.ps.xid
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn major_sent(&self) -> bool {
        self.major_sent
    }

    pub fn describe(&self) -> String {
        describe(self.kind, &self.ps)
    }

    pub fn num_channels(&self) -> usize {
        self.sinks.len() + self.sources.len()
    }

    /// Attach a local stream the peer's data is written to.
    pub fn attach_sink(&mut self, id: PacketType, stream: BoxedSink) -> &mut Channel {
        debug!(trans = %self.describe(), id = %(id as u8 as char), "attach sink");
        self.sinks.push(Channel::sink(id, stream));
        self.sinks.last_mut().expect("just pushed")
    }

    /// Attach a local stream whose data is forwarded to the peer.
    pub fn attach_source(&mut self, id: PacketType, stream: BoxedSource) -> &mut Channel {
        debug!(trans = %self.describe(), id = %(id as u8 as char), "attach source");
        self.sources.push(Channel::source(id, stream));
        self.sources.last_mut().expect("just pushed")
    }

    /// Close sinks by id; `None` closes all of them.
    pub fn close_sink(&mut self, id: Option<PacketType>) {
        self.sinks.retain(|c| id.is_some_and(|id| c.id() != id));
    }

    /// Close sources by id; `None` closes all of them.
    pub fn close_source(&mut self, id: Option<PacketType>) {
        self.sources.retain(|c| id.is_some_and(|id| c.id() != id));
    }

    /// All sources have reached EOF on their local streams (trivially true
    /// with no sources). Used to delay a command's status until the tail of
    /// its output has been forwarded.
    pub fn sources_at_eof(&self) -> bool {
        self.sources.iter().all(|c| c.is_read_eof())
    }

    /// Stage a frame carrying a decimal ASCII integer (size replies).
    pub fn queue_uint(&mut self, packet_type: PacketType, value: i64) {
        self.outbox
            .push(codec::encode_uint(&self.ps, packet_type, value));
    }

    /// Take the frames staged for transmission, in order.
    pub fn drain_outbox(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.outbox.drain(..)
    }

    pub fn outbox_is_empty(&self) -> bool {
        self.outbox.is_empty()
    }

    /// Dispatch one inbound frame.
    ///
    /// Order of precedence: a DONE transaction drops everything; data for a
    /// known sink is queued to it; an EOF packet half-closes the sink that
    /// asked to hear about it; everything else goes to the kind handler.
    pub fn recv_packet(&mut self, frame: Frame) -> Dispatch {
        if self.done {
            debug!(trans = %self.describe(), "frame for finished transaction dropped");
            return Dispatch::Handled;
        }

        let packet_type = frame.packet_type();
        if let Some(sink) = self.sinks.iter_mut().find(|c| c.id() == packet_type) {
            debug!(
                trans = %describe(self.kind, &self.ps),
                len = frame.payload.len(),
                "sink data"
            );
            sink.write_data(frame.payload);
            return Dispatch::Handled;
        }

        if frame.packet_type() == PacketType::Eof {
            if let Some(sink) = self
                .sinks
                .iter_mut()
                .find(|s| s.write_eof_action() != WriteEofAction::None)
            {
                debug!(trans = %describe(self.kind, &self.ps), "received EOF");
                sink.announce_write_eof();
                return Dispatch::Handled;
            }
        }

        Dispatch::KindPacket(frame)
    }

    /// Pump every channel once: drain sinks, pull from sources when the
    /// link's flow gate is open, fire one-shot EOF actions, purge the dead.
    ///
    /// Local I/O failures fail the transaction with the OS errno rather than
    /// propagating, except a broken pipe on a sink, which only closes that
    /// channel. A finished transaction's channels are left untouched.
    /// Returns true when any frame was staged or any terminal event fired.
    pub fn pump(&mut self, cx: &mut Context<'_>, out_allowed: bool) -> bool {
        let ps = self.ps;
        let mut events = Vec::new();

        if !self.done {
            for sink in &mut self.sinks {
                match sink.poll_drain(cx) {
                    Poll::Ready(Ok(true)) => {
                        events
                            .push(ChannelEvent::WriteEofDone(sink.id(), sink.write_eof_action()));
                    }
                    Poll::Ready(Ok(false)) | Poll::Pending => {}
                    // The local reader went away (a command exiting without
                    // consuming its stdin). That closes the channel, it does
                    // not fail the transaction.
                    Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Poll::Ready(Err(e)) => events.push(ChannelEvent::IoError(errno_of(&e))),
                }
            }
        }

        if out_allowed && !self.done {
            for source in &mut self.sources {
                match source.poll_produce(cx, &ps) {
                    Poll::Ready(Ok(SourceYield::Data(buf))) => {
                        events.push(ChannelEvent::SourceData(source.id(), buf));
                    }
                    Poll::Ready(Ok(SourceYield::Eof)) => {
                        events.push(ChannelEvent::SourceEof(source.take_read_eof_action()));
                    }
                    Poll::Ready(Err(e)) => events.push(ChannelEvent::IoError(errno_of(&e))),
                    Poll::Pending => {}
                }
            }
        }

        let progress = !events.is_empty();
        for event in events {
            self.handle_event(event);
        }

        self.sinks.retain(|c| !c.is_dead());
        self.sources.retain(|c| !c.is_dead());
        progress
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::SourceData(id, mut buf) => {
                codec::push_header(&mut buf, &self.ps, id);
                self.outbox.push(buf.freeze());
            }
            ChannelEvent::SourceEof(action) => match action {
                ReadEofAction::None => {}
                ReadEofAction::SendEof => {
                    self.outbox
                        .push(codec::encode_empty(&self.ps, PacketType::Eof));
                }
                ReadEofAction::SendEofAndStatus => {
                    self.outbox
                        .push(codec::encode_empty(&self.ps, PacketType::Eof));
                    self.send_status(Status::default());
                }
            },
            ChannelEvent::WriteEofDone(id, action) => match action {
                WriteEofAction::None | WriteEofAction::CloseStream => {
                    debug!(trans = %self.describe(), id = %(id as u8 as char), "sink closed");
                }
                WriteEofAction::ReplyMinor => self.send_minor(0),
            },
            ChannelEvent::IoError(errno) => self.fail(errno),
        }
    }

    /// Send the major status. Sending it twice is a programming bug.
    pub fn send_major(&mut self, code: i64) {
        debug!(trans = %self.describe(), code, "send status.major");
        assert!(!self.major_sent, "major status sent twice");
        self.outbox
            .push(codec::encode_uint(&self.ps, PacketType::Major, code));
        self.major_sent = true;
    }

    /// Send the minor status and finish the transaction. Sending it twice is
    /// a programming bug.
    pub fn send_minor(&mut self, code: i64) {
        debug!(trans = %self.describe(), code, "send status.minor");
        assert!(!self.minor_sent, "minor status sent twice");
        self.outbox
            .push(codec::encode_uint(&self.ps, PacketType::Minor, code));
        self.minor_sent = true;
        self.done = true;
    }

    /// Send both halves of the status in order and finish.
    pub fn send_status(&mut self, status: Status) {
        if self.done {
            warn!(trans = %self.describe(), "send_status on a finished transaction");
            return;
        }
        self.send_major(status.major);
        self.send_minor(status.minor);
    }

    /// Abort with `code`, filling in whichever status halves are missing.
    /// Aborting after both were sent is a programming bug.
    pub fn fail(&mut self, code: i64) {
        self.done = true;
        if !self.major_sent {
            self.send_major(code);
        } else if !self.minor_sent {
            self.send_minor(code);
        } else {
            panic!("transaction failed after both statuses were sent");
        }
    }

    /// Force a specific major/minor pair and finish.
    pub fn fail2(&mut self, major: i64, minor: i64) {
        self.send_major(major);
        self.send_minor(minor);
    }

    /// Announce a timeout with the dedicated packet type (not an errno) and
    /// finish.
    pub fn send_timeout(&mut self) {
        debug!(trans = %self.describe(), "send timeout");
        self.outbox
            .push(codec::encode_empty(&self.ps, PacketType::Timeout));
        self.done = true;
    }

    /// Drain every sink fully. Used at tear-down before the link closes.
    pub async fn flush_sinks(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "sink flush failed during tear-down");
            }
        }
    }
}

fn describe(kind: TransactionKind, ps: &ProtocolState) -> String {
    format!("{}/{}", kind.name(), ps.xid)
}

pub(crate) fn errno_of(e: &io::Error) -> i64 {
    e.raw_os_error().unwrap_or(libc::EIO) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameHeader, ProtocolVersion, Role};
    use std::future::poll_fn;
    use std::io::Cursor;

    fn server_ps() -> ProtocolState {
        ProtocolState::new(ProtocolVersion::Legacy, 0, Role::Server)
    }

    fn frame(packet_type: PacketType, payload: &'static [u8]) -> Frame {
        Frame {
            header: FrameHeader {
                packet_type,
                len: (4 + payload.len()) as u16,
                xid: 0,
            },
            payload: Bytes::from_static(payload),
        }
    }

    async fn pump_once(trans: &mut Transaction, out_allowed: bool) -> bool {
        poll_fn(|cx| Poll::Ready(trans.pump(cx, out_allowed))).await
    }

    #[tokio::test]
    async fn source_data_is_framed_into_the_outbox() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        let data: &[u8] = b"output";
        trans.attach_source(PacketType::Stdout, Box::new(data));

        assert!(pump_once(&mut trans, true).await);
        let frames: Vec<_> = trans.drain_outbox().collect();
        assert_eq!(frames.len(), 1);

        let mut cursor = Cursor::new(frames[0].as_ref());
        let parsed = codec::parse(&mut cursor, ProtocolVersion::Legacy).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::Stdout);
        assert_eq!(parsed.payload.as_ref(), b"output");
    }

    #[tokio::test]
    async fn flow_gate_holds_sources_back() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        let data: &[u8] = b"held";
        trans.attach_source(PacketType::Stdout, Box::new(data));

        assert!(!pump_once(&mut trans, false).await);
        assert!(trans.outbox_is_empty());

        assert!(pump_once(&mut trans, true).await);
        assert!(!trans.outbox_is_empty());
    }

    #[tokio::test]
    async fn source_eof_action_emits_eof_and_status() {
        let mut trans = Transaction::new(TransactionKind::Extract, server_ps());
        let data: &[u8] = b"";
        trans
            .attach_source(PacketType::Data, Box::new(data))
            .set_read_eof_action(ReadEofAction::SendEofAndStatus);

        pump_once(&mut trans, true).await;
        let types: Vec<PacketType> = trans
            .drain_outbox()
            .map(|b| {
                let mut cursor = Cursor::new(b.as_ref());
                codec::parse(&mut cursor, ProtocolVersion::Legacy)
                    .unwrap()
                    .packet_type()
            })
            .collect();
        assert_eq!(
            types,
            vec![PacketType::Eof, PacketType::Major, PacketType::Minor]
        );
        assert!(trans.is_done());
    }

    #[tokio::test]
    async fn sink_receives_dispatched_data() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.attach_sink(PacketType::Stdin, Box::new(a));

        let dispatch = trans.recv_packet(frame(PacketType::Stdin, b"typed"));
        assert!(matches!(dispatch, Dispatch::Handled));

        pump_once(&mut trans, true).await;

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"typed");
    }

    #[tokio::test]
    async fn closed_sink_reader_does_not_fail_the_transaction() {
        // Stdin queued for a command that exited without consuming it; the
        // write hits a broken pipe, which closes the channel and nothing else.
        let (a, b) = tokio::io::duplex(64);
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.attach_sink(PacketType::Stdin, Box::new(a));
        drop(b);

        trans.recv_packet(frame(PacketType::Stdin, b"unconsumed"));
        pump_once(&mut trans, true).await;

        assert!(!trans.is_done());
        assert!(trans.outbox_is_empty());
        // The dead sink was purged.
        assert_eq!(trans.num_channels(), 0);
    }

    #[tokio::test]
    async fn finished_transaction_leaves_sinks_alone() {
        let (a, b) = tokio::io::duplex(64);
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.attach_sink(PacketType::Stdin, Box::new(a));
        trans.recv_packet(frame(PacketType::Stdin, b"late"));

        trans.send_status(Status::default());
        drop(b);
        pump_once(&mut trans, true).await;

        // Only the status pair went out; the stale sink data was not touched.
        assert_eq!(trans.drain_outbox().count(), 2);
    }

    #[tokio::test]
    async fn eof_packet_triggers_write_eof_action() {
        let (a, _b) = tokio::io::duplex(64);
        let mut trans = Transaction::new(TransactionKind::Inject, server_ps());
        trans.send_major(0);
        trans
            .attach_sink(PacketType::Data, Box::new(a))
            .set_write_eof_action(WriteEofAction::ReplyMinor);

        let dispatch = trans.recv_packet(frame(PacketType::Eof, b""));
        assert!(matches!(dispatch, Dispatch::Handled));

        pump_once(&mut trans, true).await;
        assert!(trans.is_done());

        let frames: Vec<_> = trans.drain_outbox().collect();
        // major from setup, then the minor fired by the EOF action
        let last = frames.last().unwrap();
        let mut cursor = Cursor::new(last.as_ref());
        let parsed = codec::parse(&mut cursor, ProtocolVersion::Legacy).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::Minor);
        assert_eq!(codec::parse_uint(&parsed.payload).unwrap(), 0);
    }

    #[test]
    fn unknown_packet_goes_to_kind_handler() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        let dispatch = trans.recv_packet(frame(PacketType::Size, b"42\0"));
        assert!(matches!(dispatch, Dispatch::KindPacket(_)));
    }

    #[test]
    fn frames_after_done_are_dropped() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.send_status(Status { major: 0, minor: 0 });
        let dispatch = trans.recv_packet(frame(PacketType::Stdin, b"late"));
        assert!(matches!(dispatch, Dispatch::Handled));
    }

    #[test]
    fn status_ordering_major_then_minor() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.send_status(Status { major: 0, minor: 1 });
        assert!(trans.is_done());

        let types: Vec<PacketType> = trans
            .drain_outbox()
            .map(|b| {
                let mut cursor = Cursor::new(b.as_ref());
                codec::parse(&mut cursor, ProtocolVersion::Legacy)
                    .unwrap()
                    .packet_type()
            })
            .collect();
        assert_eq!(types, vec![PacketType::Major, PacketType::Minor]);
    }

    #[test]
    #[should_panic(expected = "major status sent twice")]
    fn double_major_is_a_bug() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.send_major(0);
        trans.send_major(0);
    }

    #[test]
    fn fail_fills_in_missing_statuses() {
        let mut trans = Transaction::new(TransactionKind::Inject, server_ps());
        trans.send_major(0);
        trans.fail(libc::EIO as i64);
        assert!(trans.is_done());

        let frames: Vec<_> = trans.drain_outbox().collect();
        let mut cursor = Cursor::new(frames[1].as_ref());
        let parsed = codec::parse(&mut cursor, ProtocolVersion::Legacy).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::Minor);
        assert_eq!(
            codec::parse_uint(&parsed.payload).unwrap(),
            libc::EIO as i64
        );
    }

    #[test]
    #[should_panic(expected = "after both statuses")]
    fn fail_after_both_statuses_is_a_bug() {
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.send_status(Status::default());
        trans.fail(1);
    }

    #[test]
    fn close_by_id_and_close_all() {
        let data: &[u8] = b"";
        let mut trans = Transaction::new(TransactionKind::Command, server_ps());
        trans.attach_source(PacketType::Stdout, Box::new(data));
        trans.attach_source(PacketType::Stderr, Box::new(data));
        assert_eq!(trans.num_channels(), 2);

        trans.close_source(Some(PacketType::Stdout));
        assert_eq!(trans.num_channels(), 1);

        trans.close_source(None);
        assert_eq!(trans.num_channels(), 0);
    }
}
