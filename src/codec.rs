// ABOUTME: Wire codec for the remex framed protocol - header encode/decode and payload formats
// ABOUTME: Supports the legacy 4-byte header and the multiplexed 6-byte header with transaction id

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Maximum frame length on the wire, header included.
///
/// This is the MTU of the legacy codec. The 16-bit length field makes 65535
/// the hard ceiling; anything larger than [`MAX_FRAME_SIZE`] is rejected
/// before any payload bytes are read.
pub const MAX_FRAME_SIZE: usize = 32768;

/// Packet types used on the wire.
///
/// Every logical stream inside a transaction is tagged with one of these; the
/// tag doubles as the channel id (see [`crate::channel`]).
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Command request header (`<user> <command>`), client to server
    Command = b'c',
    /// Inject request (`<user> <size> <path>`), client to server
    Inject = b'i',
    /// Extract request (`<user> <path>`), client to server
    Extract = b'e',
    /// Quit the server, client to server
    Quit = b'q',
    /// Interrupt the running command, client to server
    Interrupt = b'I',
    /// Standard input data, client to server
    Stdin = b'0',
    /// Standard output data, server to client
    Stdout = b'1',
    /// Standard error data, server to client
    Stderr = b'2',
    /// File data for inject or extract, both directions
    Data = b'd',
    /// EOF on the paired data stream, both directions
    Eof = b'E',
    /// File size reply (decimal ASCII payload), server to client
    Size = b's',
    /// Major status (decimal ASCII payload), server to client
    Major = b'M',
    /// Minor status (decimal ASCII payload), server to client
    Minor = b'm',
    /// Timeout notification, server to client
    Timeout = b'T',
}

/// Header shape negotiated when the link is opened.
///
/// There is no in-band handshake; both endpoints of a link must be configured
/// with the same version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// 4-byte header, one transaction per link.
    #[default]
    Legacy,
    /// 6-byte header carrying a 16-bit transaction id.
    Multiplexed,
}

impl ProtocolVersion {
    pub const fn header_size(self) -> usize {
        match self {
            ProtocolVersion::Legacy => 4,
            ProtocolVersion::Multiplexed => 6,
        }
    }
}

/// Which end of the link a transaction runs on. Only used for diagnostics;
/// the wire format is symmetric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-transaction protocol state stamped into every outbound header.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolState {
    pub version: ProtocolVersion,
    /// Transaction id; 0 on a legacy link.
    pub xid: u16,
    pub role: Role,
}

impl ProtocolState {
    pub fn new(version: ProtocolVersion, xid: u16, role: Role) -> Self {
        Self { version, xid, role }
    }

    pub const fn header_size(&self) -> usize {
        self.version.header_size()
    }

    /// Largest payload that fits in one frame under this header shape.
    pub const fn max_payload(&self) -> usize {
        MAX_FRAME_SIZE - self.header_size()
    }
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub packet_type: PacketType,
    /// Total frame length, header included.
    pub len: u16,
    /// Transaction id; 0 on a legacy link.
    pub xid: u16,
}

/// A complete frame as read off the link.
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn xid(&self) -> u16 {
        self.header.xid
    }
}

/// Codec errors. `Incomplete` is an expected runtime condition while a frame
/// is still accumulating; everything else terminates the link.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("invalid packet type: {0:#x}")]
    InvalidPacketType(u8),

    #[error("invalid frame length {len}, must be {min}-{max}")]
    InvalidFrameLength { len: usize, min: usize, max: usize },

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("invalid user name")]
    InvalidUserName,

    #[error("empty command")]
    EmptyCommand,
}

/// Check whether `buf` holds a complete frame, without allocating.
///
/// Validates the announced length against the header size and the MTU before
/// any payload is consumed.
pub fn check(buf: &mut Cursor<&[u8]>, version: ProtocolVersion) -> Result<(), CodecError> {
    let header_size = version.header_size();
    if buf.remaining() < header_size {
        return Err(CodecError::Incomplete);
    }

    let announced = {
        let data = buf.chunk();
        ((data[2] as usize) << 8) | data[3] as usize
    };
    if announced < header_size || announced > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrameLength {
            len: announced,
            min: header_size,
            max: MAX_FRAME_SIZE,
        });
    }

    if buf.remaining() < announced {
        return Err(CodecError::Incomplete);
    }
    Ok(())
}

/// Parse one frame from `buf`, advancing the cursor past it.
///
/// Callers run [`check`] first; `parse` still re-validates the length so a
/// hostile header can never trigger an oversized read.
pub fn parse(buf: &mut Cursor<&[u8]>, version: ProtocolVersion) -> Result<Frame, CodecError> {
    check(buf, version)?;

    let type_raw = buf.get_u8();
    let packet_type =
        PacketType::try_from(type_raw).map_err(|_| CodecError::InvalidPacketType(type_raw))?;
    let _pad = buf.get_u8();
    let len = buf.get_u16();

    let xid = match version {
        ProtocolVersion::Legacy => 0,
        ProtocolVersion::Multiplexed => buf.get_u16(),
    };

    let payload_len = len as usize - version.header_size();
    let payload = buf.copy_to_bytes(payload_len);

    Ok(Frame {
        header: FrameHeader { packet_type, len, xid },
        payload,
    })
}

/// Encode a frame with the given payload.
pub fn encode(
    ps: &ProtocolState,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<Bytes, CodecError> {
    if payload.len() > ps.max_payload() {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: ps.max_payload(),
        });
    }

    let mut buf = BytesMut::with_capacity(ps.header_size() + payload.len());
    buf.put_bytes(0, ps.header_size());
    buf.put_slice(payload);
    push_header(&mut buf, ps, packet_type);
    Ok(buf.freeze())
}

/// Fill in the already-reserved header bytes at the front of `buf`.
///
/// Source channels read payload bytes into a buffer with `ps.header_size()`
/// bytes of head room; this stamps the header in place so the payload is
/// never copied.
pub fn push_header(buf: &mut BytesMut, ps: &ProtocolState, packet_type: PacketType) {
    let total = buf.len();
    debug_assert!(total >= ps.header_size());
    debug_assert!(total <= MAX_FRAME_SIZE);

    buf[0] = packet_type.into();
    buf[1] = 0;
    buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    if ps.version == ProtocolVersion::Multiplexed {
        buf[4..6].copy_from_slice(&ps.xid.to_be_bytes());
    }
}

/// Allocate a payload buffer with head room for the header of `ps`.
pub fn payload_buffer(ps: &ProtocolState) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MAX_FRAME_SIZE);
    buf.put_bytes(0, ps.header_size());
    buf
}

/// Build a status or size frame carrying a decimal ASCII integer.
pub fn encode_uint(ps: &ProtocolState, packet_type: PacketType, value: i64) -> Bytes {
    let text = format!("{value}\0");
    encode(ps, packet_type, text.as_bytes()).expect("status payload is always small")
}

/// Build a bare frame with no payload (EOF, timeout).
pub fn encode_empty(ps: &ProtocolState, packet_type: PacketType) -> Bytes {
    encode(ps, packet_type, &[]).expect("empty payload always fits")
}

/// Parse the decimal ASCII integer payload of a status or size frame.
///
/// The sender NUL-terminates the digits; trailing bytes after the NUL are
/// ignored.
pub fn parse_uint(payload: &[u8]) -> Result<i64, CodecError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text = std::str::from_utf8(&payload[..end])
        .map_err(|_| CodecError::MalformedPayload("integer"))?;
    text.trim()
        .parse::<i64>()
        .map_err(|_| CodecError::MalformedPayload("integer"))
}

/// A user name may only contain `[A-Za-z0-9_]` and must be non-empty. This
/// is a constraint on the command line sent over the wire, not a full POSIX
/// account check.
pub fn valid_user_name(user: &str) -> bool {
    !user.is_empty() && user.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// A request frame decoded into its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Command { user: String, command: String },
    Inject { user: String, size: u64, path: String },
    Extract { user: String, path: String },
    Quit,
    Interrupt,
}

impl Request {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Request::Command { .. } => PacketType::Command,
            Request::Inject { .. } => PacketType::Inject,
            Request::Extract { .. } => PacketType::Extract,
            Request::Quit => PacketType::Quit,
            Request::Interrupt => PacketType::Interrupt,
        }
    }

    /// Format the request payload. User names are validated here so a bad
    /// name never reaches the wire.
    pub fn encode_payload(&self) -> Result<Bytes, CodecError> {
        let line = match self {
            Request::Command { user, command } => {
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                if command.is_empty() {
                    return Err(CodecError::EmptyCommand);
                }
                format!("{user} {command}\0")
            }
            Request::Inject { user, size, path } => {
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                format!("{user} {size} {path}\0")
            }
            Request::Extract { user, path } => {
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                format!("{user} {path}\0")
            }
            Request::Quit | Request::Interrupt => String::from("\0"),
        };
        Ok(Bytes::from(line.into_bytes()))
    }

    /// Decode a request frame received by the server. The server re-validates
    /// the user name; a client is not trusted to have done so.
    pub fn parse(frame: &Frame) -> Result<Request, CodecError> {
        let end = frame
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(frame.payload.len());
        let line = std::str::from_utf8(&frame.payload[..end])
            .map_err(|_| CodecError::MalformedPayload("request"))?;

        let request = match frame.packet_type() {
            PacketType::Quit => Request::Quit,
            PacketType::Interrupt => Request::Interrupt,
            PacketType::Command => {
                let (user, command) = line
                    .split_once(' ')
                    .ok_or(CodecError::MalformedPayload("command request"))?;
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                if command.is_empty() {
                    return Err(CodecError::EmptyCommand);
                }
                Request::Command {
                    user: user.to_string(),
                    command: command.to_string(),
                }
            }
            PacketType::Inject => {
                let mut parts = line.splitn(3, ' ');
                let user = parts.next().unwrap_or_default();
                let size = parts
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or(CodecError::MalformedPayload("inject request"))?;
                let path = parts
                    .next()
                    .ok_or(CodecError::MalformedPayload("inject request"))?;
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                Request::Inject {
                    user: user.to_string(),
                    size,
                    path: path.to_string(),
                }
            }
            PacketType::Extract => {
                let (user, path) = line
                    .split_once(' ')
                    .ok_or(CodecError::MalformedPayload("extract request"))?;
                if !valid_user_name(user) {
                    return Err(CodecError::InvalidUserName);
                }
                Request::Extract {
                    user: user.to_string(),
                    path: path.to_string(),
                }
            }
            other => return Err(CodecError::InvalidPacketType(other.into())),
        };
        Ok(request)
    }
}
