// ABOUTME: Client error types mapping every operation failure to its exit-code kind
// ABOUTME: Provides structured error reporting with conversion from codec and link failures

use crate::codec::CodecError;
use crate::link::LinkError;
use std::io;
use thiserror::Error;

/// Everything a client operation can fail with.
///
/// Each variant corresponds to one of the framework's distinct exit-code
/// kinds, so callers can react to the class of failure without string
/// matching.
#[derive(Debug, Error)]
pub enum RemexError {
    /// Bad user name, empty command, or an oversized request line.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Opening the link to the peer failed.
    #[error("failed to open session: {0}")]
    OpenSession(#[source] io::Error),

    /// The request frame could not be delivered.
    #[error("failed to send command: {0}")]
    SendCommand(#[source] LinkError),

    /// Forwarding local standard input to the remote command failed.
    #[error("failed to forward standard input: {0}")]
    ForwardInput(#[source] io::Error),

    /// Receiving command results failed: sink overflow, unexpected packets,
    /// or the link breaking before the status pair arrived.
    #[error("failed to receive results: {0}")]
    ReceiveResults(String),

    /// A local file could not be opened, read, written or stat'ed.
    #[error("local file error: {0}")]
    LocalFile(#[source] io::Error),

    /// The remote side reported a non-zero status for a file operation.
    #[error("remote file error (status {0})")]
    RemoteFile(i64),

    /// Streaming a file to the remote side failed.
    #[error("failed to send file: {0}")]
    SendFile(String),

    /// Receiving a file from the remote side failed.
    #[error("failed to receive file: {0}")]
    ReceiveFile(String),

    /// The interrupt request could not be delivered.
    #[error("failed to interrupt command: {0}")]
    InterruptCommand(#[source] LinkError),

    /// Protocol violation: bad frame, unexpected type, or a link timeout.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for client operations.
pub type RemexResult<T> = Result<T, RemexError>;

impl From<CodecError> for RemexError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InvalidUserName | CodecError::EmptyCommand => {
                RemexError::Parameter(e.to_string())
            }
            other => RemexError::Protocol(other.to_string()),
        }
    }
}

/// Map a local-file open failure the way the original API did: an
/// over-long path is the caller's mistake, everything else is a file error.
pub(crate) fn local_open_error(e: io::Error) -> RemexError {
    if e.raw_os_error() == Some(libc::ENAMETOOLONG) {
        RemexError::Parameter("file name too long".into())
    } else {
        RemexError::LocalFile(e)
    }
}
