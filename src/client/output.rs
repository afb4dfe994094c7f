// ABOUTME: Output sinks for command results: screen, discard, and capped capture buffers
// ABOUTME: Overrunning a capture buffer is a receive-results failure, not a silent truncation

use crate::transaction::Status;
use std::io::{self, Write};

/// Where a command's stdout and stderr go on the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Write through to the client process's own stdout and stderr.
    Screen,
    /// Discard everything.
    Discard,
    /// Capture both streams concatenated into one buffer of at most `limit`
    /// bytes.
    Together { limit: usize },
    /// Capture the streams separately, each capped at `limit` bytes.
    Split { limit: usize },
}

/// A completed command: its status pair plus whatever was captured.
///
/// `Together` mode returns the combined stream in `stdout` and leaves
/// `stderr` empty; `Screen` and `Discard` leave both empty.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Status,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum SinkError {
    Overflow,
    Io(io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Overflow => write!(f, "output buffer overflow"),
            SinkError::Io(e) => write!(f, "screen write failed: {e}"),
        }
    }
}

pub(crate) enum OutputSink {
    Screen,
    Discard,
    Together { buf: Vec<u8>, limit: usize },
    Split { out: Vec<u8>, err: Vec<u8>, limit: usize },
}

impl OutputSink {
    pub fn new(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Screen => OutputSink::Screen,
            OutputMode::Discard => OutputSink::Discard,
            OutputMode::Together { limit } => OutputSink::Together {
                buf: Vec::new(),
                limit,
            },
            OutputMode::Split { limit } => OutputSink::Split {
                out: Vec::new(),
                err: Vec::new(),
                limit,
            },
        }
    }

    pub fn write_stdout(&mut self, data: &[u8]) -> Result<(), SinkError> {
        match self {
            OutputSink::Screen => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(data).map_err(SinkError::Io)?;
                stdout.flush().map_err(SinkError::Io)
            }
            OutputSink::Discard => Ok(()),
            OutputSink::Together { buf, limit } => append_capped(buf, data, *limit),
            OutputSink::Split { out, limit, .. } => append_capped(out, data, *limit),
        }
    }

    pub fn write_stderr(&mut self, data: &[u8]) -> Result<(), SinkError> {
        match self {
            OutputSink::Screen => {
                let mut stderr = io::stderr().lock();
                stderr.write_all(data).map_err(SinkError::Io)?;
                stderr.flush().map_err(SinkError::Io)
            }
            OutputSink::Discard => Ok(()),
            OutputSink::Together { buf, limit } => append_capped(buf, data, *limit),
            OutputSink::Split { err, limit, .. } => append_capped(err, data, *limit),
        }
    }

    pub fn into_buffers(self) -> (Vec<u8>, Vec<u8>) {
        match self {
            OutputSink::Screen | OutputSink::Discard => (Vec::new(), Vec::new()),
            OutputSink::Together { buf, .. } => (buf, Vec::new()),
            OutputSink::Split { out, err, .. } => (out, err),
        }
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], limit: usize) -> Result<(), SinkError> {
    if buf.len() + data.len() > limit {
        return Err(SinkError::Overflow);
    }
    buf.extend_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn together_concatenates_both_streams() {
        let mut sink = OutputSink::new(OutputMode::Together { limit: 64 });
        sink.write_stdout(b"out ").unwrap();
        sink.write_stderr(b"err").unwrap();
        let (combined, empty) = sink.into_buffers();
        assert_eq!(combined, b"out err");
        assert!(empty.is_empty());
    }

    #[test]
    fn split_keeps_streams_apart() {
        let mut sink = OutputSink::new(OutputMode::Split { limit: 64 });
        sink.write_stdout(b"to stdout").unwrap();
        sink.write_stderr(b"to stderr").unwrap();
        let (out, err) = sink.into_buffers();
        assert_eq!(out, b"to stdout");
        assert_eq!(err, b"to stderr");
    }

    #[test]
    fn overflow_is_an_error_not_a_truncation() {
        let mut sink = OutputSink::new(OutputMode::Together { limit: 4 });
        sink.write_stdout(b"1234").unwrap();
        assert!(matches!(
            sink.write_stdout(b"5"),
            Err(SinkError::Overflow)
        ));
    }

    #[test]
    fn split_buffers_are_capped_independently() {
        let mut sink = OutputSink::new(OutputMode::Split { limit: 4 });
        sink.write_stdout(b"1234").unwrap();
        // stderr still has its own head room
        sink.write_stderr(b"abcd").unwrap();
        assert!(matches!(sink.write_stderr(b"e"), Err(SinkError::Overflow)));
    }

    #[test]
    fn discard_swallows_everything() {
        let mut sink = OutputSink::new(OutputMode::Discard);
        sink.write_stdout(&[0u8; 1024]).unwrap();
        sink.write_stderr(&[0u8; 1024]).unwrap();
        let (out, err) = sink.into_buffers();
        assert!(out.is_empty() && err.is_empty());
    }
}
