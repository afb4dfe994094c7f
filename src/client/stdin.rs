// ABOUTME: Non-blocking stdin plumbing for the command driver
// ABOUTME: A guard flips O_NONBLOCK on the process's stdin and restores it on every exit path

use crate::channel::BoxedSource;
use std::io;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// RAII guard over the process-wide stdin flags.
///
/// Stdin is shared state: whatever happens during the command, the original
/// flags must come back, so the restore lives in `Drop`.
pub(crate) struct StdinGuard {
    fd: i32,
    original_flags: i32,
}

impl StdinGuard {
    fn new() -> io::Result<Self> {
        let fd = io::stdin().as_raw_fd();
        let original_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if original_flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, original_flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, original_flags })
    }
}

impl Drop for StdinGuard {
    fn drop(&mut self) {
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, self.original_flags) } < 0 {
            debug!(error = %io::Error::last_os_error(), "failed to restore stdin flags");
        }
    }
}

struct AsyncStdin {
    inner: AsyncFd<io::Stdin>,
}

impl AsyncRead for AsyncStdin {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        unfilled.as_mut_ptr().cast(),
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Wire up stdin as a forwarding source.
///
/// The readiness-based path needs a pollable fd (tty, pipe); when stdin is a
/// regular file the registration fails and the runtime's thread-pool reader
/// takes over, with the original flags left untouched.
pub(crate) fn stdin_source() -> (Option<StdinGuard>, BoxedSource) {
    if let Ok(guard) = StdinGuard::new() {
        match AsyncFd::new(io::stdin()) {
            Ok(fd) => {
                return (Some(guard), Box::new(AsyncStdin { inner: fd }));
            }
            Err(e) => {
                debug!(error = %e, "stdin not pollable, using the blocking reader");
                drop(guard);
            }
        }
    }
    (None, Box::new(tokio::io::stdin()))
}
