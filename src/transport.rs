// ABOUTME: Transport plug-ins: unix-domain sockets and virtio/serial character devices
// ABOUTME: Every plug-in yields the same full-duplex non-blocking pipe the link layer drives

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll, ready};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Where the peer lives. Parsed from `unix:<path>`, `virtio:<path>` or
/// `serial:<path>`; a bare path means a unix-domain socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix-domain socket, the usual choice for host-side testing.
    Unix(PathBuf),
    /// Virtio-serial character device inside a guest.
    Virtio(PathBuf),
    /// Plain serial line; the device is put into raw mode on open.
    Serial(PathBuf),
}

impl Endpoint {
    /// Plug-in tag, for diagnostics only.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Unix(_) => "unix",
            Endpoint::Virtio(_) => "virtio",
            Endpoint::Serial(_) => "serial",
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Unix(p) | Endpoint::Virtio(p) | Endpoint::Serial(p) => p,
        }
    }

    /// Open the endpoint as the connecting side.
    pub async fn connect(&self) -> io::Result<Pipe> {
        debug!(kind = self.kind(), path = %self.path().display(), "opening link");
        match self {
            Endpoint::Unix(path) => Ok(Pipe::Unix(UnixStream::connect(path).await?)),
            Endpoint::Virtio(path) => Ok(Pipe::Device(CharDevice::open(path, false)?)),
            Endpoint::Serial(path) => Ok(Pipe::Device(CharDevice::open(path, true)?)),
        }
    }

    /// Bind the endpoint as the serving side.
    ///
    /// Unix sockets get a real listener (any stale socket file is removed
    /// first). Character devices have no accept step; each "accept" opens
    /// the device anew.
    pub fn listen(&self) -> io::Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Virtio(_) | Endpoint::Serial(_) => Ok(Listener::Device(self.clone())),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let endpoint = if let Some(path) = spec.strip_prefix("unix:") {
            Endpoint::Unix(PathBuf::from(path))
        } else if let Some(path) = spec.strip_prefix("virtio:") {
            Endpoint::Virtio(PathBuf::from(path))
        } else if let Some(path) = spec.strip_prefix("serial:") {
            Endpoint::Serial(PathBuf::from(path))
        } else {
            Endpoint::Unix(PathBuf::from(spec))
        };
        if endpoint.path().as_os_str().is_empty() {
            return Err(format!("endpoint '{spec}' has an empty path"));
        }
        Ok(endpoint)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.path().display())
    }
}

/// Server-side acceptor.
pub enum Listener {
    Unix(UnixListener),
    Device(Endpoint),
}

impl Listener {
    pub async fn accept(&mut self) -> io::Result<Pipe> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Pipe::Unix(stream))
            }
            Listener::Device(endpoint) => endpoint.connect().await,
        }
    }
}

/// A concrete full-duplex byte pipe, whatever plug-in produced it.
#[derive(Debug)]
pub enum Pipe {
    Unix(UnixStream),
    Device(CharDevice),
}

impl AsyncRead for Pipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Pipe::Device(d) => Pin::new(d).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Pipe::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Pipe::Device(d) => Pin::new(d).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Unix(s) => Pin::new(s).poll_flush(cx),
            Pipe::Device(d) => Pin::new(d).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Pipe::Device(d) => Pin::new(d).poll_shutdown(cx),
        }
    }
}

/// A character device (virtio-serial port or serial line) opened in
/// non-blocking mode and driven through the runtime's readiness interface.
#[derive(Debug)]
pub struct CharDevice {
    fd: AsyncFd<std::fs::File>,
}

impl CharDevice {
    pub fn open(path: &Path, raw: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        if raw {
            set_raw_mode(file.as_raw_fd())?;
        }
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for CharDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_read_ready(cx))?;
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

impl AsyncWrite for CharDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the device; there is nothing buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Character devices have no half-close; the link layer tracks
        // write-EOF on its own.
        Poll::Ready(Ok(()))
    }
}

/// Put a serial line into raw mode so the framing survives the tty layer.
fn set_raw_mode(fd: i32) -> io::Result<()> {
    unsafe {
        let mut termios = std::mem::zeroed::<libc::termios>();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut termios);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_spec_parsing() {
        assert_eq!(
            "unix:/run/remex.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/remex.sock"))
        );
        assert_eq!(
            "virtio:/dev/virtio-ports/org.remex.0"
                .parse::<Endpoint>()
                .unwrap(),
            Endpoint::Virtio(PathBuf::from("/dev/virtio-ports/org.remex.0"))
        );
        assert_eq!(
            "serial:/dev/ttyS1".parse::<Endpoint>().unwrap(),
            Endpoint::Serial(PathBuf::from("/dev/ttyS1"))
        );
        // A bare path is a unix socket.
        assert_eq!(
            "/tmp/sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/sock"))
        );
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn unix_listen_connect_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("pipe.sock"));
        let mut listener = endpoint.listen().unwrap();

        let client = endpoint.connect();
        let (server_pipe, client_pipe) = tokio::join!(listener.accept(), client);
        let mut server_pipe = server_pipe.unwrap();
        let mut client_pipe = client_pipe.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_pipe.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let endpoint = Endpoint::Unix(path);
        assert!(endpoint.listen().is_ok());
    }
}
