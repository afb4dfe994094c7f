// ABOUTME: The server: configuration, accept loop and connection lifecycle
// ABOUTME: Unix listeners serve connections concurrently; character devices are reopened serially

pub mod connection;
pub mod exec;

use crate::codec::ProtocolVersion;
use crate::link::{DEFAULT_LINK_TIMEOUT, Link};
use crate::transport::{Endpoint, Listener};
use connection::ServerConnection;
use exec::ExecRegistry;
use std::io;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{info, warn};

/// Server tuning knobs.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub version: ProtocolVersion,
    /// Connections idle longer than this are dropped.
    pub link_timeout: Duration,
    /// Commands running longer than this are killed and answered with a
    /// timeout packet. `None` lets them run forever.
    pub command_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            version: ProtocolVersion::default(),
            link_timeout: DEFAULT_LINK_TIMEOUT,
            command_timeout: None,
        }
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }
}

/// The test server. Accepts links on one endpoint and serves transactions
/// until a peer sends a quit request.
pub struct Server {
    config: ServerConfig,
    registry: ExecRegistry,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ExecRegistry::default(),
        }
    }

    pub async fn run(&self) -> io::Result<()> {
        let mut listener = self.config.endpoint.listen()?;
        info!(endpoint = %self.config.endpoint, "server listening");

        let is_device = matches!(listener, Listener::Device(_));
        let (quit_tx, mut quit_rx) = tokio::sync::watch::channel(false);
        let mut tasks = JoinSet::new();

        loop {
            if is_device {
                // A character device is a single permanent peer: serve it to
                // completion, then reopen.
                let pipe = listener.accept().await?;
                let conn = self.connection(Link::new(pipe, self.config.version));
                match conn.run().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "connection failed"),
                }
            } else {
                tokio::select! {
                    result = quit_rx.changed() => {
                        let _ = result;
                        break;
                    }
                    accepted = listener.accept() => {
                        let pipe = accepted?;
                        let conn = self.connection(Link::new(pipe, self.config.version));
                        let quit_tx = quit_tx.clone();
                        tasks.spawn(async move {
                            match conn.run().await {
                                Ok(true) => {
                                    let _ = quit_tx.send(true);
                                }
                                Ok(false) => {}
                                Err(e) => warn!(error = %e, "connection failed"),
                            }
                        });
                    }
                }
            }
        }

        // Quit drains: let live connections finish before shutting down.
        while tasks.join_next().await.is_some() {}
        info!("server stopped");
        Ok(())
    }

    fn connection<T>(&self, link: Link<T>) -> ServerConnection<T>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        ServerConnection::new(
            link,
            self.registry.clone(),
            self.config.link_timeout,
            self.config.command_timeout,
        )
    }
}
