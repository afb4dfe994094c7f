//! Remote test execution over a byte pipe.
//!
//! A controller on the host drives commands inside an isolated environment
//! (a virtual machine reached through a virtio-serial port, a plain serial
//! line, or a unix-domain socket) and shuttles standard streams, file
//! contents and exit codes across that single pipe.
//!
//! The crate is the transport protocol and transaction engine of that setup:
//! a framed byte protocol multiplexing several half-duplex streams over one
//! full-duplex link, and the event-driven state machine that orchestrates
//! command execution, file injection, file extraction, flow control and
//! shutdown on both ends.
//!
//! # Running a command
//!
//! ```rust,no_run
//! use remex::{Client, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint: Endpoint = "unix:/run/remex.sock".parse()?;
//!     let mut client = Client::new(endpoint);
//!
//!     let output = client.run_command_captured("tester", "uname -r", 65536).await?;
//!     println!("kernel: {}", String::from_utf8_lossy(&output.stdout));
//!     assert_eq!(output.status.minor, 0);
//!     Ok(())
//! }
//! ```
//!
//! # Serving
//!
//! ```rust,no_run
//! use remex::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = "virtio:/dev/virtio-ports/org.remex.0".parse()?;
//!     let server = Server::new(ServerConfig::new(endpoint));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod link;
pub mod server;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod tests;

pub use client::{Client, CommandOutput, OutputMode, RemexError, RemexResult};
pub use codec::{Frame, PacketType, ProtocolState, ProtocolVersion};
pub use link::{Link, LinkError};
pub use server::{Server, ServerConfig};
pub use transaction::{Status, Transaction, TransactionKind};
pub use transport::{Endpoint, Pipe};
