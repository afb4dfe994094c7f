// ABOUTME: The remex server daemon: binds a listening endpoint and runs the event loop
// ABOUTME: Serves command, inject and extract transactions until a peer sends quit

use argh::FromArgs;
use remex::{ProtocolVersion, Server, ServerConfig, transport::Endpoint};
use std::error::Error;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Test server: executes commands and transfers files on behalf of a remote
/// controller.
#[derive(FromArgs)]
struct CliArgs {
    /// endpoint to listen on, e.g. unix:/run/remex.sock,
    /// virtio:/dev/virtio-ports/org.remex.0 or serial:/dev/ttyS1
    #[argh(positional)]
    endpoint: Endpoint,

    /// use the multiplexed header that carries transaction ids
    #[argh(switch)]
    multiplexed: bool,

    /// seconds without link activity before a connection is dropped
    #[argh(option, default = "60")]
    link_timeout: u64,

    /// kill commands that run longer than this many seconds
    #[argh(option)]
    command_timeout: Option<u64>,

    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = ServerConfig::new(cli_args.endpoint)
        .with_link_timeout(Duration::from_secs(cli_args.link_timeout));
    if cli_args.multiplexed {
        config = config.with_version(ProtocolVersion::Multiplexed);
    }
    if let Some(seconds) = cli_args.command_timeout {
        config = config.with_command_timeout(Duration::from_secs(seconds));
    }

    let server = Server::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }
    Ok(())
}
