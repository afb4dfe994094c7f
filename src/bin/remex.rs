// ABOUTME: Thin test driver over the client library: run, inject, extract, interrupt, quit
// ABOUTME: Exit code mirrors the remote command's status so scripts can chain on it

use argh::FromArgs;
use remex::{Client, ProtocolVersion, RemexError, transport::Endpoint};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Drive a remex test server.
#[derive(FromArgs)]
struct CliArgs {
    /// endpoint of the server, e.g. unix:/run/remex.sock
    #[argh(option, short = 'e')]
    endpoint: Endpoint,

    /// use the multiplexed header that carries transaction ids
    #[argh(switch)]
    multiplexed: bool,

    /// user to run the operation as (default: root)
    #[argh(option, short = 'u', default = "String::from(\"root\")")]
    user: String,

    /// seconds without link activity before giving up
    #[argh(option, default = "60")]
    link_timeout: u64,

    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    #[argh(subcommand)]
    operation: Operation,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Operation {
    Run(RunArgs),
    Inject(InjectArgs),
    Extract(ExtractArgs),
    Interrupt(InterruptArgs),
    Quit(QuitArgs),
}

/// Run a command on the server and print its output.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunArgs {
    /// the command line to execute
    #[argh(positional)]
    command: String,
}

/// Copy a local file to the server.
#[derive(FromArgs)]
#[argh(subcommand, name = "inject")]
struct InjectArgs {
    /// local source path
    #[argh(positional)]
    local: String,
    /// remote destination path
    #[argh(positional)]
    remote: String,
}

/// Copy a file from the server to a local path.
#[derive(FromArgs)]
#[argh(subcommand, name = "extract")]
struct ExtractArgs {
    /// remote source path
    #[argh(positional)]
    remote: String,
    /// local destination path
    #[argh(positional)]
    local: String,
}

/// Interrupt the command the server is currently running.
#[derive(FromArgs)]
#[argh(subcommand, name = "interrupt")]
struct InterruptArgs {}

/// Tell the server to drain and exit.
#[derive(FromArgs)]
#[argh(subcommand, name = "quit")]
struct QuitArgs {}

#[tokio::main]
async fn main() {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging {
            Level::DEBUG
        } else {
            Level::WARN
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut client = Client::new(cli_args.endpoint)
        .with_link_timeout(Duration::from_secs(cli_args.link_timeout))
        .with_progress_dots(true);
    if cli_args.multiplexed {
        client = client.with_version(ProtocolVersion::Multiplexed);
    }

    let exit_code = match run(&mut client, &cli_args.user, cli_args.operation).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("remex: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(client: &mut Client, user: &str, operation: Operation) -> Result<i32, RemexError> {
    match operation {
        Operation::Run(args) => {
            let status = client.run_command(user, &args.command).await?;
            if status.major != 0 {
                eprintln!("remex: command failed to start (status {})", status.major);
                return Ok(1);
            }
            Ok(status.minor as i32)
        }
        Operation::Inject(args) => {
            client.inject_file(user, &args.local, &args.remote).await?;
            Ok(0)
        }
        Operation::Extract(args) => {
            client.extract_file(user, &args.remote, &args.local).await?;
            Ok(0)
        }
        Operation::Interrupt(_) => {
            client.interrupt().await?;
            Ok(0)
        }
        Operation::Quit(_) => {
            client.quit_server().await?;
            Ok(0)
        }
    }
}
