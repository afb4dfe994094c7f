// ABOUTME: Local process execution for the server: spawn, signal escalation, exit mapping
// ABOUTME: Keeps a registry of running commands so interrupts can cross connections

use crate::transaction::Status;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reported by the child watcher when a spawned command exits.
#[derive(Clone, Copy, Debug)]
pub struct ExitEvent {
    pub xid: u16,
    pub status: Status,
}

struct RunningEntry {
    xid: u16,
    pgid: i32,
    /// A first interrupt sends SIGTERM; any further one escalates.
    term_sent: bool,
}

/// Commands currently running on this server, shared across connections.
///
/// A legacy link cannot carry an interrupt next to a running command (one
/// transaction per link), so interrupts may arrive on a fresh connection and
/// have to find the command here.
#[derive(Clone, Default)]
pub struct ExecRegistry {
    running: Arc<Mutex<Vec<RunningEntry>>>,
}

impl ExecRegistry {
    fn register(&self, xid: u16, pgid: i32) {
        self.running
            .lock()
            .expect("exec registry poisoned")
            .push(RunningEntry {
                xid,
                pgid,
                term_sent: false,
            });
    }

    fn unregister(&self, xid: u16, pgid: i32) {
        self.running
            .lock()
            .expect("exec registry poisoned")
            .retain(|e| e.xid != xid || e.pgid != pgid);
    }

    /// Interrupt a running command: SIGTERM to its process group first,
    /// SIGKILL on repetition. With no id (legacy links), the most recently
    /// started command is the target. Returns false when nothing is running.
    pub fn interrupt(&self, xid: Option<u16>) -> bool {
        let mut running = self.running.lock().expect("exec registry poisoned");
        let entry = match xid {
            Some(xid) => running.iter_mut().find(|e| e.xid == xid),
            None => running.last_mut(),
        };
        match entry {
            Some(entry) => {
                if entry.term_sent {
                    signal_group(entry.pgid, libc::SIGKILL);
                } else {
                    signal_group(entry.pgid, libc::SIGTERM);
                    entry.term_sent = true;
                }
                true
            }
            None => false,
        }
    }

    /// Hard-kill a command whose server-side timeout expired.
    pub fn kill(&self, xid: u16) {
        let running = self.running.lock().expect("exec registry poisoned");
        if let Some(entry) = running.iter().find(|e| e.xid == xid) {
            signal_group(entry.pgid, libc::SIGKILL);
        }
    }
}

fn signal_group(pgid: i32, signal: i32) {
    debug!(pgid, signal, "signalling process group");
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        warn!(
            pgid,
            signal,
            error = %io::Error::last_os_error(),
            "failed to signal process group"
        );
    }
}

/// Stdio handles of a freshly spawned command; the child itself lives in a
/// watcher task that reports through the exit channel.
pub struct SpawnedCommand {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn `command_line` through the shell in its own process group.
///
/// The user name was validated at the protocol layer; switching credentials
/// is the deployment's business (the server usually runs as root inside a
/// disposable guest).
pub fn spawn(
    user: &str,
    command_line: &str,
    xid: u16,
    registry: &ExecRegistry,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
) -> io::Result<SpawnedCommand> {
    debug!(user, command = command_line, xid, "spawning command");

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    // With process_group(0) the child's pid is its pgid.
    let pgid = child.id().map(|id| id as i32).unwrap_or(0);
    registry.register(xid, pgid);

    let registry = registry.clone();
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(exit) => map_exit_status(exit),
            Err(e) => {
                warn!(error = %e, "waiting for child failed");
                Status {
                    major: crate::transaction::errno_of(&e),
                    minor: 0,
                }
            }
        };
        registry.unregister(xid, pgid);
        let _ = exit_tx.send(ExitEvent { xid, status });
    });

    Ok(SpawnedCommand {
        stdin,
        stdout,
        stderr,
    })
}

/// Major 0 means the command ran; minor carries the exit code, or the signal
/// number for a signal death.
fn map_exit_status(exit: std::process::ExitStatus) -> Status {
    let minor = match exit.code() {
        Some(code) => code as i64,
        None => exit.signal().unwrap_or(0) as i64,
    };
    Status { major: 0, minor }
}
