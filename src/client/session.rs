//! One client call: serve callbacks, issue `Process`, clean up
//!
//! ```text
//! mkdir <root>/<id>/<pid> (0700)
//!   ├─ serve stdout.sock  (Stdout.WriteLine → reorder sink)
//!   ├─ serve stderr.sock  (Stderr.WriteLine → reorder sink)
//!   └─ serve stdin.sock   (Stdin.ReadChunk ← literal | file | none)
//! dial <root>/<name>.sock → ServerService.Process ... reply
//!   (first SIGINT/SIGTERM → ServerService.Cancel over a second connection)
//! remove the three sockets and the directory
//! ```

use super::services::{OutputService, ServedSocket, StdinService, StdinSource};
use super::sink::ReorderSink;
use crate::error::{ClientError, RpcError};
use crate::identity::{main_socket_path, sanitize_machine_id, CallbackSockets};
use crate::protocol::{CancelArgs, CancelReply, ProcessArgs, ProcessReply, METHOD_CANCEL, METHOD_PROCESS, PING_CMDLINE};
use crate::resolver::clean_path;
use crate::rpc::RpcClient;
use crate::signal::SignalHandler;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to run one call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub root: PathBuf,
    pub name: String,
    pub machine_id: String,
    /// Caller pid used in the call identity; defaults to this process
    pub pid: Option<i32>,
    /// Per-request working directory (empty = server's cwd)
    pub start_dir: String,
    /// Command followed by its arguments; empty means ping
    pub command: Vec<String>,
    /// Resolved `KEY=VALUE` overlay
    pub env: Vec<String>,
    pub stdin: StdinSource,
    /// Send `Cancel` on the first SIGINT/SIGTERM
    pub watch_interrupts: bool,
}

impl CallOptions {
    pub fn effective_pid(&self) -> i32 {
        self.pid.unwrap_or_else(|| std::process::id() as i32)
    }

    fn absolute_root(&self) -> Result<PathBuf, ClientError> {
        if self.root.is_absolute() {
            return Ok(clean_path(&self.root));
        }
        let cwd = std::env::current_dir().map_err(|e| ClientError::setup("invalid root", e))?;
        Ok(clean_path(&cwd.join(&self.root)))
    }

    fn process_args(&self, machine_id: &str, pid: i32) -> ProcessArgs {
        let (command, args) = match self.command.split_first() {
            Some((command, args)) => (command.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        ProcessArgs {
            machine_id: machine_id.to_string(),
            pid,
            start_dir: self.start_dir.clone(),
            command,
            args,
            env: self.env.clone(),
        }
    }
}

/// The server's reply plus client-side timing
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub reply: ProcessReply,
    pub client_start: DateTime<Utc>,
    pub client_end: DateTime<Utc>,
    pub rtt_ms: i64,
    /// Round trip minus server-side exec time, never negative
    pub overhead_ms: i64,
    /// Command as shown in the summary
    pub command_shown: String,
}

impl CallOutcome {
    fn new(reply: ProcessReply, client_start: DateTime<Utc>, client_end: DateTime<Utc>, command: &[String]) -> Self {
        let rtt_ms = (client_end - client_start).num_milliseconds();
        let overhead_ms = (rtt_ms - reply.elapsed_millis).max(0);
        let command_shown = if !reply.resolved_cmd_line.is_empty() {
            reply.resolved_cmd_line.clone()
        } else if command.first().map_or(true, |c| c.trim().is_empty()) {
            PING_CMDLINE.to_string()
        } else {
            command.join(" ")
        };
        Self {
            reply,
            client_start,
            client_end,
            rtt_ms,
            overhead_ms,
            command_shown,
        }
    }

    pub fn return_code(&self) -> i32 {
        self.reply.return_code
    }

    /// One-line `key=value` timing summary
    pub fn summary(&self) -> String {
        let ts = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Nanos, true);
        format!(
            "command={:?} client_start={} client_end={} rtt_ms={} server_start={} server_end={} exec_ms={} overhead_ms={} rc={} stopped={} stopped_by={:?}",
            self.command_shown,
            ts(&self.client_start),
            ts(&self.client_end),
            self.rtt_ms,
            ts(&self.reply.exec_start),
            ts(&self.reply.exec_end),
            self.reply.elapsed_millis,
            self.overhead_ms,
            self.reply.return_code,
            self.reply.stopped,
            self.reply.stopped_by.as_str(),
        )
    }
}

/// Removes the callback sockets and their directory when dropped
struct CallbackCleanup<'a> {
    sockets: &'a CallbackSockets,
}

impl Drop for CallbackCleanup<'_> {
    fn drop(&mut self) {
        for path in self.sockets.all() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(socket = %path.display(), error = %e, "failed to remove callback socket");
                }
            }
        }
        if let Err(e) = fs::remove_dir(&self.sockets.dir) {
            debug!(dir = %self.sockets.dir.display(), error = %e, "callback dir not removed");
        }
    }
}

/// Run one call, writing the child's output lines to `stdout` / `stderr`
pub fn run_call<O, E>(options: &CallOptions, stdout: O, stderr: E) -> Result<CallOutcome, ClientError>
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let root = options.absolute_root()?;
    let pid = options.effective_pid();
    let machine_id = sanitize_machine_id(&options.machine_id)?;
    let sockets = CallbackSockets::derive(&root, &machine_id, pid);

    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&sockets.dir)
        .map_err(|e| ClientError::setup(format!("mkdir {}", sockets.dir.display()), e))?;

    for path in sockets.all() {
        match fs::symlink_metadata(path) {
            Ok(_) => return Err(ClientError::StaleSocket(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClientError::setup(format!("stat socket {}", path.display()), e)),
        }
    }

    let stdin_reader = options
        .stdin
        .open()
        .map_err(|e| ClientError::setup("open stdinfile", e))?;

    let _cleanup = CallbackCleanup { sockets: &sockets };

    let _stdout = ServedSocket::serve(
        &sockets.stdout,
        "Stdout",
        Arc::new(OutputService::new("Stdout", Arc::new(ReorderSink::new(stdout)))),
    )?;
    let _stderr = ServedSocket::serve(
        &sockets.stderr,
        "Stderr",
        Arc::new(OutputService::new("Stderr", Arc::new(ReorderSink::new(stderr)))),
    )?;
    let _stdin = ServedSocket::serve(&sockets.stdin, "Stdin", Arc::new(StdinService::new(stdin_reader)))?;

    let main_socket = main_socket_path(&root, &options.name);
    let client = RpcClient::dial(&main_socket)?;

    let _interrupts = if options.watch_interrupts {
        Some(watch_interrupts(main_socket.clone(), machine_id.clone(), pid)?)
    } else {
        None
    };

    let args = options.process_args(&machine_id, pid);
    let client_start = Utc::now();
    let reply: ProcessReply = client.call(METHOD_PROCESS, &args)?;
    let client_end = Utc::now();

    Ok(CallOutcome::new(reply, client_start, client_end, &options.command))
}

/// Issue `Cancel` for a call identity over a fresh connection
pub fn send_cancel(root: &Path, name: &str, machine_id: &str, pid: i32) -> Result<CancelReply, RpcError> {
    let client = RpcClient::dial(&main_socket_path(root, name))?;
    client.call(
        METHOD_CANCEL,
        &CancelArgs {
            machine_id: machine_id.to_string(),
            pid,
        },
    )
}

fn watch_interrupts(main_socket: PathBuf, machine_id: String, pid: i32) -> Result<SignalHandler, ClientError> {
    let mut handler = SignalHandler::new();
    handler
        .setup_with(move |sig| {
            info!(signal = sig, "interrupt received; canceling remote command");
            let cancel = RpcClient::dial(&main_socket).and_then(|client| {
                client.call::<_, CancelReply>(
                    METHOD_CANCEL,
                    &CancelArgs {
                        machine_id,
                        pid,
                    },
                )
            });
            match cancel {
                Ok(reply) => debug!(ok = reply.ok, "cancel sent"),
                Err(e) => warn!(error = %e, "cancel failed"),
            }
        })
        .map_err(|e| ClientError::setup("install interrupt handler", io::Error::new(io::ErrorKind::Other, e)))?;
    Ok(handler)
}
