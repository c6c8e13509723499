//! `ServerService`: the `Process` and `Cancel` methods
//!
//! A `Process` call walks through these stages, any of which may end it with a
//! setup-failure reply:
//!
//! ```text
//! validate startdir ─▶ await callback sockets ─▶ dial callbacks ─┬─▶ ping reply
//!                                                                └─▶ resolve ─▶ spawn ─▶ run pumps ─▶ reap ─▶ reply
//! ```
//!
//! While the child runs, three pump threads move its stdout, stderr and stdin
//! through the callback services, and a watcher thread turns a fired
//! cancellation token into SIGTERM, then SIGKILL after a grace period, on the
//! child's process group. The reply is only composed once every pump has
//! finished so the caller has seen all output before `Process` returns.

use super::callbacks::{Callbacks, SOCKET_WAIT_TIMEOUT};
use super::registry::{signal_group, Registry, Session};
use crate::cancel::CancelToken;
use crate::env;
use crate::error::RpcError;
use crate::identity::{sanitize_machine_id, session_key, CallbackSockets};
use crate::protocol::{
    CancelArgs, CancelReply, Line, ProcessArgs, ProcessReply, StoppedBy, STDIN_CHUNK_SIZE,
};
use crate::resolver;
use crate::rpc::{handle, unknown_method, Service};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Return code for setup failures before the command could be resolved
pub const RC_SETUP: i32 = 2;

/// Return code when the resolved command could not be started
pub const RC_SPAWN: i32 = 127;

/// Time between SIGTERM and SIGKILL on cancellation
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Pause after an empty, non-EOF stdin chunk
const STDIN_IDLE: Duration = Duration::from_millis(10);

/// How often an output pump rechecks whether the child has exited
const PIPE_POLL_MS: u16 = 10;

/// Upper bound on forwarding output once the child has exited, for
/// descendants that keep writing to the inherited pipe
pub const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Count of running `Process` calls; shutdown waits for it to drain
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

pub struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    pub fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        InFlightGuard(self)
    }

    /// Block until no `Process` call is running
    pub fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct ServerService {
    root: PathBuf,
    base_env: Vec<String>,
    registry: Arc<Registry>,
    in_flight: InFlight,
    socket_timeout: Duration,
}

impl ServerService {
    /// `root` must be absolute; `base_env` holds resolved `KEY=VALUE` entries
    pub fn new(root: PathBuf, base_env: Vec<String>) -> Self {
        Self {
            root,
            base_env,
            registry: Arc::new(Registry::new()),
            in_flight: InFlight::default(),
            socket_timeout: SOCKET_WAIT_TIMEOUT,
        }
    }

    /// Override how long `Process` waits for each callback socket
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run one command on behalf of a caller
    pub fn process(&self, args: ProcessArgs) -> ProcessReply {
        let _guard = self.in_flight.enter();
        let machine_id = match sanitize_machine_id(&args.machine_id) {
            Ok(id) => id,
            Err(e) => {
                error!(machine_id = ?args.machine_id, error = %e, "machine-id rejected");
                return ProcessReply::failure(RC_SETUP, format!("invalid machine-id {:?}: {}", args.machine_id, e));
            }
        };
        let args = ProcessArgs { machine_id, ..args };
        let key = session_key(&args.machine_id, args.pid);
        info!(key = %key, cmd = %args.command, args = args.args.len(), startdir = %args.start_dir, "Process start");

        let work_dir = match validate_start_dir(&args.start_dir) {
            Ok(dir) => dir,
            Err(msg) => {
                error!(key = %key, startdir = %args.start_dir, "startdir invalid");
                return ProcessReply::failure(RC_SETUP, msg);
            }
        };

        let session = Session::new(key.clone());
        if self.registry.add(Arc::clone(&session)).is_some() {
            warn!(key = %key, "session key reused while a call was in flight");
        }

        let reply = self.run_session(&session, &args, work_dir.as_deref());

        session.token().cancel();
        self.registry.remove(&session);
        reply
    }

    fn run_session(&self, session: &Session, args: &ProcessArgs, work_dir: Option<&Path>) -> ProcessReply {
        let key = session.key();
        let sockets = CallbackSockets::derive(&self.root, &args.machine_id, args.pid);

        let callbacks = match Callbacks::connect(&sockets, self.socket_timeout) {
            Ok(callbacks) => callbacks,
            Err(msg) => {
                error!(key = %key, error = %msg, "callback setup failed");
                return ProcessReply::failure(RC_SETUP, msg);
            }
        };

        if args.command.trim().is_empty() {
            let _ = callbacks.write_stdout(Line::new(0, "server ping to stdout"));
            let _ = callbacks.write_stderr(Line::new(0, "server ping to stderr"));
            info!(key = %key, "ping handled");
            return ProcessReply::ping();
        }

        let merged_env = env::merge_env_map(&env::os_environ(), &self.base_env, &args.env);
        let env_list: Vec<String> = merged_env
            .iter()
            .filter_map(|(k, v)| Some(format!("{}={}", k.to_str()?, v.to_str()?)))
            .collect();

        let cwd = match work_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };
        let resolved = match resolver::resolve_command(&args.command, &cwd, &env_list) {
            Ok(path) => path,
            Err(e) => {
                error!(key = %key, cmd = %args.command, error = %e, "resolve command failed");
                return ProcessReply::failure(e.return_code(), e.to_string());
            }
        };

        let mut command = Command::new(&resolved);
        command
            .args(&args.args)
            .env_clear()
            .envs(&merged_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let exec_start = Utc::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(key = %key, path = %resolved.display(), error = %e, "exec start failed");
                return ProcessReply::failure_at(RC_SPAWN, format!("exec start: {}", e), exec_start);
            }
        };
        let pgid = child.id() as i32;
        session.attach(pgid);
        spawn_kill_watcher(key.to_string(), pgid, session.token().clone());

        let resolved_cmd_line = std::iter::once(resolved.display().to_string())
            .chain(args.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let (status, exec_end) = run_child(&mut child, &callbacks, session.token());
        let return_code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(key = %key, error = %e, "wait for child failed");
                1
            }
        };

        let stopped_by = session.stopped_by();
        let reply = ProcessReply {
            return_code,
            error: String::new(),
            stopped: stopped_by.is_set(),
            stopped_by,
            exec_start,
            exec_end,
            elapsed_millis: (exec_end - exec_start).num_milliseconds(),
            resolved_cmd_line,
        };
        info!(
            key = %key,
            rc = reply.return_code,
            stopped = reply.stopped,
            by = %reply.stopped_by,
            elapsed_ms = reply.elapsed_millis,
            "Process end"
        );
        reply
    }

    /// Stop the caller's running call; `ok` is false when none matches
    pub fn cancel(&self, args: CancelArgs) -> CancelReply {
        let key = session_key(&args.machine_id, args.pid);
        let ok = self.registry.cancel(&key, StoppedBy::Client);
        if ok {
            info!(key = %key, "Cancel acknowledged");
        } else {
            warn!(key = %key, "Cancel: session not found");
        }
        CancelReply { ok }
    }

    /// Stop every session on behalf of the server
    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all(StoppedBy::Server)
    }
}

impl Service for ServerService {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "Process" => handle(method, params, |args: ProcessArgs| self.process(args)),
            "Cancel" => handle(method, params, |args: CancelArgs| self.cancel(args)),
            _ => Err(unknown_method("ServerService", method)),
        }
    }
}

/// `Ok(None)` for an empty startdir (inherit the server's cwd)
fn validate_start_dir(start_dir: &str) -> Result<Option<PathBuf>, String> {
    if start_dir.is_empty() {
        return Ok(None);
    }
    let mut dir = PathBuf::from(start_dir);
    if dir.is_relative() {
        let cwd = std::env::current_dir().map_err(|_| format!("invalid startdir: {:?}", start_dir))?;
        dir = resolver::clean_path(&cwd.join(dir));
    }
    if dir.is_dir() {
        Ok(Some(dir))
    } else {
        Err(format!("invalid startdir: {:?}", start_dir))
    }
}

/// Pump the child's I/O until it exits and every pump has drained
fn run_child(
    child: &mut Child,
    callbacks: &Callbacks,
    token: &CancelToken,
) -> (std::io::Result<ExitStatus>, DateTime<Utc>) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();
    let proc_done = AtomicBool::new(false);

    thread::scope(|scope| {
        if let Some(pipe) = stdout {
            let pipe = ExitBoundPipe::new(pipe, &proc_done);
            scope.spawn(move || pump_lines(pipe, |line| callbacks.write_stdout(line)));
        }
        if let Some(pipe) = stderr {
            let pipe = ExitBoundPipe::new(pipe, &proc_done);
            scope.spawn(move || pump_lines(pipe, |line| callbacks.write_stderr(line)));
        }
        if let Some(pipe) = stdin {
            let proc_done = &proc_done;
            scope.spawn(move || pump_stdin(pipe, callbacks, token, proc_done));
        }

        let status = child.wait();
        let exec_end = Utc::now();
        proc_done.store(true, Ordering::SeqCst);
        (status, exec_end)
    })
}

/// Child output pipe that ends at the child's exit rather than at EOF
///
/// Descendants may inherit the write end and hold it open long after the
/// child is gone. Once `proc_done` is set the reader only returns what is
/// already buffered in the pipe, then reports EOF.
struct ExitBoundPipe<'a, R> {
    pipe: R,
    proc_done: &'a AtomicBool,
    drain_deadline: Option<Instant>,
}

impl<'a, R> ExitBoundPipe<'a, R> {
    fn new(pipe: R, proc_done: &'a AtomicBool) -> Self {
        Self {
            pipe,
            proc_done,
            drain_deadline: None,
        }
    }
}

impl<R: Read + AsFd> Read for ExitBoundPipe<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let exited = self.proc_done.load(Ordering::SeqCst);
            let timeout = if exited {
                let deadline = *self.drain_deadline.get_or_insert_with(|| Instant::now() + OUTPUT_DRAIN_LIMIT);
                if Instant::now() >= deadline {
                    return Ok(0);
                }
                PollTimeout::ZERO
            } else {
                PollTimeout::from(PIPE_POLL_MS)
            };

            let ready = {
                let mut fds = [PollFd::new(self.pipe.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, timeout)
            };
            match ready {
                Ok(0) if exited => return Ok(0),
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => return self.pipe.read(buf),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

/// Forward each line read from `pipe` with a per-stream index from 0
///
/// A failed delivery does not stop the pump; the pipe keeps draining so the
/// child never blocks on a full buffer.
fn pump_lines<R, F>(pipe: R, mut send: F)
where
    R: Read,
    F: FnMut(Line) -> Result<(), RpcError>,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut index = 0u64;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if let Err(e) = send(Line::new(index, text)) {
                    debug!(index, error = %e, "line delivery failed");
                }
                index += 1;
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Pull the caller's stdin into the child until EOF, error, cancel or exit
fn pump_stdin(mut pipe: ChildStdin, callbacks: &Callbacks, token: &CancelToken, proc_done: &AtomicBool) {
    loop {
        if token.is_cancelled() || proc_done.load(Ordering::SeqCst) {
            break;
        }
        let chunk = match callbacks.read_stdin(STDIN_CHUNK_SIZE) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "stdin service call failed");
                break;
            }
        };
        if !chunk.err.is_empty() {
            debug!(error = %chunk.err, "caller stdin read failed");
            break;
        }
        if !chunk.data.is_empty() && pipe.write_all(&chunk.data).is_err() {
            break;
        }
        if chunk.eof {
            break;
        }
        if chunk.data.is_empty() && token.wait_timeout(STDIN_IDLE) {
            break;
        }
    }
    // dropping the pipe closes the child's stdin
}

/// SIGTERM the group when the token fires, SIGKILL after the grace period
///
/// The token also fires when `Process` returns, which sweeps up any process
/// left behind in the group.
fn spawn_kill_watcher(key: String, pgid: i32, token: CancelToken) {
    let spawned = thread::Builder::new().name("kill-watcher".to_string()).spawn(move || {
        token.wait();
        match signal_group(pgid, Signal::SIGTERM) {
            Err(Errno::ESRCH) => return,
            Err(e) => debug!(key = %key, pgid, error = %e, "SIGTERM failed"),
            Ok(()) => info!(key = %key, pgid, "cancel received; signaled process group"),
        }
        thread::sleep(KILL_GRACE);
        let _ = signal_group(pgid, Signal::SIGKILL);
    });
    if let Err(e) = spawned {
        error!(error = %e, "failed to spawn kill watcher");
    }
}

/// Exit status, or `128 + signal` for a child killed by a signal
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}
