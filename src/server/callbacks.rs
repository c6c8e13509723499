//! Outbound calls to the caller's stdout, stderr and stdin services
//!
//! During a `Process` call the server is itself an RPC client: it dials the
//! three callback sockets the caller created under
//! `<root>/<machine-id>/<pid>/` and streams the child's I/O through them.

use crate::error::RpcError;
use crate::identity::CallbackSockets;
use crate::protocol::{
    Empty, Line, StdinReadArgs, StdinReadReply, METHOD_STDERR_WRITE_LINE, METHOD_STDIN_READ_CHUNK,
    METHOD_STDOUT_WRITE_LINE,
};
use crate::rpc::RpcClient;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// How often to look for a callback socket
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for each callback socket to appear
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Block until `path` exists as a socket node
pub fn wait_for_socket(path: &Path, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let stat = fs::symlink_metadata(path);
        if let Ok(meta) = &stat {
            if meta.file_type().is_socket() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(match stat {
                Err(e) => e,
                Ok(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out waiting for socket {}", path.display()),
                ),
            });
        }
        thread::sleep(SOCKET_POLL_INTERVAL);
    }
}

/// Connected callback clients for one call
pub struct Callbacks {
    stdout: RpcClient,
    stderr: RpcClient,
    stdin: RpcClient,
}

impl Callbacks {
    /// Wait for all three sockets, then dial them
    ///
    /// The error is the reply message for the caller, naming the socket that
    /// failed.
    pub fn connect(sockets: &CallbackSockets, timeout: Duration) -> Result<Self, String> {
        let named = [("stdout", &sockets.stdout), ("stderr", &sockets.stderr), ("stdin", &sockets.stdin)];

        for (name, path) in named {
            wait_for_socket(path, timeout).map_err(|e| format!("{} socket not available: {}", name, e))?;
        }

        let dial = |name: &str, path: &Path| {
            RpcClient::dial(path).map_err(|e| format!("connect {} service: {}", name, e))
        };
        Ok(Self {
            stdout: dial("stdout", &sockets.stdout)?,
            stderr: dial("stderr", &sockets.stderr)?,
            stdin: dial("stdin", &sockets.stdin)?,
        })
    }

    pub fn write_stdout(&self, line: Line) -> Result<(), RpcError> {
        self.stdout.call::<_, Empty>(METHOD_STDOUT_WRITE_LINE, &line).map(|_| ())
    }

    pub fn write_stderr(&self, line: Line) -> Result<(), RpcError> {
        self.stderr.call::<_, Empty>(METHOD_STDERR_WRITE_LINE, &line).map(|_| ())
    }

    pub fn read_stdin(&self, max: usize) -> Result<StdinReadReply, RpcError> {
        self.stdin.call(METHOD_STDIN_READ_CHUNK, &StdinReadArgs { max: max as i64 })
    }
}
