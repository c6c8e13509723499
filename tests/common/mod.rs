#![allow(dead_code)]

use sockexec::client::{run_call, CallOptions, CallOutcome, StdinSource};
use sockexec::error::ClientError;
use sockexec::server::{Daemon, DaemonOptions, ServerService};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const MACHINE_ID: &str = "0123abcd";

static NEXT_PID: AtomicI32 = AtomicI32::new(50_000);

/// Writer whose bytes stay readable after it has been moved into a call
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A server running on its own thread under a temporary root
pub struct TestServer {
    pub root: TempDir,
    pub name: String,
    pub socket: PathBuf,
    pub service: Arc<ServerService>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with_env(Vec::new())
    }

    pub fn start_with_env(base_env: Vec<String>) -> Self {
        let root = TempDir::new().unwrap();
        let daemon = Daemon::bind(&DaemonOptions {
            root: root.path().to_path_buf(),
            name: "test".into(),
            start_dir: None,
            base_env,
        })
        .unwrap();
        let socket = daemon.socket_path().to_path_buf();
        let service = Arc::clone(daemon.service());
        let shutdown = daemon.shutdown_flag();
        let handle = thread::spawn(move || daemon.run().unwrap());
        Self {
            root,
            name: "test".into(),
            socket,
            service,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Options for a fresh call identity
    pub fn options(&self, command: &[&str]) -> CallOptions {
        CallOptions {
            root: self.root.path().to_path_buf(),
            name: self.name.clone(),
            machine_id: MACHINE_ID.into(),
            pid: Some(NEXT_PID.fetch_add(1, Ordering::SeqCst)),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn call(&self, options: &CallOptions) -> Result<Captured, ClientError> {
        let stdout = SharedBuf::default();
        let stderr = SharedBuf::default();
        let outcome = run_call(options, stdout.clone(), stderr.clone())?;
        Ok(Captured {
            outcome,
            stdout: stdout.text(),
            stderr: stderr.text(),
        })
    }

    pub fn run(&self, command: &[&str]) -> Captured {
        self.call(&self.options(command)).unwrap()
    }

    pub fn run_with_stdin(&self, command: &[&str], stdin: StdinSource) -> Captured {
        let options = CallOptions {
            stdin,
            ..self.options(command)
        };
        self.call(&options).unwrap()
    }

    /// Block until a session with this key is registered
    pub fn wait_for_session(&self, key: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.service.registry().get(key).is_none() {
            assert!(Instant::now() < deadline, "session {} never appeared", key);
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct Captured {
    pub outcome: CallOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn rc(&self) -> i32 {
        self.outcome.return_code()
    }
}
