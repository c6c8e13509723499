//! Callback services the client serves for the duration of one call
//!
//! - `Stdout` / `Stderr`: `WriteLine(Line)`, fed into a [`ReorderSink`]
//! - `Stdin`: `ReadChunk(StdinReadArgs)`, pulling from the selected source

use super::sink::ReorderSink;
use crate::error::{ClientError, RpcError};
use crate::protocol::{Empty, Line, StdinReadArgs, StdinReadReply, STDIN_CHUNK_SIZE};
use crate::rpc::{handle, unknown_method, RpcServer, Service};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub struct OutputService<W: Write> {
    name: &'static str,
    sink: Arc<ReorderSink<W>>,
}

impl<W: Write> OutputService<W> {
    pub fn new(name: &'static str, sink: Arc<ReorderSink<W>>) -> Self {
        Self { name, sink }
    }
}

impl<W: Write + Send + 'static> Service for OutputService<W> {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "WriteLine" => handle(method, params, |line: Line| {
                if let Err(e) = self.sink.write(line) {
                    debug!(service = self.name, error = %e, "local write failed");
                }
                Empty {}
            }),
            _ => Err(unknown_method(self.name, method)),
        }
    }
}

/// Where the child's stdin comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinSource {
    /// Immediate EOF
    #[default]
    None,
    Literal(String),
    File(PathBuf),
}

impl StdinSource {
    /// Open the source; `None` means no reader at all
    pub fn open(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(match self {
            StdinSource::None => None,
            StdinSource::Literal(s) => Some(Box::new(Cursor::new(s.clone().into_bytes()))),
            StdinSource::File(path) => Some(Box::new(File::open(path)?)),
        })
    }
}

pub struct StdinService {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl StdinService {
    pub fn new(reader: Option<Box<dyn Read + Send>>) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }

    /// Read up to `max` bytes, never more than 64K (64K when `max <= 0`)
    pub fn read_chunk(&self, args: StdinReadArgs) -> StdinReadReply {
        let max = match usize::try_from(args.max) {
            Ok(n) if n > 0 => n.min(STDIN_CHUNK_SIZE),
            _ => STDIN_CHUNK_SIZE,
        };
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        let Some(reader) = reader.as_mut() else {
            return StdinReadReply::eof();
        };

        let mut buf = vec![0u8; max];
        let read = loop {
            match reader.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match read {
            Ok(0) => StdinReadReply::eof(),
            Ok(n) => {
                buf.truncate(n);
                StdinReadReply {
                    data: buf,
                    eof: false,
                    err: String::new(),
                }
            }
            Err(e) => StdinReadReply {
                data: Vec::new(),
                eof: false,
                err: e.to_string(),
            },
        }
    }
}

impl Service for StdinService {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "ReadChunk" => handle(method, params, |args: StdinReadArgs| self.read_chunk(args)),
            _ => Err(unknown_method("Stdin", method)),
        }
    }
}

/// One callback service listening on its own socket
pub struct ServedSocket {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl ServedSocket {
    /// Bind `path` (which must not exist) and serve `service` as `name`
    pub fn serve(path: &Path, name: &'static str, service: Arc<dyn Service>) -> Result<Self, ClientError> {
        match fs::symlink_metadata(path) {
            Ok(_) => return Err(ClientError::StaleSocket(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClientError::setup(format!("stat socket {}", path.display()), e)),
        }
        let listener = UnixListener::bind(path).map_err(|source| ClientError::Serve { service: name, source })?;

        let server = Arc::new(RpcServer::new().with_service(name, service));
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let accept = thread::Builder::new()
            .name(format!("serve-{}", name))
            .spawn(move || {
                if let Err(e) = server.serve_listener(&listener, &flag) {
                    warn!(service = name, error = %e, "callback listener failed");
                }
            })
            .map_err(|source| ClientError::Serve { service: name, source })?;

        Ok(Self {
            path: path.to_path_buf(),
            shutdown,
            accept: Some(accept),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ServedSocket {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}
