//! Inbound RPC dispatch
//!
//! Services register under a name; a request for `Name.Method` is routed to
//! the service called `Name`. Each connection gets a read loop and every
//! request runs on its own thread, so a long call (such as `Process`) never
//! blocks the next request on the same connection.

use super::codec::{decode_params, read_message, write_message, Request, Response};
use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Poll interval of the accept loop while idle
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// A named group of methods reachable over RPC
pub trait Service: Send + Sync {
    /// Handle `method` (the part after the dot) with the raw params
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Decode params, run a typed handler and encode its result
pub fn handle<A, R, F>(method: &str, params: Value, f: F) -> Result<Value, RpcError>
where
    A: DeserializeOwned,
    R: Serialize,
    F: FnOnce(A) -> R,
{
    let args: A = decode_params(method, params)?;
    Ok(serde_json::to_value(f(args))?)
}

#[derive(Clone, Default)]
pub struct RpcServer {
    services: HashMap<String, Arc<dyn Service>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, service: Arc<dyn Service>) {
        self.services.insert(name.to_string(), service);
    }

    pub fn with_service(mut self, name: &str, service: Arc<dyn Service>) -> Self {
        self.register(name, service);
        self
    }

    /// Route `Service.Method` to its handler
    pub fn dispatch(&self, full_method: &str, params: Value) -> Result<Value, RpcError> {
        let (service, method) = full_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::Remote(format!("rpc: service/method request ill-formed: {}", full_method)))?;
        let handler = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::Remote(format!("rpc: can't find service {}", full_method)))?;
        handler.call(method, params)
    }

    /// Serve one connection until the peer closes it, then wait for its
    /// in-flight requests
    pub fn serve_conn(self: Arc<Self>, stream: UnixStream) {
        let writer = match stream.try_clone() {
            Ok(w) => Arc::new(Mutex::new(w)),
            Err(e) => {
                error!(error = %e, "failed to clone rpc connection");
                return;
            }
        };
        let mut reader = BufReader::new(stream);
        let mut in_flight = Vec::new();

        loop {
            let request: Request = match read_message(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "dropping rpc connection");
                    break;
                }
            };

            let server = Arc::clone(&self);
            let writer = Arc::clone(&writer);
            let spawned = thread::Builder::new()
                .name(format!("rpc-{}", request.method))
                .spawn(move || {
                    debug!(method = %request.method, id = request.id, "rpc request");
                    let response = match server.dispatch(&request.method, request.params) {
                        Ok(result) => Response::ok(request.id, result),
                        Err(e) => Response::err(request.id, e.to_string()),
                    };
                    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = write_message(&mut *writer, &response) {
                        debug!(error = %e, "failed to write rpc response");
                    }
                });
            match spawned {
                Ok(handle) => in_flight.push(handle),
                Err(e) => error!(error = %e, "failed to spawn rpc handler"),
            }
            in_flight.retain(|h| !h.is_finished());
        }

        for handle in in_flight {
            let _ = handle.join();
        }
    }

    /// Accept connections until `shutdown` is set
    ///
    /// Each connection is served on its own thread. The listener is switched
    /// to non-blocking mode so the flag is observed within one poll interval.
    pub fn serve_listener(self: Arc<Self>, listener: &UnixListener, shutdown: &AtomicBool) -> io::Result<()> {
        listener.set_nonblocking(true)?;

        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    let server = Arc::clone(&self);
                    if let Err(e) = thread::Builder::new()
                        .name("rpc-conn".to_string())
                        .spawn(move || server.serve_conn(stream))
                    {
                        error!(error = %e, "failed to spawn connection thread");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Ok(())
    }
}

/// Error for a method name a service does not know
pub fn unknown_method(service: &str, method: &str) -> RpcError {
    RpcError::UnknownMethod(format!("{}.{}", service, method))
}
