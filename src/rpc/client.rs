//! Outbound RPC caller
//!
//! One connection carries any number of concurrent calls. Writers serialize on
//! a mutex; a single reader thread routes each response to its waiting caller
//! by id. When the connection ends every pending call fails with
//! [`RpcError::Shutdown`].

use super::codec::{read_message, write_message, CallId, Request, Response};
use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

type Reply = Result<Value, RpcError>;

#[derive(Default)]
struct Pending {
    calls: HashMap<CallId, Sender<Reply>>,
    closed: bool,
}

pub struct RpcClient {
    writer: Mutex<UnixStream>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Connect to a Unix socket
    pub fn dial(path: &Path) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path).map_err(|source| RpcError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(stream)
    }

    /// Wrap an established stream and start the response reader
    pub fn new(stream: UnixStream) -> Result<Self, RpcError> {
        let read_half = stream.try_clone()?;
        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("rpc-client-reader".to_string())
                .spawn(move || read_loop(read_half, pending))?
        };
        Ok(Self {
            writer: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(0),
            reader: Some(reader),
        })
    }

    /// Issue `method(args)` and block for the reply
    pub fn call<A: Serialize, R: DeserializeOwned>(&self, method: &str, args: &A) -> Result<R, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(method, args, id)?;

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.lock_pending();
            if pending.closed {
                return Err(RpcError::Shutdown);
            }
            pending.calls.insert(id, tx);
        }

        let sent = {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            write_message(&mut *writer, &request)
        };
        if let Err(e) = sent {
            self.lock_pending().calls.remove(&id);
            return Err(RpcError::Io(e));
        }

        let value = rx.recv().map_err(|_| RpcError::Shutdown)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Close both directions; pending and future calls fail with `Shutdown`
    pub fn close(&self) {
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writer.shutdown(Shutdown::Both);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn read_loop(stream: UnixStream, pending: Arc<Mutex<Pending>>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_message::<_, Response>(&mut reader) {
            Ok(Some(response)) => {
                let id = response.id;
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).calls.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => debug!(id, "response for unknown call"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "rpc connection read failed");
                break;
            }
        }
    }

    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
    pending.closed = true;
    for (_, tx) in pending.calls.drain() {
        let _ = tx.send(Err(RpcError::Shutdown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Line;
    use std::io::{BufRead, Write};

    #[test]
    fn test_call_round_trip() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut writer = server_end.try_clone().unwrap();
            let mut reader = BufReader::new(server_end);
            let request: Request = read_message(&mut reader).unwrap().unwrap();
            assert_eq!(request.method, "Stdout.WriteLine");
            let line: Line = request.decode_params().unwrap();
            write_message(&mut writer, &Response::ok(request.id, serde_json::json!({"echo": line.text}))).unwrap();
        });

        let client = RpcClient::new(client_end).unwrap();
        let reply: Value = client.call("Stdout.WriteLine", &Line::new(0, "hello")).unwrap();
        assert_eq!(reply["echo"], "hello");
        peer.join().unwrap();
    }

    #[test]
    fn test_out_of_order_replies_reach_their_callers() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut writer = server_end.try_clone().unwrap();
            let mut reader = BufReader::new(server_end);
            let first: Request = read_message(&mut reader).unwrap().unwrap();
            let second: Request = read_message(&mut reader).unwrap().unwrap();
            for request in [second, first] {
                let line: Line = request.decode_params().unwrap();
                write_message(&mut writer, &Response::ok(request.id, Value::from(line.index))).unwrap();
            }
        });

        let client = Arc::new(RpcClient::new(client_end).unwrap());
        let handles: Vec<_> = (0..2u64)
            .map(|i| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    let got: u64 = client.call("Stdout.WriteLine", &Line::new(i, "x")).unwrap();
                    assert_eq!(got, i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        peer.join().unwrap();
    }

    #[test]
    fn test_remote_error_string() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            let mut writer = server_end.try_clone().unwrap();
            let mut reader = BufReader::new(server_end);
            let request: Request = read_message(&mut reader).unwrap().unwrap();
            write_message(&mut writer, &Response::err(request.id, "rpc: can't find method Nope.Nope")).unwrap();
        });

        let client = RpcClient::new(client_end).unwrap();
        let err = client.call::<_, Value>("Nope.Nope", &Line::new(0, "")).unwrap_err();
        assert_eq!(err.to_string(), "rpc: can't find method Nope.Nope");
    }

    #[test]
    fn test_peer_close_fails_pending_calls() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        thread::spawn(move || {
            let mut reader = BufReader::new(server_end);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            // drop without answering
        });

        let client = RpcClient::new(client_end).unwrap();
        let err = client.call::<_, Value>("Stdout.WriteLine", &Line::new(0, "x")).unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));

        let err = client.call::<_, Value>("Stdout.WriteLine", &Line::new(1, "y")).unwrap_err();
        assert!(matches!(err, RpcError::Shutdown | RpcError::Io(_)));
    }

    #[test]
    fn test_dial_missing_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = RpcClient::dial(&tmp.path().join("absent.sock")).err().unwrap();
        assert!(matches!(err, RpcError::Connect { .. }));
    }

    #[test]
    fn test_ids_increase() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let peer = thread::spawn(move || {
            let mut writer = server_end.try_clone().unwrap();
            let mut reader = BufReader::new(server_end);
            let mut seen = Vec::new();
            for _ in 0..3 {
                let request: Request = read_message(&mut reader).unwrap().unwrap();
                seen.push(request.id);
                write_message(&mut writer, &Response::ok(request.id, Value::Null)).unwrap();
            }
            writer.flush().unwrap();
            seen
        });

        let client = RpcClient::new(client_end).unwrap();
        for i in 0..3 {
            let _: Value = client.call("Stdout.WriteLine", &Line::new(i, "")).unwrap();
        }
        assert_eq!(peer.join().unwrap(), vec![0, 1, 2]);
    }
}
