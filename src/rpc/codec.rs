//! JSON-RPC envelopes over a byte stream
//!
//! Wire format: newline-delimited JSON, one envelope per line, UTF-8.
//!
//! ```text
//! → {"method":"ServerService.Process","params":[{...}],"id":0}
//! ← {"id":0,"result":{...},"error":null}
//! ```
//!
//! `params` is a one-element array as Go's `net/rpc/jsonrpc` sends it; a bare
//! object is accepted as well. `error` is `null` on success, otherwise a string.

use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};

/// Maximum envelope size (16MB to prevent memory exhaustion)
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Call id, unique per connection and increasing
pub type CallId = u64;

/// Request envelope (caller → service)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: CallId,
}

/// Response envelope (service → caller)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CallId,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

impl Request {
    pub fn new<A: Serialize>(method: &str, args: &A, id: CallId) -> Result<Self, RpcError> {
        Ok(Self {
            method: method.to_string(),
            params: Value::Array(vec![serde_json::to_value(args)?]),
            id,
        })
    }

    /// Decode the single argument carried in `params`
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        decode_params(&self.method, self.params.clone())
    }
}

impl Response {
    pub fn ok(id: CallId, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: CallId, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Value::String(message.into()),
        }
    }

    /// Split into the call's outcome
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Value::Null => Ok(self.result),
            Value::String(s) if s.is_empty() => Ok(self.result),
            Value::String(s) => Err(RpcError::Remote(s)),
            other => Err(RpcError::Remote(other.to_string())),
        }
    }
}

/// Unwrap `[arg]` (or a bare `arg`) into the method's argument type
pub fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, RpcError> {
    let arg = match params {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Array(items) => {
            return Err(RpcError::InvalidParams {
                method: method.to_string(),
                message: format!("expected 1 param, got {}", items.len()),
            })
        }
        other => other,
    };
    serde_json::from_value(arg).map_err(|e| RpcError::InvalidParams {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Encode an envelope as one JSONL line (with trailing newline)
pub fn encode_jsonl<T: Serialize>(message: &T) -> io::Result<String> {
    let json = serde_json::to_string(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(format!("{}\n", json))
}

/// Decode an envelope from one JSONL line
pub fn decode_jsonl<T: DeserializeOwned>(line: &str) -> io::Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one envelope and flush
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let line = encode_jsonl(message)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

/// Read one envelope; `Ok(None)` on a clean EOF between lines
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut buf = Vec::new();
    let n = io::Read::take(&mut *reader, MAX_LINE_SIZE as u64 + 1).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: more than {} bytes", MAX_LINE_SIZE),
        ));
    }
    let line = std::str::from_utf8(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    decode_jsonl(line).map(Some)
}
