//! Sockexec protocol messages
//!
//! Payloads carried by the RPC envelopes in [`crate::rpc::codec`]. Field names
//! on the wire follow the Go `net/rpc` conventions (exported PascalCase field
//! names), so a sockexec client can talk to a Go execution server and the other
//! way round.
//!
//! ```text
//! client ── ServerService.Process ──▶ server
//! client ◀── Stdout.WriteLine ─────── server   (callback socket)
//! client ◀── Stderr.WriteLine ─────── server   (callback socket)
//! client ◀── Stdin.ReadChunk ──────── server   (callback socket)
//! client ── ServerService.Cancel ───▶ server   (second connection)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Method names, `Service.Method`
pub const METHOD_PROCESS: &str = "ServerService.Process";
pub const METHOD_CANCEL: &str = "ServerService.Cancel";
pub const METHOD_STDOUT_WRITE_LINE: &str = "Stdout.WriteLine";
pub const METHOD_STDERR_WRITE_LINE: &str = "Stderr.WriteLine";
pub const METHOD_STDIN_READ_CHUNK: &str = "Stdin.ReadChunk";

/// Default chunk size requested from the caller's stdin service
pub const STDIN_CHUNK_SIZE: usize = 64 * 1024;

/// Resolved command line reported for a liveness check
pub const PING_CMDLINE: &str = "(ping)";

/// A request to run one command on the execution server (Client → Server)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessArgs {
    /// Stable per-host identifier of the caller
    #[serde(rename = "MachineID")]
    pub machine_id: String,
    /// Caller's process id; together with `machine_id` forms the call identity
    #[serde(rename = "PID")]
    pub pid: i32,
    /// Working directory for the child (empty = server's cwd)
    #[serde(rename = "StartDir", default)]
    pub start_dir: String,
    /// Command to run; empty or whitespace means ping
    #[serde(rename = "Command", default)]
    pub command: String,
    #[serde(rename = "Args", default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    /// `KEY=VALUE` overlay applied on top of the server environment
    #[serde(rename = "Env", default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,
}

/// Who requested a session stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoppedBy {
    #[default]
    Nobody,
    Client,
    Server,
}

impl StoppedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoppedBy::Nobody => "",
            StoppedBy::Client => "client",
            StoppedBy::Server => "server",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "client" => StoppedBy::Client,
            "server" => StoppedBy::Server,
            _ => StoppedBy::Nobody,
        }
    }

    pub fn is_set(&self) -> bool {
        *self != StoppedBy::Nobody
    }
}

impl fmt::Display for StoppedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StoppedBy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StoppedBy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| StoppedBy::from_str(&s)).unwrap_or_default())
    }
}

/// Full accounting of one `Process` call (Server → Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReply {
    /// Exit status, `128 + signal` when the child was killed by a signal,
    /// or a setup failure code (2, 126, 127)
    #[serde(rename = "ReturnCode")]
    pub return_code: i32,
    /// Human-readable setup failure, empty on normal completion
    #[serde(rename = "Error", default)]
    pub error: String,
    #[serde(rename = "Stopped", default)]
    pub stopped: bool,
    #[serde(rename = "StoppedBy", default)]
    pub stopped_by: StoppedBy,
    #[serde(rename = "ExecStartRFC3339")]
    pub exec_start: DateTime<Utc>,
    #[serde(rename = "ExecEndRFC3339")]
    pub exec_end: DateTime<Utc>,
    #[serde(rename = "ElapsedMillis", default)]
    pub elapsed_millis: i64,
    /// e.g. `/usr/bin/echo hi`
    #[serde(rename = "ResolvedCmdLine", default)]
    pub resolved_cmd_line: String,
}

impl Default for ProcessReply {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            return_code: 0,
            error: String::new(),
            stopped: false,
            stopped_by: StoppedBy::Nobody,
            exec_start: now,
            exec_end: now,
            elapsed_millis: 0,
            resolved_cmd_line: String::new(),
        }
    }
}

impl ProcessReply {
    /// Setup failure shape: start == end, zero elapsed, no command line
    pub fn failure_at(return_code: i32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            return_code,
            error: error.into(),
            stopped: false,
            stopped_by: StoppedBy::Nobody,
            exec_start: at,
            exec_end: at,
            elapsed_millis: 0,
            resolved_cmd_line: String::new(),
        }
    }

    /// Setup failure stamped with the current time
    pub fn failure(return_code: i32, error: impl Into<String>) -> Self {
        Self::failure_at(return_code, error, Utc::now())
    }

    /// Reply for an empty command
    pub fn ping() -> Self {
        Self {
            resolved_cmd_line: PING_CMDLINE.to_string(),
            ..Self::default()
        }
    }

    pub fn is_setup_failure(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelArgs {
    #[serde(rename = "MachineID")]
    pub machine_id: String,
    #[serde(rename = "PID")]
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CancelReply {
    /// false when no live session matched; never an error
    #[serde(rename = "OK")]
    pub ok: bool,
}

/// One line of child output; the stream is implied by the callback socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// 0-based, strictly increasing per stream
    #[serde(rename = "Index")]
    pub index: u64,
    #[serde(rename = "Text")]
    pub text: String,
}

impl Line {
    pub fn new(index: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Empty reply body for `WriteLine` (`{}` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinReadArgs {
    #[serde(rename = "Max")]
    pub max: i64,
}

/// Pull-model stdin chunk (Client → Server, as the reply to `Stdin.ReadChunk`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StdinReadReply {
    #[serde(rename = "Data", with = "base64_bytes", default)]
    pub data: Vec<u8>,
    #[serde(rename = "EOF", default)]
    pub eof: bool,
    /// Read error on the caller side, empty when none
    #[serde(rename = "Err", default)]
    pub err: String,
}

impl StdinReadReply {
    pub fn eof() -> Self {
        Self {
            eof: true,
            ..Self::default()
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `[]byte` travels as a base64 string, `null` when empty
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if data.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(data))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_args_wire_names() {
        let args = ProcessArgs {
            machine_id: "abc123".to_string(),
            pid: 42,
            start_dir: "/tmp".to_string(),
            command: "echo".to_string(),
            args: vec!["hi".to_string()],
            env: vec!["A=1".to_string()],
        };

        let json = serde_json::to_string(&args).unwrap();
        assert!(json.contains(r#""MachineID":"abc123""#));
        assert!(json.contains(r#""PID":42"#));
        assert!(json.contains(r#""StartDir":"/tmp""#));
        assert!(json.contains(r#""Args":["hi"]"#));
    }

    #[test]
    fn test_process_args_accepts_null_lists() {
        let json = r#"{"MachineID":"ab","PID":1,"StartDir":"","Command":"","Args":null,"Env":null}"#;
        let args: ProcessArgs = serde_json::from_str(json).unwrap();
        assert!(args.args.is_empty());
        assert!(args.env.is_empty());
    }

    #[test]
    fn test_stopped_by_wire_values() {
        let mut reply = ProcessReply::ping();
        assert!(serde_json::to_string(&reply).unwrap().contains(r#""StoppedBy":"""#));

        reply.stopped = true;
        reply.stopped_by = StoppedBy::Client;
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""StoppedBy":"client""#));

        let decoded: ProcessReply = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.stopped_by, StoppedBy::Client);
    }

    #[test]
    fn test_failure_reply_shape() {
        let reply = ProcessReply::failure(127, "command \"nope\" not found in PATH");
        assert_eq!(reply.return_code, 127);
        assert_eq!(reply.exec_start, reply.exec_end);
        assert_eq!(reply.elapsed_millis, 0);
        assert!(reply.resolved_cmd_line.is_empty());
        assert!(reply.is_setup_failure());
    }

    #[test]
    fn test_ping_reply() {
        let reply = ProcessReply::ping();
        assert_eq!(reply.return_code, 0);
        assert!(!reply.stopped);
        assert_eq!(reply.resolved_cmd_line, "(ping)");
        assert!(!reply.is_setup_failure());
    }

    #[test]
    fn test_stdin_data_is_base64() {
        let reply = StdinReadReply {
            data: b"hello\n".to_vec(),
            eof: false,
            err: String::new(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""Data":"aGVsbG8K""#));

        let empty = serde_json::to_string(&StdinReadReply::eof()).unwrap();
        assert!(empty.contains(r#""Data":null"#));
        assert!(empty.contains(r#""EOF":true"#));

        let decoded: StdinReadReply = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.data, b"hello\n");
    }

    #[test]
    fn test_go_reply_timestamps_parse() {
        let json = r#"{"ReturnCode":0,"Error":"","Stopped":false,"StoppedBy":"",
            "ExecStartRFC3339":"2025-01-02T03:04:05.123456789Z",
            "ExecEndRFC3339":"2025-01-02T03:04:05.2Z",
            "ElapsedMillis":77,"ResolvedCmdLine":"/bin/true"}"#;
        let reply: ProcessReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.elapsed_millis, 77);
        assert!(reply.exec_end > reply.exec_start);
    }
}
