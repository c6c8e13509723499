//! Typed errors for sockexec
//!
//! Setup failures inside a `Process` call are not errors at this level: they
//! travel inside [`crate::protocol::ProcessReply`]. The types here cover the
//! transport, the command resolver and the glue around both binaries.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for client-side argument and configuration errors
pub const EXIT_USAGE: i32 = 2;

/// Exit code when the RPC transport itself failed
pub const EXIT_TRANSPORT: i32 = 1;

/// Errors raised by the wire codec, the RPC client and the RPC server
#[derive(Debug, Error)]
pub enum RpcError {
    /// Dialing a socket failed
    #[error("connect {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the connection failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An envelope or payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer answered the call with an error string
    #[error("{0}")]
    Remote(String),

    /// The connection closed while calls were pending
    #[error("connection is shut down")]
    Shutdown,

    /// No registered service handles the method
    #[error("rpc: can't find method {0}")]
    UnknownMethod(String),

    /// The request params did not match the method's argument type
    #[error("rpc: invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
}

/// Command resolution failures, each mapped to a shell-style exit code
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("command {0:?} not found in PATH")]
    NotInPath(String),

    #[error("resolve symlinks: {path}: {source}")]
    Symlink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no such file: {}", .0.display())]
    Missing(PathBuf),

    #[error("is a directory: {}", .0.display())]
    IsDirectory(PathBuf),

    #[error("not executable: {}", .0.display())]
    NotExecutable(PathBuf),
}

impl ResolveError {
    /// 127 for "not found", 126 for "found but cannot execute"
    pub fn return_code(&self) -> i32 {
        match self {
            ResolveError::NotInPath(_) | ResolveError::Symlink { .. } | ResolveError::Missing(_) => 127,
            ResolveError::IsDirectory(_) | ResolveError::NotExecutable(_) => 126,
        }
    }
}

/// Environment overlay errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("empty env entry")]
    EmptyEntry,

    #[error("--env {name} requested but not present in {side} environment")]
    Missing { name: String, side: &'static str },
}

/// Machine identity errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("empty machine-id")]
    Empty,

    #[error("invalid machine-id char: {0:?}")]
    InvalidChar(char),
}

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("config path is a directory: {}", .0.display())]
    IsDirectory(PathBuf),

    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of one client call that happen before or around the RPC itself
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("refusing to overwrite existing socket: {}", .0.display())]
    StaleSocket(PathBuf),

    #[error("{context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("serve {service}: {source}")]
    Serve {
        service: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("invalid machine-id: {0}")]
    Identity(#[from] IdentityError),
}

impl ClientError {
    pub fn setup(context: impl Into<String>, source: io::Error) -> Self {
        ClientError::Setup {
            context: context.into(),
            source,
        }
    }

    /// Exit code the client binary reports for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::StaleSocket(_) | ClientError::Setup { .. } | ClientError::Identity(_) => EXIT_USAGE,
            ClientError::Serve { .. } | ClientError::Rpc(_) => EXIT_TRANSPORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_codes() {
        assert_eq!(ResolveError::NotInPath("x".into()).return_code(), 127);
        assert_eq!(ResolveError::Missing(PathBuf::from("/x")).return_code(), 127);
        assert_eq!(ResolveError::IsDirectory(PathBuf::from("/tmp")).return_code(), 126);
        assert_eq!(ResolveError::NotExecutable(PathBuf::from("/etc/passwd")).return_code(), 126);
    }

    #[test]
    fn test_client_error_exit_codes() {
        assert_eq!(ClientError::StaleSocket(PathBuf::from("/r/a/1/stdout.sock")).exit_code(), 2);
        assert_eq!(ClientError::Rpc(RpcError::Shutdown).exit_code(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = EnvError::Missing {
            name: "HOME".to_string(),
            side: "client",
        };
        assert_eq!(
            err.to_string(),
            "--env HOME requested but not present in client environment"
        );
        assert!(ResolveError::NotInPath("nope".into()).to_string().contains("not found in PATH"));
    }
}
