//! Call identity and socket path derivation
//!
//! ```text
//! <root>/<name>.sock                         main socket
//! <root>/<machine-id>/<pid>/stdout.sock      callback sockets, one set per call
//! <root>/<machine-id>/<pid>/stderr.sock
//! <root>/<machine-id>/<pid>/stdin.sock
//! ```

use crate::error::IdentityError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Trim and validate a machine id against `[0-9a-fA-F-]+`
pub fn sanitize_machine_id(s: &str) -> Result<String, IdentityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(IdentityError::Empty);
    }
    if let Some(c) = s.chars().find(|c| !(c.is_ascii_hexdigit() || *c == '-')) {
        return Err(IdentityError::InvalidChar(c));
    }
    Ok(s.to_string())
}

/// Machine id from `/etc/machine-id`, or a random per-invocation id
pub fn load_machine_id() -> String {
    if let Ok(data) = fs::read_to_string(MACHINE_ID_PATH) {
        if let Ok(id) = sanitize_machine_id(&data) {
            return id;
        }
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    warn!(id = %id, "machine-id not found; using random id");
    id
}

/// Registry key for a call
pub fn session_key(machine_id: &str, pid: i32) -> String {
    format!("{}:{}", machine_id, pid)
}

pub fn main_socket_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}.sock", name))
}

/// The three per-call callback sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSockets {
    pub dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub stdin: PathBuf,
}

impl CallbackSockets {
    pub fn derive(root: &Path, machine_id: &str, pid: i32) -> Self {
        let dir = root.join(machine_id).join(pid.to_string());
        Self {
            stdout: dir.join("stdout.sock"),
            stderr: dir.join("stderr.sock"),
            stdin: dir.join("stdin.sock"),
            dir,
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.stdout, &self.stderr, &self.stdin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_machine_id() {
        assert_eq!(sanitize_machine_id(" abcDEF-0123\n").unwrap(), "abcDEF-0123");
        assert_eq!(sanitize_machine_id("   "), Err(IdentityError::Empty));
        assert_eq!(sanitize_machine_id("abc/def"), Err(IdentityError::InvalidChar('/')));
        assert_eq!(sanitize_machine_id("xyz"), Err(IdentityError::InvalidChar('x')));
    }

    #[test]
    fn test_load_machine_id_is_valid() {
        let id = load_machine_id();
        assert!(sanitize_machine_id(&id).is_ok());
    }

    #[test]
    fn test_session_key() {
        assert_eq!(session_key("abcd", 1234), "abcd:1234");
    }

    #[test]
    fn test_socket_paths() {
        let root = Path::new("/run/sockexec");
        assert_eq!(main_socket_path(root, "build"), PathBuf::from("/run/sockexec/build.sock"));

        let socks = CallbackSockets::derive(root, "abcd", 77);
        assert_eq!(socks.dir, PathBuf::from("/run/sockexec/abcd/77"));
        assert_eq!(socks.stdout, PathBuf::from("/run/sockexec/abcd/77/stdout.sock"));
        assert_eq!(socks.stderr, PathBuf::from("/run/sockexec/abcd/77/stderr.sock"));
        assert_eq!(socks.stdin, PathBuf::from("/run/sockexec/abcd/77/stdin.sock"));
    }
}
