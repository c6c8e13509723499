//! Live sessions, one per in-flight `Process` call

use crate::cancel::CancelToken;
use crate::protocol::StoppedBy;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Signal every process in the group led by `pgid`
pub fn signal_group(pgid: i32, sig: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(-pgid), sig)
}

#[derive(Debug, Default)]
struct SessionState {
    pgid: Option<i32>,
    stopped_by: StoppedBy,
}

#[derive(Debug)]
pub struct Session {
    key: String,
    token: CancelToken,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            token: CancelToken::new(),
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Record the child's process group once it has been spawned
    pub fn attach(&self, pgid: i32) {
        self.lock().pgid = Some(pgid);
    }

    pub fn stopped_by(&self) -> StoppedBy {
        self.lock().stopped_by
    }

    /// Request a stop: mark who asked (first one sticks), fire the token and
    /// SIGTERM the child's group if it is running
    pub fn stop(&self, by: StoppedBy) {
        let mut state = self.lock();
        if !state.stopped_by.is_set() {
            state.stopped_by = by;
        }
        self.token.cancel();
        if let Some(pgid) = state.pgid {
            if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
                debug!(key = %self.key, pgid, error = %e, "SIGTERM to process group failed");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keyed by `machineID:pid`; a second call with the same key replaces the
/// first entry
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, returning any entry it displaced
    pub fn add(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.lock().insert(session.key().to_string(), session)
    }

    /// Remove `session` only if it is still the registered entry for its key
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.lock();
        match sessions.get(session.key()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.key());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.lock().get(key).cloned()
    }

    /// Stop one session; false when the key is unknown
    pub fn cancel(&self, key: &str, by: StoppedBy) -> bool {
        let sessions = self.lock();
        match sessions.get(key) {
            Some(session) => {
                session.stop(by);
                true
            }
            None => false,
        }
    }

    /// Stop every live session, returning how many were signaled
    pub fn cancel_all(&self, by: StoppedBy) -> usize {
        let sessions = self.lock();
        for session in sessions.values() {
            session.stop(by);
        }
        sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn test_cancel_marks_and_fires_token() {
        let registry = Registry::new();
        let session = Session::new("abcd:1");
        registry.add(Arc::clone(&session));

        assert!(registry.cancel("abcd:1", StoppedBy::Client));
        assert!(session.token().is_cancelled());
        assert_eq!(session.stopped_by(), StoppedBy::Client);

        assert!(!registry.cancel("abcd:2", StoppedBy::Client));
    }

    #[test]
    fn test_first_stopper_sticks() {
        let session = Session::new("abcd:1");
        session.stop(StoppedBy::Client);
        session.stop(StoppedBy::Server);
        assert_eq!(session.stopped_by(), StoppedBy::Client);
    }

    #[test]
    fn test_cancel_all() {
        let registry = Registry::new();
        let a = Session::new("a:1");
        let b = Session::new("b:2");
        registry.add(Arc::clone(&a));
        registry.add(Arc::clone(&b));

        assert_eq!(registry.cancel_all(StoppedBy::Server), 2);
        assert_eq!(a.stopped_by(), StoppedBy::Server);
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn test_duplicate_key_last_writer_wins() {
        let registry = Registry::new();
        let older = Session::new("dup:7");
        let newer = Session::new("dup:7");

        assert!(registry.add(Arc::clone(&older)).is_none());
        let displaced = registry.add(Arc::clone(&newer)).unwrap();
        assert!(Arc::ptr_eq(&displaced, &older));

        // the older call finishing must not evict the newer entry
        assert!(!registry.remove(&older));
        assert!(Arc::ptr_eq(&registry.get("dup:7").unwrap(), &newer));

        assert!(registry.remove(&newer));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_signals_process_group() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let session = Session::new("grp:1");
        session.attach(child.id() as i32);

        session.stop(StoppedBy::Client);
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }
}
