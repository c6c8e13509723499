use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

/// Watches SIGINT and SIGTERM on a background thread
///
/// The server uses the shutdown flag to leave its accept loop; the client
/// hooks a callback that fires once, on the first interrupt.
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    signal_number: Arc<AtomicI32>,
    handle: Option<Handle>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Share an existing shutdown flag (e.g. a daemon's accept loop flag)
    pub fn with_flag(shutdown_flag: Arc<AtomicBool>) -> Self {
        Self {
            shutdown_flag,
            signal_number: Arc::new(AtomicI32::new(0)),
            handle: None,
        }
    }

    /// Start watching; every signal sets the shutdown flag and `on_first`
    /// runs for the first one only
    pub fn setup_with<F>(&mut self, on_first: F) -> Result<()>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        self.handle = Some(signals.handle());
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let signal_number = Arc::clone(&self.signal_number);

        thread::Builder::new().name("signal-watch".to_string()).spawn(move || {
            let mut on_first = Some(on_first);
            for sig in signals.forever() {
                signal_number.store(sig, Ordering::SeqCst);
                shutdown_flag.store(true, Ordering::SeqCst);
                if let Some(f) = on_first.take() {
                    f(sig);
                }
            }
        })?;

        Ok(())
    }

    /// Last signal received, 0 if none
    pub fn signal_number(&self) -> i32 {
        self.signal_number.load(Ordering::SeqCst)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_creation() {
        let handler = SignalHandler::new();
        assert!(!handler.shutdown_flag.load(Ordering::SeqCst));
        assert_eq!(handler.signal_number(), 0);
    }

    #[test]
    fn test_shared_flag_untouched_until_signal() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut handler = SignalHandler::with_flag(Arc::clone(&flag));
        assert!(handler.setup_with(|_| {}).is_ok());
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(handler.signal_number(), 0);
    }
}
