//! Graceful shutdown support via atomic flag

use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide flag set by the SIGTERM/SIGINT handler
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Handle to a stop flag, polled by stream sources between lines.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownFlag(&'static AtomicBool);

impl ShutdownFlag {
    /// The process-wide flag driven by signal handlers.
    pub fn global() -> Self {
        Self(shutdown_flag())
    }

    /// A private flag, independent of signals (embedding, tests).
    pub fn standalone() -> Self {
        Self(Box::leak(Box::new(AtomicBool::new(false))))
    }

    pub fn is_requested(self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn request(self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::global()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_flags_are_independent() {
        let a = ShutdownFlag::standalone();
        let b = ShutdownFlag::standalone();
        a.request();
        assert!(a.is_requested());
        assert!(!b.is_requested());
    }
}
