//! Cancellation: SIGTERM/SIGINT/SIGHUP flip a flag the executor polls.
//!
//! Uses the `signal-hook` crate for safe signal registration. The executor
//! checks the flag between child polls and runs the same cleanup path as any
//! other failure, so an interrupted run never leaves a half-written artifact.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// A flag that only changes through [`CancellationSignal::cancel`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag wired to SIGTERM and SIGINT (and SIGHUP on Unix).
    ///
    /// Registration is best-effort; failures are logged to stderr but not fatal.
    #[must_use]
    pub fn from_os_signals() -> Self {
        let signal = Self::new();
        signal.register();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation programmatically.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn register(&self) {
        for (name, sig) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
            if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&self.cancelled)) {
                eprintln!("[BSG-SIGNAL] failed to register {name}: {e}");
            }
        }

        // A closing controlling terminal must not leave the producer orphaned.
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.cancelled)) {
                eprintln!("[BSG-SIGNAL] failed to register SIGHUP: {e}");
            }
        }
    }
}
