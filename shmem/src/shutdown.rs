use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::debug;

use crate::errors::Result;

/// Longest stretch [`Shutdown::sleep`] goes without looking at the flag.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cancellation flag shared by the polling loops. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    closing: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn is_requested(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Sleeps for `duration` or until shutdown is requested. Returns `false` if woken
    /// by a shutdown request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Sets the flag on SIGHUP, SIGINT, SIGQUIT or SIGTERM.
    pub fn install_signal_handlers(&self) -> Result<()> {
        for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.closing))?;
        }
        debug!("signal handlers installed");
        Ok(())
    }
}
