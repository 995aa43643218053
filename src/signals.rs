//! Termination signal handling.
//!
//! SIGINT and SIGTERM only set a shared flag. The accept loop polls the
//! flag between blocking waits and after an interrupted one.

use signal_hook::consts::{SIGINT, SIGTERM};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared request to stop accepting connections
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown from ordinary code rather than a signal.
    #[cfg(test)]
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

/// Make SIGINT and SIGTERM set `token`.
///
/// The installed handler performs a single atomic store.
pub fn install(token: &ShutdownToken) -> io::Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&token.requested))?;
    }
    Ok(())
}
