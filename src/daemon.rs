//! Background execution.
//!
//! The process forks once. The parent reports the child's pid and exits;
//! the child carries on as the server with console output turned off.
//! Must be called before logging is installed or any thread is spawned.

use std::io;

/// Which side of the fork this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The original process
    Parent { child: libc::pid_t },
    /// The forked server process
    Child,
}

/// Fork the process once.
pub fn detach() -> io::Result<Detached> {
    // SAFETY: called from main before any other thread exists, so the
    // child inherits a consistent copy of the address space.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Detached::Child),
        child => Ok(Detached::Parent { child }),
    }
}
