//! Advisory file locking for the compile+apply cycle.
//!
//! Every invocation that touches the kernel filter (the daemon's tick,
//! `compile`, `status`, `stop`) serializes on an exclusive `flock` so two
//! invocations can never race to install a partially-built ruleset. The
//! lock is polled in non-blocking mode until the timeout expires.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::core::error::{Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Holds the exclusive lock; dropping it releases the flock.
pub struct LockGuard {
    _lock: Flock<File>,
}

/// Acquires an exclusive advisory lock on `path`, creating the file if
/// needed. Fails with [`Error::LockTimeout`] when the lock cannot be taken
/// within `timeout`.
pub fn lock_file(path: &Path, timeout: Duration) -> Result<LockGuard> {
    let deadline = Instant::now() + timeout;
    let mut file = open_lock_file(path)?;

    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("acquired lock '{}'", path.display());
                return Ok(LockGuard { _lock: lock });
            }
            Err((returned, Errno::EWOULDBLOCK)) => {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout {
                        path: path.to_path_buf(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
                file = returned;
                std::thread::sleep(RETRY_INTERVAL);
            }
            Err((_, errno)) => return Err(Error::Io(std::io::Error::from(errno))),
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}
