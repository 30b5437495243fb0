//! Exclusive leader election over a file lock.
//!
//! When HA is enabled, several instances share the queue directory; only
//! the holder of `<queue>/leader.lock` runs the retry worker.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

#[derive(Debug)]
pub struct LeaderLock {
    path: PathBuf,
    handle: Option<File>,
}

impl LeaderLock {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, handle: None }
    }

    #[must_use]
    pub const fn is_leader(&self) -> bool {
        self.handle.is_some()
    }

    /// Non-blocking acquisition attempt; idempotent while held.
    pub fn try_acquire(&mut self) -> bool {
        if self.handle.is_some() {
            return true;
        }

        let Ok(file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
        else {
            return false;
        };

        if flock_exclusive(&file) {
            tracing::info!(path = %self.path.display(), "leadership acquired");
            self.handle = Some(file);
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.handle.take() {
            flock_unlock(&file);
            tracing::info!(path = %self.path.display(), "leadership released");
        }
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> bool {
    use std::os::fd::AsRawFd;
    // Safety: valid fd for the lifetime of `file`.
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(unix)]
fn flock_unlock(file: &File) {
    use std::os::fd::AsRawFd;
    // Safety: valid fd for the lifetime of `file`.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> bool {
    tracing::warn!("file locking unsupported on this platform; assuming leadership");
    true
}

#[cfg(not(unix))]
fn flock_unlock(_file: &File) {}
