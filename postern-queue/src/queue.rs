//! The four-state directory queue.
//!
//! ```text
//! <root>/active/<id>.msg            ready for lease
//! <root>/inflight/<id>.msg          leased, mtime = lease time
//! <root>/failure/<id>.msg           temp-failed, retry scheduled
//! <root>/permanent_fail/<id>.msg    terminal
//! ```
//!
//! Atomic rename is the only state-transition primitive: each message id has
//! exactly one `.msg` file, the directory it sits in is its state, and a
//! rename either fully happens or fully doesn't. That gives at-most-one
//! concurrent worker per message and at-least-once delivery across crashes
//! without any in-process lock.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;

use crate::message::{self, QueueMessage};
use crate::retry::{RetrySchedule, backoff, now_unix};

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_DEPTH: usize = 100_000;

const ACTIVE: &str = "active";
const INFLIGHT: &str = "inflight";
const FAILURE: &str = "failure";
const PERMANENT_FAIL: &str = "permanent_fail";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue depth {depth} at capacity {max}")]
    Full { depth: usize, max: usize },

    #[error("queue I/O failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl QueueError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug)]
pub struct MailQueue {
    root: PathBuf,
    max_depth: usize,
    lease_timeout: Duration,
}

impl MailQueue {
    /// Creates the state directories and sweeps `*.tmp` leftovers from a
    /// crashed writer.
    ///
    /// # Errors
    ///
    /// Fails when the directories cannot be created or scanned.
    pub fn open(root: PathBuf, max_depth: usize) -> Result<Self, QueueError> {
        let queue = Self {
            root,
            max_depth,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        };

        for state in [ACTIVE, INFLIGHT, FAILURE, PERMANENT_FAIL] {
            let dir = queue.dir(state);
            fs::create_dir_all(&dir).map_err(|e| QueueError::io(&dir, e))?;
        }
        queue.sweep_tmp()?;

        Ok(queue)
    }

    /// Test hook; production uses the 300 s default.
    #[must_use]
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    fn dir(&self, state: &str) -> PathBuf {
        self.root.join(state)
    }

    fn msg_path(&self, state: &str, id: &str) -> PathBuf {
        self.dir(state).join(format!("{id}.msg"))
    }

    fn retry_path(&self, id: &str) -> PathBuf {
        self.dir(FAILURE).join(format!("{id}.retry"))
    }

    fn sweep_tmp(&self) -> Result<(), QueueError> {
        for state in [ACTIVE, INFLIGHT, FAILURE, PERMANENT_FAIL] {
            let dir = self.dir(state);
            let entries = fs::read_dir(&dir).map_err(|e| QueueError::io(&dir, e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    tracing::warn!(path = %path.display(), "removing orphaned temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    fn msg_entries(&self, state: &str) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.dir(state);
        let entries = fs::read_dir(&dir).map_err(|e| QueueError::io(&dir, e))?;
        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "msg"))
            .collect())
    }

    /// Messages ready for lease; exported as `mail_queue_depth`.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.msg_entries(ACTIVE).map_or(0, |entries| entries.len())
    }

    /// Durably writes a new message into `active/`. The caller only
    /// acknowledges the mail to its sender after this returns.
    ///
    /// # Errors
    ///
    /// `Full` at the depth cap; otherwise I/O errors.
    pub fn enqueue(
        &self,
        from: &str,
        recipients: &[String],
        raw: &[u8],
    ) -> Result<String, QueueError> {
        let depth = self.depth();
        if depth >= self.max_depth {
            return Err(QueueError::Full {
                depth,
                max: self.max_depth,
            });
        }

        let id = message::generate_id();
        let final_path = self.msg_path(ACTIVE, &id);
        let tmp_path = self.dir(ACTIVE).join(format!("{id}.tmp"));

        let content = message::serialize(from, recipients, raw);
        let mut file = fs::File::create(&tmp_path).map_err(|e| QueueError::io(&tmp_path, e))?;
        file.write_all(&content)
            .map_err(|e| QueueError::io(&tmp_path, e))?;
        file.sync_all().map_err(|e| QueueError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(|e| QueueError::io(&final_path, e))?;

        tracing::info!(%id, from, recipients = recipients.len(), "enqueued");
        Ok(id)
    }

    /// Moves leases whose holder went quiet back to `active/`. This is the
    /// only crash-recovery path for stuck deliveries.
    fn reclaim_expired(&self) -> Result<(), QueueError> {
        let now = SystemTime::now();
        for path in self.msg_entries(INFLIGHT)? {
            let expired = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map(|mtime| {
                    now.duration_since(mtime)
                        .is_ok_and(|age| age > self.lease_timeout)
                })
                .unwrap_or(false);

            if expired && let Some(name) = path.file_name() {
                let dst = self.dir(ACTIVE).join(name);
                match fs::rename(&path, &dst) {
                    Ok(()) => {
                        tracing::warn!(path = %dst.display(), "reclaimed expired lease");
                    }
                    Err(_) => continue,
                }
            }
        }
        Ok(())
    }

    /// Re-activates temp-failed messages whose scheduled retry time passed.
    /// The retry sidecar stays behind so the count survives the next lease.
    fn reactivate_due(&self) -> Result<(), QueueError> {
        let now = now_unix();
        for path in self.msg_entries(FAILURE)? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let schedule = fs::read_to_string(self.retry_path(stem))
                .map(|content| RetrySchedule::parse(&content))
                .unwrap_or_default();

            if schedule.is_due(now)
                && let Some(name) = path.file_name()
            {
                let dst = self.dir(ACTIVE).join(name);
                if fs::rename(&path, &dst).is_ok() {
                    tracing::debug!(id = stem, retry = schedule.retry_count, "retry due");
                }
            }
        }
        Ok(())
    }

    /// Takes the lease on one ready message, if any.
    ///
    /// The winning rename `active/<id>` → `inflight/<id>` is the lease;
    /// losing the race to another worker just moves on to the next entry.
    ///
    /// # Errors
    ///
    /// Directory scan failures only; per-message races are not errors.
    pub fn fetch_ready(&self) -> Result<Option<QueueMessage>, QueueError> {
        self.reclaim_expired()?;
        self.reactivate_due()?;

        for path in self.msg_entries(ACTIVE)? {
            let Some(name) = path.file_name().map(std::ffi::OsStr::to_owned) else {
                continue;
            };
            let inflight = self.dir(INFLIGHT).join(&name);

            if fs::rename(&path, &inflight).is_err() {
                // Another worker won this entry.
                continue;
            }

            let Some(id) = inflight
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
            else {
                continue;
            };

            // Lease time is the file's mtime.
            if let Ok(file) = fs::File::options().write(true).open(&inflight) {
                let _ = file.set_modified(SystemTime::now());
            }

            let content = fs::read(&inflight).map_err(|e| QueueError::io(&inflight, e))?;
            if content.is_empty() {
                tracing::error!(%id, "leased empty message, moving to permanent_fail");
                let _ = fs::rename(&inflight, self.msg_path(PERMANENT_FAIL, &id));
                continue;
            }

            let Some((from, recipients, raw)) = message::parse(&content) else {
                tracing::error!(%id, "leased unparsable message, moving to permanent_fail");
                let _ = fs::rename(&inflight, self.msg_path(PERMANENT_FAIL, &id));
                continue;
            };

            let retry_count = fs::read_to_string(self.retry_path(&id))
                .map(|content| RetrySchedule::parse(&content).retry_count)
                .unwrap_or(0);

            tracing::debug!(%id, retry_count, "leased");
            return Ok(Some(QueueMessage {
                id,
                from,
                recipients,
                raw,
                retry_count,
            }));
        }

        Ok(None)
    }

    /// # Errors
    ///
    /// I/O errors removing the delivered file.
    pub fn mark_success(&self, id: &str) -> Result<(), QueueError> {
        let path = self.msg_path(INFLIGHT, id);
        fs::remove_file(&path).map_err(|e| QueueError::io(&path, e))?;
        let _ = fs::remove_file(self.retry_path(id));
        tracing::info!(id, "delivered");
        Ok(())
    }

    /// Schedules the next attempt at `now + backoff(retry_count)` and parks
    /// the message in `failure/`.
    ///
    /// # Errors
    ///
    /// I/O errors from the rename or the schedule write.
    pub fn mark_temp_fail(&self, msg: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let src = self.msg_path(INFLIGHT, &msg.id);
        let dst = self.msg_path(FAILURE, &msg.id);
        fs::rename(&src, &dst).map_err(|e| QueueError::io(&src, e))?;

        let schedule = RetrySchedule {
            retry_count: msg.retry_count + 1,
            next_retry_unix: now_unix() + backoff(msg.retry_count).as_secs(),
        };
        self.write_schedule(&msg.id, schedule)?;

        tracing::warn!(
            id = %msg.id,
            retry = schedule.retry_count,
            next_retry = schedule.next_retry_unix,
            reason,
            "temp-failed"
        );
        Ok(())
    }

    /// # Errors
    ///
    /// I/O errors from the rename.
    pub fn mark_perm_fail(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let src = self.msg_path(INFLIGHT, id);
        let dst = self.msg_path(PERMANENT_FAIL, id);
        fs::rename(&src, &dst).map_err(|e| QueueError::io(&src, e))?;
        let _ = fs::remove_file(self.retry_path(id));

        tracing::error!(id, reason, "permanently failed");
        Ok(())
    }

    fn write_schedule(&self, id: &str, schedule: RetrySchedule) -> Result<(), QueueError> {
        let path = self.retry_path(id);
        let tmp = self.dir(FAILURE).join(format!("{id}.retry.tmp"));

        fs::write(&tmp, schedule.serialize()).map_err(|e| QueueError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| QueueError::io(&path, e))
    }

    /// True when `id` currently has exactly one `.msg` file across all four
    /// state directories.
    #[must_use]
    pub fn state_exclusive(&self, id: &str) -> bool {
        [ACTIVE, INFLIGHT, FAILURE, PERMANENT_FAIL]
            .into_iter()
            .filter(|state| self.msg_path(state, id).exists())
            .count()
            == 1
    }
}
