//! Per-user on-disk mailbox.
//!
//! Layout, shared with the IMAP frontend:
//!
//! ```text
//! <root>/<user>/INBOX/<id>.eml
//! <root>/<user>/Quarantine/<id>.eml
//! <root>/<user>/flags.txt
//! ```
//!
//! Writes are atomic and durable: content goes to `<path>.tmp`, is fsynced,
//! then renamed into place. A message file is never observable half-written
//! at its final path. Mutating operations share one mutex so concurrent
//! directory creation stays benign.

use std::{
    collections::BTreeMap,
    collections::BTreeSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message has no mailbox user")]
    MissingUser,

    #[error("no such message {id} for {user}")]
    NotFound { user: String, id: String },

    #[error("store I/O failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A message accepted for local delivery.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub from: String,
    pub recipients: Vec<String>,
    pub mailbox_user: String,
    /// Raw RFC 5322 bytes, already carrying the `Authentication-Results`
    /// header the session prepended.
    pub raw: Vec<u8>,
}

#[derive(Debug)]
pub struct MailStore {
    root: PathBuf,
    domain: String,
    lock: Mutex<()>,
}

impl MailStore {
    #[must_use]
    pub fn new(root: PathBuf, domain: String) -> Self {
        Self {
            root,
            domain,
            lock: Mutex::new(()),
        }
    }

    fn generate_id() -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let noise: u32 = rand::rng().random();
        format!("{millis}-{noise:08x}")
    }

    fn inbox_dir(&self, user: &str) -> PathBuf {
        self.root.join(user).join("INBOX")
    }

    fn quarantine_dir(&self, user: &str) -> PathBuf {
        self.root.join(user).join("Quarantine")
    }

    #[must_use]
    pub fn message_path(&self, user: &str, id: &str) -> PathBuf {
        self.inbox_dir(user).join(format!("{id}.eml"))
    }

    fn flags_path(&self, user: &str) -> PathBuf {
        self.root.join(user).join("flags.txt")
    }

    /// Builds the delivery frame and writes it durably. Returns the id.
    ///
    /// # Errors
    ///
    /// See [`StoreError`]; on failure no file exists at the final path.
    pub fn store(&self, message: &StoredMessage) -> Result<String, StoreError> {
        if message.mailbox_user.is_empty() {
            return Err(StoreError::MissingUser);
        }

        let _guard = self.lock.lock();

        let inbox = self.inbox_dir(&message.mailbox_user);
        fs::create_dir_all(&inbox).map_err(|e| StoreError::io(&inbox, e))?;

        let id = Self::generate_id();
        let path = self.message_path(&message.mailbox_user, &id);

        let mut frame = Vec::with_capacity(message.raw.len() + 256);
        frame.extend_from_slice(format!("From: {}\r\n", message.from).as_bytes());
        for rcpt in &message.recipients {
            frame.extend_from_slice(format!("To: {rcpt}\r\n").as_bytes());
        }
        frame.extend_from_slice(format!("Message-ID: <{id}@{}>\r\n", self.domain).as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(&message.raw);

        write_atomic(&path, &frame)?;

        tracing::info!(
            user = %message.mailbox_user,
            %id,
            bytes = frame.len(),
            "stored message"
        );
        Ok(id)
    }

    /// Moves `INBOX/<id>.eml` into the user's Quarantine folder.
    ///
    /// # Errors
    ///
    /// `NotFound` when the message is gone, I/O errors otherwise.
    pub fn move_to_quarantine(&self, user: &str, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let src = self.message_path(user, id);
        if !src.exists() {
            return Err(StoreError::NotFound {
                user: user.to_string(),
                id: id.to_string(),
            });
        }

        let dir = self.quarantine_dir(user);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let dst = dir.join(format!("{id}.eml"));
        fs::rename(&src, &dst).map_err(|e| StoreError::io(&src, e))?;

        tracing::warn!(user, id, "quarantined message");
        Ok(())
    }

    /// # Errors
    ///
    /// `NotFound` when the message is gone, I/O errors otherwise.
    pub fn delete(&self, user: &str, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let path = self.message_path(user, id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                user: user.to_string(),
                id: id.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;

        tracing::warn!(user, id, "deleted message");
        Ok(())
    }

    fn load_flags(&self, user: &str) -> BTreeMap<String, BTreeSet<String>> {
        let mut flags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let Ok(content) = fs::read_to_string(self.flags_path(user)) else {
            return flags;
        };

        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let Some(id) = tokens.next() else { continue };
            flags
                .entry(id.to_string())
                .or_default()
                .extend(tokens.map(str::to_string));
        }
        flags
    }

    fn write_flags(
        &self,
        user: &str,
        flags: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), StoreError> {
        let mut content = String::new();
        for (id, set) in flags {
            content.push_str(id);
            for flag in set {
                content.push(' ');
                content.push_str(flag);
            }
            content.push('\n');
        }
        write_atomic(&self.flags_path(user), content.as_bytes())
    }

    /// Flags for one message, e.g. `\Seen`.
    #[must_use]
    pub fn flags(&self, user: &str, id: &str) -> Vec<String> {
        let _guard = self.lock.lock();
        self.load_flags(user)
            .remove(id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// I/O errors from the sidecar rewrite.
    pub fn add_flag(&self, user: &str, id: &str, flag: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut flags = self.load_flags(user);
        flags
            .entry(id.to_string())
            .or_default()
            .insert(flag.to_string());
        self.write_flags(user, &flags)
    }

    /// # Errors
    ///
    /// I/O errors from the sidecar rewrite.
    pub fn remove_flag(&self, user: &str, id: &str, flag: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut flags = self.load_flags(user);
        if let Some(set) = flags.get_mut(id) {
            set.remove(flag);
            if set.is_empty() {
                flags.remove(id);
            }
        }
        self.write_flags(user, &flags)
    }
}

/// write + fsync + rename; the final path either has the old content or all
/// of the new one.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));

    let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(content).map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}
