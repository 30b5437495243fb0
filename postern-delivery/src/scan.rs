//! Content scanning providers.
//!
//! Scanners are a capability set: anything that can answer
//! `scan(hash, raw) → verdict` can be registered at startup. The default
//! provider speaks the clamd INSTREAM protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use postern_store::MailStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { signature: String },
    Unavailable,
}

/// SHA-256 of the raw message, handed to providers that key verdicts by
/// content hash.
#[must_use]
pub fn content_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;
    async fn scan(&self, sha256: &str, raw: &[u8]) -> ScanVerdict;
}

/// clamd INSTREAM client: `zINSTREAM\0`, big-endian length-prefixed chunks,
/// zero terminator, one reply line.
#[derive(Debug)]
pub struct ClamAvScanner {
    addr: String,
    timeout: Duration,
}

impl ClamAvScanner {
    #[must_use]
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(10),
        }
    }

    async fn instream(&self, raw: &[u8]) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.addr).await?;

        stream.write_all(b"zINSTREAM\0").await?;
        stream
            .write_all(&(raw.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(raw).await?;
        stream.write_all(&0u32.to_be_bytes()).await?;

        let mut reply = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
            if reply.contains(&0) || reply.len() >= 1024 {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&reply).trim_matches('\0').trim().to_string())
    }
}

#[async_trait]
impl Scanner for ClamAvScanner {
    fn name(&self) -> &str {
        "clamav"
    }

    async fn scan(&self, _sha256: &str, raw: &[u8]) -> ScanVerdict {
        let reply = match tokio::time::timeout(self.timeout, self.instream(raw)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(addr = %self.addr, error = %e, "clamav unreachable");
                return ScanVerdict::Unavailable;
            }
            Err(_) => {
                tracing::warn!(addr = %self.addr, "clamav scan timed out");
                return ScanVerdict::Unavailable;
            }
        };

        if reply.contains("FOUND") {
            ScanVerdict::Infected { signature: reply }
        } else if reply.contains("OK") {
            ScanVerdict::Clean
        } else {
            ScanVerdict::Unavailable
        }
    }
}

/// The registered providers. Built during startup; never mutated after.
#[derive(Default)]
pub struct ScannerSet {
    providers: Vec<Arc<dyn Scanner>>,
}

impl ScannerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scanner: Arc<dyn Scanner>) {
        tracing::info!(scanner = scanner.name(), "registered scanner");
        self.providers.push(scanner);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Any infection wins; otherwise any unavailable provider makes the
    /// whole answer unavailable. No providers means scanning is off.
    pub async fn scan(&self, raw: &[u8]) -> ScanVerdict {
        let hash = content_hash(raw);
        let mut unavailable = false;

        for provider in &self.providers {
            match provider.scan(&hash, raw).await {
                ScanVerdict::Infected { signature } => {
                    tracing::warn!(scanner = provider.name(), %signature, "infected content");
                    return ScanVerdict::Infected { signature };
                }
                ScanVerdict::Unavailable => unavailable = true,
                ScanVerdict::Clean => {}
            }
        }

        if unavailable {
            ScanVerdict::Unavailable
        } else {
            ScanVerdict::Clean
        }
    }
}

/// Maps queue ids to the stored copy a late verdict must act on.
///
/// Sessions insert after a successful store+enqueue; the retry worker's
/// scan task consumes entries when a provider flags the content after the
/// fact. The chosen retroactive action is move-to-quarantine.
#[derive(Debug, Default)]
pub struct RetroIndex {
    entries: DashMap<String, StoredCopy>,
}

#[derive(Debug, Clone)]
pub struct StoredCopy {
    pub user: String,
    pub store_id: String,
}

impl RetroIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, queue_id: &str, user: &str, store_id: &str) {
        self.entries.insert(
            queue_id.to_string(),
            StoredCopy {
                user: user.to_string(),
                store_id: store_id.to_string(),
            },
        );
    }

    pub fn forget(&self, queue_id: &str) {
        self.entries.remove(queue_id);
    }

    /// Applies the retroactive quarantine for `queue_id`, if a stored copy
    /// is still known.
    pub fn quarantine(&self, store: &MailStore, queue_id: &str) {
        let Some((_, copy)) = self.entries.remove(queue_id) else {
            return;
        };

        match store.move_to_quarantine(&copy.user, &copy.store_id) {
            Ok(()) => {
                tracing::warn!(
                    queue_id,
                    user = %copy.user,
                    store_id = %copy.store_id,
                    "retroactively quarantined stored copy"
                );
            }
            Err(e) => {
                tracing::error!(queue_id, error = %e, "retroactive quarantine failed");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixedScanner(ScanVerdict);

    #[async_trait]
    impl Scanner for FixedScanner {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn scan(&self, _sha256: &str, _raw: &[u8]) -> ScanVerdict {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn empty_set_is_clean() {
        assert_eq!(ScannerSet::new().scan(b"x").await, ScanVerdict::Clean);
    }

    #[tokio::test]
    async fn infection_wins_over_unavailable() {
        let mut set = ScannerSet::new();
        set.register(Arc::new(FixedScanner(ScanVerdict::Unavailable)));
        set.register(Arc::new(FixedScanner(ScanVerdict::Infected {
            signature: "Eicar-Test".to_string(),
        })));

        assert!(matches!(
            set.scan(b"x").await,
            ScanVerdict::Infected { .. }
        ));
    }

    #[tokio::test]
    async fn unavailable_poisons_clean() {
        let mut set = ScannerSet::new();
        set.register(Arc::new(FixedScanner(ScanVerdict::Clean)));
        set.register(Arc::new(FixedScanner(ScanVerdict::Unavailable)));

        assert_eq!(set.scan(b"x").await, ScanVerdict::Unavailable);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[test]
    fn retro_index_quarantines_known_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailStore::new(dir.path().to_path_buf(), "example.org".to_string());
        let store_id = store
            .store(&postern_store::StoredMessage {
                from: "a@example.org".to_string(),
                recipients: vec!["bob@example.org".to_string()],
                mailbox_user: "bob".to_string(),
                raw: b"x".to_vec(),
            })
            .unwrap();

        let index = RetroIndex::new();
        index.record("queue-1", "bob", &store_id);
        index.quarantine(&store, "queue-1");

        assert!(!store.message_path("bob", &store_id).exists());
        // Entry consumed; a second call is a no-op.
        index.quarantine(&store, "queue-1");
    }
}
