//! End-to-end session flows over an in-memory stream: greeting through
//! accepted delivery, policy rejections, and the TLS/auth gating rules.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::broadcast;

use postern_auth::Authenticator;
use postern_common::Signal;
use postern_common::config::ServerConfig;
use postern_crypto::hash_password;
use postern_delivery::scan::{RetroIndex, ScannerSet};
use postern_dns::{DnsError, Lookup, MxRecord};
use postern_metrics::Metrics;
use postern_queue::MailQueue;
use postern_smtp::limits::{LimitsConfig, RateLimiter};
use postern_smtp::session::{Session, SessionServices};
use postern_smtp::Connection;
use postern_store::MailStore;

#[derive(Debug, Default)]
struct StubLookup {
    txt: HashMap<String, Vec<String>>,
}

impl StubLookup {
    fn with_txt(mut self, name: &str, value: &str) -> Self {
        self.txt
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }
}

#[async_trait]
impl Lookup for StubLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        Ok(self.txt.get(name).cloned().unwrap_or_default())
    }
    async fn a(&self, _: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        Ok(vec![])
    }
    async fn aaaa(&self, _: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        Ok(vec![])
    }
    async fn mx(&self, _: &str) -> Result<Vec<MxRecord>, DnsError> {
        Ok(vec![])
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    services: Arc<SessionServices>,
    shutdown: broadcast::Sender<Signal>,
}

fn harness(lookup: StubLookup, config_extra: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let overridden_keys: Vec<&str> = config_extra
        .lines()
        .filter_map(|line| line.split('=').next())
        .map(|key| key.trim())
        .collect();
    let base = ["domain = \"example.org\"", "require_starttls = false", "scan_enabled = false"]
        .into_iter()
        .filter(|line| {
            let key = line.split('=').next().unwrap().trim();
            !overridden_keys.contains(&key)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let config: ServerConfig =
        toml::from_str(&format!("{base}\n{config_extra}")).unwrap();
    config.validate().unwrap();

    let mut users = BTreeMap::new();
    users.insert("alice".to_string(), hash_password("s3cret"));

    let queue = Arc::new(MailQueue::open(dir.path().join("queue"), 100).unwrap());
    let store = Arc::new(MailStore::new(
        dir.path().join("mail"),
        "example.org".to_string(),
    ));

    let services = Arc::new(SessionServices {
        config: Arc::new(config),
        authenticator: Authenticator::new(Arc::new(lookup)),
        users,
        queue,
        store,
        scanners: Arc::new(ScannerSet::new()),
        retro: Arc::new(RetroIndex::new()),
        metrics: Arc::new(Metrics::new()),
        limiter: Arc::new(RateLimiter::new(LimitsConfig::default())),
        tls_acceptor: None,
    });

    let (shutdown, _) = broadcast::channel(4);
    Harness {
        _dir: dir,
        services,
        shutdown,
    }
}

struct Client {
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    /// Reads one complete (possibly multi-line) reply; returns the code and
    /// all lines.
    async fn reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");
            let line = line.trim_end().to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                break;
            }
        }
        let code = lines[0][..3].parse().unwrap();
        (code, lines)
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn expect(&mut self, line: &str, code: u16) -> Vec<String> {
        self.send(line).await;
        let (got, lines) = self.reply().await;
        assert_eq!(got, code, "{line} -> {lines:?}");
        lines
    }
}

fn start_session(harness: &Harness) -> Client {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let session = Session::new(
        7,
        "203.0.113.5:4711".parse().unwrap(),
        Arc::clone(&harness.services),
    );
    let shutdown = harness.shutdown.subscribe();
    tokio::spawn(async move {
        session.run(Connection::plain(server_side), shutdown).await;
    });

    let (read, writer) = tokio::io::split(client_side);
    Client {
        reader: BufReader::new(read),
        writer,
    }
}

const AUTH_PLAIN_ALICE: &str = "AUTH PLAIN AGFsaWNlAHMzY3JldA=="; // \0alice\0s3cret

#[tokio::test]
async fn happy_path_delivery() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);

    let (code, greeting) = client.reply().await;
    assert_eq!(code, 220);
    assert!(greeting[0].contains("example.org ESMTP ready"));

    let capabilities = client.expect("EHLO smtp.example.org", 250).await;
    let joined = capabilities.join("\n");
    assert!(joined.contains("PIPELINING"));
    assert!(joined.contains("SIZE"));
    assert!(joined.contains("8BITMIME"));
    assert!(joined.contains("SMTPUTF8"));
    assert!(joined.contains("HELP"));
    // No TLS context configured: STARTTLS is not advertised.
    assert!(!joined.contains("STARTTLS"));

    client.expect(AUTH_PLAIN_ALICE, 235).await;
    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    client.expect("RCPT TO:<bob@example.net>", 250).await;
    client.expect("DATA", 354).await;

    client.send("Subject: hi").await;
    client.send("").await;
    client.send("body").await;
    let lines = client.expect(".", 250).await;
    assert!(lines[0].contains("Message accepted for delivery"));

    client.expect("QUIT", 221).await;

    // One file in active/, already stamped with Authentication-Results.
    assert_eq!(harness.services.queue.depth(), 1);
    let queued = harness.services.queue.fetch_ready().unwrap().unwrap();
    assert_eq!(queued.from, "<alice@example.org>");
    assert_eq!(queued.recipients, vec!["bob@example.net".to_string()]);
    let raw = String::from_utf8(queued.raw).unwrap();
    assert!(raw.starts_with("Authentication-Results: example.org;"));
    assert!(raw.contains("Subject: hi"));

    assert_eq!(harness.services.metrics.messages_received(), 1);
}

#[tokio::test]
async fn oversize_message_gets_552_and_no_queue_entry() {
    let harness = harness(StubLookup::default(), "max_message_size = 1024");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;
    client.expect(AUTH_PLAIN_ALICE, 235).await;
    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    client.expect("RCPT TO:<bob@example.net>", 250).await;
    client.expect("DATA", 354).await;

    for _ in 0..40 {
        client.send(&"x".repeat(60)).await;
    }
    let lines = client.expect(".", 552).await;
    assert!(lines[0].contains("Message size exceeds maximum permitted"));

    assert_eq!(harness.services.queue.depth(), 0);
    assert_eq!(harness.services.metrics.messages_received(), 0);

    // The session survives and a fresh, smaller transaction works.
    client.expect("MAIL FROM:<alice@example.org>", 250).await;
}

#[tokio::test]
async fn dmarc_reject_refuses_the_message() {
    let lookup = StubLookup::default()
        .with_txt("bad.example", "v=spf1 -all")
        .with_txt("_dmarc.bad.example", "v=DMARC1; p=reject");
    let harness = harness(lookup, "");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;
    client.expect(AUTH_PLAIN_ALICE, 235).await;
    client.expect("MAIL FROM:<spoof@bad.example>", 250).await;
    client.expect("RCPT TO:<bob@example.net>", 250).await;
    client.expect("DATA", 354).await;

    client.send("From: spoof@bad.example").await;
    client.send("Subject: spoofed").await;
    client.send("").await;
    client.send("body").await;
    let lines = client.expect(".", 550).await;
    assert!(lines[0].contains("Message rejected"));

    assert_eq!(harness.services.queue.depth(), 0);
    assert_eq!(harness.services.metrics.messages_received(), 0);
}

#[tokio::test]
async fn auth_is_gated_behind_starttls_when_required() {
    let harness = harness(StubLookup::default(), "require_starttls = true");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;

    let lines = client.expect(AUTH_PLAIN_ALICE, 530).await;
    assert!(lines[0].contains("Must issue STARTTLS first"));

    // And the envelope is gated behind authentication.
    let lines = client.expect("MAIL FROM:<alice@example.org>", 530).await;
    assert!(lines[0].contains("Authentication required"));
}

#[tokio::test]
async fn command_sequencing_is_enforced() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("MAIL FROM:<alice@example.org>", 503).await;
    client.expect("DATA", 503).await;
    client.expect("EHLO x", 250).await;
    client.expect("DATA", 503).await;
    client.expect("VRFY alice", 502).await;
    client.expect("NOOP", 250).await;
    client.expect("RSET", 250).await;
    client.expect("QUIT", 221).await;
}

#[tokio::test]
async fn bad_credentials_get_535_and_count_failures() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;
    // \0alice\0wrong
    client.expect("AUTH PLAIN AGFsaWNlAHdyb25n", 535).await;
    client.expect("AUTH PLAIN !!!garbage!!!", 535).await;

    // The session itself keeps going.
    client.expect("NOOP", 250).await;
}

#[tokio::test]
async fn auth_login_exchange() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;
    client.send("AUTH LOGIN").await;
    let (code, lines) = client.reply().await;
    assert_eq!(code, 334);
    assert!(lines[0].contains("VXNlcm5hbWU6"));

    client.send("YWxpY2U=").await; // alice
    let (code, lines) = client.reply().await;
    assert_eq!(code, 334);
    assert!(lines[0].contains("UGFzc3dvcmQ6"));

    client.send("czNjcmV0").await; // s3cret
    let (code, _) = client.reply().await;
    assert_eq!(code, 235);
}

#[tokio::test]
async fn quarantined_attachment_is_accepted_but_diverted() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);
    client.reply().await;

    client.expect("EHLO x", 250).await;
    client.expect(AUTH_PLAIN_ALICE, 235).await;
    client.expect("MAIL FROM:<alice@example.org>", 250).await;
    client.expect("RCPT TO:<bob@example.org>", 250).await;
    client.expect("DATA", 354).await;

    for line in [
        "Content-Type: multipart/mixed; boundary=b",
        "",
        "--b",
        "Content-Type: application/octet-stream",
        "Content-Disposition: attachment; filename=\"odd.bin\"",
        "",
        "payload",
        "--b--",
    ] {
        client.send(line).await;
    }
    client.expect(".", 250).await;

    // Stored, but into Quarantine rather than INBOX.
    let mail_root = harness.services.store.message_path("bob", "probe");
    let user_dir = mail_root.parent().unwrap().parent().unwrap();
    let inbox: Vec<_> = std::fs::read_dir(user_dir.join("INBOX"))
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    let quarantine: Vec<_> = std::fs::read_dir(user_dir.join("Quarantine"))
        .unwrap()
        .flatten()
        .collect();
    assert!(inbox.is_empty());
    assert_eq!(quarantine.len(), 1);

    // Still queued for relay.
    assert_eq!(harness.services.queue.depth(), 1);
}

#[tokio::test]
async fn shutdown_signal_ends_the_session_with_421() {
    let harness = harness(StubLookup::default(), "");
    let mut client = start_session(&harness);
    client.reply().await;

    harness.shutdown.send(Signal::Shutdown).unwrap();

    let (code, lines) = client.reply().await;
    assert_eq!(code, 421);
    assert!(lines[0].contains("shutting down"));
}
