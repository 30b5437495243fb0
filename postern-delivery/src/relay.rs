//! Outbound relay: MX resolution plus one SMTP transaction per recipient
//! domain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use postern_dns::Lookup;
use postern_queue::QueueMessage;

use crate::client::{ClientError, Reply, SmtpClient};

const SMTP_PORT: u16 = 25;
const DEFAULT_RETRY_AFTER_SECS: u64 = 300;

/// The classification the retry worker acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub permanent: bool,
    pub reason: String,
    pub retry_after_secs: u64,
}

impl DeliveryResult {
    fn success() -> Self {
        Self {
            success: true,
            permanent: false,
            reason: String::new(),
            retry_after_secs: 0,
        }
    }

    fn permanent(reason: String) -> Self {
        Self {
            success: false,
            permanent: true,
            reason,
            retry_after_secs: 0,
        }
    }

    fn temporary(reason: String) -> Self {
        Self {
            success: false,
            permanent: false,
            reason,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }
    }
}

enum AttemptOutcome {
    Delivered,
    /// 5xx from the peer; no further hosts are tried.
    Rejected(String),
    /// 4xx or I/O trouble; the next host may do better.
    TryNext(String),
}

pub struct Relay {
    lookup: Arc<dyn Lookup>,
    helo_domain: String,
    timeout: Duration,
    port: u16,
}

impl Relay {
    #[must_use]
    pub fn new(lookup: Arc<dyn Lookup>, helo_domain: String) -> Self {
        Self {
            lookup,
            helo_domain,
            timeout: Duration::from_secs(30),
            port: SMTP_PORT,
        }
    }

    /// Test hook; real relays talk to port 25.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Delivers to every recipient domain of the message. The combined
    /// result is permanent as soon as any domain rejects permanently,
    /// otherwise temporary if any domain needs a retry.
    pub async fn deliver(&self, msg: &QueueMessage) -> DeliveryResult {
        let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rcpt in &msg.recipients {
            let Some((_, domain)) = rcpt.rsplit_once('@') else {
                return DeliveryResult::permanent(format!("malformed recipient '{rcpt}'"));
            };
            by_domain
                .entry(domain.to_ascii_lowercase())
                .or_default()
                .push(rcpt.clone());
        }

        let mut temp_reason = None;
        for (domain, recipients) in by_domain {
            let result = self
                .deliver_to_domain(&domain, &recipients, &msg.from, &msg.raw)
                .await;
            if result.permanent {
                return result;
            }
            if !result.success {
                temp_reason = Some(result.reason);
            }
        }

        match temp_reason {
            Some(reason) => DeliveryResult::temporary(reason),
            None => DeliveryResult::success(),
        }
    }

    /// Candidate hosts in MX-preference order; the bare domain (implicit
    /// MX) when no MX records exist.
    async fn candidate_hosts(&self, domain: &str) -> Result<Vec<String>, String> {
        match self.lookup.mx(domain).await {
            Ok(records) if !records.is_empty() => Ok(records
                .into_iter()
                .map(|r| r.exchange.trim_end_matches('.').to_string())
                .collect()),
            Ok(_) => Ok(vec![domain.to_string()]),
            Err(e) if e.is_temporary() => Err(format!("MX lookup for {domain} failed: {e}")),
            Err(_) => Ok(vec![domain.to_string()]),
        }
    }

    async fn deliver_to_domain(
        &self,
        domain: &str,
        recipients: &[String],
        from: &str,
        raw: &[u8],
    ) -> DeliveryResult {
        let hosts = match self.candidate_hosts(domain).await {
            Ok(hosts) => hosts,
            Err(reason) => return DeliveryResult::temporary(reason),
        };

        let mut last_reason = format!("no hosts reachable for {domain}");
        for host in hosts {
            match self.attempt(&host, recipients, from, raw).await {
                AttemptOutcome::Delivered => {
                    tracing::info!(domain, %host, "relayed");
                    return DeliveryResult::success();
                }
                AttemptOutcome::Rejected(reason) => {
                    tracing::warn!(domain, %host, %reason, "permanently rejected");
                    return DeliveryResult::permanent(reason);
                }
                AttemptOutcome::TryNext(reason) => {
                    tracing::debug!(domain, %host, %reason, "host failed, trying next");
                    last_reason = reason;
                }
            }
        }

        DeliveryResult::temporary(last_reason)
    }

    async fn attempt(
        &self,
        host: &str,
        recipients: &[String],
        from: &str,
        raw: &[u8],
    ) -> AttemptOutcome {
        match self.transact(host, recipients, from, raw).await {
            Ok(outcome) => outcome,
            Err(e) => AttemptOutcome::TryNext(format!("{host}: {e}")),
        }
    }

    fn classify(step: &str, reply: &Reply) -> AttemptOutcome {
        if reply.is_permanent() {
            AttemptOutcome::Rejected(format!(
                "{step} rejected: {} {}",
                reply.code,
                reply.message()
            ))
        } else {
            AttemptOutcome::TryNext(format!(
                "{step} deferred: {} {}",
                reply.code,
                reply.message()
            ))
        }
    }

    async fn transact(
        &self,
        host: &str,
        recipients: &[String],
        from: &str,
        raw: &[u8],
    ) -> Result<AttemptOutcome, ClientError> {
        let addr = format!("{host}:{}", self.port);
        let mut client = SmtpClient::connect(&addr, self.timeout).await?;

        let greeting = client.read_reply().await?;
        if !greeting.is_success() {
            return Ok(Self::classify("greeting", &greeting));
        }

        let ehlo = client.command(&format!("EHLO {}", self.helo_domain)).await?;
        if !ehlo.is_success() {
            return Ok(Self::classify("EHLO", &ehlo));
        }

        let mail = client.command(&format!("MAIL FROM:{from}")).await?;
        if !mail.is_success() {
            return Ok(Self::classify("MAIL FROM", &mail));
        }

        for rcpt in recipients {
            let reply = client.command(&format!("RCPT TO:<{rcpt}>")).await?;
            if !reply.is_success() {
                return Ok(Self::classify("RCPT TO", &reply));
            }
        }

        let data = client.command("DATA").await?;
        if !data.is_intermediate() {
            return Ok(Self::classify("DATA", &data));
        }

        let accepted = client.send_data(raw).await?;
        if !accepted.is_success() {
            return Ok(Self::classify("message", &accepted));
        }

        // A failed QUIT cannot un-deliver the message.
        let _ = client.command("QUIT").await;

        Ok(AttemptOutcome::Delivered)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use postern_dns::{DnsError, MxRecord};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct NoMx;

    #[async_trait]
    impl Lookup for NoMx {
        async fn txt(&self, _: &str) -> Result<Vec<String>, DnsError> {
            Ok(vec![])
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

    fn message(rcpt: &str) -> QueueMessage {
        QueueMessage {
            id: "test-1".to_string(),
            from: "<alice@example.org>".to_string(),
            recipients: vec![rcpt.to_string()],
            raw: b"Subject: hi\r\n\r\nbody\r\n".to_vec(),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn malformed_recipient_is_permanent() {
        let relay = Relay::new(Arc::new(NoMx), "mx.example.org".to_string());
        let result = relay.deliver(&message("no-at-sign")).await;
        assert!(!result.success);
        assert!(result.permanent);
    }

    #[tokio::test]
    async fn unreachable_host_is_temporary_with_retry_after() {
        // 192.0.2.0/24 is TEST-NET; connections fail fast or time out.
        let mut relay = Relay::new(Arc::new(NoMx), "mx.example.org".to_string());
        relay.timeout = Duration::from_millis(200);

        let result = relay.deliver(&message("bob@192.0.2.1")).await;
        assert!(!result.success);
        assert!(!result.permanent);
        assert_eq!(result.retry_after_secs, 300);
    }

    /// A scripted SMTP peer answering each step of the transaction.
    async fn scripted_server(listener: TcpListener, data_reply: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"220 peer ready\r\n").await.unwrap();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply: &[u8] = if line.starts_with("EHLO") {
                b"250-peer\r\n250 SIZE 1000000\r\n"
            } else if line.starts_with("MAIL") || line.starts_with("RCPT") {
                b"250 OK\r\n"
            } else if line == "DATA" {
                b"354 go\r\n"
            } else if line == "." {
                write.write_all(data_reply.as_bytes()).await.unwrap();
                continue;
            } else if line == "QUIT" {
                write.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                continue;
            };
            write.write_all(reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_transaction_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_server(listener, "250 queued\r\n"));

        let relay = Relay::new(Arc::new(NoMx), "mx.example.org".to_string()).with_port(port);
        let result = relay.deliver(&message("bob@127.0.0.1")).await;
        assert!(result.success, "{}", result.reason);
    }

    #[tokio::test]
    async fn permanent_rejection_stops_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_server(listener, "550 content rejected\r\n"));

        let relay = Relay::new(Arc::new(NoMx), "mx.example.org".to_string()).with_port(port);
        let result = relay.deliver(&message("bob@127.0.0.1")).await;
        assert!(!result.success);
        assert!(result.permanent);
        assert!(result.reason.contains("550"));
    }

    #[tokio::test]
    async fn classification_table() {
        let permanent = Reply {
            code: 550,
            lines: vec!["no".to_string()],
        };
        assert!(matches!(
            Relay::classify("RCPT TO", &permanent),
            AttemptOutcome::Rejected(_)
        ));

        let temporary = Reply {
            code: 451,
            lines: vec!["later".to_string()],
        };
        assert!(matches!(
            Relay::classify("MAIL FROM", &temporary),
            AttemptOutcome::TryNext(_)
        ));
    }
}
