//! One SMTP ingress session: command loop, SASL, DATA framing, and the
//! end-of-DATA acceptance pipeline.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use postern_auth::{Authenticator, DmarcPolicy};
use postern_common::Signal;
use postern_common::config::ServerConfig;
use postern_common::envelope::Envelope;
use postern_common::status::Status;
use postern_crypto::verify_password;
use postern_delivery::scan::{RetroIndex, ScanVerdict, ScannerSet};
use postern_metrics::Metrics;
use postern_mime::Verdict;
use postern_queue::{MailQueue, QueueError};
use postern_store::{MailStore, StoredMessage};

use crate::command::Command;
use crate::connection::{Connection, ConnectionError};
use crate::limits::RateLimiter;
use crate::sasl;
use crate::state::{Action, Gates, State, decide};

const INITIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Every process-wide handle a session needs, wired once at startup.
pub struct SessionServices {
    pub config: Arc<ServerConfig>,
    pub authenticator: Authenticator,
    /// user → stored password hash.
    pub users: BTreeMap<String, String>,
    pub queue: Arc<MailQueue>,
    pub store: Arc<MailStore>,
    pub scanners: Arc<ScannerSet>,
    pub retro: Arc<RetroIndex>,
    pub metrics: Arc<Metrics>,
    pub limiter: Arc<RateLimiter>,
    pub tls_acceptor: Option<TlsAcceptor>,
}

enum Flow {
    Continue,
    Quit,
}

enum DataOutcome {
    Message(Vec<u8>),
    Oversize,
    Disconnected,
    Timeout,
}

pub struct Session {
    id: u64,
    peer: SocketAddr,
    services: Arc<SessionServices>,
    state: State,
    helo_domain: String,
    authenticated_user: Option<String>,
    envelope: Envelope,
}

impl Session {
    #[must_use]
    pub fn new(id: u64, peer: SocketAddr, services: Arc<SessionServices>) -> Self {
        Self {
            id,
            peer,
            services,
            state: State::default(),
            helo_domain: String::new(),
            authenticated_user: None,
            envelope: Envelope::default(),
        }
    }

    fn gates(&self, tls_active: bool) -> Gates {
        Gates {
            tls_active,
            authenticated: self.authenticated_user.is_some(),
            require_starttls: self.services.config.require_starttls,
            tls_required: self.services.config.tls_required,
            tls_available: self.services.tls_acceptor.is_some(),
        }
    }

    fn command_timeout(&self) -> Duration {
        match self.state {
            State::Connected => INITIAL_TIMEOUT,
            _ => Duration::from_secs(self.services.config.smtp_timeout),
        }
    }

    async fn reply<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &self,
        connection: &mut Connection<S>,
        status: Status,
        text: &str,
    ) -> Result<(), ConnectionError> {
        let line = format!("{status} {text}");
        tracing::trace!(session = self.id, ">> {line}");
        connection.send_line(&line).await
    }

    /// Drives the session to completion. The connection is closed on
    /// return; the caller releases ledger and rate-limiter accounting.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin + Send>(
        mut self,
        mut connection: Connection<S>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let started = Instant::now();
        self.services.metrics.session_started();
        tracing::debug!(session = self.id, peer = %self.peer, tls = connection.is_tls(), "connected");

        let result = self.serve(&mut connection, &mut shutdown).await;
        match result {
            Ok(()) => {}
            Err(ConnectionError::LineTooLong) => {
                let _ = self
                    .reply(&mut connection, Status::SyntaxError, "Line too long")
                    .await;
            }
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "session I/O ended");
            }
        }

        self.services.metrics.session_finished(started.elapsed());
        self.services.limiter.session_closed(self.id);
        tracing::debug!(session = self.id, "disconnected");
    }

    async fn serve<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
        shutdown: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), ConnectionError> {
        self.reply(
            connection,
            Status::ServiceReady,
            &format!("{} ESMTP ready", self.services.config.domain),
        )
        .await?;

        loop {
            let line = tokio::select! {
                _ = shutdown.recv() => {
                    let _ = self
                        .reply(connection, Status::Unavailable, "Server shutting down")
                        .await;
                    return Ok(());
                }
                read = tokio::time::timeout(self.command_timeout(), connection.read_line()) => {
                    match read {
                        Err(_) => {
                            self.reply(
                                connection,
                                Status::Unavailable,
                                "Timeout - closing connection",
                            )
                            .await?;
                            return Ok(());
                        }
                        Ok(result) => match result? {
                            None => return Ok(()),
                            Some(line) => line,
                        },
                    }
                }
            };

            if line.is_empty() {
                continue;
            }
            tracing::trace!(session = self.id, "<< {line}");

            if !self.services.limiter.allow_command(self.id) {
                self.reply(connection, Status::Unavailable, "Too many commands")
                    .await?;
                return Ok(());
            }

            let command = Command::try_from(line.as_str()).unwrap_or_else(|invalid| invalid);
            match self.handle(connection, command).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn handle<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
        command: Command,
    ) -> Result<Flow, ConnectionError> {
        let action = decide(self.state, command, &self.gates(connection.is_tls()));

        match action {
            Action::Reply(status, text) => {
                self.reply(connection, status, text).await?;
            }

            Action::Greet { domain, extended } => {
                self.helo_domain = domain;
                self.envelope.clear();
                self.state = State::Greeted;

                if extended {
                    self.send_capabilities(connection).await?;
                } else {
                    let domain = self.services.config.domain.clone();
                    self.reply(connection, Status::Ok, &domain).await?;
                }
            }

            Action::UpgradeTls => {
                // The acceptor is present, or decide() would have refused.
                let Some(acceptor) = self.services.tls_acceptor.clone() else {
                    self.reply(connection, Status::TlsNotAvailable, "TLS not available")
                        .await?;
                    return Ok(Flow::Continue);
                };
                return self.upgrade_tls(connection, &acceptor).await;
            }

            Action::Authenticate { mechanism, initial } => {
                return self.authenticate(connection, &mechanism, initial).await;
            }

            Action::AcceptMail(sender) => {
                *self.envelope.sender_mut() = sender;
                self.state = State::MailFrom;
                self.reply(connection, Status::Ok, "OK").await?;
            }

            Action::AcceptRcpt(rcpt) => {
                self.envelope.push_recipient(rcpt);
                self.state = State::RcptTo;
                self.reply(connection, Status::Ok, "OK").await?;
            }

            Action::BeginData => {
                self.state = State::Data;
                self.reply(
                    connection,
                    Status::StartMailInput,
                    "End data with <CR><LF>.<CR><LF>",
                )
                .await?;

                match self.receive_data(connection).await? {
                    DataOutcome::Disconnected => return Ok(Flow::Quit),
                    DataOutcome::Timeout => {
                        self.reply(connection, Status::Unavailable, "Timeout - closing connection")
                            .await?;
                        return Ok(Flow::Quit);
                    }
                    DataOutcome::Oversize => {
                        self.reply(
                            connection,
                            Status::ExceededStorage,
                            "Message size exceeds maximum permitted",
                        )
                        .await?;
                        self.end_transaction();
                    }
                    DataOutcome::Message(raw) => {
                        self.accept_message(connection, raw).await?;
                        self.end_transaction();
                    }
                }
            }

            Action::Reset => {
                self.envelope.clear();
                self.authenticated_user = None;
                self.state = State::Greeted;
                self.reply(connection, Status::Ok, "OK").await?;
            }

            Action::Noop => {
                self.reply(connection, Status::Ok, "OK").await?;
            }

            Action::Help => {
                self.reply(
                    connection,
                    Status::HelpMessage,
                    "Commands: EHLO HELO STARTTLS AUTH MAIL RCPT DATA RSET NOOP HELP QUIT",
                )
                .await?;
            }

            Action::Quit => {
                self.reply(connection, Status::GoodBye, "Bye").await?;
                return Ok(Flow::Quit);
            }
        }

        Ok(Flow::Continue)
    }

    /// End-of-DATA and RSET both land here: the envelope is gone, the
    /// session stays greeted (and authenticated, where it was).
    fn end_transaction(&mut self) {
        self.envelope.clear();
        self.state = State::Greeted;
    }

    async fn send_capabilities<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &self,
        connection: &mut Connection<S>,
    ) -> Result<(), ConnectionError> {
        let config = &self.services.config;
        let mut capabilities = vec![
            config.domain.clone(),
            "PIPELINING".to_string(),
            format!("SIZE {}", config.max_message_size),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
        ];
        if !connection.is_tls() && self.services.tls_acceptor.is_some() {
            capabilities.push("STARTTLS".to_string());
        }
        if connection.is_tls() {
            capabilities.push("AUTH PLAIN LOGIN".to_string());
        }
        capabilities.push("HELP".to_string());

        let last = capabilities.len() - 1;
        for (idx, capability) in capabilities.iter().enumerate() {
            let separator = if idx == last { ' ' } else { '-' };
            let line = format!("{}{separator}{capability}", Status::Ok);
            tracing::trace!(session = self.id, ">> {line}");
            connection.send_line(&line).await?;
        }
        Ok(())
    }

    async fn upgrade_tls<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
        acceptor: &TlsAcceptor,
    ) -> Result<Flow, ConnectionError> {
        self.reply(connection, Status::ServiceReady, "Ready to start TLS")
            .await?;

        match connection.upgrade_in_place(acceptor).await {
            Ok(info) => {
                self.services.metrics.inc_tls_handshakes();
                tracing::info!(
                    session = self.id,
                    protocol = info.protocol(),
                    cipher = info.cipher(),
                    "TLS established"
                );

                // RFC 3207: the handshake wipes every bit of protocol state.
                self.state = State::Greeted;
                self.helo_domain.clear();
                self.authenticated_user = None;
                self.envelope.clear();
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "TLS handshake failed");
                let _ = self
                    .reply(connection, Status::TlsNotAvailable, "TLS negotiation failed")
                    .await;
                Ok(Flow::Quit)
            }
        }
    }

    async fn read_auth_token<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &self,
        connection: &mut Connection<S>,
        prompt: &str,
    ) -> Result<Option<String>, ConnectionError> {
        self.reply(connection, Status::AuthContinue, prompt).await?;

        let read = tokio::time::timeout(self.command_timeout(), connection.read_line()).await;
        match read {
            Err(_) | Ok(Ok(None)) => Ok(None),
            Ok(Ok(Some(line))) => Ok(Some(line)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn authenticate<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Flow, ConnectionError> {
        if !self.services.limiter.allow_auth(self.peer.ip()) {
            self.reply(
                connection,
                Status::Unavailable,
                "Too many authentication failures",
            )
            .await?;
            return Ok(Flow::Quit);
        }

        let credentials = match mechanism {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => match self.read_auth_token(connection, "").await? {
                        Some(line) => line,
                        None => return Ok(Flow::Quit),
                    },
                };
                if payload == "*" {
                    self.reply(connection, Status::ArgumentError, "Authentication cancelled")
                        .await?;
                    return Ok(Flow::Continue);
                }
                sasl::decode_plain(&payload)
            }

            "LOGIN" => {
                let username = match initial {
                    Some(token) => sasl::decode_login_token(&token),
                    None => match self
                        .read_auth_token(connection, sasl::LOGIN_USERNAME_PROMPT)
                        .await?
                    {
                        Some(line) => sasl::decode_login_token(&line),
                        None => return Ok(Flow::Quit),
                    },
                };
                let password = match self
                    .read_auth_token(connection, sasl::LOGIN_PASSWORD_PROMPT)
                    .await?
                {
                    Some(line) => sasl::decode_login_token(&line),
                    None => return Ok(Flow::Quit),
                };
                match (username, password) {
                    (Some(user), Some(pass)) => Some((user, pass)),
                    _ => None,
                }
            }

            _ => {
                self.reply(
                    connection,
                    Status::ParameterNotImplemented,
                    "Unrecognized authentication mechanism",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        };

        let Some((user, password)) = credentials else {
            self.auth_failed(connection, "malformed credentials").await?;
            return Ok(Flow::Continue);
        };

        let valid = self
            .services
            .users
            .get(&user)
            .is_some_and(|stored| verify_password(&password, stored));

        if valid {
            tracing::info!(session = self.id, %user, "authenticated");
            self.authenticated_user = Some(user);
            self.reply(connection, Status::AuthSuccessful, "Authentication successful")
                .await?;
        } else {
            self.auth_failed(connection, "bad credentials").await?;
        }
        Ok(Flow::Continue)
    }

    async fn auth_failed<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &self,
        connection: &mut Connection<S>,
        why: &str,
    ) -> Result<(), ConnectionError> {
        tracing::warn!(session = self.id, peer = %self.peer, why, "authentication failed");
        self.services.limiter.record_auth_failure(self.peer.ip());
        self.services.metrics.inc_auth_failures();
        self.reply(connection, Status::AuthFailed, "Authentication failed")
            .await
    }

    /// Reads until the lone-dot terminator, reversing dot-stuffing. Bytes
    /// past `max_message_size` are discarded but the stream is still
    /// drained to the terminator so the 552 lands on a clean boundary.
    async fn receive_data<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
    ) -> Result<DataOutcome, ConnectionError> {
        let max = self.services.config.max_message_size;
        let timeout = Duration::from_secs(self.services.config.data_timeout);

        let mut body: Vec<u8> = Vec::new();
        let mut total = 0usize;
        let mut oversize = false;

        loop {
            let line = match tokio::time::timeout(timeout, connection.read_line()).await {
                Err(_) => return Ok(DataOutcome::Timeout),
                Ok(result) => match result? {
                    None => return Ok(DataOutcome::Disconnected),
                    Some(line) => line,
                },
            };

            if line == "." {
                return Ok(if oversize {
                    DataOutcome::Oversize
                } else {
                    DataOutcome::Message(body)
                });
            }

            let line = line.strip_prefix('.').unwrap_or(&line);
            total += line.len() + 2;
            if total > max {
                oversize = true;
                body.clear();
                continue;
            }

            body.extend_from_slice(line.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
    }

    /// The end-of-DATA acceptance pipeline: authenticity checks, header
    /// stamping, scanning, attachment policy, store, enqueue. The 250 is
    /// only sent after both the store and the queue write are durable.
    async fn accept_message<S: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        connection: &mut Connection<S>,
        raw: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let services = Arc::clone(&self.services);
        let config = &services.config;

        let (header_bytes, body_bytes) = postern_mime::split_raw_headers(&raw);
        let headers = String::from_utf8_lossy(header_bytes).into_owned();
        let body = String::from_utf8_lossy(body_bytes).into_owned();

        // Authenticity pipeline: SPF over the envelope, DKIM over the
        // message, DMARC over both.
        let results = services
            .authenticator
            .verify_inbound(
                self.peer.ip(),
                &self.envelope.reverse_path(),
                &self.helo_domain,
                &headers,
                &body,
            )
            .await;

        let mut quarantine = false;
        match results.dmarc.policy {
            DmarcPolicy::Reject => {
                tracing::warn!(session = self.id, "dmarc reject");
                return self
                    .reply(connection, Status::Rejected, "Message rejected")
                    .await;
            }
            DmarcPolicy::Quarantine => quarantine = true,
            DmarcPolicy::None => {}
        }

        let mut stamped =
            Vec::with_capacity(raw.len() + 128);
        stamped.extend_from_slice(
            results
                .to_header_line(config.authserv_id())
                .as_bytes(),
        );
        stamped.extend_from_slice(&raw);

        // Virus scan; an unreachable scanner defers, a hit rejects.
        if config.scan_enabled && !services.scanners.is_empty() {
            match services.scanners.scan(&stamped).await {
                ScanVerdict::Infected { signature } => {
                    tracing::warn!(session = self.id, %signature, "virus rejected");
                    services.metrics.inc_virus_rejected();
                    return self
                        .reply(connection, Status::Rejected, "Message rejected - virus detected")
                        .await;
                }
                ScanVerdict::Unavailable => {
                    return self
                        .reply(
                            connection,
                            Status::ActionAborted,
                            "Virus scanner unavailable - try again later",
                        )
                        .await;
                }
                ScanVerdict::Clean => {}
            }
        }

        // MIME decomposition and the attachment policy.
        match postern_mime::parse(&stamped) {
            Ok(message) => {
                let decision = postern_mime::evaluate(&message);
                match decision.verdict {
                    Verdict::Reject => {
                        return self
                            .reply(connection, Status::Rejected, &decision.reason)
                            .await;
                    }
                    Verdict::Quarantine => quarantine = true,
                    Verdict::Allow => {}
                }
            }
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "unparsable MIME accepted as-is");
            }
        }

        // Local copy for the first recipient's mailbox.
        let Some(first_rcpt) = self.envelope.recipients().first() else {
            return self
                .reply(connection, Status::ActionAborted, "Internal error - no recipients")
                .await;
        };
        let mailbox_user = first_rcpt.local_part().to_string();
        let recipients: Vec<String> = self
            .envelope
            .recipients()
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();

        let stored = StoredMessage {
            from: self.envelope.reverse_path(),
            recipients: recipients.clone(),
            mailbox_user: mailbox_user.clone(),
            raw: stamped.clone(),
        };
        let store_id = match services.store.store(&stored) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session = self.id, error = %e, "store failed");
                return self
                    .reply(connection, Status::ActionAborted, "Internal error - storage failed")
                    .await;
            }
        };

        if quarantine && let Err(e) = services.store.move_to_quarantine(&mailbox_user, &store_id) {
            tracing::error!(session = self.id, error = %e, "quarantine move failed");
        }

        // Durable queue entry for the relay path.
        let queue_id = match services.queue.enqueue(
            &self.envelope.reverse_path(),
            &recipients,
            &stamped,
        ) {
            Ok(id) => id,
            Err(QueueError::Full { .. }) => {
                return self
                    .reply(
                        connection,
                        Status::InsufficientStorage,
                        "Queue full - try again later",
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!(session = self.id, error = %e, "enqueue failed");
                return self
                    .reply(connection, Status::ActionAborted, "Internal error - queueing failed")
                    .await;
            }
        };

        if !quarantine {
            services.retro.record(&queue_id, &mailbox_user, &store_id);
        }

        services.metrics.inc_messages_received();
        tracing::info!(
            session = self.id,
            %queue_id,
            %store_id,
            user = %mailbox_user,
            "message accepted"
        );
        self.reply(connection, Status::Ok, "Message accepted for delivery")
            .await
    }
}
