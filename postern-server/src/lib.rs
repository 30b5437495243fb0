//! Lifecycle coordination.
//!
//! Startup walks the phases `Config → Logging → Tls → Storage → Services →
//! Servers` in order; a failure anywhere returns the error and drops
//! whatever was already built (locks and sockets release on drop). Shutdown
//! is three-phased: stop accepting, drain active sessions up to the
//! configured bound, then stop background services in reverse start order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use postern_auth::Authenticator;
use postern_common::config::ServerConfig;
use postern_common::{Signal, logging};
use postern_crypto::TlsSettings;
use postern_delivery::scan::{ClamAvScanner, RetroIndex, ScannerSet};
use postern_delivery::{LeaderLock, Relay, RetryWorker};
use postern_dns::{DnsConfig, Resolver};
use postern_metrics::{AdminServer, AdminState, HealthState, Metrics, Readiness};
use postern_queue::MailQueue;
use postern_smtp::limits::{ConnectionLedger, LimitsConfig, RateLimiter};
use postern_smtp::session::SessionServices;
use postern_smtp::SmtpServer;
use postern_store::MailStore;

const DRAIN_POLL: Duration = Duration::from_millis(100);

pub struct Server {
    config: Arc<ServerConfig>,
}

impl Server {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Brings the whole system up, serves until a termination signal, then
    /// drains and stops.
    ///
    /// # Errors
    ///
    /// Any startup-phase failure; the phases already completed unwind by
    /// drop.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config;

        // Phase: Logging.
        logging::init(config.log_level, &config.log_file).context("logging init failed")?;
        tracing::info!(domain = %config.domain, "starting postern");

        // Phase: Tls.
        let tls_acceptor = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => {
                let settings = TlsSettings {
                    certificate: cert.clone(),
                    key: key.clone(),
                    min_version: config.min_tls_version,
                };
                let server_config = settings.server_config().context("TLS init failed")?;
                tracing::info!(cert = %cert.display(), "TLS context loaded");
                Some(TlsAcceptor::from(server_config))
            }
            _ => {
                tracing::warn!("no TLS certificate configured; STARTTLS disabled");
                None
            }
        };

        // Phase: Storage.
        let store = Arc::new(MailStore::new(
            config.mail_root.clone(),
            config.domain.clone(),
        ));
        let queue = Arc::new(
            MailQueue::open(config.queue_root.clone(), config.max_queue_depth)
                .context("queue init failed")?,
        );

        // Phase: Services.
        let users = load_users(&config)?;
        let metrics = Arc::new(Metrics::new());
        let health = Arc::new(HealthState::new());

        let limits = LimitsConfig {
            global_max_connections: config.global_max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            commands_per_minute: config.commands_per_minute,
            ..LimitsConfig::default()
        };
        let ledger = Arc::new(ConnectionLedger::new(limits));
        let limiter = Arc::new(RateLimiter::new(limits));

        let resolver: Arc<Resolver> = Arc::new(Resolver::new(DnsConfig {
            server: config.dns_server.clone(),
            ..DnsConfig::default()
        }));
        let authenticator = Authenticator::new(resolver.clone());

        let mut scanners = ScannerSet::new();
        if config.scan_enabled {
            scanners.register(Arc::new(ClamAvScanner::new(config.clamav_addr.clone())));
        }
        let scanners = Arc::new(scanners);
        let retro = Arc::new(RetroIndex::new());

        // Phase: Servers.
        let (shutdown, _) = broadcast::channel::<Signal>(8);

        let services = Arc::new(SessionServices {
            config: Arc::clone(&config),
            authenticator,
            users,
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            scanners: Arc::clone(&scanners),
            retro: Arc::clone(&retro),
            metrics: Arc::clone(&metrics),
            limiter,
            tls_acceptor,
        });

        let smtp = SmtpServer::bind(Arc::clone(&services), Arc::clone(&ledger))
            .await
            .context("SMTP listener init failed")?;

        let admin = AdminServer::bind(
            &format!("{}:{}", config.host, config.admin_port),
            AdminState {
                metrics: Arc::clone(&metrics),
                health: Arc::clone(&health),
                admin_token: config.admin_token.clone(),
            },
        )
        .await
        .context("admin endpoint init failed")?;

        let relay = Relay::new(resolver, config.domain.clone());
        let leader = config
            .ha_enabled
            .then(|| LeaderLock::new(config.queue_root.join("leader.lock")));
        let worker = RetryWorker::new(
            Arc::clone(&queue),
            relay,
            scanners,
            retro,
            Arc::clone(&store),
            Arc::clone(&metrics),
            leader,
        );

        let admin_task = tokio::spawn(admin.serve(shutdown.subscribe()));
        let worker_task = tokio::spawn(worker.run(shutdown.subscribe()));
        let smtp_task = tokio::spawn(smtp.run(shutdown.clone()));

        health.set(Readiness::Ready, "");
        tracing::info!(
            smtp_port = config.smtp_port,
            smtps_port = config.smtps_port,
            admin_port = config.admin_port,
            "postern ready"
        );

        wait_for_termination().await;

        // Shutdown P1: stop accepting; P2 below drains; P3 stops the rest.
        health.set(Readiness::Stopping, "");
        let _ = shutdown.send(Signal::Shutdown);

        drain_sessions(&ledger, Duration::from_secs(config.drain_timeout)).await;

        for (name, task) in [
            ("smtp", smtp_task),
            ("worker", worker_task),
        ] {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!(task = name, "did not stop in time");
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), admin_task).await {
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "admin endpoint exited with error"),
            Ok(_) => {}
            Err(_) => tracing::warn!(task = "admin", "did not stop in time"),
        }

        tracing::info!("shutdown complete");
        Ok(())
    }
}

fn load_users(
    config: &ServerConfig,
) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
    match postern_crypto::migrate_users_file(&config.users_file) {
        Ok(users) => {
            tracing::info!(count = users.len(), "users loaded");
            Ok(users)
        }
        Err(postern_crypto::password::MigrateError::Config(
            postern_common::config::ConfigError::Read { ref source, .. },
        )) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %config.users_file.display(),
                "users file missing; no accounts can authenticate"
            );
            Ok(std::collections::BTreeMap::new())
        }
        Err(e) => Err(e).context("users file init failed"),
    }
}

/// P2: wait for active sessions to finish, bounded by the drain timeout.
/// Sessions past the bound are abandoned to process exit.
async fn drain_sessions(ledger: &ConnectionLedger, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while ledger.active() > 0 {
        if Instant::now() >= deadline {
            tracing::warn!(
                remaining = ledger.active(),
                "drain timeout elapsed; abandoning sessions"
            );
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    tracing::info!("all sessions drained");
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGHUP handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = term.recv() => tracing::info!("SIGTERM received"),
        _ = hangup.recv() => tracing::info!("SIGHUP received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("SIGINT received");
}
