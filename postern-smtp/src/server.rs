//! Listener accept loops with C3 admission.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use postern_common::Signal;

use crate::connection::Connection;
use crate::limits::ConnectionLedger;
use crate::session::{Session, SessionServices};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

pub struct SmtpServer {
    services: Arc<SessionServices>,
    ledger: Arc<ConnectionLedger>,
    plain: TcpListener,
    /// Implicit-TLS listener (typically 465); absent when disabled.
    secure: Option<TcpListener>,
    next_id: Arc<AtomicU64>,
}

impl SmtpServer {
    /// Binds all configured listeners up front so a port conflict fails
    /// startup instead of surfacing mid-flight.
    ///
    /// # Errors
    ///
    /// See [`ServerError`].
    pub async fn bind(
        services: Arc<SessionServices>,
        ledger: Arc<ConnectionLedger>,
    ) -> Result<Self, ServerError> {
        let config = &services.config;

        let plain_addr = format!("{}:{}", config.host, config.smtp_port);
        let plain = TcpListener::bind(&plain_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: plain_addr.clone(),
                source,
            })?;
        tracing::info!(addr = %plain_addr, "smtp listener bound");

        let secure = if config.smtps_port != 0 {
            let addr = format!("{}:{}", config.host, config.smtps_port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            tracing::info!(%addr, "smtps listener bound");
            Some(listener)
        } else {
            None
        };

        Ok(Self {
            services,
            ledger,
            plain,
            secure,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Accepts until shutdown fires. Sessions run as detached tasks; the
    /// ledger's active count is what the drain phase watches.
    pub async fn run(self, shutdown: broadcast::Sender<Signal>) {
        let plain_loop = accept_loop(
            self.plain,
            false,
            Arc::clone(&self.services),
            Arc::clone(&self.ledger),
            Arc::clone(&self.next_id),
            shutdown.clone(),
        );

        if let Some(secure) = self.secure {
            let secure_loop = accept_loop(
                secure,
                true,
                self.services,
                self.ledger,
                self.next_id,
                shutdown,
            );
            tokio::join!(plain_loop, secure_loop);
        } else {
            plain_loop.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    implicit_tls: bool,
    services: Arc<SessionServices>,
    ledger: Arc<ConnectionLedger>,
    next_id: Arc<AtomicU64>,
    shutdown: broadcast::Sender<Signal>,
) {
    let mut stop = shutdown.subscribe();

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        if !admit(&services, &ledger, peer) {
            refuse(stream).await;
            continue;
        }

        services.metrics.inc_connections();
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let session_services = Arc::clone(&services);
        let session_ledger = Arc::clone(&ledger);
        let session_shutdown = shutdown.subscribe();

        tokio::spawn(async move {
            run_session(
                id,
                stream,
                peer,
                implicit_tls,
                session_services,
                session_shutdown,
            )
            .await;
            session_ledger.release(peer.ip());
        });
    }

    tracing::info!(implicit_tls, "accept loop stopped");
}

/// Admission: the rate-limiter window (arrivals) and the connection ledger
/// (concurrency) must both agree.
fn admit(services: &SessionServices, ledger: &ConnectionLedger, peer: SocketAddr) -> bool {
    if !services.limiter.allow_connection(peer.ip()) {
        tracing::warn!(peer = %peer, "connection rate limit exceeded");
        return false;
    }
    if !ledger.try_acquire(peer.ip()) {
        return false;
    }
    true
}

async fn refuse(mut stream: TcpStream) {
    let _ = stream.write_all(b"421 Too many connections\r\n").await;
    let _ = stream.shutdown().await;
}

async fn run_session(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    implicit_tls: bool,
    services: Arc<SessionServices>,
    shutdown: broadcast::Receiver<Signal>,
) {
    let session = Session::new(id, peer, Arc::clone(&services));

    if implicit_tls {
        let Some(acceptor) = services.tls_acceptor.clone() else {
            tracing::error!(session = id, "implicit TLS listener without a TLS context");
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                services.metrics.inc_tls_handshakes();
                session.run(Connection::tls(tls_stream), shutdown).await;
            }
            Err(e) => {
                tracing::warn!(session = id, peer = %peer, error = %e, "implicit TLS handshake failed");
            }
        }
    } else {
        session.run(Connection::plain(stream), shutdown).await;
    }
}
