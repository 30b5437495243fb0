//! Counter/gauge registry with Prometheus text rendering.
//!
//! Instruments are fixed at compile time; everything is a relaxed atomic so
//! sessions and workers update without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    smtp_connections_total: AtomicU64,
    smtp_active_sessions: AtomicU64,
    smtp_auth_failures_total: AtomicU64,
    smtp_tls_handshakes_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_virus_rejected_total: AtomicU64,
    mail_queue_depth: AtomicU64,
    session_duration_count: AtomicU64,
    session_duration_sum_ms: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections(&self) {
        self.smtp_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.smtp_active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self, duration: Duration) {
        self.smtp_active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.session_duration_count.fetch_add(1, Ordering::Relaxed);
        self.session_duration_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.smtp_auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tls_handshakes(&self) {
        self.smtp_tls_handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_virus_rejected(&self) {
        self.messages_virus_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.mail_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.smtp_active_sessions.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);

        let counter = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        };
        let gauge = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        };

        counter(
            &mut out,
            "smtp_connections_total",
            self.smtp_connections_total.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "smtp_active_sessions",
            self.smtp_active_sessions.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "smtp_auth_failures_total",
            self.smtp_auth_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "smtp_tls_handshakes_total",
            self.smtp_tls_handshakes_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "messages_received_total",
            self.messages_received_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "messages_virus_rejected_total",
            self.messages_virus_rejected_total.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "mail_queue_depth",
            self.mail_queue_depth.load(Ordering::Relaxed),
        );

        out.push_str("# TYPE smtp_session_duration_ms summary\n");
        out.push_str(&format!(
            "smtp_session_duration_ms_count {}\n",
            self.session_duration_count.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "smtp_session_duration_ms_sum {}\n",
            self.session_duration_sum_ms.load(Ordering::Relaxed)
        ));

        out
    }
}
