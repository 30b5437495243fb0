//! Connection accounting and fixed-window rate limiting.
//!
//! Two separate concerns: the [`ConnectionLedger`] tracks *concurrent*
//! connections (acquire/release), while the [`RateLimiter`] counts
//! *arrivals* per window and never decrements.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

const IDLE_ENTRY_RESET: Duration = Duration::from_secs(5 * 60);
const CONNECTION_WINDOW: Duration = Duration::from_secs(60);
const COMMAND_WINDOW: Duration = Duration::from_secs(60);
const AUTH_WINDOW: Duration = Duration::from_secs(10 * 60);
const AUTH_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    pub global_max_connections: usize,
    pub max_connections_per_ip: usize,
    pub connections_per_minute: u32,
    pub commands_per_minute: u32,
    /// Poll interval for [`ConnectionLedger::wait_for_capacity`].
    pub backpressure_delay: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_max_connections: 500,
            max_connections_per_ip: 10,
            connections_per_minute: 30,
            commands_per_minute: 120,
            backpressure_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct IpEntry {
    count: usize,
    last_seen: Instant,
}

/// Global and per-IP concurrency caps.
#[derive(Debug)]
pub struct ConnectionLedger {
    config: LimitsConfig,
    global: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, IpEntry>>,
}

impl ConnectionLedger {
    #[must_use]
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            global: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    /// Admits iff both the global and the per-IP cap have room; increments
    /// both on success.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        if self.active() >= self.config.global_max_connections {
            tracing::warn!(active = self.active(), "global connection limit reached");
            return false;
        }

        let mut per_ip = self.per_ip.lock();
        let now = Instant::now();
        let entry = per_ip.entry(ip).or_insert(IpEntry {
            count: 0,
            last_seen: now,
        });

        // A stale entry is leftover accounting from a dead burst.
        if now.duration_since(entry.last_seen) > IDLE_ENTRY_RESET {
            entry.count = 0;
        }
        entry.last_seen = now;

        if entry.count >= self.config.max_connections_per_ip {
            tracing::warn!(%ip, count = entry.count, "per-ip connection limit reached");
            return false;
        }

        entry.count += 1;
        drop(per_ip);

        self.global.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn release(&self, ip: IpAddr) {
        self.global
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();

        let mut per_ip = self.per_ip.lock();
        if let Some(entry) = per_ip.get_mut(&ip) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Polls at the backpressure delay until admission succeeds or the
    /// timeout elapses.
    pub async fn wait_for_capacity(&self, ip: IpAddr, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(ip) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.backpressure_delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    start: Instant,
}

impl Window {
    fn fresh() -> Self {
        Self {
            count: 0,
            start: Instant::now(),
        }
    }

    fn roll(&mut self, length: Duration) {
        if self.start.elapsed() > length {
            *self = Self::fresh();
        }
    }
}

/// Arrival-rate windows: connections per IP per minute, commands per
/// session per minute, auth failures per IP per ten minutes.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimitsConfig,
    connections: Mutex<HashMap<IpAddr, Window>>,
    commands: DashMap<u64, Window>,
    auth_failures: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            commands: DashMap::new(),
            auth_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow_connection(&self, ip: IpAddr) -> bool {
        let mut map = self.connections.lock();
        let window = map.entry(ip).or_insert_with(Window::fresh);
        window.roll(CONNECTION_WINDOW);
        window.count += 1;
        window.count <= self.config.connections_per_minute
    }

    pub fn allow_command(&self, session_id: u64) -> bool {
        let mut window = self
            .commands
            .entry(session_id)
            .or_insert_with(Window::fresh);
        window.roll(COMMAND_WINDOW);
        window.count += 1;
        window.count <= self.config.commands_per_minute
    }

    /// Drops the per-session command bucket when the session ends.
    pub fn session_closed(&self, session_id: u64) {
        self.commands.remove(&session_id);
    }

    pub fn record_auth_failure(&self, ip: IpAddr) {
        let mut map = self.auth_failures.lock();
        let window = map.entry(ip).or_insert_with(Window::fresh);
        window.roll(AUTH_WINDOW);
        window.count += 1;
    }

    /// False once the failure bucket is full, until its window expires.
    #[must_use]
    pub fn allow_auth(&self, ip: IpAddr) -> bool {
        let map = self.auth_failures.lock();
        let Some(window) = map.get(&ip) else {
            return true;
        };
        if window.start.elapsed() > AUTH_WINDOW {
            return true;
        }
        window.count < AUTH_FAILURE_LIMIT
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn small_config() -> LimitsConfig {
        LimitsConfig {
            global_max_connections: 3,
            max_connections_per_ip: 2,
            connections_per_minute: 3,
            commands_per_minute: 4,
            backpressure_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn ledger_enforces_per_ip_cap() {
        let ledger = ConnectionLedger::new(small_config());
        let a = ip("192.0.2.1");

        assert!(ledger.try_acquire(a));
        assert!(ledger.try_acquire(a));
        assert!(!ledger.try_acquire(a));

        ledger.release(a);
        assert!(ledger.try_acquire(a));
    }

    #[test]
    fn ledger_enforces_global_cap() {
        let ledger = ConnectionLedger::new(small_config());

        assert!(ledger.try_acquire(ip("192.0.2.1")));
        assert!(ledger.try_acquire(ip("192.0.2.2")));
        assert!(ledger.try_acquire(ip("192.0.2.3")));
        assert!(!ledger.try_acquire(ip("192.0.2.4")));
        assert_eq!(ledger.active(), 3);

        ledger.release(ip("192.0.2.1"));
        assert!(ledger.try_acquire(ip("192.0.2.4")));
    }

    #[tokio::test]
    async fn wait_for_capacity_times_out_then_succeeds() {
        let ledger = ConnectionLedger::new(small_config());
        let a = ip("192.0.2.1");
        assert!(ledger.try_acquire(a));
        assert!(ledger.try_acquire(a));

        assert!(
            !ledger
                .wait_for_capacity(a, Duration::from_millis(20))
                .await
        );

        ledger.release(a);
        assert!(
            ledger
                .wait_for_capacity(a, Duration::from_millis(20))
                .await
        );
    }

    #[test]
    fn connection_window_is_monotone_within_limit() {
        let limiter = RateLimiter::new(small_config());
        let a = ip("198.51.100.1");

        assert!(limiter.allow_connection(a));
        assert!(limiter.allow_connection(a));
        assert!(limiter.allow_connection(a));
        assert!(!limiter.allow_connection(a));
        // Another IP has its own window.
        assert!(limiter.allow_connection(ip("198.51.100.2")));
    }

    #[test]
    fn command_window_per_session() {
        let limiter = RateLimiter::new(small_config());

        for _ in 0..4 {
            assert!(limiter.allow_command(1));
        }
        assert!(!limiter.allow_command(1));
        assert!(limiter.allow_command(2));

        limiter.session_closed(1);
        assert!(limiter.allow_command(1));
    }

    #[test]
    fn auth_failures_lock_out_after_five() {
        let limiter = RateLimiter::new(small_config());
        let a = ip("203.0.113.9");

        assert!(limiter.allow_auth(a));
        for _ in 0..5 {
            limiter.record_auth_failure(a);
        }
        assert!(!limiter.allow_auth(a));
        // Other IPs are unaffected.
        assert!(limiter.allow_auth(ip("203.0.113.10")));
    }
}
