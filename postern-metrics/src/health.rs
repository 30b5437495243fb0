//! Readiness state machine: `Starting → Ready ⇄ Degraded → Stopping`.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Degraded,
    Stopping,
}

impl From<u8> for Readiness {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Degraded,
            3 => Self::Stopping,
            _ => Self::Starting,
        }
    }
}

#[derive(Debug)]
pub struct HealthState {
    state: AtomicU8,
    reason: Mutex<String>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Readiness::Starting as u8),
            reason: Mutex::new(String::new()),
        }
    }

    pub fn set(&self, readiness: Readiness, reason: &str) {
        let previous = self.state.swap(readiness as u8, Ordering::SeqCst);
        *self.reason.lock() = reason.to_string();

        if previous != readiness as u8 {
            tracing::info!(
                from = ?Readiness::from(previous),
                to = ?readiness,
                reason,
                "readiness changed"
            );
        }
    }

    #[must_use]
    pub fn get(&self) -> Readiness {
        Readiness::from(self.state.load(Ordering::SeqCst))
    }

    /// Health-endpoint body: `OK`, `STARTING`, `DEGRADED: <reason>`,
    /// `STOPPING`.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.get() {
            Readiness::Ready => "OK".to_string(),
            Readiness::Starting => "STARTING".to_string(),
            Readiness::Stopping => "STOPPING".to_string(),
            Readiness::Degraded => {
                let reason = self.reason.lock();
                if reason.is_empty() {
                    "DEGRADED".to_string()
                } else {
                    format!("DEGRADED: {reason}")
                }
            }
        }
    }

    /// The ready endpoint serves traffic for `Ready` and `Degraded`.
    #[must_use]
    pub fn accepts_traffic(&self) -> bool {
        matches!(self.get(), Readiness::Ready | Readiness::Degraded)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_in_starting() {
        let health = HealthState::new();
        assert_eq!(health.get(), Readiness::Starting);
        assert_eq!(health.describe(), "STARTING");
        assert!(!health.accepts_traffic());
    }

    #[test]
    fn transitions_and_reasons() {
        let health = HealthState::new();

        health.set(Readiness::Ready, "");
        assert_eq!(health.describe(), "OK");
        assert!(health.accepts_traffic());

        health.set(Readiness::Degraded, "queue backlog");
        assert_eq!(health.describe(), "DEGRADED: queue backlog");
        assert!(health.accepts_traffic());

        health.set(Readiness::Stopping, "");
        assert_eq!(health.describe(), "STOPPING");
        assert!(!health.accepts_traffic());
    }
}
