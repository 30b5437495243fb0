//! The retry worker: leases one message, attempts delivery, classifies the
//! outcome, and feeds scanner verdicts back into retroactive quarantine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use postern_common::Signal;
use postern_metrics::Metrics;
use postern_queue::{MailQueue, QueueMessage};
use postern_store::MailStore;

use crate::leader::LeaderLock;
use crate::relay::Relay;
use crate::scan::{RetroIndex, ScanVerdict, ScannerSet};

const IDLE_SLEEP: Duration = Duration::from_secs(2);
const FOLLOWER_SLEEP: Duration = Duration::from_secs(3);

pub struct RetryWorker {
    queue: Arc<MailQueue>,
    relay: Relay,
    scanners: Arc<ScannerSet>,
    retro: Arc<RetroIndex>,
    store: Arc<MailStore>,
    metrics: Arc<Metrics>,
    /// Present only when HA is enabled.
    leader: Option<LeaderLock>,
}

impl RetryWorker {
    #[must_use]
    pub fn new(
        queue: Arc<MailQueue>,
        relay: Relay,
        scanners: Arc<ScannerSet>,
        retro: Arc<RetroIndex>,
        store: Arc<MailStore>,
        metrics: Arc<Metrics>,
        leader: Option<LeaderLock>,
    ) -> Self {
        Self {
            queue,
            relay,
            scanners,
            retro,
            store,
            metrics,
            leader,
        }
    }

    /// Runs until shutdown. Each iteration is self-contained: a failure is
    /// logged and the loop proceeds.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        tracing::info!(ha = self.leader.is_some(), "retry worker started");

        loop {
            if let Some(leader) = self.leader.as_mut()
                && !leader.try_acquire()
            {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(FOLLOWER_SLEEP) => continue,
                }
            }

            self.metrics.set_queue_depth(self.queue.depth() as u64);

            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    tracing::error!(error = %e, "retry iteration failed");
                    false
                }
            };

            if !worked {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(IDLE_SLEEP) => {}
                }
            } else if !matches!(
                shutdown.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ) {
                break;
            }
        }

        if let Some(leader) = self.leader.as_mut() {
            leader.release();
        }
        tracing::info!("retry worker stopped");
    }

    /// One lease → one delivery attempt → one classification. Returns
    /// whether a message was processed.
    async fn run_once(&self) -> Result<bool, postern_queue::QueueError> {
        let Some(msg) = self.queue.fetch_ready()? else {
            return Ok(false);
        };

        self.spawn_scan(&msg);

        let result = self.relay.deliver(&msg).await;
        if result.success {
            self.queue.mark_success(&msg.id)?;
        } else if result.permanent {
            self.queue.mark_perm_fail(&msg.id, &result.reason)?;
        } else {
            self.queue.mark_temp_fail(&msg, &result.reason)?;
        }

        Ok(true)
    }

    /// Verdicts never block delivery; an infection found after the fact
    /// quarantines the stored copy.
    fn spawn_scan(&self, msg: &QueueMessage) {
        if self.scanners.is_empty() {
            self.retro.forget(&msg.id);
            return;
        }

        let scanners = Arc::clone(&self.scanners);
        let retro = Arc::clone(&self.retro);
        let store = Arc::clone(&self.store);
        let queue_id = msg.id.clone();
        let raw = msg.raw.clone();

        tokio::spawn(async move {
            match scanners.scan(&raw).await {
                ScanVerdict::Infected { signature } => {
                    tracing::warn!(%queue_id, %signature, "late scan verdict: infected");
                    retro.quarantine(&store, &queue_id);
                }
                ScanVerdict::Clean | ScanVerdict::Unavailable => {
                    retro.forget(&queue_id);
                }
            }
        });
    }
}
