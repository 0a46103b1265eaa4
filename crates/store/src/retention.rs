//! Periodic audit retention
//!
//! Runs one sweep as soon as it is started, then one per interval, until
//! stopped through its handle or the shared shutdown signal fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::audit::{AuditLedger, CleanupReport};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Rows kept per record kind, `<= 0` disables
    pub max_records: i64,
    /// Age limit in days, `<= 0` disables
    pub retention_days: i64,
    pub interval: Duration,
}

pub struct RetentionScheduler {
    ledger: AuditLedger,
    config: RetentionConfig,
}

impl RetentionScheduler {
    pub fn new(ledger: AuditLedger, config: RetentionConfig) -> Self {
        Self { ledger, config }
    }

    /// One sweep, logging what it removed
    pub async fn run_once(&self) -> Result<CleanupReport> {
        info!("Starting audit records hard cleanup (permanent deletion)");

        let report = self
            .ledger
            .cleanup_old_records(self.config.max_records, self.config.retention_days)
            .await?;

        if report.total() > 0 {
            let remaining = self.ledger.stats().await?;
            info!(
                "Audit hard cleanup completed: permanently deleted {} attestation records, {} resource request records",
                report.attestation_deleted, report.resource_deleted
            );
            info!(
                "Remaining records: {} attestation records, {} resource request records",
                remaining.attestation_records, remaining.resource_requests
            );
        } else {
            debug!("Audit hard cleanup completed: no records deleted");
        }

        Ok(report)
    }

    /// Run the first sweep, then spawn the periodic loop
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> RetentionHandle {
        let period = self.config.interval.max(Duration::from_millis(10));
        info!(
            "Starting audit cleanup service with interval: {:?}, max_records: {}, retention_days: {}",
            period, self.config.max_records, self.config.retention_days
        );

        let scheduler = Arc::new(self);
        if let Err(e) = scheduler.run_once().await {
            error!("Failed to cleanup audit records: {}", e);
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let worker = Arc::clone(&scheduler);
        let task = tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = worker.run_once().await {
                            error!("Failed to cleanup audit records: {}", e);
                        }
                    }
                    _ = &mut stop_rx => {
                        info!("Audit cleanup service stopped");
                        break;
                    }
                    _ = shutdown.changed() => {
                        info!("Audit cleanup service stopped due to shutdown signal");
                        break;
                    }
                }
            }
        });

        RetentionHandle {
            scheduler,
            stop: stop_tx,
            task,
        }
    }
}

/// Running retention loop; consuming [`RetentionHandle::stop`] makes a second
/// stop impossible
pub struct RetentionHandle {
    scheduler: Arc<RetentionScheduler>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RetentionHandle {
    /// Sweep now, outside the regular cadence
    pub async fn force_cleanup(&self) -> Result<CleanupReport> {
        self.scheduler.run_once().await
    }

    pub async fn stop(self) {
        // The loop may already have exited on the shutdown signal.
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            error!("Audit cleanup task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;
    use chrono::Utc;
    use gateway_common::{AttestationRecord, InstanceInfo, SourceService};

    async fn seed(ledger: &AuditLedger, count: i64) {
        let now = Utc::now();
        for i in 0..count {
            let mut record = AttestationRecord::new(
                SourceService::Kbs,
                "127.0.0.1",
                format!("s{}", i),
                "",
                "",
                200,
                InstanceInfo::default(),
            );
            record.timestamp = now - chrono::Duration::seconds(i);
            ledger.save_attestation(&record).await.unwrap();
        }
    }

    fn config(interval: Duration) -> RetentionConfig {
        RetentionConfig {
            max_records: 2,
            retention_days: 0,
            interval,
        }
    }

    #[tokio::test]
    async fn test_start_sweeps_immediately() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        seed(&ledger, 5).await;

        let (_tx, rx) = watch::channel(false);
        let handle = RetentionScheduler::new(ledger.clone(), config(Duration::from_secs(3600)))
            .start(rx)
            .await;

        assert_eq!(ledger.stats().await.unwrap().attestation_records, 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_sweep_and_force_cleanup() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);

        let (_tx, rx) = watch::channel(false);
        let handle = RetentionScheduler::new(ledger.clone(), config(Duration::from_millis(50)))
            .start(rx)
            .await;

        seed(&ledger, 4).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ledger.stats().await.unwrap().attestation_records, 2);

        seed(&ledger, 3).await;
        let report = handle.force_cleanup().await.unwrap();
        assert!(report.attestation_deleted <= 3);
        assert_eq!(ledger.stats().await.unwrap().attestation_records, 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);

        let (tx, rx) = watch::channel(false);
        let handle = RetentionScheduler::new(ledger, config(Duration::from_secs(3600)))
            .start(rx)
            .await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("retention loop should exit promptly");
    }
}
