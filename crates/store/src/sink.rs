//! Fire-and-forget audit queue
//!
//! Request handlers hand records to [`AuditSink::submit`], which never
//! waits: a full queue drops the record with a warning. A single writer
//! task persists records through the [`AuditLedger`] and logs failures.
//! [`AuditWriter::drain`] closes the queue and writes what is left.

use gateway_common::AuditRecord;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLedger;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Create the queue and spawn its writer
    pub fn spawn(ledger: AuditLedger, capacity: usize) -> (AuditSink, AuditWriter) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_writer(ledger, rx, close_rx));

        (
            AuditSink { tx },
            AuditWriter {
                close: close_tx,
                task,
            },
        )
    }

    /// Queue a record without waiting; returns false if it was dropped
    pub fn submit(&self, record: impl Into<AuditRecord>) -> bool {
        match self.tx.try_send(record.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                warn!("Audit queue is full, dropping {} record", record.kind());
                false
            }
            Err(TrySendError::Closed(record)) => {
                warn!("Audit queue is closed, dropping {} record", record.kind());
                false
            }
        }
    }
}

/// Owner of the writer task
pub struct AuditWriter {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AuditWriter {
    /// Stop accepting records and wait until every queued one is written
    pub async fn drain(self) {
        let _ = self.close.send(());
        if let Err(e) = self.task.await {
            error!("Audit writer task failed: {}", e);
        }
    }
}

async fn run_writer(
    ledger: AuditLedger,
    mut rx: mpsc::Receiver<AuditRecord>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(record) => write(&ledger, record).await,
                None => break,
            },
            _ = &mut close_rx => {
                rx.close();
                let mut drained = 0usize;
                while let Some(record) = rx.recv().await {
                    write(&ledger, record).await;
                    drained += 1;
                }
                debug!("Drained {} queued audit records", drained);
                break;
            }
        }
    }
    info!("Audit writer stopped");
}

async fn write(ledger: &AuditLedger, record: AuditRecord) {
    let kind = record.kind();
    match ledger.save(record).await {
        Ok(id) => debug!("Saved {} audit record {}", kind, id),
        Err(e) => error!("Failed to save {} audit record: {}", kind, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_store;
    use gateway_common::{InstanceInfo, ResourceRequest};

    fn request(tag: &str) -> ResourceRequest {
        ResourceRequest::new(
            "127.0.0.1",
            "",
            "default",
            "key",
            tag,
            "GET",
            200,
            InstanceInfo::default(),
        )
    }

    #[tokio::test]
    async fn test_drain_writes_queued_records() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store);
        let (sink, writer) = AuditSink::spawn(ledger.clone(), 64);

        for i in 0..10 {
            assert!(sink.submit(request(&i.to_string())));
        }
        writer.drain().await;

        assert_eq!(ledger.stats().await.unwrap().resource_requests, 10);
        // Sink clones outlive the writer; submissions are dropped, not blocked
        assert!(!sink.submit(request("late")));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (store, _dir) = memory_store().await;
        let ledger = AuditLedger::new(store.clone());

        // Keep the writer busy so the single slot stays occupied
        let blocker = store.clone();
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();
        let held = tokio::spawn(async move {
            blocker
                .call(move |_| {
                    let _ = hold_rx.recv();
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (sink, writer) = AuditSink::spawn(ledger.clone(), 1);
        let accepted = (0..5).filter(|i| sink.submit(request(&i.to_string()))).count();
        assert!(accepted < 5);

        hold_tx.send(()).unwrap();
        held.await.unwrap().unwrap();
        writer.drain().await;

        assert_eq!(
            ledger.stats().await.unwrap().resource_requests,
            accepted as i64
        );
    }
}
