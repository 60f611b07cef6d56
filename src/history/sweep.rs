//! Orphaned payload sweep
//!
//! A payload is orphaned when no live entry references it: its entry
//! expired along with the board, or a cleanup task failed. Payloads younger
//! than the grace period are skipped, since they may belong to a write that
//! has stored its payload but not yet committed the entry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::{delete_payload, HistoryManager};
use crate::error::Result;
use crate::payload::PayloadStore;
use crate::store::Store;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub referenced: usize,
    pub too_recent: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl<S: Store, P: PayloadStore> HistoryManager<S, P> {
    /// Delete stored payloads that no live entry references
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        // Listing payloads before reading references means a payload whose
        // entry commits in between is seen as referenced or as too recent.
        let stored = self.payloads.list().await?;
        let referenced = self.store.referenced_payloads().await?;
        let now = SystemTime::now();

        let mut report = SweepReport {
            scanned: stored.len(),
            ..SweepReport::default()
        };

        for payload in stored {
            if referenced.contains(&payload.reference) {
                report.referenced += 1;
                continue;
            }

            let age = now.duration_since(payload.stored_at).unwrap_or(Duration::ZERO);
            if age < self.sweep_grace {
                report.too_recent += 1;
                continue;
            }

            if delete_payload(self.payloads.as_ref(), &self.stats, None, &payload.reference).await {
                report.deleted += 1;
            } else {
                report.failed += 1;
            }
        }

        tracing::info!(
            scanned = report.scanned,
            deleted = report.deleted,
            too_recent = report.too_recent,
            failed = report.failed,
            "Orphan sweep finished"
        );

        Ok(report)
    }

    /// Spawn a task that sweeps every `interval` until cancelled
    pub fn spawn_sweep_task(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let history = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the start-up sweep covers it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = history.sweep_orphans().await {
                    tracing::warn!(error = %e, "Orphan sweep failed");
                }
            }

            tracing::debug!("Orphan sweep task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::BoardConfig;
    use crate::media::{MediaType, Preview};
    use crate::payload::{MemoryPayloadStore, PayloadRef};
    use crate::stats::ServiceStats;
    use crate::store::{BoardId, Entry, EntryId, MemoryStore};

    fn manager(grace: Duration) -> (Arc<MemoryPayloadStore>, HistoryManager<MemoryStore, MemoryPayloadStore>) {
        let payloads = Arc::new(MemoryPayloadStore::new());
        let history = HistoryManager::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&payloads),
            &BoardConfig::default().sweep_grace(grace),
            Arc::new(ServiceStats::new()),
        );
        (payloads, history)
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_unreferenced() {
        let (payloads, history) = manager(Duration::ZERO);
        let board = BoardId::new("b");

        let live = Entry::image(EntryId::new(), MediaType::Png, Preview::new(vec![1]), 3);
        let live_ref = live.payload().cloned().unwrap();
        let orphan = PayloadRef::for_entry(EntryId::new(), MediaType::Jpeg);

        payloads.put(&live_ref, Bytes::from_static(b"png")).await.unwrap();
        payloads.put(&orphan, Bytes::from_static(b"jpg")).await.unwrap();
        history.commit(&board, live).await.unwrap();

        let report = history.sweep_orphans().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.referenced, 1);
        assert_eq!(report.deleted, 1);
        assert!(payloads.contains(&live_ref));
        assert!(!payloads.contains(&orphan));
    }

    #[tokio::test]
    async fn test_sweep_skips_recent_payloads() {
        let (payloads, history) = manager(Duration::from_secs(3600));
        let orphan = PayloadRef::for_entry(EntryId::new(), MediaType::Png);
        payloads.put(&orphan, Bytes::from_static(b"png")).await.unwrap();

        let report = history.sweep_orphans().await.unwrap();

        assert_eq!(report.too_recent, 1);
        assert_eq!(report.deleted, 0);
        assert!(payloads.contains(&orphan));
    }

    #[tokio::test]
    async fn test_sweep_counts_failures() {
        let (payloads, history) = manager(Duration::ZERO);
        payloads
            .put(&PayloadRef::for_entry(EntryId::new(), MediaType::Png), Bytes::from_static(b"x"))
            .await
            .unwrap();
        payloads.fail_deletes(true);

        let report = history.sweep_orphans().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(payloads.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_cancel() {
        let (_, history) = manager(Duration::ZERO);
        let history = Arc::new(history);
        let shutdown = CancellationToken::new();

        let handle = history.spawn_sweep_task(Duration::from_millis(10), shutdown.clone());
        shutdown.cancel();

        handle.await.unwrap();
    }
}
