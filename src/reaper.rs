//! Expiration reaper. A timer enqueues reap tasks; one consumer runs the sweeps.

use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::DbHandle;
use crate::store::ContentStore;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(72 * 60 * 60);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapTask;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub stale: usize,
}

#[derive(Clone)]
pub struct Reaper {
    store: ContentStore,
    queue: DbHandle,
    retention: Duration,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(store: ContentStore, queue: DbHandle, retention: Duration, stale_after: Duration) -> Self {
        Self {
            store,
            queue,
            retention,
            stale_after,
        }
    }

    /// One idempotent pass over both roots. Jobs still queued or claimed are never stale.
    pub async fn sweep(&self) -> Result<ReapReport, anyhow::Error> {
        let expired = self.store.sweep_expired(self.retention).await?;
        let active = self.queue.active_ids().await?;
        let stale = self.store.sweep_stale(self.stale_after, &active).await?;
        if !expired.is_empty() || !stale.is_empty() {
            info!(expired = ?expired, stale = ?stale, "reaped");
        }
        Ok(ReapReport {
            expired: expired.len(),
            stale: stale.len(),
        })
    }
}

/// Holds at most one pending task. Ticks that find one pending are dropped.
pub fn reap_queue() -> (Sender<ReapTask>, Receiver<ReapTask>) {
    async_channel::bounded(1)
}

/// Enqueues a reap task every `period` until cancelled. The first tick fires immediately.
pub async fn schedule(cancel: CancellationToken, period: Duration, tx: Sender<ReapTask>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reap timer cancelled");
                break;
            },
            _ = ticker.tick() => {
                match tx.try_send(ReapTask) {
                    Ok(()) => debug!("Reap task enqueued"),
                    Err(TrySendError::Full(_)) => debug!("Reap already pending, tick dropped"),
                    Err(TrySendError::Closed(_)) => {
                        debug!("Reap queue closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Single consumer of the reap queue. A failing sweep is logged and the next task retries.
pub async fn consume(cancel: CancellationToken, rx: Receiver<ReapTask>, reaper: Reaper) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reaper cancelled");
                break;
            },
            task = rx.recv() => {
                if task.is_err() {
                    debug!("Reap queue closed");
                    break;
                }
                if let Err(err) = reaper.sweep().await {
                    error!(error = %format!("{err:#}"), "Reap sweep failed");
                }
            }
        }
    }
    info!("Reaper stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Presence;
    use crate::{ImageKind, JobId, JobTicket, PreviewMode};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir) -> (ContentStore, DbHandle) {
        let store = ContentStore::open(dir.path().join("data")).await.unwrap();
        let queue = DbHandle::new(&dir.path().join("queue.db")).await.unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn pending_task_absorbs_extra_ticks() {
        let (tx, rx) = reap_queue();
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(schedule(cancel.clone(), Duration::from_millis(5), tx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rx.len(), 1);

        cancel.cancel();
        timer.await.unwrap();
        assert_eq!(rx.try_recv(), Ok(ReapTask));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn consumer_sweeps_on_each_task() {
        let dir = TempDir::new().unwrap();
        let (store, queue) = fixture(&dir).await;
        let id = JobId::parse("old1").unwrap();
        let (_, publish) = store.allocate(&id).await.unwrap().unwrap();
        tokio::fs::write(publish.join("a-original.png"), b"png").await.unwrap();

        let reaper = Reaper::new(store.clone(), queue, Duration::ZERO, Duration::ZERO);
        let (tx, rx) = reap_queue();
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(cancel.clone(), rx, reaper.clone()));

        tx.send(ReapTask).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.lookup(&id).await.unwrap() != Presence::NotFound {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Sweeping an empty store again is harmless.
        assert_eq!(reaper.sweep().await.unwrap(), ReapReport::default());

        cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn generous_retention_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let (store, queue) = fixture(&dir).await;
        let id = JobId::parse("fresh1").unwrap();
        store.allocate(&id).await.unwrap().unwrap();

        let reaper = Reaper::new(store.clone(), queue, Duration::MAX, Duration::MAX);
        assert_eq!(reaper.sweep().await.unwrap(), ReapReport::default());
        assert_eq!(store.lookup(&id).await.unwrap(), Presence::InProgress);
    }

    #[tokio::test]
    async fn queued_jobs_are_not_stale() {
        let dir = TempDir::new().unwrap();
        let (store, queue) = fixture(&dir).await;
        let id = JobId::parse("waits1").unwrap();
        store.allocate(&id).await.unwrap().unwrap();
        queue
            .enqueue(&JobTicket {
                id: id.clone(),
                base_name: "cat".into(),
                extension: ".png".into(),
                kind: ImageKind::Png,
                variants: BTreeSet::new(),
                preview: PreviewMode::None,
            })
            .await
            .unwrap();

        let reaper = Reaper::new(store.clone(), queue.clone(), Duration::MAX, Duration::ZERO);
        assert_eq!(reaper.sweep().await.unwrap(), ReapReport::default());
        assert_eq!(store.lookup(&id).await.unwrap(), Presence::InProgress);

        queue.cancel(&id, "withdrawn").await.unwrap();
        assert_eq!(reaper.sweep().await.unwrap(), ReapReport { expired: 0, stale: 1 });
        assert_eq!(store.lookup(&id).await.unwrap(), Presence::NotFound);
    }
}
