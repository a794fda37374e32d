use crate::db::DbHandle;
use crate::pipeline::{Outcome, Pipeline};
use crate::store::ContentStore;
use crate::{JobContext, JobId, JobTicket, Status};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, Stdin};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Claims one job at a time from the shared queue and runs it through the pipeline.
pub struct Worker {
    worker_id: Uuid,
    queue: DbHandle,
    store: ContentStore,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        worker_id: Uuid,
        queue: DbHandle,
        store: ContentStore,
        pipeline: Arc<Pipeline>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id,
            queue,
            store,
            pipeline,
            poll_interval,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Polls until cancelled. A claimed job always runs to completion first.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), Error> {
        info!(worker_id = %self.worker_id, "Worker started.");
        while !cancel_token.is_cancelled() {
            if self.run_once().await?.is_some() {
                continue;
            }
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                },
                _ = sleep(self.poll_interval) => {}
            }
        }
        info!(worker_id = %self.worker_id, "Worker stopped.");
        Ok(())
    }

    /// Claims and processes the oldest queued job, if any.
    pub async fn run_once(&self) -> Result<Option<(JobId, Status)>, Error> {
        let Some(entry) = self.queue.claim_next(self.worker_id).await? else {
            return Ok(None);
        };
        let ticket = entry.payload.0;
        let job_id = ticket.id.clone();
        debug!(message = "Claimed job", job_id = %job_id, seq = entry.seq);

        let status = self.process(ticket).await?;
        Ok(Some((job_id, status)))
    }

    #[instrument(skip(self, ticket), fields(job_id = %ticket.id, worker_id = %self.worker_id))]
    async fn process(&self, ticket: JobTicket) -> Result<Status, Error> {
        let job_id = ticket.id.clone();
        let ctx = JobContext::from_ticket(ticket, &self.store);

        match self.pipeline.run(ctx).await {
            Outcome::Published(ctx) => {
                if let Err(err) = self.store.discard_working(&job_id).await {
                    warn!(message = "Failed to drop working directory", error = %err);
                }
                self.queue.complete_job(&job_id).await?;
                info!(message = "Completed job", trail = ?ctx.trail);
                Ok(Status::Completed)
            }
            Outcome::Failed(ctx) => {
                let reason = ctx.failure_summary();
                // A job deleted while it waited has no working directory and must stay gone.
                let deleted = !tokio::fs::try_exists(self.store.working_dir(&job_id))
                    .await
                    .unwrap_or(true);
                let cleanup = if deleted {
                    debug!(message = "Job deleted before it ran, dropping leftovers");
                    self.store.remove(&job_id).await
                } else {
                    self.store.mark_failed(&job_id, &reason).await
                };
                if let Err(err) = cleanup {
                    error!(message = "Failed to record failure", error = %err);
                }
                self.queue.fail_job(&job_id, &reason).await?;
                info!(message = "Failed job", error = %reason);
                Ok(Status::Failed)
            }
        }
    }
}

/// A supervised worker process stops once its coordinator closes the stdin pipe.
pub async fn cancel_on_eof(mut stdin: Stdin, cancel_token: CancellationToken) {
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    debug!("Coordinator pipe closed");
    cancel_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{seeded_job, FakeCodec};
    use crate::preview::PreviewParams;
    use crate::store::Presence;
    use crate::{PreviewMode, SizeClass};
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir, codec: FakeCodec) -> (Worker, ContentStore, DbHandle) {
        let store = ContentStore::open(dir.path().join("data")).await.unwrap();
        let queue = DbHandle::new(&dir.path().join("queue.db")).await.unwrap();
        let pipeline = Pipeline::standard(Arc::new(codec), store.clone(), Arc::new(PreviewParams::seeded(3)));
        let worker = Worker::new(
            Uuid::new_v4(),
            queue.clone(),
            store.clone(),
            Arc::new(pipeline),
            Duration::from_millis(10),
        );
        (worker, store, queue)
    }

    #[tokio::test]
    async fn published_job_is_acknowledged_and_working_dir_dropped() {
        let dir = TempDir::new().unwrap();
        let (worker, store, queue) = fixture(&dir, FakeCodec::new(1000)).await;
        let ticket = seeded_job(&store, "good1", ".jpg", &[SizeClass::Small], PreviewMode::Pixelate).await;
        queue.enqueue(&ticket).await.unwrap();

        let (id, status) = worker.run_once().await.unwrap().unwrap();

        assert_eq!(status, Status::Completed);
        assert_eq!(queue.status_of(&id).await.unwrap(), Some(Status::Completed));
        assert_eq!(store.lookup(&id).await.unwrap(), Presence::Ready);
        assert!(!store.working_dir(&id).exists());
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_leaves_a_marker_and_no_archive() {
        let dir = TempDir::new().unwrap();
        let (worker, store, queue) = fixture(&dir, FakeCodec::failing(1000, "resize")).await;
        let ticket = seeded_job(&store, "bad1", ".png", &[SizeClass::Small], PreviewMode::None).await;
        queue.enqueue(&ticket).await.unwrap();

        let (id, status) = worker.run_once().await.unwrap().unwrap();

        assert_eq!(status, Status::Failed);
        assert_eq!(queue.status_of(&id).await.unwrap(), Some(Status::Failed));
        let Presence::Failed(reason) = store.lookup(&id).await.unwrap() else {
            panic!("expected a failure marker");
        };
        assert!(reason.starts_with("resize_variants"), "{reason}");
        assert!(!store.archive_path(&id).exists());
        assert!(!store.publish_dir(&id).exists());
    }

    #[tokio::test]
    async fn deleted_job_does_not_come_back_as_failed() {
        let dir = TempDir::new().unwrap();
        let (worker, store, queue) = fixture(&dir, FakeCodec::new(1000)).await;
        // No variants, so the chain gets as far as creating the publish directory.
        let ticket = seeded_job(&store, "gone1", ".jpg", &[], PreviewMode::None).await;
        queue.enqueue(&ticket).await.unwrap();
        store.remove(&ticket.id).await.unwrap();

        let (id, status) = worker.run_once().await.unwrap().unwrap();

        assert_eq!(status, Status::Failed);
        assert_eq!(queue.status_of(&id).await.unwrap(), Some(Status::Failed));
        assert_eq!(store.lookup(&id).await.unwrap(), Presence::NotFound);
        assert!(!store.publish_dir(&id).exists());
    }

    #[tokio::test]
    async fn run_drains_the_queue_in_order_then_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (worker, store, queue) = fixture(&dir, FakeCodec::new(800)).await;
        for raw in ["first", "second", "third"] {
            let ticket = seeded_job(&store, raw, ".gif", &[], PreviewMode::None).await;
            queue.enqueue(&ticket).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let worker = Arc::new(worker);
        let running = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.counts().await.unwrap().completed < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(queue.counts().await.unwrap().queued, 0);
    }
}
