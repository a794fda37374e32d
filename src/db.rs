use crate::{JobId, JobTicket, QueueEntry, Status};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Durable FIFO of image jobs, shared by every worker process through one SQLite file.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl DbHandle {
    pub async fn new(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub async fn enqueue(&self, ticket: &JobTicket) -> Result<i64, sqlx::Error> {
        debug!("Submitting job {:?}", ticket);
        sqlx::query_scalar(
            "INSERT INTO image_jobs (id, payload, status, submitted_at) \
            VALUES (?1, ?2, 'QUEUED', ?3) \
            RETURNING seq",
        )
        .bind(ticket.id.as_str())
        .bind(Json(ticket))
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
    }

    /// Claims the oldest queued job for `worker`. The single UPDATE statement is the
    /// serialization point: no two workers can claim the same row.
    pub async fn claim_next(&self, worker: Uuid) -> Result<Option<QueueEntry>, sqlx::Error> {
        sqlx::query_as::<_, QueueEntry>(
            "UPDATE image_jobs \
                SET status = 'PROCESSING', \
                claimed_by = ?1, \
                started_at = ?2 \
            WHERE seq = (SELECT seq FROM image_jobs WHERE status = 'QUEUED' ORDER BY seq LIMIT 1) \
            RETURNING seq, payload, status",
        )
        .bind(worker.to_string())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
    }

    pub async fn complete_job(&self, id: &JobId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE image_jobs \
                SET status = 'COMPLETED', \
                finished_at = ?1 \
            WHERE id = ?2 AND status = 'PROCESSING'",
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub async fn fail_job(&self, id: &JobId, msg: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE image_jobs \
                SET status = 'FAILED', \
                finished_at = ?1, \
                error = ?2 \
            WHERE id = ?3 AND status = 'PROCESSING'",
        )
        .bind(Utc::now())
        .bind(msg)
        .bind(id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fails whatever `worker` still holds. Abandoned jobs are never requeued.
    pub async fn abandon_claims(&self, worker: Uuid, reason: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE image_jobs \
                SET status = 'FAILED', \
                finished_at = ?1, \
                error = ?2 \
            WHERE claimed_by = ?3 AND status = 'PROCESSING'",
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(worker.to_string())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fails every job still marked processing. Only safe while no worker runs.
    pub async fn abandon_all_claims(&self, reason: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE image_jobs \
                SET status = 'FAILED', \
                finished_at = ?1, \
                error = ?2 \
            WHERE status = 'PROCESSING'",
        )
        .bind(Utc::now())
        .bind(reason)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Withdraws a job nobody has claimed yet. Returns false when it was already taken
    /// or finished.
    pub async fn cancel(&self, id: &JobId, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE image_jobs \
                SET status = 'FAILED', \
                finished_at = ?1, \
                error = ?2 \
            WHERE id = ?3 AND status = 'QUEUED'",
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Ids still waiting in the queue or held by a worker.
    pub async fn active_ids(&self) -> Result<HashSet<JobId>, sqlx::Error> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM image_jobs WHERE status IN ('QUEUED', 'PROCESSING')")
                .fetch_all(&*self.pool)
                .await?;

        Ok(ids.iter().filter_map(|raw| JobId::parse(raw).ok()).collect())
    }

    /// Ids are never reused, so every id ever issued stays here.
    pub async fn contains(&self, id: &JobId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM image_jobs WHERE id = ?1)")
            .bind(id.as_str())
            .fetch_one(&*self.pool)
            .await
    }

    pub async fn status_of(&self, id: &JobId) -> Result<Option<Status>, sqlx::Error> {
        sqlx::query_scalar("SELECT status FROM image_jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
    }

    pub async fn counts(&self) -> Result<QueueCounts, sqlx::Error> {
        let rows: Vec<(Status, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM image_jobs GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status {
                Status::Queued => counts.queued = count,
                Status::Processing => counts.processing = count,
                Status::Completed => counts.completed = count,
                Status::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageKind, PreviewMode, SizeClass};
    use std::collections::{BTreeSet, HashSet};
    use tempfile::TempDir;

    fn ticket(raw: &str) -> JobTicket {
        JobTicket {
            id: JobId::parse(raw).unwrap(),
            base_name: "cat".into(),
            extension: ".jpg".into(),
            kind: ImageKind::Jpeg,
            variants: BTreeSet::from([SizeClass::Small]),
            preview: PreviewMode::Blur,
        }
    }

    async fn open(dir: &TempDir) -> DbHandle {
        DbHandle::new(&dir.path().join("queue.db")).await.unwrap()
    }

    #[tokio::test]
    async fn claims_are_fifo_and_carry_the_ticket() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.enqueue(&ticket("first")).await.unwrap();
        db.enqueue(&ticket("second")).await.unwrap();

        let worker = Uuid::new_v4();
        let a = db.claim_next(worker).await.unwrap().unwrap();
        let b = db.claim_next(worker).await.unwrap().unwrap();

        assert_eq!(a.payload.0, ticket("first"));
        assert_eq!(a.status, Status::Processing);
        assert_eq!(b.payload.id.as_str(), "second");
        assert!(db.claim_next(worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_an_entry() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        for i in 0..40 {
            db.enqueue(&ticket(&format!("job{i}"))).await.unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let db = db.clone();
            tasks.spawn(async move {
                let worker = Uuid::new_v4();
                let mut claimed = Vec::new();
                while let Some(entry) = db.claim_next(worker).await.unwrap() {
                    claimed.push(entry.payload.id.clone());
                }
                claimed
            });
        }

        let mut seen = HashSet::new();
        while let Some(claimed) = tasks.join_next().await {
            for id in claimed.unwrap() {
                assert!(seen.insert(id), "claimed twice");
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn acknowledgements_and_abandonment() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        for raw in ["ok", "bad", "lost"] {
            db.enqueue(&ticket(raw)).await.unwrap();
        }
        let (steady, crashed) = (Uuid::new_v4(), Uuid::new_v4());

        let ok = db.claim_next(steady).await.unwrap().unwrap();
        db.complete_job(&ok.payload.id).await.unwrap();
        let bad = db.claim_next(steady).await.unwrap().unwrap();
        db.fail_job(&bad.payload.id, "optimize: refused").await.unwrap();
        db.claim_next(crashed).await.unwrap().unwrap();

        assert_eq!(db.abandon_claims(steady, "exited").await.unwrap(), 0);
        assert_eq!(db.abandon_claims(crashed, "exited").await.unwrap(), 1);

        let counts = db.counts().await.unwrap();
        assert_eq!(
            counts,
            QueueCounts {
                queued: 0,
                processing: 0,
                completed: 1,
                failed: 2
            }
        );
        let lost = JobId::parse("lost").unwrap();
        assert_eq!(db.status_of(&lost).await.unwrap(), Some(Status::Failed));
    }

    #[tokio::test]
    async fn only_unclaimed_jobs_can_be_cancelled() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        for raw in ["busy", "waiting", "done"] {
            db.enqueue(&ticket(raw)).await.unwrap();
        }
        let worker = Uuid::new_v4();
        let busy = db.claim_next(worker).await.unwrap().unwrap().payload.id.clone();
        let waiting = JobId::parse("waiting").unwrap();
        let done = JobId::parse("done").unwrap();

        assert_eq!(db.active_ids().await.unwrap(), HashSet::from([busy.clone(), waiting.clone(), done.clone()]));

        assert!(db.cancel(&waiting, "deleted").await.unwrap());
        assert!(!db.cancel(&waiting, "deleted").await.unwrap());
        assert!(!db.cancel(&busy, "deleted").await.unwrap());
        assert_eq!(db.status_of(&waiting).await.unwrap(), Some(Status::Failed));
        assert_eq!(db.status_of(&busy).await.unwrap(), Some(Status::Processing));

        let next = db.claim_next(worker).await.unwrap().unwrap();
        assert_eq!(next.payload.id, done);
        db.complete_job(&done).await.unwrap();
        assert_eq!(db.active_ids().await.unwrap(), HashSet::from([busy]));
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.enqueue(&ticket("taken")).await.unwrap();

        assert!(db.contains(&JobId::parse("taken").unwrap()).await.unwrap());
        assert!(!db.contains(&JobId::parse("free").unwrap()).await.unwrap());

        let err = db.enqueue(&ticket("taken")).await.unwrap_err();
        assert!(is_unique_violation(&err));
    }
}
