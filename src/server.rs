use crate::db::DbHandle;
use crate::reaper::{self, Reaper};
use crate::store::ContentStore;
use crate::supervisor::{Supervisor, WorkerLauncher};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub workers: usize,
    pub reap_interval: Duration,
    pub retention: Duration,
    pub stale_after: Duration,
}

/// Coordinator: keeps the worker slots filled and feeds the reap queue until cancelled.
pub async fn serve(
    cancel_token: CancellationToken,
    options: ServeOptions,
    queue: DbHandle,
    store: ContentStore,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<(), Error> {
    // No worker runs yet, so anything still marked processing was lost with the last coordinator.
    let abandoned = queue
        .abandon_all_claims("coordinator restarted while the job was processing")
        .await?;
    if abandoned > 0 {
        warn!(abandoned, "Abandoned jobs claimed before restart");
    }
    let counts = queue.counts().await?;
    info!(
        queued = counts.queued,
        completed = counts.completed,
        failed = counts.failed,
        workers = options.workers,
        "Server starting"
    );

    let (send_to_reaper, recv_from_timer) = reaper::reap_queue();
    let reaper = Reaper::new(store, queue.clone(), options.retention, options.stale_after);

    let timer = tokio::spawn(
        reaper::schedule(cancel_token.clone(), options.reap_interval, send_to_reaper)
            .instrument(info_span!("reap_timer")),
    );
    let consumer = tokio::spawn(
        reaper::consume(cancel_token.clone(), recv_from_timer, reaper).instrument(info_span!("reaper")),
    );

    let supervisor = Supervisor::new(launcher, queue, options.workers);
    supervisor
        .run(cancel_token.clone())
        .instrument(info_span!("supervisor"))
        .await;

    futures::future::join_all([timer, consumer])
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
