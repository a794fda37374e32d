//! Keeps a fixed number of worker slots occupied, replacing any worker that exits.
//!
//! Every slot cycles `Starting → Running → Restarting → Starting` until shutdown,
//! when it settles in `Stopped`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::pipeline::Pipeline;
use crate::store::ContentStore;
use crate::worker::Worker;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request during shutdown.
    Stopped,
    Exited(Option<i32>),
    Crashed(String),
}

#[async_trait]
pub trait RunningWorker: Send {
    fn worker_id(&self) -> Uuid;

    fn pid(&self) -> Option<u32>;

    /// Resolves when the worker is gone. Cancelling asks it to stop after its current job.
    async fn wait(&mut self, cancel: CancellationToken) -> WorkerExit;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, slot: usize) -> Result<Box<dyn RunningWorker>, Error>;
}

/// Runs every worker as a child process of the current executable.
pub struct ProcessLauncher {
    program: PathBuf,
    /// Global arguments placed before the `worker` subcommand.
    args: Vec<String>,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<String>, grace: Duration) -> Self {
        Self {
            program,
            args,
            grace,
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, slot: usize) -> Result<Box<dyn RunningWorker>, Error> {
        let worker_id = Uuid::new_v4();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--supervised")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(slot, worker_id = %worker_id, pid = ?child.id(), "Spawned worker process");

        Ok(Box::new(WorkerProcess {
            worker_id,
            child,
            grace: self.grace,
        }))
    }
}

struct WorkerProcess {
    worker_id: Uuid,
    child: Child,
    grace: Duration,
}

#[async_trait]
impl RunningWorker for WorkerProcess {
    fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self, cancel: CancellationToken) -> WorkerExit {
        tokio::select! {
            status = self.child.wait() => match status {
                Ok(status) => WorkerExit::Exited(status.code()),
                Err(err) => WorkerExit::Crashed(err.to_string()),
            },
            _ = cancel.cancelled() => {
                // Closing stdin is the stop request.
                drop(self.child.stdin.take());
                match timeout(self.grace, self.child.wait()).await {
                    Ok(Ok(_)) => WorkerExit::Stopped,
                    Ok(Err(err)) => WorkerExit::Crashed(err.to_string()),
                    Err(_) => {
                        warn!(worker_id = %self.worker_id, "Worker ignored stop request, killing");
                        if let Err(err) = self.child.kill().await {
                            error!(worker_id = %self.worker_id, error = %err, "Failed to kill worker");
                        }
                        WorkerExit::Stopped
                    }
                }
            }
        }
    }
}

/// Runs every worker as a tokio task of the coordinator.
pub struct TaskLauncher {
    queue: DbHandle,
    store: ContentStore,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
}

impl TaskLauncher {
    pub fn new(queue: DbHandle, store: ContentStore, pipeline: Arc<Pipeline>, poll_interval: Duration) -> Self {
        Self {
            queue,
            store,
            pipeline,
            poll_interval,
        }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, slot: usize) -> Result<Box<dyn RunningWorker>, Error> {
        let worker = Worker::new(
            Uuid::new_v4(),
            self.queue.clone(),
            self.store.clone(),
            self.pipeline.clone(),
            self.poll_interval,
        );
        let worker_id = worker.worker_id();
        let stop = CancellationToken::new();
        let handle = tokio::spawn({
            let stop = stop.clone();
            async move { worker.run(stop).await }.instrument(info_span!("worker", slot, worker_id = %worker_id))
        });

        Ok(Box::new(WorkerTask {
            worker_id,
            handle,
            stop,
        }))
    }
}

struct WorkerTask {
    worker_id: Uuid,
    handle: JoinHandle<Result<(), Error>>,
    stop: CancellationToken,
}

impl WorkerTask {
    fn exit_of(joined: Result<Result<(), Error>, tokio::task::JoinError>, stopping: bool) -> WorkerExit {
        match joined {
            Ok(Ok(())) if stopping => WorkerExit::Stopped,
            Ok(Ok(())) => WorkerExit::Exited(Some(0)),
            Ok(Err(err)) => WorkerExit::Crashed(format!("{err:#}")),
            Err(err) => WorkerExit::Crashed(err.to_string()),
        }
    }
}

#[async_trait]
impl RunningWorker for WorkerTask {
    fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self, cancel: CancellationToken) -> WorkerExit {
        tokio::select! {
            joined = &mut self.handle => Self::exit_of(joined, false),
            _ = cancel.cancelled() => {
                self.stop.cancel();
                Self::exit_of((&mut self.handle).await, true)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running { worker_id: Uuid, pid: Option<u32> },
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub slots: Vec<WorkerState>,
    pub launches: u64,
    pub restarts: u64,
}

enum SlotEvent {
    Exited {
        slot: usize,
        worker_id: Uuid,
        exit: WorkerExit,
    },
    Retry {
        slot: usize,
    },
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    queue: DbHandle,
    state: watch::Sender<SupervisorSnapshot>,
    retry_delay: Duration,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, queue: DbHandle, slots: usize) -> Self {
        let (state, _) = watch::channel(SupervisorSnapshot {
            slots: vec![WorkerState::Starting; slots],
            launches: 0,
            restarts: 0,
        });
        Self {
            launcher,
            queue,
            state,
            retry_delay: LAUNCH_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.state.subscribe()
    }

    fn set_state(&self, slot: usize, state: WorkerState) {
        self.state.send_modify(|snapshot| snapshot.slots[slot] = state);
    }

    /// Supervises every slot until `cancel` fires and all workers have stopped.
    pub async fn run(&self, cancel: CancellationToken) {
        let slots = self.state.borrow().slots.len();
        info!(slots, "Supervisor started.");

        let mut pending: FuturesUnordered<BoxFuture<'static, SlotEvent>> = FuturesUnordered::new();
        for slot in 0..slots {
            let next = self.start(slot, &cancel).await;
            pending.push(next);
        }

        while let Some(event) = pending.next().await {
            match event {
                SlotEvent::Exited {
                    slot,
                    worker_id,
                    exit,
                } => {
                    match self.queue.abandon_claims(worker_id, "worker exited before finishing").await {
                        Ok(0) => {}
                        Ok(abandoned) => warn!(slot, worker_id = %worker_id, abandoned, "Abandoned claimed jobs"),
                        Err(err) => error!(slot, worker_id = %worker_id, error = %err, "Failed to abandon claims"),
                    }

                    if cancel.is_cancelled() {
                        debug!(slot, worker_id = %worker_id, exit = ?exit, "Worker stopped");
                        self.set_state(slot, WorkerState::Stopped);
                        continue;
                    }

                    warn!(slot, worker_id = %worker_id, exit = ?exit, "Worker exited, restarting");
                    self.set_state(slot, WorkerState::Restarting);
                    self.state.send_modify(|snapshot| snapshot.restarts += 1);
                    let next = self.start(slot, &cancel).await;
                    pending.push(next);
                }
                SlotEvent::Retry { slot } => {
                    if cancel.is_cancelled() {
                        self.set_state(slot, WorkerState::Stopped);
                    } else {
                        let next = self.start(slot, &cancel).await;
                        pending.push(next);
                    }
                }
            }
        }
        info!("Supervisor stopped.");
    }

    async fn start(&self, slot: usize, cancel: &CancellationToken) -> BoxFuture<'static, SlotEvent> {
        self.set_state(slot, WorkerState::Starting);
        let cancel = cancel.clone();

        match self.launcher.launch(slot).await {
            Ok(mut worker) => {
                let worker_id = worker.worker_id();
                let pid = worker.pid();
                self.state.send_modify(|snapshot| {
                    snapshot.slots[slot] = WorkerState::Running { worker_id, pid };
                    snapshot.launches += 1;
                });
                info!(slot, worker_id = %worker_id, pid = ?pid, "Worker running");

                async move {
                    let exit = worker.wait(cancel).await;
                    SlotEvent::Exited {
                        slot,
                        worker_id,
                        exit,
                    }
                }
                .boxed()
            }
            Err(err) => {
                error!(slot, error = %err, "Failed to launch worker");
                self.set_state(slot, WorkerState::Restarting);
                let delay = self.retry_delay;
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {},
                        _ = sleep(delay) => {},
                    }
                    SlotEvent::Retry { slot }
                }
                .boxed()
            }
        }
    }
}
