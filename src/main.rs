use anyhow::{bail, Error};
use clap::Parser;
use serde_json::json;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use imgq::codec::RasterCodec;
use imgq::config::{Cli, Command, Config};
use imgq::db::DbHandle;
use imgq::intake::{Intake, SizeParam, Submission};
use imgq::lookup::LookupService;
use imgq::pipeline::Pipeline;
use imgq::preview::PreviewParams;
use imgq::reaper::Reaper;
use imgq::server::{self, ServeOptions};
use imgq::store::ContentStore;
use imgq::supervisor::{ProcessLauncher, TaskLauncher, WorkerLauncher, DEFAULT_SHUTDOWN_GRACE};
use imgq::worker::{self, Worker};
use imgq::{telemetry, JobId};

async fn open(config: &Config) -> Result<(ContentStore, DbHandle), Error> {
    let store = ContentStore::open(&config.data_dir).await?;
    let queue_db = config.queue_db_path();
    if let Some(parent) = queue_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let queue = DbHandle::new(&queue_db).await?;
    Ok((store, queue))
}

fn standard_pipeline(store: &ContentStore) -> Arc<Pipeline> {
    Arc::new(Pipeline::standard(
        Arc::new(RasterCodec::new()),
        store.clone(),
        Arc::new(PreviewParams::from_entropy()),
    ))
}

fn print_json(value: &serde_json::Value) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[instrument(skip_all, fields(command = ?cli.command))]
async fn setup(cli: Cli, cancel_token: CancellationToken) -> Result<(), Error> {
    let config = cli.config;
    let (store, queue) = open(&config).await?;

    match cli.command {
        Command::Serve { in_process } => {
            let launcher: Arc<dyn WorkerLauncher> = if in_process {
                Arc::new(TaskLauncher::new(
                    queue.clone(),
                    store.clone(),
                    standard_pipeline(&store),
                    config.poll_interval(),
                ))
            } else {
                Arc::new(ProcessLauncher::new(
                    env::current_exe()?,
                    config.to_args(),
                    DEFAULT_SHUTDOWN_GRACE,
                ))
            };
            let options = ServeOptions {
                workers: config.worker_count(),
                reap_interval: config.reap_interval(),
                retention: config.retention(),
                stale_after: config.stale_after(),
            };
            server::serve(cancel_token, options, queue, store, launcher)
                .instrument(info_span!("server"))
                .await?;
        }
        Command::Worker {
            worker_id,
            supervised,
        } => {
            let worker_id = worker_id.unwrap_or_else(Uuid::new_v4);
            if supervised {
                tokio::spawn(worker::cancel_on_eof(tokio::io::stdin(), cancel_token.clone()));
            }
            let pipeline = standard_pipeline(&store);
            Worker::new(worker_id, queue, store, pipeline, config.poll_interval())
                .run(cancel_token)
                .instrument(info_span!("worker", worker_id = %worker_id))
                .await?;
        }
        Command::Submit {
            file,
            sizes,
            preview,
            name,
        } => {
            let bytes = tokio::fs::read(&file).await?;
            let submission = Submission {
                file_name: file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string),
                bytes,
                sizes: (!sizes.is_empty()).then_some(SizeParam::Many(sizes)),
                preview,
                output_name: name,
            };
            let id = Intake::new(store, queue, config.max_upload_bytes)
                .submit(submission)
                .await?;
            print_json(&json!({ "id": id }))?;
        }
        Command::Status { id } => {
            let id = JobId::parse(&id)?;
            let status = LookupService::new(store).status(&id).await?;
            let mut body = serde_json::to_value(&status)?;
            body["code"] = json!(status.code());
            print_json(&body)?;
        }
        Command::Download { id, output } => {
            let id = JobId::parse(&id)?;
            let Some(archive) = LookupService::new(store).archive(&id).await? else {
                bail!("job {id} has no archive yet");
            };
            copy_archive(&archive, &output).await?;
            print_json(&json!({ "id": id, "archive": output }))?;
        }
        Command::Delete { id } => {
            let id = JobId::parse(&id)?;
            let withdrawn = Intake::new(store, queue, config.max_upload_bytes).delete(&id).await?;
            print_json(&json!({ "id": id, "deleted": true, "withdrawn": withdrawn }))?;
        }
        Command::Reap => {
            let report = Reaper::new(store, queue, config.retention(), config.stale_after())
                .sweep()
                .await?;
            print_json(&json!({ "expired": report.expired, "stale": report.stale }))?;
        }
    }

    Ok(())
}

async fn copy_archive(archive: &Path, output: &Path) -> Result<(), Error> {
    let bytes = tokio::fs::copy(archive, output).await?;
    debug!(archive = %archive.display(), output = %output.display(), bytes, "Archive copied");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "imgq=debug");
    }

    let cli = Cli::parse();
    let logging = telemetry::init(&cli.config.log_sinks(), cli.config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cli, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    let result = app.await?;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "Command failed");
    }
    telemetry::shutdown(logging);

    result?;

    Ok(())
}
