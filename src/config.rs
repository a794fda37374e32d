use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::telemetry::LogSinks;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Run the coordinator: supervised workers plus the expiration reaper
    Serve {
        #[arg(long, help = "Run workers as tasks of this process instead of child processes")]
        in_process: bool,
    },
    /// Run a single worker against the shared queue
    Worker {
        #[arg(long)]
        worker_id: Option<Uuid>,

        #[arg(long, help = "Stop once stdin is closed by the coordinator")]
        supervised: bool,
    },
    /// Accept an image and print its id
    Submit {
        file: PathBuf,

        #[arg(short = 's', long = "size", help = "Size class to publish, repeatable or comma separated")]
        sizes: Vec<String>,

        #[arg(short = 'p', long, help = "Preview style: blur, pixelate or tessellate")]
        preview: Option<String>,

        #[arg(long, help = "Base name of the published files")]
        name: Option<String>,
    },
    /// Print the status of a job as JSON
    Status { id: String },
    /// Copy the archive of a ready job
    Download {
        id: String,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Remove every trace of a job
    Delete { id: String },
    /// Run one expiration and staleness sweep
    Reap,
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct Config {
    #[arg(
        short = 'd',
        long = "data-dir",
        env = "IMGQ_DATA_DIR",
        help = "Root of the working and published trees",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "queue-db",
        env = "IMGQ_QUEUE_DB",
        help = "SQLite queue database [default: <data-dir>/queue.db]"
    )]
    pub queue_db: Option<PathBuf>,

    #[arg(
        short = 'n',
        long = "workers",
        env = "IMGQ_WORKERS",
        help = "Number of worker processes [default: number of cores]"
    )]
    pub workers: Option<usize>,

    #[arg(
        long = "reap-interval-secs",
        env = "IMGQ_REAP_INTERVAL_SECS",
        default_value = "60"
    )]
    pub reap_interval_secs: u64,

    #[arg(
        long = "retention-hours",
        env = "IMGQ_RETENTION_HOURS",
        help = "Age at which published artifacts expire",
        default_value = "72"
    )]
    pub retention_hours: u64,

    #[arg(
        long = "stale-after-mins",
        env = "IMGQ_STALE_AFTER_MINS",
        help = "Age at which unfinished job directories are swept",
        default_value = "60"
    )]
    pub stale_after_mins: u64,

    #[arg(
        long = "poll-interval-ms",
        env = "IMGQ_POLL_INTERVAL_MS",
        default_value = "500"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "max-upload-bytes",
        env = "IMGQ_MAX_UPLOAD_BYTES",
        default_value = "20971520"
    )]
    pub max_upload_bytes: u64,

    #[arg(
        long = "log-dir",
        env = "IMGQ_LOG_DIR",
        help = "Directory of process.log and err.log [default: <data-dir>/logs]"
    )]
    pub log_dir: Option<PathBuf>,

    #[arg(long = "process-log-cap", env = "IMGQ_PROCESS_LOG_CAP", default_value = "50000")]
    pub process_log_cap: u64,

    #[arg(long = "error-log-cap", env = "IMGQ_ERROR_LOG_CAP", default_value = "10000")]
    pub error_log_cap: u64,

    #[arg(
        long = "jaeger-endpoint",
        env = "IMGQ_JAEGER_ENDPOINT",
        help = "Jaeger collector URL, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl Config {
    pub fn queue_db_path(&self) -> PathBuf {
        self.queue_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("queue.db"))
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 60 * 60)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_mins * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_sinks(&self) -> LogSinks {
        LogSinks {
            dir: self
                .log_dir
                .clone()
                .unwrap_or_else(|| self.data_dir.join("logs")),
            process_cap: self.process_log_cap,
            error_cap: self.error_log_cap,
        }
    }

    /// Arguments that hand this configuration to a worker process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--data-dir".to_string(),
            self.data_dir.display().to_string(),
            "--queue-db".to_string(),
            self.queue_db_path().display().to_string(),
            "--poll-interval-ms".to_string(),
            self.poll_interval_ms.to_string(),
            "--max-upload-bytes".to_string(),
            self.max_upload_bytes.to_string(),
            "--log-dir".to_string(),
            self.log_sinks().dir.display().to_string(),
            "--process-log-cap".to_string(),
            self.process_log_cap.to_string(),
            "--error-log-cap".to_string(),
            self.error_log_cap.to_string(),
        ];
        if let Some(endpoint) = &self.jaeger_endpoint {
            args.push("--jaeger-endpoint".to_string());
            args.push(endpoint.clone());
        }
        args
    }
}
