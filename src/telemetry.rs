use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use opentelemetry::global;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const PROCESS_LOG: &str = "process.log";
pub const ERROR_LOG: &str = "err.log";

/// Where the size-capped log files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSinks {
    pub dir: PathBuf,
    pub process_cap: u64,
    pub error_cap: u64,
}

/// Log file that is truncated before a write whenever it has grown past `cap` bytes.
pub struct CappedFile {
    file: File,
    cap: u64,
}

impl CappedFile {
    pub fn open(path: impl AsRef<Path>, cap: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, cap })
    }
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.metadata()?.len() > self.cap {
            self.file.set_len(0)?;
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Hands the file to a background writer thread. Keep the guard until shutdown.
fn non_blocking(path: PathBuf, cap: u64) -> io::Result<(NonBlocking, WorkerGuard)> {
    Ok(tracing_appender::non_blocking(CappedFile::open(path, cap)?))
}

/// Keeps the log writer threads alive. Pass it back to [`shutdown`].
#[must_use]
pub struct Logging {
    _guards: Vec<WorkerGuard>,
}

pub fn init(sinks: &LogSinks, jaeger_endpoint: Option<&str>) -> Result<Logging, Box<dyn std::error::Error>> {
    fs::create_dir_all(&sinks.dir)?;
    let (process_log, process_guard) = non_blocking(sinks.dir.join(PROCESS_LOG), sinks.process_cap)?;
    let (error_log, error_guard) = non_blocking(sinks.dir.join(ERROR_LOG), sinks.error_cap)?;

    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            env::remove_var("http_proxy");
            env::remove_var("https_proxy");
            env::remove_var("HTTP_PROXY");
            env::remove_var("HTTPS_PROXY");

            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name("imgq")
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("imgq=debug"))?;

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(fmt::Layer::default().with_ansi(false).with_writer(process_log))
        .with(
            fmt::Layer::default()
                .with_ansi(false)
                .with_writer(error_log.with_max_level(Level::ERROR)),
        )
        .try_init()?;

    Ok(Logging {
        _guards: vec![process_guard, error_guard],
    })
}

/// Flushes the log files and the trace exporter.
pub fn shutdown(logging: Logging) {
    global::shutdown_tracer_provider();
    drop(logging);
}
