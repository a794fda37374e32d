use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Input rejected at submission time. The job is never enqueued.
#[derive(Debug, Error)]
pub enum ValidationFault {
    #[error("no file name was supplied")]
    MissingFileName,
    #[error("upload is empty")]
    EmptyUpload,
    #[error("upload is {size} bytes, the limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported image format `{0}`")]
    UnsupportedFormat(String),
    #[error("unknown size class `{0}`")]
    UnknownSizeClass(String),
    #[error("unknown preview mode `{0}`")]
    UnknownPreviewMode(String),
    #[error("malformed id `{0}`")]
    MalformedId(String),
}

/// A filesystem operation failed. Fatal to the job that hit it, never to the process.
#[derive(Debug, Error)]
#[error("failed to {op} {}: {source}", .path.display())]
pub struct StorageFault {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StorageFault {
    pub fn new(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub(crate) trait StorageResultExt<T> {
    fn storage(self, op: &'static str, path: impl AsRef<Path>) -> Result<T, StorageFault>;
}

impl<T> StorageResultExt<T> for io::Result<T> {
    fn storage(self, op: &'static str, path: impl AsRef<Path>) -> Result<T, StorageFault> {
        self.map_err(|err| StorageFault::new(op, path, err))
    }
}

/// Anything the codec boundary reports. Always surfaces as a stage failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum StageCause {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageFault),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A pipeline stage failed for one job.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {cause}")]
pub struct StageFault {
    pub stage: &'static str,
    #[source]
    pub cause: StageCause,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationFault),
    #[error(transparent)]
    Storage(#[from] StorageFault),
    #[error("queue: {0}")]
    Queue(#[from] sqlx::Error),
    #[error("could not allocate an unused id after {0} attempts")]
    IdExhausted(usize),
}
