use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod job;
pub mod lookup;
pub mod pipeline;
pub mod preview;
pub mod reaper;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use job::{ImageKind, JobContext, JobId, MimeClass, PreviewMode, SizeClass};

/// What a submission leaves on the queue. Everything else a worker needs is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: JobId,
    pub base_name: String,
    pub extension: String,
    pub kind: ImageKind,
    pub variants: BTreeSet<SizeClass>,
    pub preview: PreviewMode,
}

impl JobTicket {
    pub fn original_file_name(&self) -> String {
        format!("{}-original{}", self.base_name, self.extension)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub seq: i64,
    pub payload: sqlx::types::Json<JobTicket>,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}
