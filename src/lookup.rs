//! Read-only status and manifest queries over the content store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::error::{StorageFault, StorageResultExt};
use crate::pipeline::EMBED_FILE_NAME;
use crate::preview::PREVIEW_WIDTH;
use crate::store::{ContentStore, Presence};
use crate::{JobId, SizeClass};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    NotFound,
    InProgress,
    Failed { reason: String },
    Ready(Manifest),
}

impl JobStatus {
    /// HTTP-style code of the status.
    pub fn code(&self) -> u16 {
        match self {
            JobStatus::NotFound => 404,
            JobStatus::InProgress => 202,
            JobStatus::Failed { .. } => 422,
            JobStatus::Ready(_) => 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub id: JobId,
    /// Base name shared by every artifact.
    pub filename: String,
    pub archive: String,
    pub created: DateTime<Utc>,
    pub files: Vec<Artifact>,
    /// Embed snippet, when one was written.
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub bytes: u64,
    pub file_size: String,
    /// `original`, `async`, or a size class label.
    pub size: String,
    pub width: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LookupService {
    store: ContentStore,
}

impl LookupService {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus, StorageFault> {
        match self.store.lookup(id).await? {
            Presence::NotFound => Ok(JobStatus::NotFound),
            Presence::InProgress => Ok(JobStatus::InProgress),
            Presence::Failed(reason) => Ok(JobStatus::Failed { reason }),
            Presence::Ready => match self.manifest(id).await? {
                Some(manifest) => Ok(JobStatus::Ready(manifest)),
                // Deleted or expired between the two reads.
                None => Ok(JobStatus::NotFound),
            },
        }
    }

    /// Path of the archive once the id is ready.
    pub async fn archive(&self, id: &JobId) -> Result<Option<PathBuf>, StorageFault> {
        match self.store.lookup(id).await? {
            Presence::Ready => Ok(Some(self.store.archive_path(id))),
            _ => Ok(None),
        }
    }

    async fn manifest(&self, id: &JobId) -> Result<Option<Manifest>, StorageFault> {
        let archive = self.store.archive_path(id);
        let archive_meta = match fs::metadata(&archive).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageFault::new("stat", &archive, err)),
        };
        let created = archive_meta
            .created()
            .or_else(|_| archive_meta.modified())
            .storage("stat", &archive)?;

        let dir = self.store.publish_dir(id);
        let mut filename = String::new();
        let mut files = Vec::new();
        let mut code = None;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageFault::new("list", &dir, err)),
        };
        while let Some(entry) = entries.next_entry().await.storage("list", &dir)? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == EMBED_FILE_NAME {
                code = Some(fs::read_to_string(entry.path()).await.storage("read", entry.path())?);
                continue;
            }
            if Path::new(&name).extension().is_some_and(|ext| ext == "html") {
                continue;
            }
            let bytes = entry.metadata().await.storage("stat", entry.path())?.len();
            let (base, size) = classify(&name);
            filename = base;
            files.push(Artifact {
                width: label_width(&size),
                file_size: human_size(bytes),
                name,
                bytes,
                size,
            });
        }
        files.sort_by(|a, b| {
            a.width
                .unwrap_or(u32::MAX)
                .cmp(&b.width.unwrap_or(u32::MAX))
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Some(Manifest {
            id: id.clone(),
            filename,
            archive: format!("{id}.zip"),
            created: created.into(),
            files,
            code,
        }))
    }
}

/// Splits `beach-small.jpg` into (`beach`, `small`).
fn classify(name: &str) -> (String, String) {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    match stem.rsplit_once('-') {
        Some((base, label)) => (base.to_string(), label.to_string()),
        None => (stem.to_string(), String::new()),
    }
}

fn label_width(label: &str) -> Option<u32> {
    match label {
        "async" => Some(PREVIEW_WIDTH),
        other => other.parse::<SizeClass>().ok().map(SizeClass::width),
    }
}

/// Decimal units: below one megabyte in whole kilobytes, above with one decimal.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1_000_000 {
        format!("{}kb", (bytes as f64 / 1_000.0).round() as u64)
    } else {
        format!("{:.1}mb", bytes as f64 / 1_000_000.0)
    }
}
