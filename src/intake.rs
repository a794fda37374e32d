//! Upload intake: validates a submission, stages the source file and enqueues a ticket.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::db::{is_unique_violation, DbHandle};
use crate::error::{StorageFault, SubmitError, ValidationFault};
use crate::store::ContentStore;
use crate::{ImageKind, JobId, JobTicket, PreviewMode, SizeClass};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;
const MAX_ID_ATTEMPTS: usize = 8;

/// The size parameter as clients send it: one class, a comma separated list, or an array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeParam {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Submission {
    pub file_name: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub sizes: Option<SizeParam>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
}

/// Normalizes the loose size parameter into an ordered set. Absent means no variants.
pub fn normalize_sizes(param: Option<&SizeParam>) -> Result<BTreeSet<SizeClass>, ValidationFault> {
    let raw: Vec<&str> = match param {
        None => Vec::new(),
        Some(SizeParam::One(list)) => list.split(',').collect(),
        Some(SizeParam::Many(items)) => items.iter().map(String::as_str).collect(),
    };
    raw.into_iter()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::parse)
        .collect()
}

/// Base name shared by every artifact. Dots and path separators are stripped; an empty
/// result falls back to the upload's own stem.
pub fn sanitize_base_name(output_name: Option<&str>, file_name: &str) -> String {
    let clean = |raw: &str| -> String {
        raw.chars()
            .filter(|c| !matches!(c, '.' | '/' | '\\'))
            .collect::<String>()
            .trim()
            .to_string()
    };

    if let Some(name) = output_name.map(clean).filter(|name| !name.is_empty()) {
        return name;
    }
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(clean)
        .unwrap_or_default();
    if stem.is_empty() {
        "image".to_string()
    } else {
        stem
    }
}

/// A submission that passed validation, waiting for an id.
#[derive(Debug, Clone)]
struct Accepted {
    base_name: String,
    extension: String,
    kind: ImageKind,
    variants: BTreeSet<SizeClass>,
    preview: PreviewMode,
}

impl Accepted {
    fn ticket(&self, id: JobId) -> JobTicket {
        JobTicket {
            id,
            base_name: self.base_name.clone(),
            extension: self.extension.clone(),
            kind: self.kind,
            variants: self.variants.clone(),
            preview: self.preview,
        }
    }
}

#[derive(Clone)]
pub struct Intake {
    store: ContentStore,
    queue: DbHandle,
    max_upload_bytes: u64,
}

impl Intake {
    pub fn new(store: ContentStore, queue: DbHandle, max_upload_bytes: u64) -> Self {
        Self {
            store,
            queue,
            max_upload_bytes,
        }
    }

    fn validate(&self, submission: &Submission) -> Result<Accepted, ValidationFault> {
        let file_name = submission
            .file_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(ValidationFault::MissingFileName)?;

        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let kind = ImageKind::from_extension(extension)
            .ok_or_else(|| ValidationFault::UnsupportedFormat(extension.to_string()))?;

        let size = submission.bytes.len() as u64;
        if size == 0 {
            return Err(ValidationFault::EmptyUpload);
        }
        if size > self.max_upload_bytes {
            return Err(ValidationFault::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let variants = normalize_sizes(submission.sizes.as_ref())?;
        let preview = match submission.preview.as_deref() {
            Some(raw) => raw.parse()?,
            None => PreviewMode::None,
        };
        let base_name = sanitize_base_name(submission.output_name.as_deref(), file_name);

        Ok(Accepted {
            base_name,
            extension: format!(".{}", extension.to_ascii_lowercase()),
            kind,
            variants,
            preview,
        })
    }

    /// Accepts an upload and returns its fresh id. Processing happens later on a worker.
    #[instrument(skip(self, submission), fields(file_name = ?submission.file_name, bytes = submission.bytes.len()))]
    pub async fn submit(&self, submission: Submission) -> Result<JobId, SubmitError> {
        let accepted = self.validate(&submission)?;

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = JobId::generate(&mut rand::rng());
            if self.queue.contains(&id).await? || self.store.exists(&id).await? {
                debug!(job_id = %id, attempt, "id already taken");
                continue;
            }

            // Creating the working directory reserves the id; a concurrent submission
            // that drew the same id gets `None` and draws again.
            let Some((working, _)) = self.store.allocate(&id).await? else {
                debug!(job_id = %id, attempt, "id reserved by another submission");
                continue;
            };
            let ticket = accepted.ticket(id.clone());
            let source = working.join(ticket.original_file_name());
            if let Err(err) = fs::write(&source, &submission.bytes).await {
                self.store.remove(&id).await?;
                return Err(StorageFault::new("write", &source, err).into());
            }

            match self.queue.enqueue(&ticket).await {
                Ok(seq) => {
                    info!(job_id = %id, seq, variants = ?ticket.variants, preview = ?ticket.preview, "job accepted");
                    return Ok(id);
                }
                // The id was issued before and its files are gone. The directories are ours.
                Err(err) if is_unique_violation(&err) => {
                    warn!(job_id = %id, attempt, "id collided on enqueue");
                    self.store.remove(&id).await?;
                }
                Err(err) => {
                    self.store.remove(&id).await?;
                    return Err(err.into());
                }
            }
        }
        Err(SubmitError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Withdraws the job if nobody claimed it yet, then removes its files. Returns
    /// whether a queued entry was withdrawn.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &JobId) -> Result<bool, SubmitError> {
        let withdrawn = self.queue.cancel(id, "deleted before processing").await?;
        self.store.remove(id).await?;
        info!(job_id = %id, withdrawn, "job deleted");
        Ok(withdrawn)
    }
}
