//! Filesystem layout for in-flight and published artifacts.
//!
//! ```text
//! {root}/working/{id}/              source upload and intermediate files
//! {root}/published/{id}/            optimized artifact set
//! {root}/published/{id}.zip         archive, written last; its presence means ready
//! {root}/published/{id}.zip.partial archive being written
//! {root}/published/{id}.failed      failure marker holding the reason
//! ```

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info};

use crate::error::{StorageFault, StorageResultExt};
use crate::JobId;

const WORKING: &str = "working";
const PUBLISHED: &str = "published";

/// What the store holds for an id, cheapest check first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    NotFound,
    InProgress,
    Failed(String),
    Ready,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    working_root: PathBuf,
    published_root: PathBuf,
}

impl ContentStore {
    /// Opens (and creates when missing) the two roots under `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageFault> {
        let root = root.as_ref();
        let store = ContentStore {
            working_root: root.join(WORKING),
            published_root: root.join(PUBLISHED),
        };
        fs::create_dir_all(&store.working_root)
            .await
            .storage("create", &store.working_root)?;
        fs::create_dir_all(&store.published_root)
            .await
            .storage("create", &store.published_root)?;
        Ok(store)
    }

    pub fn working_dir(&self, id: &JobId) -> PathBuf {
        self.working_root.join(id.as_str())
    }

    pub fn publish_dir(&self, id: &JobId) -> PathBuf {
        self.published_root.join(id.as_str())
    }

    pub fn archive_path(&self, id: &JobId) -> PathBuf {
        self.published_root.join(format!("{id}.zip"))
    }

    pub fn partial_archive_path(&self, id: &JobId) -> PathBuf {
        self.published_root.join(format!("{id}.zip.partial"))
    }

    fn failure_marker(&self, id: &JobId) -> PathBuf {
        self.published_root.join(format!("{id}.failed"))
    }

    /// Creates both directories of a job. The working directory is created exclusively,
    /// so of two callers racing for one id exactly one gets `Some`.
    pub async fn allocate(&self, id: &JobId) -> Result<Option<(PathBuf, PathBuf)>, StorageFault> {
        let working = self.working_dir(id);
        let publish = self.publish_dir(id);
        match fs::create_dir(&working).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(StorageFault::new("create", &working, err)),
        }
        fs::create_dir_all(&publish).await.storage("create", &publish)?;
        Ok(Some((working, publish)))
    }

    /// True when anything at all exists for `id`.
    pub async fn exists(&self, id: &JobId) -> Result<bool, StorageFault> {
        Ok(self.lookup(id).await? != Presence::NotFound)
    }

    /// Renames the fully written partial archive into place, flipping the id to ready.
    pub async fn commit_archive(&self, id: &JobId) -> Result<PathBuf, StorageFault> {
        let partial = self.partial_archive_path(id);
        let archive = self.archive_path(id);
        fs::rename(&partial, &archive).await.storage("publish", &archive)?;
        Ok(archive)
    }

    pub async fn lookup(&self, id: &JobId) -> Result<Presence, StorageFault> {
        if exists(&self.archive_path(id)).await? {
            return Ok(Presence::Ready);
        }

        let marker = self.failure_marker(id);
        match fs::read_to_string(&marker).await {
            Ok(reason) => return Ok(Presence::Failed(reason)),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageFault::new("read", &marker, err)),
        }

        if exists(&self.working_dir(id)).await? || exists(&self.publish_dir(id)).await? {
            Ok(Presence::InProgress)
        } else {
            Ok(Presence::NotFound)
        }
    }

    /// Deletes every trace of `id`. Absent targets are not an error.
    pub async fn remove(&self, id: &JobId) -> Result<(), StorageFault> {
        remove_path(&self.working_dir(id)).await?;
        self.remove_published(id).await
    }

    async fn remove_published(&self, id: &JobId) -> Result<(), StorageFault> {
        remove_path(&self.publish_dir(id)).await?;
        remove_path(&self.archive_path(id)).await?;
        remove_path(&self.partial_archive_path(id)).await?;
        remove_path(&self.failure_marker(id)).await
    }

    /// Drops the intermediate files of a job once its artifact set is published.
    pub async fn discard_working(&self, id: &JobId) -> Result<(), StorageFault> {
        remove_path(&self.working_dir(id)).await
    }

    /// Records a terminal failure. Whatever reached the publish directory is discarded;
    /// the working directory is left to the staleness sweep.
    pub async fn mark_failed(&self, id: &JobId, reason: &str) -> Result<(), StorageFault> {
        remove_path(&self.publish_dir(id)).await?;
        remove_path(&self.partial_archive_path(id)).await?;
        let marker = self.failure_marker(id);
        fs::write(&marker, reason).await.storage("write", &marker)
    }

    /// Removes every published id whose age is at least `max_age`.
    pub async fn sweep_expired(&self, max_age: Duration) -> Result<Vec<JobId>, StorageFault> {
        let now = SystemTime::now();
        let mut ages: HashMap<JobId, Duration> = HashMap::new();

        for (name, age, _) in list_aged(&self.published_root, now).await? {
            let Some(id) = id_of(&name) else {
                continue;
            };
            let oldest = ages.entry(id).or_insert(age);
            if age > *oldest {
                *oldest = age;
            }
        }

        let mut removed = Vec::new();
        for (id, age) in ages {
            if age >= max_age {
                self.remove_published(&id).await?;
                debug!(job_id = %id, age_secs = age.as_secs(), "removed expired artifacts");
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "expired artifact sets removed");
        }
        Ok(removed)
    }

    /// Removes crash remnants older than `max_age`: working directories, publish
    /// directories that never received an archive, and abandoned partial archives.
    /// Ids in `active` are still queued or being processed and are left alone.
    pub async fn sweep_stale(&self, max_age: Duration, active: &HashSet<JobId>) -> Result<Vec<JobId>, StorageFault> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for (name, age, is_dir) in list_aged(&self.working_root, now).await? {
            if !is_dir || age < max_age {
                continue;
            }
            let id = id_of(&name);
            if id.as_ref().is_some_and(|id| active.contains(id)) {
                continue;
            }
            let path = self.working_root.join(&name);
            remove_path(&path).await?;
            if let Some(id) = id {
                debug!(job_id = %id, age_secs = age.as_secs(), "removed stale working directory");
                removed.push(id);
            }
        }

        for (name, age, is_dir) in list_aged(&self.published_root, now).await? {
            if age < max_age {
                continue;
            }
            let Some(id) = id_of(&name) else {
                continue;
            };
            if active.contains(&id) {
                continue;
            }
            let orphan_dir = is_dir && !exists(&self.archive_path(&id)).await?;
            let partial = name.ends_with(".zip.partial");
            if orphan_dir || partial {
                remove_path(&self.published_root.join(&name)).await?;
                debug!(job_id = %id, entry = %name, "removed unfinished publish remnant");
                if !removed.contains(&id) {
                    removed.push(id);
                }
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "stale job remnants removed");
        }
        Ok(removed)
    }
}

fn id_of(entry_name: &str) -> Option<JobId> {
    let stem = entry_name.split('.').next()?;
    JobId::parse(stem).ok()
}

fn age_of(meta: &std::fs::Metadata, now: SystemTime) -> Duration {
    let born = meta.created().or_else(|_| meta.modified()).unwrap_or(now);
    now.duration_since(born).unwrap_or(Duration::ZERO)
}

async fn list_aged(
    dir: &Path,
    now: SystemTime,
) -> Result<Vec<(String, Duration, bool)>, StorageFault> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StorageFault::new("list", dir, err)),
    };

    let mut listed = Vec::new();
    while let Some(entry) = entries.next_entry().await.storage("list", dir)? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // Entries may vanish between listing and stat when a delete races the sweep.
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(StorageFault::new("stat", entry.path(), err)),
        };
        listed.push((name, age_of(&meta, now), meta.is_dir()));
    }
    Ok(listed)
}

async fn exists(path: &Path) -> Result<bool, StorageFault> {
    fs::try_exists(path).await.storage("inspect", path)
}

async fn remove_path(path: &Path) -> Result<(), StorageFault> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StorageFault::new("stat", path, err)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageFault::new("remove", path, err)),
    }
}
