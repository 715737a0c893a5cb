use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    paginate, AppendOutcome, ImageRecord, ImageRecordStore, RecordPage, TransformFailure, Variant,
};
use crate::error::StoreError;

/// A lock file older than this is assumed to belong to a crashed writer.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// Record store keeping one JSON document per image in a directory.
///
/// Several processes may share the directory. Every read-modify-write holds
/// an exclusive `{id}.lock` file created with `O_EXCL`; a writer that finds
/// the lock taken gets [`StoreError::Conflict`] and is expected to retry.
/// Documents are replaced by renaming a fully written temporary file.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    dir: PathBuf,
}

impl FsRecordStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, &e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        is_valid_id(id).then(|| self.dir.join(format!("{}.json", id)))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    async fn read(&self, path: &Path) -> Result<Option<ImageRecord>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Backend(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path, &e)),
        }
    }

    async fn write(&self, path: &Path, record: &ImageRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| io_error(&tmp, &e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(path, &e));
        }
        Ok(())
    }

    /// Take the exclusive lock for `id`, clearing it first if it is stale.
    async fn lock(&self, id: &str) -> Result<RecordLock, StoreError> {
        let path = self.lock_path(id);
        match try_create(&path).await {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
                return Err(io_error(&path, &e))
            }
            Err(_) => {}
        }

        if is_stale(&path).await {
            if let Some(lock) = self.take_over_stale(id, &path).await {
                return Ok(lock);
            }
        }

        debug!(record = %id, "Record lock held by another writer");
        Err(StoreError::Conflict(id.to_string()))
    }

    /// Replace the stale lock at `path`.
    ///
    /// Takeovers are serialized by a second `O_EXCL` file, and staleness is
    /// checked again while holding it. A writer that saw the old lock as
    /// stale but lost the race finds the winner's fresh lock and backs off.
    async fn take_over_stale(&self, id: &str, path: &Path) -> Option<RecordLock> {
        let guard_path = path.with_extension("lock.takeover");
        let guard = match try_create(&guard_path).await {
            Ok(guard) => guard,
            Err(_) => {
                // A takeover guard outliving the lock timeout belongs to a crashed writer
                if is_stale(&guard_path).await {
                    warn!(record = %id, "Removing abandoned lock takeover guard");
                    let _ = tokio::fs::remove_file(&guard_path).await;
                }
                return None;
            }
        };

        if !is_stale(path).await {
            return None;
        }
        warn!(record = %id, "Removing stale record lock");
        let _ = tokio::fs::remove_file(path).await;
        let lock = try_create(path).await.ok();
        drop(guard);
        lock
    }

    /// Read-modify-write `id` under its lock.
    async fn update<F>(&self, id: &str, mutate: F) -> Result<AppendOutcome, StoreError>
    where
        F: FnOnce(&mut ImageRecord) -> AppendOutcome + Send,
    {
        let path = self
            .record_path(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let _lock = self.lock(id).await?;
        let mut record = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let outcome = mutate(&mut record);
        if outcome == AppendOutcome::Appended {
            self.write(&path, &record).await?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ImageRecordStore for FsRecordStore {
    async fn create(&self, record: ImageRecord) -> Result<String, StoreError> {
        let path = self
            .record_path(&record.id)
            .ok_or_else(|| StoreError::InvalidLocation(format!("record id '{}'", record.id)))?;

        let _lock = self.lock(&record.id).await?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::Conflict(record.id));
        }
        self.write(&path, &record).await?;
        Ok(record.id)
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        match self.record_path(id) {
            Some(path) => self.read(&path).await,
            None => Ok(None),
        }
    }

    async fn append_variant(
        &self,
        id: &str,
        variant: Variant,
    ) -> Result<AppendOutcome, StoreError> {
        self.update(id, move |record| record.push_variant(variant))
            .await
    }

    async fn record_failure(
        &self,
        id: &str,
        failure: TransformFailure,
    ) -> Result<AppendOutcome, StoreError> {
        self.update(id, move |record| record.push_failure(failure))
            .await
    }

    async fn list(&self, owner_id: &str, page: u32, limit: u32) -> Result<RecordPage, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, &e))?;

        let mut owned = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A record may be replaced between listing and reading
            if let Some(record) = self.read(&path).await? {
                if record.owner_id == owner_id {
                    owned.push(record);
                }
            }
        }

        Ok(paginate(owned, page, limit))
    }
}

/// Holds a record lock file; removes it on drop.
struct RecordLock {
    path: PathBuf,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release record lock");
        }
    }
}

async fn try_create(path: &Path) -> std::io::Result<RecordLock> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    Ok(RecordLock {
        path: path.to_path_buf(),
    })
}

async fn is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return true;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

/// Ids become file names, so only a conservative alphabet is allowed.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn io_error(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Backend(format!("{}: {}", path.display(), err))
}
