//! File-based record store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{LabRecord, RecordFilter, RecordKey, RecordStore, RecordUpdate};
use crate::error::StoreError;

const FILE_VERSION: u32 = 1;

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    records: Vec<LabRecord>,
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on the sibling `.lock` file, released on drop.
struct FileLock(std::fs::File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.0);
    }
}

/// JSON file store.
///
/// The file is the only source of truth: every operation re-reads it under
/// an advisory lock on `<path>.lock`, so a `renew` run from another process
/// is seen by the next operation of a running service, and two processes
/// can never both create a record for one key. Mutations are written to a
/// temp file and renamed over the real one.
pub struct FileRecordStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Keeps this process's tasks from parking blocking threads on the
    /// file lock.
    local: Mutex<()>,
}

impl FileRecordStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Write {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
        }

        let store = Self {
            lock_path: sibling(&path, ".lock"),
            path,
            local: Mutex::new(()),
        };
        let records = store.load().await?;
        info!(path = %store.path.display(), records = records.len(), "Opened record store");
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self, mode: LockMode) -> Result<FileLock, StoreError> {
        let lock_path = self.lock_path.clone();
        let locked = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            match mode {
                LockMode::Shared => fs2::FileExt::lock_shared(&file)?,
                LockMode::Exclusive => fs2::FileExt::lock_exclusive(&file)?,
            }
            Ok(file)
        })
        .await;

        let lock_err = |reason: String| StoreError::Lock {
            path: self.lock_path.display().to_string(),
            reason,
        };
        match locked {
            Ok(Ok(file)) => Ok(FileLock(file)),
            Ok(Err(e)) => Err(lock_err(e.to_string())),
            Err(e) => Err(lock_err(e.to_string())),
        }
    }

    /// Current records, read under a shared lock.
    async fn load(&self) -> Result<Vec<LabRecord>, StoreError> {
        let _local = self.local.lock().await;
        let _lock = self.lock(LockMode::Shared).await?;
        Self::read_file(&self.path).await
    }

    /// Read-modify-write under an exclusive lock. `change` returns its result
    /// and whether the records were modified; unmodified records are not
    /// written back.
    async fn modify<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Vec<LabRecord>) -> Result<(T, bool), StoreError> + Send,
    {
        let _local = self.local.lock().await;
        let _lock = self.lock(LockMode::Exclusive).await?;
        let mut records = Self::read_file(&self.path).await?;
        let (result, changed) = change(&mut records)?;
        if changed {
            self.write_file(&records).await?;
        }
        Ok(result)
    }

    async fn read_file(path: &Path) -> Result<Vec<LabRecord>, StoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let file: RecordFile =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        // Keep the first record per key if the file was edited by hand.
        let mut records: Vec<LabRecord> = Vec::with_capacity(file.records.len());
        for record in file.records {
            if records.iter().any(|r| r.key == record.key) {
                warn!(
                    server = %record.key.server_id,
                    lab = %record.key.lab_id,
                    "Dropping duplicate record"
                );
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Write to a sibling temp file and rename it over the real one.
    async fn write_file(&self, records: &[LabRecord]) -> Result<(), StoreError> {
        let write_err = |e: &dyn std::fmt::Display| StoreError::Write {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        };

        let content = serde_json::to_string_pretty(&RecordFile {
            version: FILE_VERSION,
            records: records.to_vec(),
        })
        .map_err(|e| write_err(&e))?;

        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, content).await.map_err(|e| write_err(&e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| write_err(&e))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn find(&self, key: &RecordKey) -> Result<Option<LabRecord>, StoreError> {
        let records = self.load().await?;
        Ok(records.into_iter().find(|r| r.key == *key))
    }

    async fn find_or_create(
        &self,
        key: &RecordKey,
        warning_date: DateTime<Utc>,
    ) -> Result<(LabRecord, bool), StoreError> {
        self.modify(|records| {
            if let Some(existing) = records.iter().find(|r| r.key == *key) {
                return Ok(((existing.clone(), false), false));
            }
            let record = LabRecord {
                id: Uuid::new_v4(),
                key: key.clone(),
                warning_date,
                renewal_flag: false,
            };
            records.push(record.clone());
            Ok(((record, true), true))
        })
        .await
    }

    async fn update(&self, id: Uuid, update: RecordUpdate) -> Result<LabRecord, StoreError> {
        self.modify(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            update.apply(record);
            Ok((record.clone(), true))
        })
        .await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.key != *key);
            let removed = records.len() != before;
            Ok((removed, removed))
        })
        .await
    }

    async fn list(&self, server_id: Option<&str>) -> Result<Vec<LabRecord>, StoreError> {
        let records = self.load().await?;
        Ok(records
            .into_iter()
            .filter(|r| server_id.is_none_or(|s| r.key.server_id == s))
            .collect())
    }

    async fn delete_many(&self, filter: &RecordFilter) -> Result<Vec<LabRecord>, StoreError> {
        self.modify(|records| {
            let (removed, kept): (Vec<LabRecord>, Vec<LabRecord>) =
                records.drain(..).partition(|r| filter.matches(r));
            *records = kept;
            let changed = !removed.is_empty();
            Ok((removed, changed))
        })
        .await
    }
}
