use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::index::FileRecord;
use super::paths::{PathError, save_path_for};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

/// Local copy of remote content. Operations are idempotent: a missing source
/// counts as success.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    fn save_path_for(&self, owner: &str, remote_path: &str) -> Result<PathBuf, PathError>;

    async fn relocate(&self, record: &FileRecord, new_path: &Path) -> Result<(), StorageError>;

    async fn delete(&self, record: &FileRecord) -> Result<(), StorageError>;
}

pub struct FsLocalStorage {
    root: PathBuf,
}

impl FsLocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folders live at their default location, files wherever they were saved.
    fn current_location(&self, record: &FileRecord) -> Result<Option<PathBuf>, PathError> {
        if record.is_folder() {
            return self
                .save_path_for(&record.owner, &record.remote_path)
                .map(Some);
        }
        Ok(record.storage_path.as_ref().map(PathBuf::from))
    }
}

#[async_trait]
impl LocalStorage for FsLocalStorage {
    fn save_path_for(&self, owner: &str, remote_path: &str) -> Result<PathBuf, PathError> {
        save_path_for(&self.root, owner, remote_path)
    }

    async fn relocate(&self, record: &FileRecord, new_path: &Path) -> Result<(), StorageError> {
        let Some(source) = self.current_location(record)? else {
            return Ok(());
        };
        if source == new_path || !tokio::fs::try_exists(&source).await? {
            return Ok(());
        }
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(from = %source.display(), to = %new_path.display(), "relocating local copy");
        tokio::fs::rename(&source, new_path).await?;
        Ok(())
    }

    async fn delete(&self, record: &FileRecord) -> Result<(), StorageError> {
        let Some(target) = self.current_location(record)? else {
            return Ok(());
        };
        let result = if record.is_folder() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                debug!(path = %target.display(), "removed local copy");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
