use std::path::Path;
use std::sync::Arc;

use ocsync_core::{RemoteConnector, RemoteError, path};
use sqlx::SqliteConnection;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::conflict;
use super::index::{self, AvailableOfflineStatus, FileInput, FileRecord, IndexError, IndexStore};
use super::local_storage::{LocalStorage, StorageError};
use super::locks::PathLocks;
use super::offline::inherited_status;
use super::reconcile::merge_local_only_fields;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("remote operation failed: {0}")]
    Unknown(String),
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(path) => EngineError::NotFound(path),
            RemoteError::Conflict(path) => EngineError::Conflict(path),
            RemoteError::Unknown(message) => EngineError::Unknown(message),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Index(IndexError::Sqlx(err))
    }
}

pub struct SyncEngine {
    pub(super) remote: Arc<dyn RemoteConnector>,
    pub(super) index: IndexStore,
    pub(super) storage: Arc<dyn LocalStorage>,
    pub(super) locks: PathLocks,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteConnector>,
        index: IndexStore,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self {
            remote,
            index,
            storage,
            locks: PathLocks::new(),
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Fetches a folder listing and reconciles it with the index.
    pub async fn refresh_folder(
        &self,
        remote_path: &str,
        account: &str,
        space_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, EngineError> {
        let folder = path::folder_path(remote_path);
        let listing = self.remote.list_folder(&folder, account, space_id).await?;
        debug!(folder = %folder, entries = listing.len(), "fetched folder listing");
        self.reconcile_folder(listing, account, space_id, now_millis())
            .await
    }

    /// Reads one remote object and merges it with its local record.
    pub async fn refresh_file(
        &self,
        remote_path: &str,
        account: &str,
        space_id: Option<&str>,
    ) -> Result<FileRecord, EngineError> {
        let remote = self.remote.read_file(remote_path, account, space_id).await?;
        let mut input = FileInput::from_remote(&remote, account, space_id);
        input.last_sync_date_for_properties = Some(now_millis());

        let mut tx = self.index.begin().await?;
        let mut local =
            index::file_by_remote_path(&mut tx, account, space_id, &remote.remote_path).await?;
        if local.is_none()
            && let Some(remote_id) = remote.remote_id.as_deref()
        {
            local = index::file_by_remote_id(&mut tx, account, remote_id).await?;
        }

        let id = match local {
            Some(local) => {
                let merged = merge_local_only_fields(input, &local);
                index::update_file(&mut tx, &merged).await?;
                merged.id
            }
            None => {
                if let Some(parent) = self.parent_record(&mut tx, &input).await? {
                    input.parent_id = parent.id;
                    input.available_offline_status = inherited_status(
                        parent.available_offline_status,
                        AvailableOfflineStatus::NotAvailable,
                    );
                }
                index::insert_file(&mut tx, &input).await?
            }
        };
        let record = index::file_by_id(&mut tx, id)
            .await?
            .ok_or(IndexError::MissingItem)?;
        tx.commit().await?;
        Ok(record)
    }

    /// Creates `remote_path` on the server below `parent` and records it.
    pub async fn create_folder(
        &self,
        remote_path: &str,
        parent: &FileRecord,
    ) -> Result<FileRecord, EngineError> {
        let folder = path::folder_path(remote_path);
        if path::parent_path(&folder).as_deref() != Some(parent.remote_path.as_str()) {
            return Err(EngineError::InvalidOperation(format!(
                "{folder} is not a direct child of {}",
                parent.remote_path
            )));
        }
        let space_id = parent.space_id.as_deref();
        if self
            .index
            .get_file_by_remote_path(&parent.owner, space_id, &folder)
            .await?
            .is_some()
        {
            return Err(EngineError::AlreadyExists(folder));
        }

        self.remote.create_folder(&folder, &parent.owner).await?;
        let remote = self.remote.read_file(&folder, &parent.owner, space_id).await?;

        let mut input = FileInput::from_remote(&remote, &parent.owner, space_id);
        input.parent_id = parent.id;
        input.available_offline_status = inherited_status(
            parent.available_offline_status,
            AvailableOfflineStatus::NotAvailable,
        );
        input.last_sync_date_for_properties = Some(now_millis());
        let record = self.index.insert_file(&input).await?;
        info!(path = %record.remote_path, "folder created");
        Ok(record)
    }

    pub async fn set_conflict(&self, file_id: i64, etag_in_conflict: &str) -> Result<(), EngineError> {
        let mut tx = self.index.begin().await?;
        conflict::set_conflict(&mut tx, file_id, etag_in_conflict).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_conflict(&self, file_id: i64) -> Result<(), EngineError> {
        let mut tx = self.index.begin().await?;
        conflict::clear_conflict(&mut tx, file_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn parent_record(
        &self,
        conn: &mut SqliteConnection,
        file: &FileInput,
    ) -> Result<Option<FileRecord>, IndexError> {
        match path::parent_path(&file.remote_path) {
            Some(parent) => {
                index::file_by_remote_path(conn, &file.owner, file.space_id.as_deref(), &parent)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Deletes a record and everything below it, children first. Local copies
    /// are removed before their rows.
    pub(super) async fn remove_subtree(
        &self,
        conn: &mut SqliteConnection,
        root: &FileRecord,
    ) -> Result<usize, IndexError> {
        if root.etag_in_conflict.is_some() {
            conflict::clear_conflict(conn, root.id).await?;
        }
        let nodes = index::subtree(conn, root).await?;
        for node in nodes.iter().rev() {
            self.delete_local_copy(node).await;
            index::delete_file(conn, node.id).await?;
        }
        debug!(path = %root.remote_path, removed = nodes.len(), "removed subtree from index");
        Ok(nodes.len())
    }

    /// Drops the local copies below `root`, keeping the records known.
    pub(super) async fn forget_local_subtree(
        &self,
        conn: &mut SqliteConnection,
        root: &FileRecord,
    ) -> Result<(), IndexError> {
        if root.etag_in_conflict.is_some() {
            conflict::clear_conflict(conn, root.id).await?;
        }
        let nodes = index::subtree(conn, root).await?;
        for node in nodes.into_iter().rev() {
            self.delete_local_copy(&node).await;
            let Some(mut current) = index::file_by_id(conn, node.id).await? else {
                continue;
            };
            current.storage_path = None;
            current.etag_in_conflict = None;
            index::update_file(conn, &current).await?;
        }
        Ok(())
    }

    pub(super) async fn delete_local_copy(&self, record: &FileRecord) {
        if let Err(err) = self.storage.delete(record).await {
            warn!(path = %record.remote_path, error = %err, "failed to delete local copy");
        }
    }

    pub(super) async fn relocate_local_copy(&self, record: &FileRecord, new_path: &Path) {
        if let Err(err) = self.storage.relocate(record, new_path).await {
            warn!(
                path = %record.remote_path,
                target = %new_path.display(),
                error = %err,
                "failed to relocate local copy"
            );
        }
    }
}

pub(super) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
