use std::collections::HashMap;
use std::path::PathBuf;

use ocsync_core::{RemoteError, path};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::conflict;
use super::engine::{EngineError, SyncEngine};
use super::index::{self, AvailableOfflineStatus, FileRecord, IndexError};
use super::offline::inherited_status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Done,
    /// The source no longer existed; its local records were removed.
    SourceMissing,
    /// The target folder no longer existed; its local records were removed.
    TargetMissing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub remote_path: String,
    pub outcome: ItemOutcome,
}

/// Per-file outcomes of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn record(&mut self, remote_path: &str, outcome: ItemOutcome) {
        self.items.push(ItemReport {
            remote_path: remote_path.to_string(),
            outcome,
        });
    }

    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome == ItemOutcome::Done)
            .count()
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn outcome_for(&self, remote_path: &str) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|item| item.remote_path == remote_path)
            .map(|item| &item.outcome)
    }

    /// Fails the batch when every item failed.
    fn into_result(self) -> Result<Self, EngineError> {
        let last_failure = self.items.iter().rev().find_map(|item| match &item.outcome {
            ItemOutcome::Failed(message) => Some(message.clone()),
            _ => None,
        });
        let all_failed = !self.items.is_empty()
            && self
                .items
                .iter()
                .all(|item| matches!(item.outcome, ItemOutcome::Failed(_)));
        match last_failure {
            Some(message) if all_failed => Err(EngineError::Unknown(message)),
            _ => Ok(self),
        }
    }
}

fn validate_transfer(
    files: &[FileRecord],
    target: &FileRecord,
    is_move: bool,
) -> Result<(), EngineError> {
    if files.is_empty() {
        return Err(EngineError::InvalidOperation("no files selected".into()));
    }
    if !target.is_folder() {
        return Err(EngineError::InvalidOperation(format!(
            "{} is not a folder",
            target.remote_path
        )));
    }
    for file in files {
        if file.owner != target.owner || file.space_id != target.space_id {
            return Err(EngineError::InvalidOperation(format!(
                "{} belongs to another account or space",
                file.remote_path
            )));
        }
        if path::is_same_or_descendant(&target.remote_path, &file.remote_path) {
            return Err(EngineError::InvalidOperation(format!(
                "cannot place {} into itself or a descendant",
                file.remote_path
            )));
        }
        if is_move && file.parent_id == target.id {
            return Err(EngineError::InvalidOperation(format!(
                "{} is already in {}",
                file.remote_path, target.remote_path
            )));
        }
    }
    Ok(())
}

fn validate_name(new_name: &str) -> Result<(), EngineError> {
    if new_name.trim().is_empty() {
        return Err(EngineError::InvalidOperation("file name is empty".into()));
    }
    if new_name.contains(path::SEPARATOR) {
        return Err(EngineError::InvalidOperation(format!(
            "file name {new_name} contains a path separator"
        )));
    }
    Ok(())
}

pub(super) fn rebase(remote_path: &str, old_prefix: &str, new_prefix: &str) -> String {
    match remote_path.strip_prefix(old_prefix) {
        Some(rest) => format!("{new_prefix}{rest}"),
        None => remote_path.to_string(),
    }
}

impl SyncEngine {
    /// Moves sibling files into `target`, one at a time.
    pub async fn move_files(
        &self,
        files: &[FileRecord],
        target: &FileRecord,
    ) -> Result<BatchReport, EngineError> {
        validate_transfer(files, target, true)?;
        let mut report = BatchReport::default();
        for requested in files {
            let outcome = self.move_one(requested, target.id).await?;
            report.record(&requested.remote_path, outcome);
        }
        info!(
            moved = report.succeeded(),
            total = report.total(),
            target = %target.remote_path,
            "move finished"
        );
        report.into_result()
    }

    /// Copies sibling files into `target`, one at a time.
    pub async fn copy_files(
        &self,
        files: &[FileRecord],
        target: &FileRecord,
    ) -> Result<BatchReport, EngineError> {
        validate_transfer(files, target, false)?;
        let mut report = BatchReport::default();
        for requested in files {
            let outcome = self.copy_one(requested, target.id).await?;
            report.record(&requested.remote_path, outcome);
        }
        info!(
            copied = report.succeeded(),
            total = report.total(),
            target = %target.remote_path,
            "copy finished"
        );
        report.into_result()
    }

    /// Renames a file or folder in place.
    pub async fn rename(&self, file: &FileRecord, new_name: &str) -> Result<FileRecord, EngineError> {
        validate_name(new_name)?;
        let _guard = self.locks.lock_record(file.id).await;
        let Some(file) = self.index.get_file_by_id(file.id).await? else {
            return Err(EngineError::NotFound(file.remote_path.clone()));
        };
        let new_path = path::renamed_path(&file.remote_path, new_name);
        if new_path == file.remote_path {
            return Ok(file);
        }
        if self
            .index
            .get_file_by_remote_path(&file.owner, file.space_id.as_deref(), &new_path)
            .await?
            .is_some()
        {
            return Err(EngineError::AlreadyExists(new_path));
        }

        self.remote
            .rename_file(&file.remote_path, &new_path, &file.owner)
            .await?;

        let mut tx = self.index.begin().await?;
        let relocation = self
            .rewrite_subtree(&mut tx, &file, file.parent_id, &new_path, None)
            .await?;
        let renamed = index::file_by_id(&mut tx, file.id)
            .await?
            .ok_or(IndexError::MissingItem)?;
        tx.commit().await?;

        if let Some((record, target)) = relocation {
            self.relocate_local_copy(&record, &target).await;
        }
        info!(from = %file.remote_path, to = %renamed.remote_path, "renamed");
        Ok(renamed)
    }

    /// Deletes files remotely and locally, or with `local_only` drops only the
    /// local copies.
    pub async fn delete_files(
        &self,
        files: &[FileRecord],
        local_only: bool,
    ) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport::default();
        for requested in files {
            let _guard = self.locks.lock_record(requested.id).await;
            let Some(file) = self.index.get_file_by_id(requested.id).await? else {
                report.record(&requested.remote_path, ItemOutcome::SourceMissing);
                continue;
            };
            if !local_only {
                match self.remote.delete_file(&file.remote_path, &file.owner).await {
                    Ok(()) => {}
                    Err(RemoteError::NotFound(_)) => {
                        debug!(path = %file.remote_path, "already gone remotely");
                    }
                    Err(err) => {
                        warn!(path = %file.remote_path, error = %err, "remote delete failed");
                        report.record(&file.remote_path, ItemOutcome::Failed(err.to_string()));
                        continue;
                    }
                }
            }

            let mut tx = self.index.begin().await?;
            if local_only {
                self.forget_local_subtree(&mut tx, &file).await?;
            } else {
                self.remove_subtree(&mut tx, &file).await?;
            }
            tx.commit().await?;
            report.record(&file.remote_path, ItemOutcome::Done);
        }
        info!(
            deleted = report.succeeded(),
            total = report.total(),
            local_only,
            "delete finished"
        );
        report.into_result()
    }

    async fn move_one(&self, requested: &FileRecord, target_id: i64) -> Result<ItemOutcome, EngineError> {
        let _guard = self.locks.lock_record(requested.id).await;
        let Some(file) = self.index.get_file_by_id(requested.id).await? else {
            return Ok(ItemOutcome::SourceMissing);
        };
        let Some(target) = self.index.get_file_by_id(target_id).await? else {
            return Ok(ItemOutcome::TargetMissing);
        };
        let new_path = match self.destination_path(&file, &target).await {
            Ok(new_path) => new_path,
            Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
        };

        match self
            .remote
            .move_file(&file.remote_path, &new_path, &file.owner)
            .await
        {
            Ok(()) => {}
            Err(err) => return self.handle_transfer_error(err, &file, &target).await,
        }

        let mut tx = self.index.begin().await?;
        self.remove_stale_at(&mut tx, &file, &new_path).await?;
        if file.etag_in_conflict.is_some() {
            conflict::clear_conflict(&mut tx, file.id).await?;
        }
        index::add_to_length(&mut tx, target.id, file.length).await?;
        let relocation = self
            .rewrite_subtree(
                &mut tx,
                &file,
                target.id,
                &new_path,
                Some(target.available_offline_status),
            )
            .await?;
        if let Some(etag) = file.etag_in_conflict.as_deref() {
            conflict::set_conflict(&mut tx, file.id, etag).await?;
        }
        tx.commit().await?;

        if let Some((record, target_path)) = relocation {
            self.relocate_local_copy(&record, &target_path).await;
        }
        debug!(from = %file.remote_path, to = %new_path, "moved");
        Ok(ItemOutcome::Done)
    }

    async fn copy_one(&self, requested: &FileRecord, target_id: i64) -> Result<ItemOutcome, EngineError> {
        let _guard = self.locks.lock_record(requested.id).await;
        let Some(file) = self.index.get_file_by_id(requested.id).await? else {
            return Ok(ItemOutcome::SourceMissing);
        };
        let Some(target) = self.index.get_file_by_id(target_id).await? else {
            return Ok(ItemOutcome::TargetMissing);
        };
        let new_path = match self.destination_path(&file, &target).await {
            Ok(new_path) => new_path,
            Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
        };

        let remote_id = match self
            .remote
            .copy_file(&file.remote_path, &new_path, &file.owner)
            .await
        {
            Ok(remote_id) => remote_id,
            Err(err) => return self.handle_transfer_error(err, &file, &target).await,
        };

        let mut copy = file.to_input();
        copy.parent_id = target.id;
        copy.remote_path = new_path.clone();
        copy.remote_id = remote_id;
        copy.name = path::file_name(&new_path).to_string();
        copy.etag = String::new();
        copy.storage_path = None;
        copy.etag_in_conflict = None;
        copy.last_sync_date_for_data = None;
        copy.modified_at_last_sync_for_data = None;
        copy.last_sync_date_for_properties = None;
        copy.available_offline_status = AvailableOfflineStatus::NotAvailable;
        copy.needs_to_update_thumbnail = true;

        let mut tx = self.index.begin().await?;
        self.remove_stale_at(&mut tx, &file, &new_path).await?;
        index::add_to_length(&mut tx, target.id, file.length).await?;
        index::insert_file(&mut tx, &copy).await?;
        tx.commit().await?;
        debug!(from = %file.remote_path, to = %new_path, "copied");
        Ok(ItemOutcome::Done)
    }

    async fn destination_path(&self, file: &FileRecord, target: &FileRecord) -> Result<String, RemoteError> {
        let desired = path::child_path(&target.remote_path, &file.name, file.is_folder());
        let available = self
            .remote
            .available_remote_path(&desired, &file.owner)
            .await?;
        Ok(if file.is_folder() {
            path::folder_path(&available)
        } else {
            available
        })
    }

    /// Compensates a failed remote move or copy. A missing source is only
    /// dropped while its record still sits at the path sent to the server.
    async fn handle_transfer_error(
        &self,
        err: RemoteError,
        file: &FileRecord,
        target: &FileRecord,
    ) -> Result<ItemOutcome, EngineError> {
        match err {
            RemoteError::Conflict(_) => {
                warn!(target = %target.remote_path, "target folder vanished remotely");
                let mut tx = self.index.begin().await?;
                self.remove_subtree(&mut tx, target).await?;
                tx.commit().await?;
                Ok(ItemOutcome::TargetMissing)
            }
            RemoteError::NotFound(_) => {
                let mut tx = self.index.begin().await?;
                match index::file_by_id(&mut tx, file.id).await? {
                    Some(current) if current.remote_path == file.remote_path => {
                        warn!(path = %file.remote_path, "source vanished remotely");
                        self.remove_subtree(&mut tx, &current).await?;
                    }
                    _ => debug!(path = %file.remote_path, "source record already moved on"),
                }
                tx.commit().await?;
                Ok(ItemOutcome::SourceMissing)
            }
            RemoteError::Unknown(message) => {
                warn!(path = %file.remote_path, error = %message, "remote operation failed");
                Ok(ItemOutcome::Failed(message))
            }
        }
    }

    /// Drops a local record still occupying a path the server reported free.
    async fn remove_stale_at(
        &self,
        conn: &mut SqliteConnection,
        file: &FileRecord,
        remote_path: &str,
    ) -> Result<(), IndexError> {
        if let Some(stale) =
            index::file_by_remote_path(conn, &file.owner, file.space_id.as_deref(), remote_path)
                .await?
            && stale.id != file.id
        {
            debug!(path = %remote_path, "dropping stale record at destination");
            self.remove_subtree(conn, &stale).await?;
        }
        Ok(())
    }

    /// Rewrites paths below `root` after it moved to `new_root_path`.
    ///
    /// With `parent_status` set, offline statuses are re-derived from the new
    /// parent downwards. Returns the relocation to apply on disk once the
    /// transaction committed.
    async fn rewrite_subtree(
        &self,
        conn: &mut SqliteConnection,
        root: &FileRecord,
        new_parent_id: i64,
        new_root_path: &str,
        parent_status: Option<AvailableOfflineStatus>,
    ) -> Result<Option<(FileRecord, PathBuf)>, IndexError> {
        let Some(root) = index::file_by_id(conn, root.id).await? else {
            return Ok(None);
        };
        let nodes = index::subtree(conn, &root).await?;
        let mut statuses: HashMap<i64, AvailableOfflineStatus> = HashMap::new();

        for node in nodes {
            let mut updated = node.clone();
            updated.remote_path = rebase(&node.remote_path, &root.remote_path, new_root_path);
            if node.id == root.id {
                updated.parent_id = new_parent_id;
                updated.name = path::file_name(new_root_path).to_string();
            }
            if let Some(parent_status) = parent_status {
                let above = if node.id == root.id {
                    parent_status
                } else {
                    statuses
                        .get(&node.parent_id)
                        .copied()
                        .unwrap_or(AvailableOfflineStatus::NotAvailable)
                };
                updated.available_offline_status =
                    inherited_status(above, node.available_offline_status);
                statuses.insert(node.id, updated.available_offline_status);
            }
            if !node.is_folder()
                && node.storage_path.is_some()
                && let Ok(storage) = self.storage.save_path_for(&node.owner, &updated.remote_path)
            {
                updated.storage_path = Some(storage.to_string_lossy().into_owned());
            }
            index::update_file(conn, &updated).await?;
        }

        if !root.is_folder() && root.storage_path.is_none() {
            return Ok(None);
        }
        Ok(self
            .storage
            .save_path_for(&root.owner, new_root_path)
            .ok()
            .map(|target| (root, target)))
    }
}
