//! Merging a fresh remote folder listing into the index.
//!
//! Remote data is authoritative for existence and metadata. Local data is
//! authoritative for materialization: storage path, content etag, conflict
//! marker and offline intent survive every merge.

use std::collections::HashMap;
use std::path::PathBuf;

use ocsync_core::RemoteFile;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::conflict;
use super::engine::{EngineError, SyncEngine};
use super::index::{self, AvailableOfflineStatus, FileInput, FileRecord, IndexError, ROOT_PARENT_ID};
use super::offline::inherited_status;
use super::operations::rebase;

/// Copies the fields only the local side knows onto a fresh remote snapshot.
pub fn merge_local_only_fields(remote: FileInput, local: &FileRecord) -> FileRecord {
    let mut merged = remote.with_id(local.id);
    merged.parent_id = local.parent_id;
    merged.last_sync_date_for_data = local.last_sync_date_for_data;
    merged.modified_at_last_sync_for_data = local.modified_at_last_sync_for_data;
    merged.storage_path = local.storage_path.clone();
    merged.tree_etag = local.tree_etag.clone();
    merged.etag_in_conflict = local.etag_in_conflict.clone();
    merged.available_offline_status = local.available_offline_status;
    merged
}

fn id_key(remote_id: &str) -> String {
    format!("id:{remote_id}")
}

fn path_key(remote_path: &str) -> String {
    format!("path:{remote_path}")
}

fn lookup_key(record: &FileRecord) -> String {
    match record.remote_id.as_deref() {
        Some(remote_id) => id_key(remote_id),
        None => path_key(&record.remote_path),
    }
}

/// Temporary path held while sibling paths are being swapped.
fn placeholder_path(id: i64) -> String {
    format!("\u{0}pending-{id}")
}

fn new_child(mut input: FileInput, folder: &FileRecord) -> FileInput {
    input.parent_id = folder.id;
    input.etag = String::new();
    input.needs_to_update_thumbnail = !input.is_folder();
    input.available_offline_status =
        inherited_status(folder.available_offline_status, AvailableOfflineStatus::NotAvailable);
    input
}

fn merged_child(input: FileInput, local: &FileRecord, folder: &FileRecord) -> FileRecord {
    let modification_changed = input.modification_timestamp != local.modification_timestamp;
    let mut merged = merge_local_only_fields(input, local);
    merged.parent_id = folder.id;
    merged.etag = local.etag.clone();
    merged.needs_to_update_thumbnail =
        (!merged.is_folder() && modification_changed) || local.needs_to_update_thumbnail;
    merged.available_offline_status =
        inherited_status(folder.available_offline_status, local.available_offline_status);
    merged
}

struct MergePlan {
    updates: Vec<(FileRecord, FileRecord)>,
    inserts: Vec<FileInput>,
    stale: Vec<FileRecord>,
}

impl SyncEngine {
    /// Reconciles `listing` (the folder itself, then its direct children)
    /// with the index and returns the folder's merged children.
    ///
    /// All writes commit in one transaction. Local copies of renamed children
    /// are relocated after the commit.
    pub async fn reconcile_folder(
        &self,
        listing: Vec<RemoteFile>,
        account: &str,
        space_id: Option<&str>,
        now_ms: i64,
    ) -> Result<Vec<FileRecord>, EngineError> {
        let mut listing = listing.into_iter();
        let Some(remote_folder) = listing.next() else {
            return Err(EngineError::InvalidOperation("empty folder listing".into()));
        };
        if !remote_folder.is_folder() {
            return Err(EngineError::InvalidOperation(format!(
                "{} is not a folder",
                remote_folder.remote_path
            )));
        }
        let children: Vec<RemoteFile> = listing.collect();

        let _guard = self
            .locks
            .lock(account, space_id, &remote_folder.remote_path)
            .await;

        let mut tx = self.index.begin().await?;
        let folder = self
            .store_folder(&mut tx, &remote_folder, account, space_id, now_ms)
            .await?;

        let plan = self
            .plan_children(&mut tx, &folder, children, account, space_id, now_ms)
            .await?;

        for stale in &plan.stale {
            info!(path = %stale.remote_path, "removed remotely, deleting local record");
            self.remove_subtree(&mut tx, stale).await?;
        }

        let mut relocations: Vec<(FileRecord, PathBuf)> = Vec::new();
        let mut descendants: HashMap<i64, Vec<FileRecord>> = HashMap::new();
        for (old, new) in &plan.updates {
            if old.remote_path == new.remote_path {
                continue;
            }
            index::set_remote_path(&mut tx, old.id, &placeholder_path(old.id)).await?;
            if old.is_folder() {
                let below: Vec<FileRecord> =
                    index::subtree(&mut tx, old).await?.into_iter().skip(1).collect();
                for node in &below {
                    index::set_remote_path(&mut tx, node.id, &placeholder_path(node.id)).await?;
                }
                descendants.insert(old.id, below);
            }
        }
        for (old, mut new) in plan.updates {
            if let Some(below) = descendants.remove(&old.id) {
                self.rebase_descendants(&mut tx, below, &old.remote_path, &new.remote_path)
                    .await?;
            }
            let has_local_copy = new.is_folder() || old.storage_path.is_some();
            if old.remote_path != new.remote_path && has_local_copy {
                match self.storage.save_path_for(&new.owner, &new.remote_path) {
                    Ok(target) => {
                        if !new.is_folder() {
                            new.storage_path = Some(target.to_string_lossy().into_owned());
                        }
                        relocations.push((old, target));
                    }
                    Err(err) => {
                        debug!(path = %new.remote_path, error = %err, "no storage path for renamed child");
                    }
                }
            }
            index::update_file(&mut tx, &new).await?;
        }
        for input in &plan.inserts {
            index::insert_file(&mut tx, input).await?;
        }

        let content = index::folder_content(&mut tx, folder.id).await?;
        if !content.iter().any(|f| f.etag_in_conflict.is_some())
            && let Some(current) = index::file_by_id(&mut tx, folder.id).await?
            && current.etag_in_conflict.is_some()
        {
            conflict::clear_conflict(&mut tx, folder.id).await?;
        }

        tx.commit().await?;
        debug!(
            folder = %folder.remote_path,
            children = content.len(),
            "folder reconciled"
        );

        for (record, target) in relocations {
            self.relocate_local_copy(&record, &target).await;
        }
        Ok(self.index.get_folder_content(folder.id).await?)
    }

    /// Inserts the folder on first sync, otherwise merges it with its record.
    /// A folder whose path lookup misses is matched by remote id.
    async fn store_folder(
        &self,
        conn: &mut SqliteConnection,
        remote_folder: &RemoteFile,
        account: &str,
        space_id: Option<&str>,
        now_ms: i64,
    ) -> Result<FileRecord, IndexError> {
        let mut input = FileInput::from_remote(remote_folder, account, space_id);
        input.last_sync_date_for_properties = Some(now_ms);

        let mut existing =
            index::file_by_remote_path(conn, account, space_id, &remote_folder.remote_path).await?;
        if existing.is_none()
            && let Some(remote_id) = remote_folder.remote_id.as_deref()
        {
            existing = index::file_by_remote_id(conn, account, remote_id).await?;
        }

        match existing {
            Some(local) => {
                let merged = merge_local_only_fields(input, &local);
                index::update_file(conn, &merged).await?;
                Ok(merged)
            }
            None => {
                match self.parent_record(conn, &input).await? {
                    Some(parent) => {
                        input.parent_id = parent.id;
                        input.available_offline_status = inherited_status(
                            parent.available_offline_status,
                            AvailableOfflineStatus::NotAvailable,
                        );
                    }
                    None => input.parent_id = ROOT_PARENT_ID,
                }
                let id = index::insert_file(conn, &input).await?;
                debug!(folder = %input.remote_path, "first sync of folder");
                Ok(input.with_id(id))
            }
        }
    }

    async fn plan_children(
        &self,
        conn: &mut SqliteConnection,
        folder: &FileRecord,
        children: Vec<RemoteFile>,
        account: &str,
        space_id: Option<&str>,
        now_ms: i64,
    ) -> Result<MergePlan, IndexError> {
        let mut known: HashMap<String, FileRecord> = index::folder_content(conn, folder.id)
            .await?
            .into_iter()
            .map(|record| (lookup_key(&record), record))
            .collect();

        let mut plan = MergePlan {
            updates: Vec::new(),
            inserts: Vec::new(),
            stale: Vec::new(),
        };
        for remote_child in children {
            let mut input = FileInput::from_remote(&remote_child, account, space_id);
            input.last_sync_date_for_properties = Some(now_ms);

            let mut matched = remote_child
                .remote_id
                .as_deref()
                .and_then(|remote_id| known.remove(&id_key(remote_id)))
                .or_else(|| known.remove(&path_key(&remote_child.remote_path)));
            if matched.is_none() {
                // A record at this path filed elsewhere, or carrying another id.
                matched =
                    index::file_by_remote_path(conn, account, space_id, &remote_child.remote_path)
                        .await?;
                if let Some(stray) = &matched {
                    known.remove(&lookup_key(stray));
                }
            }

            match matched {
                Some(local) => {
                    let merged = merged_child(input, &local, folder);
                    plan.updates.push((local, merged));
                }
                None => plan.inserts.push(new_child(input, folder)),
            }
        }
        plan.stale = known.into_values().collect();
        plan.stale.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        Ok(plan)
    }

    /// Moves the records below a folder renamed remotely under its new path.
    /// Their bytes move with the folder directory.
    async fn rebase_descendants(
        &self,
        conn: &mut SqliteConnection,
        nodes: Vec<FileRecord>,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<(), IndexError> {
        let count = nodes.len();
        for mut node in nodes {
            node.remote_path = rebase(&node.remote_path, old_prefix, new_prefix);
            if !node.is_folder()
                && node.storage_path.is_some()
                && let Ok(storage) = self.storage.save_path_for(&node.owner, &node.remote_path)
            {
                node.storage_path = Some(storage.to_string_lossy().into_owned());
            }
            index::update_file(conn, &node).await?;
        }
        debug!(from = %old_prefix, to = %new_prefix, count, "rebased descendants of renamed folder");
        Ok(())
    }
}
