use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::path;
use crate::remote::{MIME_DIR, RemoteConnector, RemoteError, RemoteFile};

/// A call observed by [`MemoryRemote`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Read(String),
    List(String),
    AvailablePath(String),
    CreateFolder(String),
    Move { from: String, to: String },
    Copy { from: String, to: String },
    Rename { from: String, to: String },
    Delete(String),
}

impl RemoteCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            RemoteCall::Read(_) | RemoteCall::List(_) | RemoteCall::AvailablePath(_)
        )
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), RemoteFile>,
    calls: Vec<RemoteCall>,
    failures: HashMap<String, RemoteError>,
    next_id: u64,
}

impl State {
    fn next_token(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn contains(&self, account: &str, remote_path: &str) -> bool {
        self.objects
            .contains_key(&(account.to_string(), remote_path.to_string()))
    }

    fn occupied(&self, account: &str, remote_path: &str) -> bool {
        let bare = remote_path.trim_end_matches(path::SEPARATOR);
        self.contains(account, bare) || self.contains(account, &path::folder_path(bare))
    }

    fn take_failure(&mut self, remote_path: &str) -> Result<(), RemoteError> {
        match self.failures.remove(remote_path) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_folder(&mut self, account: &str, remote_path: &str) {
        let folder = path::folder_path(remote_path);
        if let Some(parent) = path::parent_path(&folder) {
            self.ensure_folder(account, &parent);
        }
        if self.contains(account, &folder) {
            return;
        }
        let remote_id = self.next_token("rid");
        let etag = self.next_token("etag");
        self.objects.insert(
            (account.to_string(), folder.clone()),
            RemoteFile {
                remote_path: folder,
                remote_id: Some(remote_id),
                mime_type: MIME_DIR.to_string(),
                length: 0,
                creation_timestamp: None,
                modification_timestamp: 0,
                etag: etag.clone(),
                tree_etag: etag,
                permissions: Some("RDNVCK".to_string()),
            },
        );
    }

    fn subtree_keys(&self, account: &str, remote_path: &str) -> Vec<String> {
        self.objects
            .keys()
            .filter(|(owner, candidate)| {
                owner == account && path::is_same_or_descendant(candidate, remote_path)
            })
            .map(|(_, candidate)| candidate.clone())
            .collect()
    }

    /// Validates a move/copy/rename and returns the normalized target path.
    fn check_transfer(
        &self,
        account: &str,
        source: &str,
        target: &str,
    ) -> Result<String, RemoteError> {
        if !self.contains(account, source) {
            return Err(RemoteError::NotFound(source.to_string()));
        }
        let target = if path::is_folder_path(source) {
            path::folder_path(target)
        } else {
            target.to_string()
        };
        let parent = path::parent_path(&target).unwrap_or_else(|| path::ROOT_PATH.to_string());
        if !self.contains(account, &parent) || self.occupied(account, &target) {
            return Err(RemoteError::Conflict(target));
        }
        Ok(target)
    }

    fn relocate(&mut self, account: &str, source: &str, target: &str, keep_ids: bool) -> Option<String> {
        let mut top_id = None;
        for old_path in self.subtree_keys(account, source) {
            let Some(mut file) = self.objects.get(&(account.to_string(), old_path.clone())).cloned()
            else {
                continue;
            };
            if keep_ids {
                self.objects.remove(&(account.to_string(), old_path.clone()));
            } else {
                file.remote_id = Some(self.next_token("rid"));
            }
            let new_path = format!("{target}{}", &old_path[source.len()..]);
            if old_path == source {
                top_id = file.remote_id.clone();
            }
            file.remote_path = new_path.clone();
            self.objects.insert((account.to_string(), new_path), file);
        }
        top_id
    }
}

/// In-memory remote store keyed by account and path.
///
/// Intended as a test double: it records every call, generates remote ids
/// and etags, and can be told to fail the next operation on a given path.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the folder and any missing ancestors.
    pub fn add_folder(&self, account: &str, remote_path: &str) -> RemoteFile {
        let mut state = self.state.lock();
        state.ensure_folder(account, remote_path);
        let key = (account.to_string(), path::folder_path(remote_path));
        state.objects[&key].clone()
    }

    /// Creates or replaces a file, creating missing ancestors.
    pub fn add_file(
        &self,
        account: &str,
        remote_path: &str,
        length: i64,
        modification_timestamp: i64,
    ) -> RemoteFile {
        let mut state = self.state.lock();
        if let Some(parent) = path::parent_path(remote_path) {
            state.ensure_folder(account, &parent);
        }
        let remote_id = state.next_token("rid");
        let etag = state.next_token("etag");
        let file = RemoteFile {
            remote_path: remote_path.to_string(),
            remote_id: Some(remote_id),
            mime_type: "application/octet-stream".to_string(),
            length,
            creation_timestamp: Some(modification_timestamp),
            modification_timestamp,
            etag,
            tree_etag: String::new(),
            permissions: Some("RDNVW".to_string()),
        };
        state
            .objects
            .insert((account.to_string(), remote_path.to_string()), file.clone());
        file
    }

    /// Simulates a content change made by another client.
    pub fn touch(&self, account: &str, remote_path: &str, modification_timestamp: i64) {
        let mut state = self.state.lock();
        let etag = state.next_token("etag");
        if let Some(file) = state
            .objects
            .get_mut(&(account.to_string(), remote_path.to_string()))
        {
            file.modification_timestamp = modification_timestamp;
            file.etag = etag;
        }
    }

    /// Removes an object (and its subtree) without recording a call, as if
    /// another client deleted it.
    pub fn remove(&self, account: &str, remote_path: &str) {
        let mut state = self.state.lock();
        for key in state.subtree_keys(account, remote_path) {
            state.objects.remove(&(account.to_string(), key));
        }
    }

    pub fn get(&self, account: &str, remote_path: &str) -> Option<RemoteFile> {
        self.state
            .lock()
            .objects
            .get(&(account.to_string(), remote_path.to_string()))
            .cloned()
    }

    /// Makes the next operation whose source path is `remote_path` fail.
    pub fn fail_next(&self, remote_path: &str, error: RemoteError) {
        self.state
            .lock()
            .failures
            .insert(remote_path.to_string(), error);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl RemoteConnector for MemoryRemote {
    async fn read_file(
        &self,
        remote_path: &str,
        account: &str,
        _space_id: Option<&str>,
    ) -> Result<RemoteFile, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Read(remote_path.to_string()));
        state.take_failure(remote_path)?;
        state
            .objects
            .get(&(account.to_string(), remote_path.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_path.to_string()))
    }

    async fn list_folder(
        &self,
        remote_path: &str,
        account: &str,
        _space_id: Option<&str>,
    ) -> Result<Vec<RemoteFile>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::List(remote_path.to_string()));
        state.take_failure(remote_path)?;
        let folder = path::folder_path(remote_path);
        let Some(own) = state
            .objects
            .get(&(account.to_string(), folder.clone()))
            .cloned()
        else {
            return Err(RemoteError::NotFound(remote_path.to_string()));
        };
        let mut out = vec![own];
        out.extend(
            state
                .objects
                .iter()
                .filter(|((owner, candidate), _)| {
                    owner == account
                        && path::parent_path(candidate).as_deref() == Some(folder.as_str())
                })
                .map(|(_, file)| file.clone()),
        );
        Ok(out)
    }

    async fn available_remote_path(
        &self,
        remote_path: &str,
        account: &str,
    ) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(RemoteCall::AvailablePath(remote_path.to_string()));
        if !state.occupied(account, remote_path) {
            return Ok(remote_path.to_string());
        }
        let bare = remote_path.trim_end_matches(path::SEPARATOR);
        let parent = path::parent_path(bare).unwrap_or_else(|| path::ROOT_PATH.to_string());
        let name = path::file_name(bare);
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (name, None),
        };
        let mut counter = 2;
        loop {
            let candidate = match ext {
                Some(ext) => format!("{parent}{stem} ({counter}).{ext}"),
                None => format!("{parent}{stem} ({counter})"),
            };
            if !state.occupied(account, &candidate) {
                return Ok(candidate);
            }
            counter += 1;
        }
    }

    async fn create_folder(&self, remote_path: &str, account: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(RemoteCall::CreateFolder(remote_path.to_string()));
        state.take_failure(remote_path)?;
        let folder = path::folder_path(remote_path);
        let parent = path::parent_path(&folder).unwrap_or_else(|| path::ROOT_PATH.to_string());
        if !state.contains(account, &parent) || state.occupied(account, &folder) {
            return Err(RemoteError::Conflict(folder));
        }
        state.ensure_folder(account, &folder);
        Ok(())
    }

    async fn move_file(
        &self,
        source_remote_path: &str,
        target_remote_path: &str,
        account: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Move {
            from: source_remote_path.to_string(),
            to: target_remote_path.to_string(),
        });
        state.take_failure(source_remote_path)?;
        let target = state.check_transfer(account, source_remote_path, target_remote_path)?;
        state.relocate(account, source_remote_path, &target, true);
        Ok(())
    }

    async fn copy_file(
        &self,
        source_remote_path: &str,
        target_remote_path: &str,
        account: &str,
    ) -> Result<Option<String>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Copy {
            from: source_remote_path.to_string(),
            to: target_remote_path.to_string(),
        });
        state.take_failure(source_remote_path)?;
        let target = state.check_transfer(account, source_remote_path, target_remote_path)?;
        Ok(state.relocate(account, source_remote_path, &target, false))
    }

    async fn rename_file(
        &self,
        old_remote_path: &str,
        new_remote_path: &str,
        account: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Rename {
            from: old_remote_path.to_string(),
            to: new_remote_path.to_string(),
        });
        state.take_failure(old_remote_path)?;
        let target = state.check_transfer(account, old_remote_path, new_remote_path)?;
        state.relocate(account, old_remote_path, &target, true);
        Ok(())
    }

    async fn delete_file(&self, remote_path: &str, account: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Delete(remote_path.to_string()));
        state.take_failure(remote_path)?;
        if !state.contains(account, remote_path) {
            return Err(RemoteError::NotFound(remote_path.to_string()));
        }
        for key in state.subtree_keys(account, remote_path) {
            state.objects.remove(&(account.to_string(), key));
        }
        Ok(())
    }
}
