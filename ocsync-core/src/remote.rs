use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path;

/// MIME type the remote store reports for collections.
pub const MIME_DIR: &str = "DIR";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),
    /// The operation's target vanished, or two writers diverged.
    #[error("remote conflict: {0}")]
    Conflict(String),
    #[error("remote operation failed: {0}")]
    Unknown(String),
}

/// Metadata of one remote object as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub remote_path: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub mime_type: String,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub creation_timestamp: Option<i64>,
    #[serde(default)]
    pub modification_timestamp: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub tree_etag: String,
    #[serde(default)]
    pub permissions: Option<String>,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_DIR
    }

    pub fn name(&self) -> &str {
        path::file_name(&self.remote_path)
    }
}

/// Remote operations the synchronization engine relies on.
///
/// Paths are absolute within the account (or space); folders end with '/'.
/// Implementations report a missing source as [`RemoteError::NotFound`] and a
/// missing target folder as [`RemoteError::Conflict`].
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn read_file(
        &self,
        remote_path: &str,
        account: &str,
        space_id: Option<&str>,
    ) -> Result<RemoteFile, RemoteError>;

    /// The folder itself followed by its immediate children.
    async fn list_folder(
        &self,
        remote_path: &str,
        account: &str,
        space_id: Option<&str>,
    ) -> Result<Vec<RemoteFile>, RemoteError>;

    /// Returns `remote_path` when free, otherwise a disambiguated sibling path.
    async fn available_remote_path(
        &self,
        remote_path: &str,
        account: &str,
    ) -> Result<String, RemoteError>;

    async fn create_folder(&self, remote_path: &str, account: &str) -> Result<(), RemoteError>;

    async fn move_file(
        &self,
        source_remote_path: &str,
        target_remote_path: &str,
        account: &str,
    ) -> Result<(), RemoteError>;

    /// Returns the remote id assigned to the copy, when the server reports one.
    async fn copy_file(
        &self,
        source_remote_path: &str,
        target_remote_path: &str,
        account: &str,
    ) -> Result<Option<String>, RemoteError>;

    async fn rename_file(
        &self,
        old_remote_path: &str,
        new_remote_path: &str,
        account: &str,
    ) -> Result<(), RemoteError>;

    async fn delete_file(&self, remote_path: &str, account: &str) -> Result<(), RemoteError>;
}
