use std::collections::HashSet;
use std::{fs, path::PathBuf, str::FromStr};

use ocsync_core::{MIME_DIR, RemoteFile};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction, migrate::Migrator};
use thiserror::Error;
use tracing::warn;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Parent id stored on the top-most folder of a hierarchy.
pub const ROOT_PARENT_ID: i64 = 0;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid available offline status: {0}")]
    InvalidOfflineStatus(i64),
    #[error("invalid worker reference: {0}")]
    InvalidWorkerRef(String),
    #[error("item not found after insert")]
    MissingItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailableOfflineStatus {
    NotAvailable,
    Available,
    /// Derived: an ancestor folder is available offline.
    AvailableAsParent,
}

impl AvailableOfflineStatus {
    fn as_i64(self) -> i64 {
        match self {
            AvailableOfflineStatus::NotAvailable => 0,
            AvailableOfflineStatus::Available => 1,
            AvailableOfflineStatus::AvailableAsParent => 2,
        }
    }

    fn parse(value: i64) -> Result<Self, IndexError> {
        match value {
            0 => Ok(AvailableOfflineStatus::NotAvailable),
            1 => Ok(AvailableOfflineStatus::Available),
            2 => Ok(AvailableOfflineStatus::AvailableAsParent),
            other => Err(IndexError::InvalidOfflineStatus(other)),
        }
    }

    pub fn is_available(self) -> bool {
        !matches!(self, AvailableOfflineStatus::NotAvailable)
    }
}

/// A file or folder that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInput {
    pub parent_id: i64,
    pub owner: String,
    pub space_id: Option<String>,
    pub remote_path: String,
    pub remote_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub length: i64,
    pub creation_timestamp: Option<i64>,
    pub modification_timestamp: i64,
    pub modified_at_last_sync_for_data: Option<i64>,
    pub last_sync_date_for_data: Option<i64>,
    pub last_sync_date_for_properties: Option<i64>,
    pub etag: String,
    pub tree_etag: String,
    pub storage_path: Option<String>,
    pub etag_in_conflict: Option<String>,
    pub available_offline_status: AvailableOfflineStatus,
    pub needs_to_update_thumbnail: bool,
    pub permissions: Option<String>,
}

impl FileInput {
    /// Local snapshot of a remote descriptor; local-only fields start empty.
    pub fn from_remote(remote: &RemoteFile, owner: &str, space_id: Option<&str>) -> Self {
        Self {
            parent_id: ROOT_PARENT_ID,
            owner: owner.to_string(),
            space_id: space_id.map(str::to_string),
            remote_path: remote.remote_path.clone(),
            remote_id: remote.remote_id.clone(),
            name: remote.name().to_string(),
            mime_type: remote.mime_type.clone(),
            length: remote.length,
            creation_timestamp: remote.creation_timestamp,
            modification_timestamp: remote.modification_timestamp,
            modified_at_last_sync_for_data: None,
            last_sync_date_for_data: None,
            last_sync_date_for_properties: None,
            etag: remote.etag.clone(),
            tree_etag: remote.tree_etag.clone(),
            storage_path: None,
            etag_in_conflict: None,
            available_offline_status: AvailableOfflineStatus::NotAvailable,
            needs_to_update_thumbnail: false,
            permissions: remote.permissions.clone(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_DIR
    }

    pub fn with_id(self, id: i64) -> FileRecord {
        FileRecord {
            id,
            parent_id: self.parent_id,
            owner: self.owner,
            space_id: self.space_id,
            remote_path: self.remote_path,
            remote_id: self.remote_id,
            name: self.name,
            mime_type: self.mime_type,
            length: self.length,
            creation_timestamp: self.creation_timestamp,
            modification_timestamp: self.modification_timestamp,
            modified_at_last_sync_for_data: self.modified_at_last_sync_for_data,
            last_sync_date_for_data: self.last_sync_date_for_data,
            last_sync_date_for_properties: self.last_sync_date_for_properties,
            etag: self.etag,
            tree_etag: self.tree_etag,
            storage_path: self.storage_path,
            etag_in_conflict: self.etag_in_conflict,
            available_offline_status: self.available_offline_status,
            needs_to_update_thumbnail: self.needs_to_update_thumbnail,
            permissions: self.permissions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub parent_id: i64,
    pub owner: String,
    pub space_id: Option<String>,
    pub remote_path: String,
    pub remote_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub length: i64,
    pub creation_timestamp: Option<i64>,
    pub modification_timestamp: i64,
    pub modified_at_last_sync_for_data: Option<i64>,
    pub last_sync_date_for_data: Option<i64>,
    pub last_sync_date_for_properties: Option<i64>,
    pub etag: String,
    pub tree_etag: String,
    pub storage_path: Option<String>,
    pub etag_in_conflict: Option<String>,
    pub available_offline_status: AvailableOfflineStatus,
    pub needs_to_update_thumbnail: bool,
    pub permissions: Option<String>,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_DIR
    }

    pub fn is_available_offline(&self) -> bool {
        self.available_offline_status.is_available()
    }

    pub fn to_input(&self) -> FileInput {
        FileInput {
            parent_id: self.parent_id,
            owner: self.owner.clone(),
            space_id: self.space_id.clone(),
            remote_path: self.remote_path.clone(),
            remote_id: self.remote_id.clone(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            length: self.length,
            creation_timestamp: self.creation_timestamp,
            modification_timestamp: self.modification_timestamp,
            modified_at_last_sync_for_data: self.modified_at_last_sync_for_data,
            last_sync_date_for_data: self.last_sync_date_for_data,
            last_sync_date_for_properties: self.last_sync_date_for_properties,
            etag: self.etag.clone(),
            tree_etag: self.tree_etag.clone(),
            storage_path: self.storage_path.clone(),
            etag_in_conflict: self.etag_in_conflict.clone(),
            available_offline_status: self.available_offline_status,
            needs_to_update_thumbnail: self.needs_to_update_thumbnail,
            permissions: self.permissions.clone(),
        }
    }
}

const FILE_COLUMNS: &str = "id, parent_id, owner, space_id, remote_path, remote_id, name, mime_type, length, creation_timestamp, modification_timestamp, modified_at_last_sync_for_data, last_sync_date_for_data, last_sync_date_for_properties, etag, tree_etag, storage_path, etag_in_conflict, available_offline_status, needs_to_update_thumbnail, permissions";

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, IndexError> {
    let status: i64 = row.try_get("available_offline_status")?;
    let needs_thumbnail: i64 = row.try_get("needs_to_update_thumbnail")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        owner: row.try_get("owner")?,
        space_id: row.try_get("space_id")?,
        remote_path: row.try_get("remote_path")?,
        remote_id: row.try_get("remote_id")?,
        name: row.try_get("name")?,
        mime_type: row.try_get("mime_type")?,
        length: row.try_get("length")?,
        creation_timestamp: row.try_get("creation_timestamp")?,
        modification_timestamp: row.try_get("modification_timestamp")?,
        modified_at_last_sync_for_data: row.try_get("modified_at_last_sync_for_data")?,
        last_sync_date_for_data: row.try_get("last_sync_date_for_data")?,
        last_sync_date_for_properties: row.try_get("last_sync_date_for_properties")?,
        etag: row.try_get("etag")?,
        tree_etag: row.try_get("tree_etag")?,
        storage_path: row.try_get("storage_path")?,
        etag_in_conflict: row.try_get("etag_in_conflict")?,
        available_offline_status: AvailableOfflineStatus::parse(status)?,
        needs_to_update_thumbnail: needs_thumbnail != 0,
        permissions: row.try_get("permissions")?,
    })
}

fn records_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<FileRecord>, IndexError> {
    rows.iter().map(record_from_row).collect()
}

// Connection-level queries. They take a plain connection so that composite
// operations can run them inside a single transaction.

pub async fn file_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<FileRecord>, IndexError> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn file_by_remote_path(
    conn: &mut SqliteConnection,
    owner: &str,
    space_id: Option<&str>,
    remote_path: &str,
) -> Result<Option<FileRecord>, IndexError> {
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE owner = ?1 AND space_id IS ?2 AND remote_path = ?3"
    );
    let row = sqlx::query(&sql)
        .bind(owner)
        .bind(space_id)
        .bind(remote_path)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn file_by_remote_id(
    conn: &mut SqliteConnection,
    owner: &str,
    remote_id: &str,
) -> Result<Option<FileRecord>, IndexError> {
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE owner = ?1 AND remote_id = ?2 ORDER BY id ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(owner)
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn folder_content(
    conn: &mut SqliteConnection,
    folder_id: i64,
) -> Result<Vec<FileRecord>, IndexError> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE parent_id = ?1 ORDER BY remote_path ASC");
    let rows = sqlx::query(&sql)
        .bind(folder_id)
        .fetch_all(&mut *conn)
        .await?;
    records_from_rows(rows)
}

pub async fn insert_file(conn: &mut SqliteConnection, file: &FileInput) -> Result<i64, IndexError> {
    let result = sqlx::query(
        "INSERT INTO files (
            parent_id, owner, space_id, remote_path, remote_id, name, mime_type, length,
            creation_timestamp, modification_timestamp, modified_at_last_sync_for_data,
            last_sync_date_for_data, last_sync_date_for_properties, etag, tree_etag,
            storage_path, etag_in_conflict, available_offline_status,
            needs_to_update_thumbnail, permissions
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
    )
    .bind(file.parent_id)
    .bind(&file.owner)
    .bind(&file.space_id)
    .bind(&file.remote_path)
    .bind(&file.remote_id)
    .bind(&file.name)
    .bind(&file.mime_type)
    .bind(file.length)
    .bind(file.creation_timestamp)
    .bind(file.modification_timestamp)
    .bind(file.modified_at_last_sync_for_data)
    .bind(file.last_sync_date_for_data)
    .bind(file.last_sync_date_for_properties)
    .bind(&file.etag)
    .bind(&file.tree_etag)
    .bind(&file.storage_path)
    .bind(&file.etag_in_conflict)
    .bind(file.available_offline_status.as_i64())
    .bind(if file.needs_to_update_thumbnail { 1 } else { 0 })
    .bind(&file.permissions)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn update_file(conn: &mut SqliteConnection, file: &FileRecord) -> Result<(), IndexError> {
    sqlx::query(
        "UPDATE files SET
            parent_id = ?2,
            owner = ?3,
            space_id = ?4,
            remote_path = ?5,
            remote_id = ?6,
            name = ?7,
            mime_type = ?8,
            length = ?9,
            creation_timestamp = ?10,
            modification_timestamp = ?11,
            modified_at_last_sync_for_data = ?12,
            last_sync_date_for_data = ?13,
            last_sync_date_for_properties = ?14,
            etag = ?15,
            tree_etag = ?16,
            storage_path = ?17,
            etag_in_conflict = ?18,
            available_offline_status = ?19,
            needs_to_update_thumbnail = ?20,
            permissions = ?21
        WHERE id = ?1",
    )
    .bind(file.id)
    .bind(file.parent_id)
    .bind(&file.owner)
    .bind(&file.space_id)
    .bind(&file.remote_path)
    .bind(&file.remote_id)
    .bind(&file.name)
    .bind(&file.mime_type)
    .bind(file.length)
    .bind(file.creation_timestamp)
    .bind(file.modification_timestamp)
    .bind(file.modified_at_last_sync_for_data)
    .bind(file.last_sync_date_for_data)
    .bind(file.last_sync_date_for_properties)
    .bind(&file.etag)
    .bind(&file.tree_etag)
    .bind(&file.storage_path)
    .bind(&file.etag_in_conflict)
    .bind(file.available_offline_status.as_i64())
    .bind(if file.needs_to_update_thumbnail { 1 } else { 0 })
    .bind(&file.permissions)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_file(conn: &mut SqliteConnection, id: i64) -> Result<(), IndexError> {
    sqlx::query("DELETE FROM files_sync WHERE file_id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM files WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_remote_path(
    conn: &mut SqliteConnection,
    id: i64,
    remote_path: &str,
) -> Result<(), IndexError> {
    sqlx::query("UPDATE files SET remote_path = ?1 WHERE id = ?2")
        .bind(remote_path)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn add_to_length(
    conn: &mut SqliteConnection,
    id: i64,
    delta: i64,
) -> Result<(), IndexError> {
    sqlx::query("UPDATE files SET length = length + ?1 WHERE id = ?2")
        .bind(delta)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_offline_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: AvailableOfflineStatus,
) -> Result<(), IndexError> {
    sqlx::query("UPDATE files SET available_offline_status = ?1 WHERE id = ?2")
        .bind(status.as_i64())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_etag_in_conflict(
    conn: &mut SqliteConnection,
    id: i64,
    etag_in_conflict: Option<&str>,
) -> Result<(), IndexError> {
    sqlx::query("UPDATE files SET etag_in_conflict = ?1 WHERE id = ?2")
        .bind(etag_in_conflict)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// The record followed by all of its descendants; every parent precedes its
/// children. Ids already visited are skipped so corrupted cyclic data
/// terminates.
pub async fn subtree(
    conn: &mut SqliteConnection,
    root: &FileRecord,
) -> Result<Vec<FileRecord>, IndexError> {
    let mut visited = HashSet::from([root.id]);
    let mut stack = vec![root.clone()];
    let mut out = Vec::new();
    while let Some(current) = stack.pop() {
        if current.is_folder() {
            for child in folder_content(conn, current.id).await? {
                if visited.insert(child.id) {
                    stack.push(child);
                } else {
                    warn!(id = child.id, parent = current.id, "cycle in file tree, skipping");
                }
            }
        }
        out.push(current);
    }
    Ok(out)
}

pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, IndexError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn open(db_path: &std::path::Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// A private in-memory database. Limited to a single connection, since
    /// every SQLite memory connection sees its own database.
    pub async fn new_in_memory() -> Result<Self, IndexError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, IndexError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn get_file_by_id(&self, id: i64) -> Result<Option<FileRecord>, IndexError> {
        let mut conn = self.pool.acquire().await?;
        file_by_id(&mut conn, id).await
    }

    pub async fn get_file_by_remote_path(
        &self,
        owner: &str,
        space_id: Option<&str>,
        remote_path: &str,
    ) -> Result<Option<FileRecord>, IndexError> {
        let mut conn = self.pool.acquire().await?;
        file_by_remote_path(&mut conn, owner, space_id, remote_path).await
    }

    pub async fn get_file_by_remote_id(
        &self,
        owner: &str,
        remote_id: &str,
    ) -> Result<Option<FileRecord>, IndexError> {
        let mut conn = self.pool.acquire().await?;
        file_by_remote_id(&mut conn, owner, remote_id).await
    }

    pub async fn get_folder_content(&self, folder_id: i64) -> Result<Vec<FileRecord>, IndexError> {
        let mut conn = self.pool.acquire().await?;
        folder_content(&mut conn, folder_id).await
    }

    pub async fn insert_file(&self, file: &FileInput) -> Result<FileRecord, IndexError> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_file(&mut conn, file).await?;
        file_by_id(&mut conn, id)
            .await?
            .ok_or(IndexError::MissingItem)
    }

    pub async fn update_file(&self, file: &FileRecord) -> Result<(), IndexError> {
        let mut conn = self.pool.acquire().await?;
        update_file(&mut conn, file).await
    }

    pub async fn list_available_offline(&self, owner: &str) -> Result<Vec<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner = ?1 AND available_offline_status = ?2 ORDER BY remote_path ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(AvailableOfflineStatus::Available.as_i64())
            .fetch_all(&self.pool)
            .await?;
        records_from_rows(rows)
    }

    pub async fn list_in_conflict(&self, owner: &str) -> Result<Vec<FileRecord>, IndexError> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner = ?1 AND etag_in_conflict IS NOT NULL ORDER BY remote_path ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        records_from_rows(rows)
    }

    pub async fn disable_thumbnails_for_file(&self, id: i64) -> Result<(), IndexError> {
        sqlx::query("UPDATE files SET needs_to_update_thumbnail = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites storage paths after the local storage directory moved.
    pub async fn replace_storage_root(
        &self,
        old_directory: &str,
        new_directory: &str,
    ) -> Result<u64, IndexError> {
        let result = sqlx::query(
            "UPDATE files
             SET storage_path = ?2 || SUBSTR(storage_path, LENGTH(?1) + 1)
             WHERE storage_path IS NOT NULL AND SUBSTR(storage_path, 1, LENGTH(?1)) = ?1",
        )
        .bind(old_directory)
        .bind(new_directory)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_files(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}

fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("ocsync");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
