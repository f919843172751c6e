use std::collections::HashSet;

use serde::Serialize;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::{EngineError, SyncEngine};
use super::index::{self, IndexError, ROOT_PARENT_ID};

/// Worker attachment of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Idle,
    Downloading(Uuid),
    Uploading(Uuid),
}

impl TransferState {
    pub fn is_synchronizing(&self) -> bool {
        !matches!(self, TransferState::Idle)
    }

    pub fn worker(&self) -> Option<Uuid> {
        match self {
            TransferState::Idle => None,
            TransferState::Downloading(worker) | TransferState::Uploading(worker) => Some(*worker),
        }
    }
}

fn parse_worker(value: Option<String>) -> Result<Option<Uuid>, IndexError> {
    value
        .map(|raw| Uuid::parse_str(&raw).map_err(|_| IndexError::InvalidWorkerRef(raw)))
        .transpose()
}

pub async fn transfer_state(
    conn: &mut SqliteConnection,
    file_id: i64,
) -> Result<TransferState, IndexError> {
    let row = sqlx::query("SELECT upload_worker, download_worker FROM files_sync WHERE file_id = ?1")
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(TransferState::Idle);
    };
    let upload = parse_worker(row.try_get("upload_worker")?)?;
    let download = parse_worker(row.try_get("download_worker")?)?;
    Ok(match (upload, download) {
        (Some(worker), _) => TransferState::Uploading(worker),
        (None, Some(worker)) => TransferState::Downloading(worker),
        (None, None) => TransferState::Idle,
    })
}

pub async fn is_synchronizing(conn: &mut SqliteConnection, file_id: i64) -> Result<bool, IndexError> {
    let row = sqlx::query("SELECT is_synchronizing FROM files_sync WHERE file_id = ?1")
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let flag: i64 = row.try_get("is_synchronizing")?;
            Ok(flag != 0)
        }
        None => Ok(false),
    }
}

async fn store_state(
    conn: &mut SqliteConnection,
    file_id: i64,
    state: TransferState,
) -> Result<(), IndexError> {
    let (upload, download) = match state {
        TransferState::Idle => (None, None),
        TransferState::Uploading(worker) => (Some(worker.to_string()), None),
        TransferState::Downloading(worker) => (None, Some(worker.to_string())),
    };
    sqlx::query(
        "INSERT INTO files_sync (file_id, upload_worker, download_worker, is_synchronizing)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(file_id) DO UPDATE SET
            upload_worker = excluded.upload_worker,
            download_worker = excluded.download_worker,
            is_synchronizing = excluded.is_synchronizing",
    )
    .bind(file_id)
    .bind(upload)
    .bind(download)
    .bind(if state.is_synchronizing() { 1 } else { 0 })
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn store_flag(
    conn: &mut SqliteConnection,
    file_id: i64,
    synchronizing: bool,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO files_sync (file_id, is_synchronizing) VALUES (?1, ?2)
         ON CONFLICT(file_id) DO UPDATE SET is_synchronizing = excluded.is_synchronizing",
    )
    .bind(file_id)
    .bind(if synchronizing { 1 } else { 0 })
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn has_synchronizing_child(
    conn: &mut SqliteConnection,
    folder_id: i64,
) -> Result<bool, IndexError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS busy FROM files_sync s
         JOIN files f ON f.id = s.file_id
         WHERE f.parent_id = ?1 AND s.is_synchronizing = 1",
    )
    .bind(folder_id)
    .fetch_one(&mut *conn)
    .await?;
    let busy: i64 = row.try_get("busy")?;
    Ok(busy > 0)
}

/// Stores the state of one file and updates the "synchronizing" flag of its
/// ancestors: a start climbs while the parent was idle, a stop climbs only
/// while the parent has no other synchronizing child.
pub async fn update_transfer_state(
    conn: &mut SqliteConnection,
    file_id: i64,
    state: TransferState,
) -> Result<(), IndexError> {
    store_state(conn, file_id, state).await?;
    let synchronizing = state.is_synchronizing();

    let mut visited = HashSet::from([file_id]);
    let mut current = file_id;
    loop {
        let Some(record) = index::file_by_id(conn, current).await? else {
            return Ok(());
        };
        let parent = record.parent_id;
        if parent == ROOT_PARENT_ID {
            return Ok(());
        }
        if !visited.insert(parent) {
            warn!(id = parent, "cycle while propagating transfer state");
            return Ok(());
        }
        let parent_synchronizing = is_synchronizing(conn, parent).await?;
        if parent_synchronizing == synchronizing {
            return Ok(());
        }
        if !synchronizing && has_synchronizing_child(conn, parent).await? {
            return Ok(());
        }
        store_flag(conn, parent, synchronizing).await?;
        current = parent;
    }
}

impl SyncEngine {
    pub async fn attach_download_worker(&self, file_id: i64, worker: Uuid) -> Result<(), EngineError> {
        self.set_transfer_state(file_id, TransferState::Downloading(worker))
            .await
    }

    pub async fn attach_upload_worker(&self, file_id: i64, worker: Uuid) -> Result<(), EngineError> {
        self.set_transfer_state(file_id, TransferState::Uploading(worker))
            .await
    }

    pub async fn detach_workers(&self, file_id: i64) -> Result<(), EngineError> {
        self.set_transfer_state(file_id, TransferState::Idle).await
    }

    pub async fn transfer_state(&self, file_id: i64) -> Result<TransferState, EngineError> {
        let mut tx = self.index.begin().await?;
        let state = transfer_state(&mut tx, file_id).await?;
        tx.commit().await?;
        Ok(state)
    }

    pub async fn is_synchronizing(&self, file_id: i64) -> Result<bool, EngineError> {
        let mut tx = self.index.begin().await?;
        let flag = is_synchronizing(&mut tx, file_id).await?;
        tx.commit().await?;
        Ok(flag)
    }

    async fn set_transfer_state(&self, file_id: i64, state: TransferState) -> Result<(), EngineError> {
        let mut tx = self.index.begin().await?;
        if index::file_by_id(&mut tx, file_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("file id {file_id}")));
        }
        update_transfer_state(&mut tx, file_id, state).await?;
        tx.commit().await?;
        debug!(file_id, ?state, "transfer state updated");
        Ok(())
    }
}
